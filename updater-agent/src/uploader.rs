//! Ships the agent's own log lines to the versioning API.
//!
//! Lines are queued on a bounded channel, buffered by a single worker and
//! flushed on a fixed interval. Stopping drains the queue and performs one
//! last flush.
//!
//! Producers block while the queue is full, and they may be tokio tasks. The
//! worker therefore runs on a dedicated OS thread with its own current-thread
//! runtime, never on the runtime that feeds it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::VersioningService;

pub struct LogUploader {
    name: String,
    service: Arc<dyn VersioningService>,
    tags: Arc<BTreeMap<String, String>>,
    tx: flume::Sender<String>,
    rx: flume::Receiver<String>,
    flush_interval: Duration,
    token: CancellationToken,
    worker: Mutex<Option<oneshot::Receiver<()>>>,
}

impl LogUploader {
    pub fn new(
        name: impl Into<String>,
        service: Arc<dyn VersioningService>,
        tags: BTreeMap<String, String>,
        queue_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let (tx, rx) = flume::bounded(queue_size.max(1));
        Self {
            name: name.into(),
            service,
            tags: Arc::new(tags),
            tx,
            rx,
            flush_interval,
            token: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer handle of the queue. Sends block while the queue is full.
    pub fn sender(&self) -> flume::Sender<String> {
        self.tx.clone()
    }

    /// Starts the worker. Calling it again has no effect.
    pub fn run(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() || self.token.is_cancelled() {
            return;
        }
        let task = Worker {
            name: self.name.clone(),
            service: self.service.clone(),
            tags: self.tags.clone(),
            rx: self.rx.clone(),
            buffer: Vec::new(),
        };
        let (done_tx, done_rx) = oneshot::channel();
        let name = self.name.clone();
        let flush_interval = self.flush_interval;
        let token = self.token.clone();
        let spawned = std::thread::Builder::new()
            .name("log-uploader".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(task.run(flush_interval, token)),
                    Err(e) => {
                        warn!(uploader = %name, error = %e, "failed to build uploader runtime")
                    }
                }
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(_) => {
                *worker = Some(done_rx);
                debug!(uploader = %self.name, "log uploader started");
            }
            Err(e) => warn!(uploader = %self.name, error = %e, "failed to spawn uploader thread"),
        }
    }

    /// Signals the worker to drain and flush.
    ///
    /// Returns a completion handle the first time it is called after `run`.
    /// It resolves once the final flush is done.
    pub fn stop(&self) -> Option<oneshot::Receiver<()>> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        debug!(uploader = %self.name, "stopping log uploader");
        self.token.cancel();
        Some(handle)
    }
}

impl Drop for LogUploader {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Worker {
    name: String,
    service: Arc<dyn VersioningService>,
    tags: Arc<BTreeMap<String, String>>,
    rx: flume::Receiver<String>,
    buffer: Vec<String>,
}

impl Worker {
    async fn run(mut self, flush_interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(flush_interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(uploader = %self.name, "got stop signal, draining remaining logs");
                    while let Ok(line) = self.rx.try_recv() {
                        self.process(line);
                    }
                    self.flush().await;
                    return;
                }
                Ok(line) = self.rx.recv_async() => self.process(line),
                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    fn process(&mut self, line: String) {
        self.buffer.push(tag_line(line, &self.tags));
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.buffer);
        match self.service.upload_logs(&lines).await {
            Ok(()) => debug!(uploader = %self.name, lines = lines.len(), "flushed logs"),
            Err(e) => warn!(
                uploader = %self.name, error = %e, dropped = lines.len(),
                "failed to upload logs"
            ),
        }
    }
}

/// Adds the custom tags to a JSON object line. Existing fields win; any
/// other line is returned as is.
fn tag_line(line: String, tags: &BTreeMap<String, String>) -> String {
    if tags.is_empty() {
        return line;
    }
    match serde_json::from_str::<Value>(&line) {
        Ok(Value::Object(mut fields)) => {
            for (key, value) in tags {
                fields
                    .entry(key.clone())
                    .or_insert_with(|| Value::String(value.clone()));
            }
            serde_json::to_string(&fields).unwrap_or(line)
        }
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cluster".to_string(), "prod".to_string()),
            ("level".to_string(), "ignored".to_string()),
        ])
    }

    #[test]
    fn tags_are_merged_into_json_objects() {
        let line = tag_line(r#"{"level":"INFO","message":"hi"}"#.to_string(), &tags());
        let fields: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            fields,
            serde_json::json!({"cluster": "prod", "level": "INFO", "message": "hi"})
        );
    }

    #[test]
    fn other_lines_are_untouched() {
        assert_eq!(tag_line("plain text".into(), &tags()), "plain text");
        assert_eq!(tag_line("[1,2]".into(), &tags()), "[1,2]");
        assert_eq!(tag_line("{\"a\": 1}".into(), &BTreeMap::new()), "{\"a\": 1}");
    }
}
