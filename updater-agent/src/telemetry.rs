//! Tracing setup shared by the updater binaries.
//!
//! Events go to stdout and, once a log uploader is attached, also into the
//! uploader's queue as JSON lines.

use std::io;
use std::sync::{Arc, RwLock};

use tracing_subscriber::filter::{LevelFilter, filter_fn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Targets never forwarded to the sink: the uploader itself and the HTTP
/// stack it drives.
const SINK_EXCLUDED_TARGETS: &[&str] = &[
    "updater_agent::uploader",
    "reqwest",
    "hyper",
    "hyper_util",
    "h2",
    "rustls",
];

/// Detachable producer side of the log uploader queue.
///
/// Clones share the same attachment. Writes block while the queue is full.
#[derive(Clone, Debug, Default)]
pub struct LogSink {
    sender: Arc<RwLock<Option<flume::Sender<String>>>>,
}

impl LogSink {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attach(&self, sender: flume::Sender<String>) {
        *self.sender.write().unwrap_or_else(|e| e.into_inner()) = Some(sender);
    }

    /// Stop forwarding lines. Lines already queued are left to the uploader.
    pub fn detach(&self) {
        *self.sender.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.sender
            .read()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    fn current(&self) -> Option<flume::Sender<String>> {
        self.sender.read().ok().and_then(|s| s.clone())
    }
}

pub struct SinkWriter {
    sender: Option<flume::Sender<String>>,
}

impl io::Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(sender) = &self.sender {
            let line = String::from_utf8_lossy(buf);
            let line = line.trim_end();
            if !line.is_empty() {
                // a closed queue only means the uploader is gone
                let _ = sender.send(line.to_string());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sender: self.current(),
        }
    }
}

fn forwarded_to_sink(target: &str) -> bool {
    !SINK_EXCLUDED_TARGETS
        .iter()
        .any(|excluded| target.starts_with(excluded))
}

pub fn init_tracing(default_directive: &str, json: bool, sink: LogSink) {
    let filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .with_default_directive(
            default_directive
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        )
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);
    let stdout_layer = if json {
        stdout_layer.json().boxed()
    } else {
        stdout_layer.boxed()
    };

    let sink_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(sink)
        .with_filter(filter_fn(|meta| forwarded_to_sink(meta.target())));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(sink_layer)
        .try_init();
}
