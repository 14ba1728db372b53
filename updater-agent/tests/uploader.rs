use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tracing_subscriber::fmt::MakeWriter;
use updater_agent::{ApiError, LogSink, LogUploader, VersioningService};
use updater_core::{EntityProperties, LatestTagResponse};

#[derive(Default)]
struct RecordingApi {
    batches: Mutex<Vec<Vec<String>>>,
    fail: bool,
}

#[async_trait]
impl VersioningService for RecordingApi {
    async fn get_latest_applicable_tag(
        &self,
        _entity: &EntityProperties,
    ) -> Result<LatestTagResponse, ApiError> {
        Err(ApiError::NotConfigured("latest tag"))
    }

    async fn get_metadata(&self) -> Result<BTreeMap<String, String>, ApiError> {
        Ok(BTreeMap::new())
    }

    async fn get_presigned_log_upload_url(&self, _size: usize) -> Result<String, ApiError> {
        Ok("http://localhost/upload".into())
    }

    async fn upload_logs(&self, lines: &[String]) -> Result<(), ApiError> {
        self.batches.lock().unwrap().push(lines.to_vec());
        if self.fail {
            return Err(ApiError::UnexpectedStatus {
                status: 500,
                body: "boom".into(),
            });
        }
        Ok(())
    }
}

fn uploader(api: Arc<RecordingApi>, tags: BTreeMap<String, String>) -> LogUploader {
    LogUploader::new("test_uploader", api, tags, 16, Duration::from_secs(3600))
}

#[tokio::test]
async fn stop_drains_queue_into_a_final_flush() {
    let api = Arc::new(RecordingApi::default());
    let uploader = uploader(api.clone(), BTreeMap::from([("cluster".into(), "prod".into())]));
    uploader.run();

    let tx = uploader.sender();
    for i in 0..10 {
        tx.send_async(format!(r#"{{"n":{i}}}"#)).await.unwrap();
    }
    tx.send_async("plain".to_string()).await.unwrap();

    let worker = uploader.stop().expect("worker was running");
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker finished in time")
        .unwrap();

    let batches = api.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.len(), 11);
    let first: serde_json::Value = serde_json::from_str(&batch[0]).unwrap();
    assert_eq!(first, serde_json::json!({"cluster": "prod", "n": 0}));
    let last: serde_json::Value = serde_json::from_str(&batch[9]).unwrap();
    assert_eq!(last, serde_json::json!({"cluster": "prod", "n": 9}));
    assert_eq!(batch[10], "plain");
}

#[tokio::test]
async fn empty_buffer_is_not_uploaded() {
    let api = Arc::new(RecordingApi::default());
    let uploader = uploader(api.clone(), BTreeMap::new());
    uploader.run();
    let worker = uploader.stop().unwrap();
    worker.await.unwrap();
    assert!(api.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn run_and_stop_are_idempotent() {
    let api = Arc::new(RecordingApi::default());
    let uploader = uploader(api, BTreeMap::new());
    assert!(uploader.stop().is_none());
    uploader.run();
    uploader.run();
    assert!(uploader.stop().is_some());
    assert!(uploader.stop().is_none());
    // a stopped uploader does not start again
    uploader.run();
    assert!(uploader.stop().is_none());
}

#[tokio::test]
async fn failed_upload_drops_the_batch() {
    let api = Arc::new(RecordingApi {
        fail: true,
        ..Default::default()
    });
    let uploader = uploader(api.clone(), BTreeMap::new());
    uploader.run();
    uploader.sender().send_async("line".into()).await.unwrap();
    uploader.stop().unwrap().await.unwrap();
    assert_eq!(api.batches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn interval_flushes_buffered_lines() {
    let api = Arc::new(RecordingApi::default());
    let uploader =
        LogUploader::new("ticking", api.clone(), BTreeMap::new(), 16, Duration::from_millis(50));
    uploader.run();
    uploader.sender().send_async("a".into()).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while api.batches.lock().unwrap().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*api.batches.lock().unwrap(), vec![vec!["a".to_string()]]);

    uploader.stop().unwrap().await.unwrap();
    assert_eq!(api.batches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sink_feeds_the_uploader_until_detached() {
    let api = Arc::new(RecordingApi::default());
    let uploader = uploader(api.clone(), BTreeMap::new());
    let sink = LogSink::detached();
    sink.attach(uploader.sender());
    uploader.run();

    sink.make_writer().write_all(b"{\"msg\":\"kept\"}\n").unwrap();
    sink.detach();
    sink.make_writer().write_all(b"{\"msg\":\"dropped\"}\n").unwrap();

    uploader.stop().unwrap().await.unwrap();
    assert_eq!(
        *api.batches.lock().unwrap(),
        vec![vec![r#"{"msg":"kept"}"#.to_string()]]
    );
}

// Sink writes block on a full queue. With the only runtime worker stuck in
// such a write, the uploader must still drain the queue.
#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn blocked_sink_writer_does_not_starve_the_uploader() {
    let api = Arc::new(RecordingApi::default());
    let uploader =
        LogUploader::new("starved", api.clone(), BTreeMap::new(), 4, Duration::from_millis(20));
    let sink = LogSink::detached();
    sink.attach(uploader.sender());
    uploader.run();

    let written = Arc::new(AtomicUsize::new(0));
    let writer = tokio::spawn({
        let sink = sink.clone();
        let written = written.clone();
        async move {
            for i in 0..40 {
                sink.make_writer()
                    .write_all(format!("{{\"n\":{i}}}\n").as_bytes())
                    .unwrap();
                written.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    // Polled from the test thread, since the runtime worker may be blocked.
    let deadline = Instant::now() + Duration::from_secs(5);
    while written.load(Ordering::SeqCst) < 40 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(written.load(Ordering::SeqCst), 40);
    writer.await.unwrap();

    sink.detach();
    uploader.stop().unwrap().await.unwrap();
    let batches = api.batches.lock().unwrap();
    let uploaded: Vec<&String> = batches.iter().flatten().collect();
    assert_eq!(uploaded.len(), 40);
    assert_eq!(uploaded[0], r#"{"n":0}"#);
    assert_eq!(uploaded[39], r#"{"n":39}"#);
}
