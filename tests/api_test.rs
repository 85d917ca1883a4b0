use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::{GrayImage, Luma, RgbImage};
use motion_recorder::media;
use motion_recorder::{AppState, MotionData, MotionSnapshot, Recorder, api};
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct StubRecorder {
    recording: AtomicBool,
}

impl Recorder for StubRecorder {
    fn start_recording(&self, _path: &Path) -> media::Result<()> {
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn fps(&self) -> f64 {
        30.0
    }
}

/// Serves the API router on an ephemeral port.
struct TestServer {
    handle: JoinHandle<()>,
    addr: SocketAddr,
    client: reqwest::Client,
    motion_data: Arc<MotionData>,
    recorder: Arc<StubRecorder>,
}

impl TestServer {
    async fn start() -> Self {
        let motion_data = Arc::new(MotionData::new());
        let recorder = Arc::new(StubRecorder::default());
        let state = AppState::new(motion_data.clone(), recorder.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, api::router(state)).await.unwrap();
        });

        Self {
            handle,
            addr,
            client: reqwest::Client::new(),
            motion_data,
            recorder,
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}{path}", self.addr))
            .send()
            .await
            .unwrap()
    }

    async fn text(&self, path: &str) -> String {
        let response = self.get(path).await;
        assert_eq!(response.status(), StatusCode::OK, "GET {path}");
        response.text().await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn snapshot_with_motion(width: u32, height: u32, moving: u32) -> MotionSnapshot {
    let mask = GrayImage::from_fn(width, height, |x, y| {
        if y * width + x < moving {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    MotionSnapshot::new(RgbImage::new(width, height), mask)
}

#[tokio::test]
async fn test_images_unavailable_before_first_snapshot() {
    let server = TestServer::start().await;

    assert_eq!(server.text("/healthy").await, "ok");
    for path in ["/current_frame", "/motion_mask"] {
        let response = server.get(path).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "GET {path}");
    }
    assert_eq!(server.text("/moving_area").await, "0");
}

#[tokio::test]
async fn test_images_are_jpeg() {
    let server = TestServer::start().await;
    server.motion_data.publish(snapshot_with_motion(32, 24, 10));

    for path in ["/current_frame", "/motion_mask"] {
        let response = server.get(path).await;
        assert_eq!(response.status(), StatusCode::OK, "GET {path}");
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            "image/jpeg"
        );
        let body = response.bytes().await.unwrap();
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
    }
}

#[tokio::test]
async fn test_scalar_routes_follow_state() {
    let server = TestServer::start().await;

    assert_eq!(server.text("/fps").await, "30");
    assert_eq!(server.text("/is_recording").await, "false");

    server.motion_data.publish(snapshot_with_motion(8, 8, 5));
    server.recorder.start_recording(Path::new("unused.mkv")).unwrap();
    assert_eq!(server.text("/moving_area").await, "5");
    assert_eq!(server.text("/is_recording").await, "true");

    server.recorder.stop_recording();
    assert_eq!(server.text("/is_recording").await, "false");
}

#[tokio::test]
async fn test_status_summarizes_state() {
    let server = TestServer::start().await;

    let empty: serde_json::Value = server.get("/status").await.json().await.unwrap();
    assert_eq!(empty["moving_area"], 0);
    assert!(empty["frame_size"].is_null());

    server.motion_data.publish(snapshot_with_motion(16, 12, 3));
    let status: serde_json::Value = server.get("/status").await.json().await.unwrap();
    assert_eq!(status["fps"], 30.0);
    assert_eq!(status["is_recording"], false);
    assert_eq!(status["moving_area"], 3);
    assert_eq!(status["frame_size"], serde_json::json!([16, 12]));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let server = TestServer::start().await;
    assert_eq!(server.get("/start_recording").await.status(), StatusCode::NOT_FOUND);
}
