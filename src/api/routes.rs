use std::io::Cursor;

use axum::body::Body;
use axum::extract::Extension;
use axum::http::{Response, StatusCode, header};
use axum::response::{IntoResponse, Json};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde_json::json;
use tracing::{debug, warn};

use crate::AppState;
use crate::motion::MotionSnapshot;

const JPEG_QUALITY: u8 = 90;

pub async fn healthy() -> &'static str {
    "ok"
}

pub async fn fps(Extension(state): Extension<AppState>) -> String {
    state.recorder.fps().to_string()
}

pub async fn moving_area(Extension(state): Extension<AppState>) -> String {
    state.motion_data.moving_area().to_string()
}

pub async fn is_recording(Extension(state): Extension<AppState>) -> String {
    state.recorder.is_recording().to_string()
}

pub async fn status(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let snapshot = state.motion_data.read();
    Json(json!({
        "fps": state.recorder.fps(),
        "is_recording": state.recorder.is_recording(),
        "moving_area": snapshot.as_ref().map_or(0, |s| s.moving_area()),
        "frame_size": snapshot.as_ref().map(|s| s.frame().dimensions()),
    }))
}

pub async fn current_frame(Extension(state): Extension<AppState>) -> Response<Body> {
    serve_snapshot_image(state, Picture::Frame).await
}

pub async fn motion_mask(Extension(state): Extension<AppState>) -> Response<Body> {
    serve_snapshot_image(state, Picture::Mask).await
}

#[derive(Debug, Clone, Copy)]
enum Picture {
    Frame,
    Mask,
}

async fn serve_snapshot_image(state: AppState, picture: Picture) -> Response<Body> {
    let Some(snapshot) = state.motion_data.read() else {
        return err_response(StatusCode::SERVICE_UNAVAILABLE, "No frame analysed yet");
    };

    let encoded = tokio::task::spawn_blocking(move || encode_jpeg(&snapshot, picture)).await;
    match encoded {
        Ok(Ok(jpeg)) => {
            debug!(?picture, size = jpeg.len(), "Encoded jpeg");
            ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response()
        }
        Ok(Err(message)) => {
            warn!(?picture, %message, "Failed to encode jpeg");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
        Err(error) => {
            warn!(?picture, %error, "Jpeg encoding task failed");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "Jpeg encoding task failed")
        }
    }
}

fn encode_jpeg(snapshot: &MotionSnapshot, picture: Picture) -> Result<Bytes, String> {
    let (raw, width, height, color) = match picture {
        Picture::Frame => {
            let frame = snapshot.frame();
            (frame.as_raw(), frame.width(), frame.height(), ExtendedColorType::Rgb8)
        }
        Picture::Mask => {
            let mask = snapshot.mask();
            (mask.as_raw(), mask.width(), mask.height(), ExtendedColorType::L8)
        }
    };
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .write_image(raw, width, height, color)
        .map_err(|e| format!("Can't encode {picture:?} as jpeg: {e}"))?;
    Ok(Bytes::from(buffer.into_inner()))
}

pub(crate) fn err_response(status: StatusCode, body_str: &'static str) -> Response<Body> {
    (status, body_str).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};

    #[test]
    fn test_encode_jpeg_has_magic() {
        let snapshot = MotionSnapshot::new(RgbImage::new(16, 8), GrayImage::new(16, 8));
        for picture in [Picture::Frame, Picture::Mask] {
            let jpeg = encode_jpeg(&snapshot, picture).unwrap();
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        }
    }
}
