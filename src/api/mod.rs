pub mod routes;

pub use routes::{current_frame, fps, healthy, is_recording, motion_mask, moving_area, status};

use axum::Router;
use axum::extract::Extension;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Read-only routes over the latest motion snapshot.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthy", get(healthy))
        .route("/fps", get(fps))
        .route("/moving_area", get(moving_area))
        .route("/is_recording", get(is_recording))
        .route("/status", get(status))
        .route("/current_frame", get(current_frame))
        .route("/motion_mask", get(motion_mask))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}
