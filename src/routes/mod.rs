mod detect_objects;
mod detections;
mod health;
mod metrics;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub use detect_objects::detect_objects;
pub use detections::get_detection;
pub use health::healthcheck;
pub use metrics::metrics_handler;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
        .route("/detect_objects", get(detect_objects))
        .route("/detections/{id}", get(get_detection))
}
