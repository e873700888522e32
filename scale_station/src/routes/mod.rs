mod control;
mod health;
mod metrics;
mod scale_ports;
mod status;
mod video_feed;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/video_feed", get(video_feed::video_feed))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api/status", get(status::status))
        .route("/api/start", post(control::start))
        .route("/api/stop", post(control::stop))
        .route("/api/reset", post(control::reset))
        .route("/api/scale/connect", post(control::connect_scale))
        .route("/api/scale/disconnect", post(control::disconnect_scale))
        .route("/api/scale/ports", get(scale_ports::ports))
}
