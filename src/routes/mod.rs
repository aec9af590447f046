mod control;
mod exit_log;
mod health;
mod metrics;
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
        .route("/metrics", get(metrics::metrics_handler))
        .route("/video_feed", get(video_feed::video_feed))
        .route("/exits", get(exit_log::exit_history))
        .route("/status", get(status::status))
        .route("/capture/start", post(control::capture_start))
        .route("/capture/stop", post(control::capture_stop))
        .route("/capture/source", post(control::capture_source))
        .route("/connection/reconnect", post(control::reconnect))
        .route("/connection/disconnect", post(control::disconnect))
        .route("/display", post(control::set_display))
}
