use crate::capture::CaptureState;
use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct StatusReport {
    connection: &'static str,
    capture: &'static str,
    queue_depth: usize,
    last_round_trip_ms: Option<u64>,
    exit_entries: usize,
}

pub async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    let capture = match state.frame_source.state().await {
        CaptureState::Idle => "idle",
        CaptureState::Capturing => "capturing",
    };
    Json(StatusReport {
        connection: state.channel.state_rx.borrow().as_str(),
        capture,
        queue_depth: state.queue.len(),
        last_round_trip_ms: *state.channel.last_rtt_ms_rx.borrow(),
        exit_entries: state.exits.len(),
    })
}
