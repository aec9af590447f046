use crate::capture::CaptureSource;
use crate::config::DisplayConfig;
use crate::server::SharedState;
use crate::streaming::ChannelCommand;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

/// Starts capture. Acquisition failures come back to the caller so the
/// user gets a visible error and a manual-retry affordance; capture stays
/// idle.
pub async fn capture_start(State(state): State<SharedState>) -> Response {
    match state.frame_source.start().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!("capture start failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// Stops capture and triggers a full exit-history pull so departures
/// recorded while streaming are not lost.
pub async fn capture_stop(State(state): State<SharedState>) -> Response {
    state.frame_source.stop().await;
    if let Err(e) = state.exit_poller.fetch_all().await {
        tracing::warn!("stop-triggered exit pull failed: {}", e);
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
pub struct SourceRequest {
    pub device_index: Option<i32>,
    pub file: Option<String>,
}

/// Switches the capture input. The source fully stops and releases before
/// the new input is acquired.
pub async fn capture_source(
    State(state): State<SharedState>,
    Json(request): Json<SourceRequest>,
) -> Response {
    let source = match (request.device_index, request.file) {
        (_, Some(path)) => CaptureSource::File(path),
        (Some(index), None) => CaptureSource::Device(index),
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                "expected `device_index` or `file`".to_string(),
            )
                .into_response();
        }
    };
    match state.frame_source.switch_source(source).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!("source switch failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

pub async fn reconnect(State(state): State<SharedState>) -> Response {
    send_command(&state, ChannelCommand::ReconnectNow).await
}

pub async fn disconnect(State(state): State<SharedState>) -> Response {
    send_command(&state, ChannelCommand::Disconnect).await
}

async fn send_command(state: &SharedState, command: ChannelCommand) -> Response {
    match state.channel.command_tx.send(command).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "streaming channel is not running".to_string(),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct DisplayRequest {
    pub width: i32,
    pub height: i32,
}

/// Updates the displayed rectangle; the overlay resynchronizes on the
/// change notification.
pub async fn set_display(
    State(state): State<SharedState>,
    Json(request): Json<DisplayRequest>,
) -> Response {
    if request.width <= 0 || request.height <= 0 {
        return (
            StatusCode::BAD_REQUEST,
            "display dimensions must be positive".to_string(),
        )
            .into_response();
    }
    let _ = state.display_tx.send(DisplayConfig {
        width: request.width,
        height: request.height,
    });
    StatusCode::NO_CONTENT.into_response()
}
