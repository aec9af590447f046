use crate::exits::ExitLogEntry;
use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct ExitHistory {
    exits: Vec<ExitLogEntry>,
}

/// Aggregated departure history, newest first.
pub async fn exit_history(State(state): State<SharedState>) -> impl IntoResponse {
    Json(ExitHistory {
        exits: state.exits.entries(),
    })
}
