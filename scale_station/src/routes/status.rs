use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, Json};
use tracing::instrument;

#[instrument(skip(state))]
pub async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    let snapshot = state.snapshot.lock().clone();
    Json(snapshot)
}
