use crate::scale;
use axum::{response::IntoResponse, Json};
use tracing::instrument;

#[instrument]
pub async fn ports() -> impl IntoResponse {
    Json(scale::list_ports())
}
