use crate::{server::SharedState, state::Command};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use tracing::instrument;

const SUPPORTED_BAUD_RATES: [u32; 2] = [9600, 115200];

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub camera_index: Option<i32>,
    pub confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectScaleRequest {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    115200
}

#[instrument(skip(state))]
pub async fn start(
    State(state): State<SharedState>,
    payload: Option<Json<StartRequest>>,
) -> impl IntoResponse {
    let request = payload.map(|Json(request)| request).unwrap_or_default();

    if let Some(threshold) = request.confidence_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                "confidence_threshold must be within 0.0..=1.0",
            )
                .into_response();
        }
    }

    state.commands.lock().push_back(Command::Start {
        camera_index: request.camera_index,
        confidence_threshold: request.confidence_threshold,
    });
    StatusCode::ACCEPTED.into_response()
}

#[instrument(skip(state))]
pub async fn stop(State(state): State<SharedState>) -> impl IntoResponse {
    state.commands.lock().push_back(Command::Stop);
    StatusCode::ACCEPTED
}

#[instrument(skip(state))]
pub async fn reset(State(state): State<SharedState>) -> impl IntoResponse {
    state.commands.lock().push_back(Command::Reset);
    StatusCode::ACCEPTED
}

#[instrument(skip(state))]
pub async fn connect_scale(
    State(state): State<SharedState>,
    Json(request): Json<ConnectScaleRequest>,
) -> impl IntoResponse {
    if !SUPPORTED_BAUD_RATES.contains(&request.baud) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            "baud must be 9600 or 115200",
        )
            .into_response();
    }

    state.commands.lock().push_back(Command::ConnectScale {
        port: request.port,
        baud: request.baud,
    });
    StatusCode::ACCEPTED.into_response()
}

#[instrument(skip(state))]
pub async fn disconnect_scale(State(state): State<SharedState>) -> impl IntoResponse {
    state.commands.lock().push_back(Command::DisconnectScale);
    StatusCode::ACCEPTED
}
