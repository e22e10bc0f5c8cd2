use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use shared::protocol::API_PREFIX;
use shared::types::ConnectionStatus;
use crate::service::TarpitService;

#[derive(Clone)]
pub struct AppState {
    pub service: TarpitService,
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/connections", get(get_connections))
        .route("/connections/:id", get(get_connection).delete(close_connection))
        .route("/listeners", get(get_listeners));

    Router::new().nest(API_PREFIX, v1).with_state(state)
}

async fn get_connections(State(state): State<AppState>) -> Json<Vec<ConnectionStatus>> {
    Json(state.service.current_connections())
}

async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<ConnectionStatus>, StatusCode> {
    state
        .service
        .current_connections()
        .into_iter()
        .find(|c| c.id == id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn close_connection(State(state): State<AppState>, Path(id): Path<u32>) -> StatusCode {
    if state.service.close_connection(id) {
        tracing::info!(id, "connection closed via API");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_listeners(State(state): State<AppState>) -> Json<Vec<u16>> {
    Json(state.service.listening_ports().await)
}
