use std::sync::Arc;

use axum::Json;
use axum::extract::State;

use crate::models::menu::{PrepullerStatus, SpawnerImages};
use super::AppState;

/// `GET /spawner/v1/images`: all known images with prepull status.
pub async fn get_images(State(state): State<Arc<AppState>>) -> Json<SpawnerImages> {
    Json(state.image_service.images())
}

/// `GET /spawner/v1/prepulls`: prepuller status per image and per node.
pub async fn get_prepulls(State(state): State<Arc<AppState>>) -> Json<PrepullerStatus> {
    Json(state.image_service.prepull_status())
}
