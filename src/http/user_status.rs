use std::sync::Arc;

use axum::Json;
use axum::extract::State;

use crate::errors::ControllerError;
use crate::models::lab::LabState;
use super::{ApiError, AppState, AuthenticatedUser};

/// `GET /spawner/v1/user-status`: the calling user's own lab state.
pub async fn get_user_status(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Json<LabState>, ApiError> {
    let username = &user.info.username;
    let lab = state
        .lab_manager
        .get_lab_state(username)
        .await?
        .ok_or_else(|| ControllerError::UnknownUser(username.clone()))?;
    Ok(Json(lab))
}
