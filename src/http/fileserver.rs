use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Html;
use serde_json::json;

use crate::errors::ControllerError;
use crate::services::fileserver::FileserverManager;
use super::{ApiError, AppState, AuthenticatedUser};

fn manager(state: &AppState) -> Result<&Arc<FileserverManager>, ApiError> {
    state.fileserver_manager.as_ref().ok_or(ApiError(ControllerError::NotConfigured))
}

/// `GET /fileserver/v1/users`: users with running file servers.
pub async fn get_fileserver_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(manager(&state)?.list()))
}

/// `GET /fileserver/v1/users/{username}`: whether a user's file server is
/// running.
pub async fn get_fileserver_status(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let manager = manager(&state)?;
    if !manager.running(&username) {
        return Err(ControllerError::UnknownUser(username).into());
    }
    Ok(Json(json!({ "username": username, "running": true })))
}

/// `DELETE /fileserver/v1/users/{username}`: remove a user's file server.
pub async fn delete_fileserver(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    manager(&state)?.delete(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /fileserver/v1/user-status`: the calling user's file server status.
pub async fn get_user_fileserver_status(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let manager = manager(&state)?;
    let username = user.info.username;
    if !manager.running(&username) {
        return Err(ControllerError::UnknownUser(username).into());
    }
    Ok(Json(json!({ "username": username, "running": true })))
}

/// `GET /files`: ensure the calling user's file server exists and return a
/// page pointing at it.
pub async fn get_files(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Html<String>, ApiError> {
    manager(&state)?.create(&user.info).await?;
    Ok(Html(state.form.generate_fileserver_page(&user.info.username)?))
}
