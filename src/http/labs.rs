use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use futures::{Stream, StreamExt};

use crate::errors::ControllerError;
use crate::models::lab::LabSpecification;
use super::{ApiError, AppState, AuthenticatedUser};

/// `GET /spawner/v1/labs`: usernames with labs.
pub async fn get_lab_users(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.lab_manager.list_lab_users(false))
}

/// `GET /spawner/v1/labs/{username}`: lab state for a user.
pub async fn get_lab_state(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lab = state
        .lab_manager
        .get_lab_state(&username)
        .await?
        .ok_or(ControllerError::UnknownUser(username))?;
    Ok(Json(lab))
}

/// `POST /spawner/v1/labs/{username}/create`: start a lab spawn.
pub async fn post_new_lab(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(spec): Json<LabSpecification>,
) -> Result<impl IntoResponse, ApiError> {
    if user.info.username != username {
        return Err(ControllerError::PermissionDenied.into());
    }
    state.lab_manager.create_lab(&user, &spec).await?;
    let location = format!("{}/spawner/v1/labs/{username}", state.path_prefix);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]))
}

/// `DELETE /spawner/v1/labs/{username}`: delete a lab.
pub async fn delete_lab(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.lab_manager.delete_lab(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /spawner/v1/labs/{username}/events`: server-sent events for the
/// user's current lab operation.
pub async fn get_lab_events(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if user.info.username != username {
        return Err(ControllerError::PermissionDenied.into());
    }
    let events = state.lab_manager.events_for_user(&username)?;
    let stream = events.map(|event| {
        let mut data = serde_json::json!({ "message": event.message });
        if let Some(progress) = event.progress {
            data["progress"] = progress.into();
        }
        Ok(SseEvent::default().event(event.event_type.to_string()).data(data.to_string()))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /spawner/v1/lab-form/{username}`: the spawner options form.
pub async fn get_lab_form(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Html<String>, ApiError> {
    if user.info.username != username {
        return Err(ControllerError::PermissionDenied.into());
    }
    let menu = state.image_service.menu_images();
    Ok(Html(state.form.generate_spawn_form(&menu)?))
}
