pub mod fileserver;
pub mod images;
pub mod labs;
pub mod user_status;

use std::sync::Arc;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::errors::ControllerError;
use crate::gafaelfawr::{GafaelfawrClient, GafaelfawrUser};
use crate::services::fileserver::FileserverManager;
use crate::services::form::FormService;
use crate::services::image::ImageService;
use crate::services::lab::LabManager;

/// Shared state for all route handlers.
pub struct AppState {
    pub lab_manager: Arc<LabManager>,
    pub image_service: Arc<ImageService>,
    pub fileserver_manager: Option<Arc<FileserverManager>>,
    pub form: FormService,
    pub gafaelfawr: GafaelfawrClient,
    pub base_url: String,
    pub path_prefix: String,
}

/// Error wrapper mapping controller errors onto HTTP responses.
///
/// The body matches what the JupyterHub spawner shim expects: a `detail`
/// list with a message, a stable error kind, and optionally the request
/// body path the error refers to.
pub struct ApiError(pub ControllerError);

impl From<ControllerError> for ApiError {
    fn from(error: ControllerError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let status =
            StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %error, "Request failed");
        }
        let mut detail = json!({
            "msg": error.to_string(),
            "type": error.kind(),
        });
        if let Some(path) = error.path() {
            detail["loc"] = json!(["body", "options", path.rsplit('.').next().unwrap_or(path)]);
        }
        (status, axum::Json(json!({ "detail": [detail] }))).into_response()
    }
}

/// Authenticated user, extracted from the identity service headers.
///
/// User-initiated routes require `X-Auth-Request-User` and
/// `X-Auth-Request-Token`; the username must match the token's owner or the
/// request is rejected.
pub struct AuthenticatedUser(pub GafaelfawrUser);

impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let username = header("X-Auth-Request-User")
            .ok_or(ApiError(ControllerError::PermissionDenied))?;
        let token = header("X-Auth-Request-Token")
            .ok_or(ApiError(ControllerError::PermissionDenied))?;
        let user = state.gafaelfawr.get_user_info(&token).await?;
        if user.info.username != username {
            return Err(ApiError(ControllerError::PermissionDenied));
        }
        Ok(AuthenticatedUser(user))
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/spawner/v1/labs", get(labs::get_lab_users))
        .route("/spawner/v1/labs/{username}", get(labs::get_lab_state))
        .route("/spawner/v1/labs/{username}", delete(labs::delete_lab))
        .route("/spawner/v1/labs/{username}/create", post(labs::post_new_lab))
        .route("/spawner/v1/labs/{username}/events", get(labs::get_lab_events))
        .route("/spawner/v1/lab-form/{username}", get(labs::get_lab_form))
        .route("/spawner/v1/user-status", get(user_status::get_user_status))
        .route("/spawner/v1/images", get(images::get_images))
        .route("/spawner/v1/prepulls", get(images::get_prepulls))
        .route("/fileserver/v1/users", get(fileserver::get_fileserver_users))
        .route("/fileserver/v1/users/{username}", get(fileserver::get_fileserver_status))
        .route("/fileserver/v1/users/{username}", delete(fileserver::delete_fileserver))
        .route("/fileserver/v1/user-status", get(fileserver::get_user_fileserver_status))
        .route("/files", get(fileserver::get_files))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
