// Session, role and CORS middleware

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::guard::{self, Access};
use crate::routes::AppState;

/// Navigation guard
///
/// Looks up the role the requested path requires and either lets the
/// request through or answers with a 303 to the right landing area.
pub async fn role_guard(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let required = guard::required_role(&path);
    let session = state.auth_manager.current_session();

    match guard::authorize(session.as_ref(), required) {
        Access::Allow => next.run(request).await,
        Access::Redirect(target) => {
            let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
            tracing::info!(
                "[{}] Navigation to {} denied (role: {:?}, required: {:?}), redirecting to {}",
                request_id,
                path,
                session.as_ref().map(|s| s.role),
                required,
                target
            );
            Redirect::to(target).into_response()
        }
    }
}

/// API guard
///
/// Protected API routes answer 401 instead of redirecting when no session exists.
pub async fn session_required(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if state.auth_manager.is_authenticated() {
        return Ok(next.run(request).await);
    }

    tracing::warn!(
        "API call without a session: {} {}",
        request.method(),
        request.uri().path()
    );
    Err(ApiError::AuthError("Not signed in".to_string()))
}

/// Create CORS middleware layer
///
/// Configures CORS to allow all origins, methods, and headers.
/// Handles OPTIONS preflight requests automatically.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
