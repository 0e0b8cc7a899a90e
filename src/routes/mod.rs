use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::{self as axum_middleware},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{AuthManager, IdentityProvider, RegisterRequest};
use crate::error::ApiError;
use crate::http_client::AuthorizedClient;
use crate::middleware;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sections of the owner dashboard
const OWNER_SECTIONS: [&str; 5] = ["overview", "fields", "bookings", "analytics", "settings"];

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub auth_manager: Arc<AuthManager>,
    pub http_client: Arc<AuthorizedClient>,
    /// Used to build protected provider URLs
    pub provider: IdentityProvider,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub token: Option<String>,
}

/// Health check routes (no session required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Session actions (no session required)
pub fn auth_routes(state: AppState) -> Router {
    Router::new()
        .route("/login", get(login_page_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/register", post(register_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/session", get(session_handler))
        .route("/auth/verify-email", post(verify_email_handler))
        .route("/auth/confirm-register", get(confirm_register_handler))
        .with_state(state)
}

/// Role-gated navigation areas
pub fn area_routes(state: AppState) -> Router {
    Router::new()
        .route("/home", get(home_handler))
        .route("/booking", get(booking_handler))
        .route("/owner/dashboard", get(owner_dashboard_handler))
        .route("/owner/dashboard/:section", get(owner_section_handler))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::role_guard,
        ))
        .with_state(state)
}

/// Protected provider passthrough (any signed-in session)
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/fields", get(list_fields_handler))
        .route("/api/bookings", post(create_booking_handler))
        .route("/api/bookings/mine", get(my_bookings_handler))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::session_required,
        ))
        .with_state(state)
}

/// Every route the companion serves
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(auth_routes(state.clone()))
        .merge(area_routes(state.clone()))
        .merge(api_routes(state))
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Fieldbook session companion is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /login - Sign-in landing area
async fn login_page_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "area": "login",
        "authenticated": state.auth_manager.is_authenticated(),
    }))
}

/// POST /auth/login
async fn login_handler(
    State(state): State<AppState>,
    Json(form): Json<LoginForm>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!("Request to /auth/login for {}", form.email);

    if form.email.trim().is_empty() || form.password.is_empty() {
        return Err(ApiError::ValidationError(
            "email and password are required".to_string(),
        ));
    }

    if !state.auth_manager.login(&form.email, &form.password).await {
        return Err(ApiError::AuthError("Invalid email or password".to_string()));
    }

    let session = state
        .auth_manager
        .current_session()
        .ok_or_else(|| ApiError::AuthError("Session was discarded".to_string()))?;

    Ok(Json(json!({
        "session": session,
        "landing": session.role.landing_path(),
    })))
}

/// POST /auth/register
///
/// A password/confirmation mismatch never reaches the provider.
async fn register_handler(
    State(state): State<AppState>,
    Json(form): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!("Request to /auth/register for {}", form.email);

    if form.password != form.confirm_password {
        return Err(ApiError::ValidationError(
            "password and confirmation do not match".to_string(),
        ));
    }

    if !state.auth_manager.register(&form).await {
        return Err(ApiError::ValidationError(
            "Registration was rejected".to_string(),
        ));
    }

    Ok(Json(json!({ "success": true })))
}

/// POST /auth/logout
async fn logout_handler(State(state): State<AppState>) -> StatusCode {
    state.auth_manager.logout();
    StatusCode::NO_CONTENT
}

/// GET /auth/session
async fn session_handler(State(state): State<AppState>) -> Json<Value> {
    let session = state.auth_manager.current_session();

    Json(json!({
        "authenticated": session.is_some(),
        "state": state.auth_manager.state(),
        "session": session,
        "nextRenewalAt": state.auth_manager.next_renewal_at().map(|t| t.to_rfc3339()),
    }))
}

fn required_token(token: Option<String>) -> Result<String, ApiError> {
    token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::ValidationError("token is required".to_string()))
}

/// POST /auth/verify-email
async fn verify_email_handler(
    State(state): State<AppState>,
    Json(form): Json<TokenForm>,
) -> Result<Json<Value>, ApiError> {
    let token = required_token(form.token)?;

    if !state.auth_manager.verify_email(&token).await {
        return Err(ApiError::ValidationError(
            "Email verification failed".to_string(),
        ));
    }
    Ok(Json(json!({ "success": true })))
}

/// GET /auth/confirm-register?token=
async fn confirm_register_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenForm>,
) -> Result<Json<Value>, ApiError> {
    let token = required_token(query.token)?;

    if !state.auth_manager.confirm_register(&token).await {
        return Err(ApiError::ValidationError(
            "Registration confirmation failed".to_string(),
        ));
    }
    Ok(Json(json!({ "success": true })))
}

fn area(state: &AppState, name: &str) -> Json<Value> {
    let session = state.auth_manager.current_session();
    Json(json!({
        "area": name,
        "displayName": session.as_ref().map(|s| s.display_name.clone()),
        "role": session.map(|s| s.role),
    }))
}

async fn home_handler(State(state): State<AppState>) -> Json<Value> {
    area(&state, "home")
}

async fn booking_handler(State(state): State<AppState>) -> Json<Value> {
    area(&state, "booking")
}

async fn owner_dashboard_handler(State(state): State<AppState>) -> Json<Value> {
    area(&state, "owner/dashboard")
}

async fn owner_section_handler(
    State(state): State<AppState>,
    Path(section): Path<String>,
) -> Response {
    if !OWNER_SECTIONS.contains(&section.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    area(&state, &format!("owner/dashboard/{}", section)).into_response()
}

/// GET /api/fields
async fn list_fields_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let url = state.provider.url("/api/Field")?;
    let body = state.http_client.get_json(url).await?;
    Ok(Json(body))
}

/// POST /api/bookings
async fn create_booking_handler(
    State(state): State<AppState>,
    Json(booking): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!("Request to /api/bookings");

    let url = state.provider.url("/api/Booking")?;
    let body = state.http_client.post_json(url, &booking).await?;
    Ok(Json(body))
}

/// GET /api/bookings/mine
async fn my_bookings_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let session = state
        .auth_manager
        .current_session()
        .ok_or_else(|| ApiError::AuthError("Not signed in".to_string()))?;

    // The id is one path segment, whatever it contains
    let mut url = state.provider.url("/api/Booking/user")?;
    url.path_segments_mut()
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("Provider URL cannot carry a path")))?
        .push(&session.id);
    let body = state.http_client.get_json(url).await?;
    Ok(Json(body))
}
