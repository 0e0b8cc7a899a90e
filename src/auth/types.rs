// Session and provider wire types

use serde::{Deserialize, Serialize};

/// Role of the signed-in user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Ordinary player who books pitches
    Player,
    /// Pitch owner with access to the owner dashboard
    Owner,
}

impl Role {
    /// Normalize the provider's role string.
    /// Only "staff" maps to `Owner`; everything else is the lower-privilege `Player`.
    pub fn from_provider(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("staff") {
            Role::Owner
        } else {
            Role::Player
        }
    }

    /// Landing area for sessions holding this role
    pub fn landing_path(self) -> &'static str {
        match self {
            Role::Player => "/home",
            Role::Owner => "/owner/dashboard",
        }
    }
}

/// Signed-in user as seen by the rest of the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub role: Role,
}

/// Access token + refresh token. Always stored and cleared together.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

/// Short prefix of a token, safe for logs
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

/// Observable lifecycle state of the token manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    SignedOut,
    SignedIn,
    RefreshInFlight,
}

// === Provider wire schemas ===

/// Common response envelope returned by every provider endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(default)]
    pub is_success: bool,
    pub message: Option<String>,
    pub return_object: Option<T>,
}

/// Login request body
#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Login payload inside the envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPayload {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id: Option<serde_json::Value>,
    pub name: Option<String>,
    pub phone_number: Option<serde_json::Value>,
}

/// Registration form as the provider expects it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub full_name: String,
    pub email: String,
    pub password: String,
    pub phone_number: String,
    pub confirm_password: String,
}

/// Refresh request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh payload inside the envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPayload {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Email verification request body
#[derive(Debug, Serialize)]
pub struct VerifyEmailRequest<'a> {
    pub token: &'a str,
}

/// Successful login as validated at the provider boundary
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub credentials: CredentialPair,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Result of a login call the provider answered cleanly
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Granted(LoginGrant),
    /// `isSuccess=false`, or a success without both tokens
    Rejected(String),
}

/// Successful refresh as validated at the provider boundary
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Render a loosely typed JSON scalar (ids and phone numbers arrive as either) as text
pub fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
