// Role-based navigation gate

use crate::auth::{Role, Session};

/// Where unauthenticated navigation is sent
pub const SIGN_IN_PATH: &str = "/login";

/// Outcome of a navigation check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    /// Deny and send the client here instead
    Redirect(&'static str),
}

/// Decide whether `session` may enter an area requiring `required`.
///
/// A role mismatch redirects to the landing area of the role the session
/// actually holds, never to the requested one, so mismatched areas cannot
/// bounce a client back and forth.
pub fn authorize(session: Option<&Session>, required: Option<Role>) -> Access {
    let Some(session) = session else {
        return Access::Redirect(SIGN_IN_PATH);
    };

    match required {
        None => Access::Allow,
        Some(role) if role == session.role => Access::Allow,
        Some(_) => Access::Redirect(session.role.landing_path()),
    }
}

/// Role required by a navigation path, per the application's route table.
/// `None` means any signed-in session may enter.
pub fn required_role(path: &str) -> Option<Role> {
    let path = path.trim_end_matches('/');
    if path == "/owner" || path.starts_with("/owner/") {
        Some(Role::Owner)
    } else if matches!(path, "/home" | "/booking") || path.starts_with("/booking/") {
        Some(Role::Player)
    } else {
        None
    }
}
