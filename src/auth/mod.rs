// Authentication module
// Session state, credential storage and token lifecycle

pub mod clock;
mod manager;
mod provider;
mod store;
mod types;

pub use manager::AuthManager;
pub use provider::IdentityProvider;
pub use store::{CredentialStore, PersistedState};
pub use types::{
    redact, AuthState, CredentialPair, LoginGrant, LoginOutcome, RefreshGrant, RegisterRequest,
    Role, Session,
};
