use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::clock;
use super::provider::IdentityProvider;
use super::store::CredentialStore;
use super::types::{
    AuthState, CredentialPair, LoginOutcome, RefreshGrant, RegisterRequest, Role, Session,
};

type RefreshFuture = Shared<BoxFuture<'static, Option<String>>>;

/// The one refresh allowed in flight at a time
struct PendingRefresh {
    id: u64,
    result: RefreshFuture,
}

/// Timer that fires proactive renewal for the current access token
struct ScheduledRenewal {
    id: u64,
    fires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Authentication manager
/// Owns the credential store and is the only writer of session state.
/// Readers observe the published session through `subscribe()`.
pub struct AuthManager {
    provider: IdentityProvider,

    store: CredentialStore,

    /// Published session; `None` when signed out
    session_tx: watch::Sender<Option<Session>>,

    /// Credential generation. Bumped on login and logout so that a refresh
    /// started against an older pair cannot write into a newer one.
    /// Also serializes every mutation of the store.
    epoch: Mutex<u64>,

    pending: Mutex<Option<PendingRefresh>>,

    renewal: Mutex<Option<ScheduledRenewal>>,

    next_id: AtomicU64,
}

impl AuthManager {
    /// Create the manager and restore whatever session survived the last run.
    ///
    /// Must be called inside a Tokio runtime: a restored access token gets
    /// its proactive renewal scheduled right away.
    pub fn new(provider: IdentityProvider, store: CredentialStore) -> Arc<Self> {
        let persisted = store.load().unwrap_or_else(|e| {
            tracing::error!("Failed to load persisted session: {:#}", e);
            Default::default()
        });

        let (session_tx, _) = watch::channel(None);
        let manager = Arc::new(Self {
            provider,
            store,
            session_tx,
            epoch: Mutex::new(0),
            pending: Mutex::new(None),
            renewal: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });

        match (persisted.session, persisted.credentials) {
            (Some(session), Some(credentials)) => {
                tracing::info!("Restored session for {} ({:?})", session.email, session.role);
                manager.session_tx.send_replace(Some(session));
                manager.schedule_renewal(&credentials.access_token);
            }
            (None, None) => {
                tracing::debug!("No persisted session");
            }
            _ => {
                tracing::warn!("Persisted session and credentials disagree, clearing store");
                if let Err(e) = manager.store.clear() {
                    tracing::error!("Failed to clear store: {:#}", e);
                }
            }
        }

        manager
    }

    // === Session reads ===

    /// Latest published session
    pub fn current_session(&self) -> Option<Session> {
        self.session_tx.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_tx.borrow().is_some()
    }

    pub fn role(&self) -> Option<Role> {
        self.session_tx.borrow().as_ref().map(|s| s.role)
    }

    /// Watch channel carrying every session change
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.session_tx.subscribe()
    }

    pub fn state(&self) -> AuthState {
        if !self.is_authenticated() {
            return AuthState::SignedOut;
        }
        let in_flight = lock(&self.pending)
            .as_ref()
            .is_some_and(|p| p.result.peek().is_none());
        if in_flight {
            AuthState::RefreshInFlight
        } else {
            AuthState::SignedIn
        }
    }

    /// Access token to attach to protected calls
    pub fn access_token(&self) -> Option<String> {
        self.store.access_token().unwrap_or_else(|e| {
            tracing::error!("Failed to read access token: {:#}", e);
            None
        })
    }

    /// When the proactive renewal timer will fire, if one is scheduled
    pub fn next_renewal_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.renewal).as_ref().map(|r| r.fires_at)
    }

    // === Provider operations ===

    /// Sign in. Every failure is logged and reported as `false`.
    ///
    /// A clean rejection leaves any current session alone. A transport or
    /// provider error, or a failed role lookup, signs out.
    pub async fn login(self: &Arc<Self>, email: &str, password: &str) -> bool {
        let grant = match self.provider.login(email, password).await {
            Ok(LoginOutcome::Granted(grant)) => grant,
            Ok(LoginOutcome::Rejected(reason)) => {
                tracing::warn!("Login rejected for {}: {}", email, reason);
                return false;
            }
            Err(e) => {
                tracing::error!("Login failed for {}, signing out: {:#}", email, e);
                self.logout();
                return false;
            }
        };

        // Tokens are not persisted until the role is known
        let role = match self.provider.role(&grant.credentials.access_token).await {
            Ok(role) => role,
            Err(e) => {
                tracing::warn!("Role lookup failed for {}, discarding tokens: {:#}", email, e);
                self.logout();
                return false;
            }
        };

        let session = Session {
            id: grant.user_id.unwrap_or_else(|| email.to_string()),
            email: email.to_string(),
            display_name: grant
                .name
                .unwrap_or_else(|| email.split('@').next().unwrap_or(email).to_string()),
            phone: grant.phone,
            role,
        };

        self.establish(session, grant.credentials)
    }

    /// Register an account. Does not sign in.
    pub async fn register(&self, form: &RegisterRequest) -> bool {
        match self.provider.register(form).await {
            Ok(()) => {
                tracing::info!("✅ Registered {}, confirmation email sent", form.email);
                true
            }
            Err(e) => {
                tracing::warn!("Registration failed for {}: {:#}", form.email, e);
                false
            }
        }
    }

    pub async fn verify_email(&self, token: &str) -> bool {
        match self.provider.verify_email(token).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Email verification failed: {:#}", e);
                false
            }
        }
    }

    pub async fn confirm_register(&self, token: &str) -> bool {
        match self.provider.confirm_register(token).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Registration confirmation failed: {:#}", e);
                false
            }
        }
    }

    /// Obtain a new access token.
    ///
    /// Concurrent callers share a single provider call and all observe the
    /// same outcome. Any failure signs the session out.
    pub async fn refresh(self: &Arc<Self>) -> Option<String> {
        let (id, result) = {
            let mut pending = lock(&self.pending);
            let joinable = pending
                .as_ref()
                .filter(|p| p.result.peek().is_none())
                .map(|p| (p.id, p.result.clone()));

            match joinable {
                Some(joined) => {
                    tracing::debug!("Joining in-flight token refresh");
                    joined
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let manager = Arc::clone(self);
                    // Runs detached so the outcome lands even if every waiter goes away
                    let task = tokio::spawn(async move { manager.run_refresh().await });
                    let result = async move {
                        task.await.unwrap_or_else(|e| {
                            tracing::error!("Token refresh task failed: {}", e);
                            None
                        })
                    }
                    .boxed()
                    .shared();

                    *pending = Some(PendingRefresh {
                        id,
                        result: result.clone(),
                    });
                    (id, result)
                }
            }
        };

        let outcome = result.await;

        let mut pending = lock(&self.pending);
        if pending.as_ref().is_some_and(|p| p.id == id) {
            *pending = None;
        }
        outcome
    }

    /// Sign out: cancel renewal, drop any in-flight refresh's effect, clear
    /// persisted state and publish `None`. No-op when already signed out.
    pub fn logout(&self) {
        let mut epoch = lock(&self.epoch);
        self.sign_out(&mut epoch);
    }

    /// Stop the renewal timer without touching the session (process shutdown)
    pub fn shutdown(&self) {
        self.cancel_renewal();
    }

    // === Internals ===

    async fn run_refresh(self: Arc<Self>) -> Option<String> {
        // The token must belong to the generation the result is committed against
        let (epoch, stored) = {
            let epoch = lock(&self.epoch);
            (*epoch, self.store.refresh_token())
        };

        let refresh_token = match stored {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::warn!("No refresh token stored, cannot refresh");
                self.fail_refresh(epoch);
                return None;
            }
            Err(e) => {
                tracing::error!("Failed to read refresh token: {:#}", e);
                self.fail_refresh(epoch);
                return None;
            }
        };

        match self.provider.refresh(&refresh_token).await {
            Ok(grant) => self.commit_refresh(epoch, grant),
            Err(e) => {
                tracing::error!("Token refresh failed: {:#}", e);
                self.fail_refresh(epoch);
                None
            }
        }
    }

    fn commit_refresh(self: &Arc<Self>, epoch: u64, grant: RefreshGrant) -> Option<String> {
        let mut current = lock(&self.epoch);
        if *current != epoch {
            tracing::info!("Session changed while refreshing, discarding refreshed token");
            return None;
        }

        if let Err(e) = self
            .store
            .save_refreshed(&grant.access_token, grant.refresh_token.as_deref())
        {
            tracing::error!("Failed to persist refreshed token: {:#}", e);
            self.sign_out(&mut current);
            return None;
        }

        tracing::info!("✅ Access token refreshed");
        self.schedule_renewal(&grant.access_token);
        Some(grant.access_token)
    }

    /// Fail closed, unless the session already moved on since `epoch`
    fn fail_refresh(&self, epoch: u64) {
        let mut current = lock(&self.epoch);
        if *current == epoch {
            self.sign_out(&mut current);
        }
    }

    fn establish(self: &Arc<Self>, session: Session, credentials: CredentialPair) -> bool {
        let mut epoch = lock(&self.epoch);
        *epoch += 1;
        self.cancel_renewal();
        *lock(&self.pending) = None;

        if let Err(e) = self.store.save_login(&session, &credentials) {
            tracing::error!("Failed to persist session: {:#}", e);
            self.sign_out(&mut epoch);
            return false;
        }

        tracing::info!("✅ Signed in as {} ({:?})", session.email, session.role);
        self.session_tx.send_replace(Some(session));
        self.schedule_renewal(&credentials.access_token);
        true
    }

    fn sign_out(&self, epoch: &mut u64) {
        let has_session = self.session_tx.borrow().is_some();
        let has_tokens = !self.store.is_empty().unwrap_or(false);
        let has_timer = lock(&self.renewal).is_some();
        if !has_session && !has_tokens && !has_timer {
            tracing::debug!("Already signed out");
            return;
        }

        *epoch += 1;
        self.cancel_renewal();
        *lock(&self.pending) = None;

        if let Err(e) = self.store.clear() {
            tracing::error!("Failed to clear persisted credentials: {:#}", e);
        }
        self.session_tx.send_replace(None);
        tracing::info!("Signed out");
    }

    /// Replace the renewal timer with one for `access_token`.
    /// Tokens without a readable or future-enough expiry get no timer.
    fn schedule_renewal(self: &Arc<Self>, access_token: &str) {
        self.cancel_renewal();

        let Some(expiry) = clock::decode_expiry(access_token) else {
            tracing::warn!("Access token expiry is unreadable, relying on reactive refresh");
            return;
        };

        let now = Utc::now();
        let Some(delay) = clock::time_until_renewal(expiry, now, clock::renewal_lead_time())
        else {
            tracing::info!("Access token is inside the renewal window, relying on reactive refresh");
            return;
        };

        let fires_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let manager: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.release_renewal(id);

            tracing::info!("♻️ Proactive token renewal firing");
            if manager.refresh().await.is_none() {
                tracing::warn!("Proactive renewal failed, renewal chain stopped");
            }
        });

        *lock(&self.renewal) = Some(ScheduledRenewal {
            id,
            fires_at,
            handle,
        });

        tracing::info!(
            "🕒 Token renewal scheduled in {:.1} minutes ({})",
            delay.as_secs_f64() / 60.0,
            fires_at.to_rfc3339()
        );
    }

    /// Forget the timer slot once it fired, without aborting the running task
    fn release_renewal(&self, id: u64) {
        let mut renewal = lock(&self.renewal);
        if renewal.as_ref().is_some_and(|r| r.id == id) {
            *renewal = None;
        }
    }

    fn cancel_renewal(&self) {
        if let Some(renewal) = lock(&self.renewal).take() {
            renewal.handle.abort();
            tracing::debug!("Cancelled renewal scheduled for {}", renewal.fires_at.to_rfc3339());
        }
    }
}

impl Drop for AuthManager {
    fn drop(&mut self) {
        self.cancel_renewal();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
