//! Single-flight token refresh
//!
//! Many requests can hit a 401 at once. The first caller to arrive becomes the
//! leader and performs the one refresh call; everyone arriving while it runs
//! becomes a waiter and receives the leader's outcome through a watch channel.
//!
//! State machine: `Idle -> Refreshing -> Idle`. The state lives behind a std
//! Mutex that is never held across an await.
//!
//! On failure the leader clears the credential store and publishes exactly one
//! session-ended event *before* waking waiters, so no waiter can observe the
//! stale credentials.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::Secret;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use venue_auth::{CredentialPair, CredentialStore, RefreshEndpoint, TokenResponse};

use crate::classify::{LogoutReason, classify};
use crate::error::{RefreshError, Result};
use crate::events::SessionEvents;

/// Boxed future returned by [`TokenRefresher::exchange`].
pub type ExchangeFuture<'a> =
    Pin<Box<dyn Future<Output = venue_auth::Result<TokenResponse>> + Send + 'a>>;

/// Performs the network half of a refresh.
///
/// Uses `Pin<Box<dyn Future>>` so the coordinator can hold an
/// `Arc<dyn TokenRefresher>`.
pub trait TokenRefresher: Send + Sync {
    fn exchange<'a>(&'a self, refresh_token: &'a str) -> ExchangeFuture<'a>;
}

impl TokenRefresher for RefreshEndpoint {
    fn exchange<'a>(&'a self, refresh_token: &'a str) -> ExchangeFuture<'a> {
        Box::pin(self.refresh(refresh_token))
    }
}

/// Outcome shared between the leader and every waiter.
type RefreshOutcome = Result<Secret<String>>;

enum RefreshState {
    Idle,
    Refreshing(watch::Receiver<Option<RefreshOutcome>>),
}

enum Role {
    Leader(watch::Sender<Option<RefreshOutcome>>),
    Waiter(watch::Receiver<Option<RefreshOutcome>>),
}

/// The last session a failed refresh ended, keyed by its access token.
struct EndedSession {
    access_token: Option<Secret<String>>,
    error: RefreshError,
}

/// Coordinates credential refreshes for one API client.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    events: SessionEvents,
    state: Mutex<RefreshState>,
    ended: Mutex<Option<EndedSession>>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        events: SessionEvents,
    ) -> Self {
        Self {
            store,
            refresher,
            events,
            state: Mutex::new(RefreshState::Idle),
            ended: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    /// Whether a refresh call is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        matches!(*lock(&self.state), RefreshState::Refreshing(_))
    }

    /// The error that ended the session `access_token` belonged to.
    ///
    /// A request that got its 401 after that session's refresh already failed
    /// reports this instead of starting a refresh of its own.
    pub fn ended_session(&self, access_token: &Secret<String>) -> Option<RefreshError> {
        lock(&self.ended)
            .as_ref()
            .filter(|e| e.access_token.as_ref() == Some(access_token))
            .map(|e| e.error.clone())
    }

    /// Return a fresh access token, refreshing at most once across all
    /// concurrent callers.
    ///
    /// Fails with the classified [`RefreshError`] when the refresh fails; by
    /// then the store has been cleared and the session event published.
    pub async fn ensure_fresh_token(&self) -> Result<Secret<String>> {
        loop {
            let role = {
                let mut state = lock(&self.state);
                match &*state {
                    RefreshState::Refreshing(rx) => Role::Waiter(rx.clone()),
                    RefreshState::Idle => {
                        let (tx, rx) = watch::channel(None);
                        *state = RefreshState::Refreshing(rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let flight = InFlight {
                        state: &self.state,
                        sender: Some(tx),
                    };
                    let outcome = self.run_refresh().await;
                    flight.finish(outcome.clone());
                    return outcome;
                }
                Role::Waiter(rx) => {
                    crate::metrics::record_waiter();
                    debug!("refresh already in flight, waiting");
                    if let Some(outcome) = wait_for_outcome(rx).await {
                        return outcome;
                    }
                    // The leader was dropped mid-refresh; take over
                    debug!("refresh leader abandoned, retrying");
                }
            }
        }
    }

    async fn run_refresh(&self) -> RefreshOutcome {
        let Some(refresh) = self.store.refresh_token().await else {
            warn!("no refresh token stored, ending session");
            let error = RefreshError::new(LogoutReason::MissingRefreshToken, None);
            return Err(self.end_session(error).await);
        };

        match self.refresher.exchange(refresh.as_str()).await {
            Ok(response) => {
                let access = Secret::new(response.token);
                let rotated = response.refresh_token.is_some();
                let pair = CredentialPair {
                    access_token: access.clone(),
                    refresh_token: response
                        .refresh_token
                        .map(Secret::new)
                        .unwrap_or_else(|| refresh.clone()),
                };
                match self.store.replace(&refresh, pair).await {
                    Ok(true) => {}
                    Ok(false) => return self.superseded().await,
                    Err(e) => warn!(error = %e, "failed to persist refreshed credentials"),
                }
                crate::metrics::record_refresh_success();
                info!(rotated, "token refresh succeeded");
                Ok(access)
            }
            Err(e) => {
                let code = e.backend_code().map(str::to_owned);
                let reason = classify(code.as_deref());
                warn!(error = %e, reason = reason.as_str(), "token refresh failed");
                Err(self.end_session(RefreshError::new(reason, code)).await)
            }
        }
    }

    /// The session changed while the refresh was in flight. A newer login
    /// wins; after a logout there is nothing to refresh and nothing to publish.
    async fn superseded(&self) -> RefreshOutcome {
        match self.store.access_token().await {
            Some(current) => {
                debug!("session replaced during refresh, using newer credentials");
                Ok(current)
            }
            None => {
                info!("session cleared during refresh, discarding refreshed credentials");
                Err(RefreshError::new(LogoutReason::TokenRefreshFailed, None))
            }
        }
    }

    async fn end_session(&self, error: RefreshError) -> RefreshError {
        // Recorded before the clear so anyone who sees the empty store also
        // sees why it was emptied
        let access_token = self.store.access_token().await;
        *lock(&self.ended) = Some(EndedSession {
            access_token,
            error: error.clone(),
        });

        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to persist cleared credentials");
        }
        self.events
            .publish(error.reason, error.backend_error.clone());
        crate::metrics::record_refresh_failure(error.reason);
        error
    }
}

/// The leader's claim on the refreshing state.
///
/// Returns the state to `Idle` even if the leader's future is dropped before
/// `finish`; waiters then see the closed channel and retry.
struct InFlight<'a> {
    state: &'a Mutex<RefreshState>,
    sender: Option<watch::Sender<Option<RefreshOutcome>>>,
}

impl InFlight<'_> {
    fn finish(mut self, outcome: RefreshOutcome) {
        let mut state = lock(self.state);
        *state = RefreshState::Idle;
        if let Some(sender) = self.sender.take() {
            // send_replace stores the value even when no waiter subscribed
            sender.send_replace(Some(outcome));
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!("refresh abandoned before completion");
            *lock(self.state) = RefreshState::Idle;
        }
    }
}

/// `None` means the leader went away without publishing an outcome.
async fn wait_for_outcome(
    mut rx: watch::Receiver<Option<RefreshOutcome>>,
) -> Option<RefreshOutcome> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone(),
        Err(_) => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
