//! Single-flight access token renewal
//!
//! Every request that fails with `401 Unauthorized` on its first attempt ends
//! up in [`RefreshCoordinator::handle_auth_failure`]. The first one to arrive
//! while no renewal is running performs the renewal; everyone arriving while
//! it is in flight is queued and released, in arrival order, with its outcome.

use crate::error::RefreshError;
use crate::session::SessionTerminator;
use crate::token_store::TokenStore;
use crate::types::{RefreshRequest, RequestAttempt, TokenPair};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Exchanges a refresh token for a new token pair
pub trait TokenRenewer: Send + Sync {
    fn renew(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenPair, RefreshError>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Renewal over `POST /auth/refresh`
///
/// Sent on a bare client: the renewal call itself is never tagged with the
/// (expired) access token and never re-enters renewal.
pub struct HttpRenewer {
    http_client: Client,
    refresh_url: String,
}

impl HttpRenewer {
    pub fn new(http_client: Client, refresh_url: impl Into<String>) -> Self {
        Self {
            http_client,
            refresh_url: refresh_url.into(),
        }
    }
}

impl TokenRenewer for HttpRenewer {
    async fn renew(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let response = self
            .http_client
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        // Servers that do not rotate refresh tokens omit the field
        let refresh_token = refreshed
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| refresh_token.to_string());
        let pair = TokenPair::new(refreshed.access_token, refresh_token);
        if !pair.is_complete() {
            return Err(RefreshError::InvalidResponse(
                "empty access token in refresh response".to_string(),
            ));
        }

        Ok(pair)
    }
}

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: VecDeque<Waiter> },
}

struct Shared<R> {
    renewer: R,
    token_store: Arc<dyn TokenStore>,
    terminator: Arc<SessionTerminator>,
    state: Mutex<RefreshState>,
}

/// Owner of the refresh state and its waiter queue
///
/// One instance lives per client. The renewal runs on its own task, so it
/// completes, updates the store and releases every waiter even when the
/// caller that started it goes away. The state mutex is only held for
/// bookkeeping, never across the renewal call.
pub struct RefreshCoordinator<R> {
    shared: Arc<Shared<R>>,
}

impl<R: TokenRenewer + 'static> RefreshCoordinator<R> {
    pub fn new(
        renewer: R,
        token_store: Arc<dyn TokenStore>,
        terminator: Arc<SessionTerminator>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                renewer,
                token_store,
                terminator,
                state: Mutex::new(RefreshState::Idle),
            }),
        }
    }

    /// Obtain a fresh access token for a request that hit `401`
    ///
    /// Returns the attempt marked as retried together with the token to
    /// replay it with. A failed renewal rejects every coalesced caller with
    /// the same error and terminates the session.
    pub async fn handle_auth_failure(
        &self,
        attempt: RequestAttempt,
    ) -> Result<(RequestAttempt, String), RefreshError> {
        let attempt = attempt.into_retry();
        let (tx, rx) = oneshot::channel();

        let leader = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    waiters.push_back(tx);
                    debug!(
                        path = %attempt.request().path,
                        waiters = waiters.len(),
                        "Token refresh in flight, waiting"
                    );
                    None
                }
                idle @ RefreshState::Idle => {
                    *idle = RefreshState::Refreshing {
                        waiters: VecDeque::new(),
                    };
                    Some(tx)
                }
            }
        };

        if let Some(leader) = leader {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move { shared.run_episode(leader).await });
        }

        let access_token = rx.await.unwrap_or(Err(RefreshError::Interrupted))?;
        Ok((attempt, access_token))
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.shared.state.lock(), RefreshState::Refreshing { .. })
    }

    /// Callers queued behind the in-flight renewal, not counting the one
    /// that started it
    pub fn pending_waiters(&self) -> usize {
        match &*self.shared.state.lock() {
            RefreshState::Refreshing { waiters } => waiters.len(),
            RefreshState::Idle => 0,
        }
    }
}

impl<R: TokenRenewer> Shared<R> {
    async fn run_episode(&self, leader: Waiter) {
        info!("Refreshing access token");

        let mut episode = Episode {
            state: &self.state,
            open: true,
        };
        let outcome = self.renew().await;
        let waiters = episode.close();

        match outcome {
            Ok(access_token) => {
                info!(waiters = waiters.len(), "Access token refreshed successfully");
                for waiter in waiters {
                    let _ = waiter.send(Ok(access_token.clone()));
                }
                let _ = leader.send(Ok(access_token));
            }
            Err(e) => {
                warn!(error = %e, waiters = waiters.len(), "Token refresh failed");
                // Callers only hear about the failure once the session is gone
                self.terminator.terminate();
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                let _ = leader.send(Err(e));
            }
        }
    }

    async fn renew(&self) -> Result<String, RefreshError> {
        let refresh_token = self
            .token_store
            .refresh_token()
            .filter(|t| !t.is_empty())
            .ok_or(RefreshError::MissingRefreshToken)?;

        let pair = self.renewer.renew(&refresh_token).await?;
        let access_token = pair.access_token.clone();
        self.token_store.set(pair);

        Ok(access_token)
    }
}

/// A running renewal; closing it returns the state to `Idle`
///
/// Only a panicking renewer or a runtime shutting down drops an open
/// episode. Its waiters are then rejected instead of staying queued.
struct Episode<'a> {
    state: &'a Mutex<RefreshState>,
    open: bool,
}

impl Episode<'_> {
    fn close(&mut self) -> VecDeque<Waiter> {
        self.open = false;
        match std::mem::replace(&mut *self.state.lock(), RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => VecDeque::new(),
        }
    }
}

impl Drop for Episode<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let waiters = self.close();
        warn!(waiters = waiters.len(), "Token refresh interrupted");
        for waiter in waiters {
            let _ = waiter.send(Err(RefreshError::Interrupted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Navigator;
    use crate::token_store::MemoryTokenStore;
    use crate::types::ApiRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Renewer that blocks until the test opens the gate
    struct GatedRenewer {
        calls: AtomicUsize,
        gate: Semaphore,
        outcome: Result<TokenPair, RefreshError>,
        seen: Mutex<Vec<String>>,
    }

    impl GatedRenewer {
        fn new(outcome: Result<TokenPair, RefreshError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                outcome,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn open(&self) {
            self.gate.add_permits(16);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenRenewer for Arc<GatedRenewer> {
        async fn renew(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(refresh_token.to_string());
            let _permit = self.gate.acquire().await.map_err(|_| RefreshError::Interrupted)?;
            self.outcome.clone()
        }
    }

    struct Fixture {
        renewer: Arc<GatedRenewer>,
        store: Arc<MemoryTokenStore>,
        terminator: Arc<SessionTerminator>,
        redirects: Arc<AtomicUsize>,
        coordinator: Arc<RefreshCoordinator<Arc<GatedRenewer>>>,
    }

    fn fixture(outcome: Result<TokenPair, RefreshError>) -> Fixture {
        let renewer = Arc::new(GatedRenewer::new(outcome));
        let store = Arc::new(MemoryTokenStore::with_tokens(TokenPair::new(
            "old-access",
            "old-refresh",
        )));
        let redirects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&redirects);
        let navigator: Arc<dyn Navigator> = Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let terminator = Arc::new(SessionTerminator::new(store.clone(), navigator, "/login"));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&renewer),
            store.clone(),
            terminator.clone(),
        ));
        Fixture {
            renewer,
            store,
            terminator,
            redirects,
            coordinator,
        }
    }

    fn attempt(path: &str) -> RequestAttempt {
        RequestAttempt::first(ApiRequest::get(path))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_renewal() {
        let f = fixture(Ok(TokenPair::new("new-access", "new-refresh")));

        let coordinator = Arc::clone(&f.coordinator);
        let leader = tokio::spawn(async move { coordinator.handle_auth_failure(attempt("/a")).await });
        wait_until(|| f.renewer.calls() == 1).await;
        assert!(f.coordinator.is_refreshing());

        let mut waiters = Vec::new();
        for (i, p) in ["/b", "/c", "/d", "/e"].into_iter().enumerate() {
            let coordinator = Arc::clone(&f.coordinator);
            waiters.push(tokio::spawn(async move { coordinator.handle_auth_failure(attempt(p)).await }));
            wait_until(|| f.coordinator.pending_waiters() == i + 1).await;
        }

        f.renewer.open();

        let (retry, token) = leader.await.unwrap().unwrap();
        assert!(retry.retried());
        assert_eq!(token, "new-access");
        for waiter in waiters {
            let (retry, token) = waiter.await.unwrap().unwrap();
            assert!(retry.retried());
            assert_eq!(token, "new-access");
        }

        assert_eq!(f.renewer.calls(), 1);
        assert_eq!(*f.renewer.seen.lock(), vec!["old-refresh".to_string()]);
        assert_eq!(f.store.get(), Some(TokenPair::new("new-access", "new-refresh")));
        assert!(!f.coordinator.is_refreshing());
        assert_eq!(f.coordinator.pending_waiters(), 0);
        assert!(!f.terminator.is_terminated());
    }

    #[tokio::test]
    async fn test_waiters_released_in_arrival_order() {
        let f = fixture(Ok(TokenPair::new("new-access", "new-refresh")));
        let order = Arc::new(Mutex::new(Vec::new()));

        let coordinator = Arc::clone(&f.coordinator);
        let leader = tokio::spawn(async move { coordinator.handle_auth_failure(attempt("/lead")).await });
        wait_until(|| f.renewer.calls() == 1).await;

        let mut handles = Vec::new();
        for i in 1..=3 {
            let coordinator = Arc::clone(&f.coordinator);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let result = coordinator.handle_auth_failure(attempt("/w")).await;
                order.lock().push(i);
                result
            }));
            wait_until(|| f.coordinator.pending_waiters() == i).await;
        }

        f.renewer.open();
        leader.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_renewal_rejects_everyone() {
        let rejected = RefreshError::Rejected {
            status: 401,
            body: "refresh token expired".to_string(),
        };
        let f = fixture(Err(rejected.clone()));

        let coordinator = Arc::clone(&f.coordinator);
        let leader = tokio::spawn(async move { coordinator.handle_auth_failure(attempt("/a")).await });
        wait_until(|| f.renewer.calls() == 1).await;

        let mut waiters = Vec::new();
        for i in 1..=2 {
            let coordinator = Arc::clone(&f.coordinator);
            waiters.push(tokio::spawn(async move { coordinator.handle_auth_failure(attempt("/b")).await }));
            wait_until(|| f.coordinator.pending_waiters() == i).await;
        }

        f.renewer.open();

        assert_eq!(leader.await.unwrap().unwrap_err(), rejected);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap_err(), rejected);
        }

        assert_eq!(f.renewer.calls(), 1);
        assert!(f.store.get().is_none());
        assert!(f.terminator.is_terminated());
        assert_eq!(f.redirects.load(Ordering::SeqCst), 1);
        assert!(!f.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_later_failure_starts_new_renewal() {
        let f = fixture(Ok(TokenPair::new("new-access", "new-refresh")));
        f.renewer.open();

        f.coordinator.handle_auth_failure(attempt("/a")).await.unwrap();
        f.coordinator.handle_auth_failure(attempt("/b")).await.unwrap();

        assert_eq!(f.renewer.calls(), 2);
        assert_eq!(
            *f.renewer.seen.lock(),
            vec!["old-refresh".to_string(), "new-refresh".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_refresh_token_terminates() {
        let f = fixture(Ok(TokenPair::new("new-access", "new-refresh")));
        f.store.clear();

        let err = f.coordinator.handle_auth_failure(attempt("/a")).await.unwrap_err();

        assert_eq!(err, RefreshError::MissingRefreshToken);
        assert_eq!(f.renewer.calls(), 0);
        assert!(f.terminator.is_terminated());
        assert!(!f.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_cancel_renewal() {
        let f = fixture(Ok(TokenPair::new("new-access", "new-refresh")));

        let coordinator = Arc::clone(&f.coordinator);
        let leader = tokio::spawn(async move { coordinator.handle_auth_failure(attempt("/a")).await });
        wait_until(|| f.renewer.calls() == 1).await;

        let coordinator = Arc::clone(&f.coordinator);
        let waiter = tokio::spawn(async move { coordinator.handle_auth_failure(attempt("/b")).await });
        wait_until(|| f.coordinator.pending_waiters() == 1).await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        assert!(f.coordinator.is_refreshing());

        f.renewer.open();

        let (retry, token) = waiter.await.unwrap().unwrap();
        assert!(retry.retried());
        assert_eq!(token, "new-access");
        assert_eq!(f.renewer.calls(), 1);
        assert_eq!(f.store.get(), Some(TokenPair::new("new-access", "new-refresh")));
        assert!(!f.coordinator.is_refreshing());
        assert!(!f.terminator.is_terminated());
    }

    #[tokio::test]
    async fn test_renewal_stores_tokens_after_sole_caller_left() {
        let f = fixture(Ok(TokenPair::new("new-access", "new-refresh")));

        let coordinator = Arc::clone(&f.coordinator);
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            coordinator.handle_auth_failure(attempt("/a")),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(f.renewer.calls(), 1);

        f.renewer.open();
        wait_until(|| !f.coordinator.is_refreshing()).await;

        assert_eq!(f.store.get(), Some(TokenPair::new("new-access", "new-refresh")));
        assert!(!f.terminator.is_terminated());
    }

    #[tokio::test]
    async fn test_http_renewer_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(serde_json::json!({ "refreshToken": "r1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "a2",
                "refreshToken": "r2"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let renewer = HttpRenewer::new(Client::new(), format!("{}/auth/refresh", mock_server.uri()));
        let pair = renewer.renew("r1").await.unwrap();
        assert_eq!(pair, TokenPair::new("a2", "r2"));
    }

    #[tokio::test]
    async fn test_http_renewer_keeps_refresh_token_when_not_rotated() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "accessToken": "a2" })),
            )
            .mount(&mock_server)
            .await;

        let renewer = HttpRenewer::new(Client::new(), format!("{}/auth/refresh", mock_server.uri()));
        let pair = renewer.renew("r1").await.unwrap();
        assert_eq!(pair, TokenPair::new("a2", "r1"));
    }

    #[tokio::test]
    async fn test_http_renewer_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(403).set_body_string("revoked"))
            .mount(&mock_server)
            .await;

        let renewer = HttpRenewer::new(Client::new(), format!("{}/auth/refresh", mock_server.uri()));
        let err = renewer.renew("r1").await.unwrap_err();
        assert_eq!(
            err,
            RefreshError::Rejected {
                status: 403,
                body: "revoked".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_http_renewer_malformed_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;

        let renewer = HttpRenewer::new(Client::new(), format!("{}/auth/refresh", mock_server.uri()));
        let err = renewer.renew("r1").await.unwrap_err();
        assert!(matches!(err, RefreshError::InvalidResponse(_)));
    }
}
