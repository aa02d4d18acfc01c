//! Session termination: wipe tokens and send the user back to login

use crate::token_store::TokenStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Hook into the hosting application's routing
pub trait Navigator: Send + Sync {
    /// Move the user to `route`, e.g. `/login`
    fn navigate(&self, route: &str);
}

impl<F> Navigator for F
where
    F: Fn(&str) + Send + Sync,
{
    fn navigate(&self, route: &str) {
        self(route)
    }
}

/// Navigator for headless use: only logs the redirect
pub struct NavigatorNoop {}

impl Navigator for NavigatorNoop {
    fn navigate(&self, route: &str) {
        info!(route = %route, "Session ended, login required");
    }
}

impl NavigatorNoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {})
    }
}

/// Tears down the session after a failed renewal or an explicit logout
pub struct SessionTerminator {
    token_store: Arc<dyn TokenStore>,
    navigator: Arc<dyn Navigator>,
    login_route: String,
    terminated: AtomicBool,
}

impl SessionTerminator {
    pub fn new(
        token_store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
        login_route: impl Into<String>,
    ) -> Self {
        Self {
            token_store,
            navigator,
            login_route: login_route.into(),
            terminated: AtomicBool::new(false),
        }
    }

    /// Clear the stored tokens and redirect to the login route
    ///
    /// Repeated calls keep the store cleared but redirect only once per
    /// session; [`rearm`](Self::rearm) starts a new session.
    pub fn terminate(&self) {
        self.token_store.clear();

        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!(route = %self.login_route, "Terminating session");
        self.navigator.navigate(&self.login_route);
    }

    /// Called once a fresh login installed new tokens
    pub fn rearm(&self) {
        self.terminated.store(false, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}
