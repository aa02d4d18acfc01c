//! API client with bearer authentication and transparent token renewal

use crate::classifier::{classify, FailureClass};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::refresh::{HttpRenewer, RefreshCoordinator, TokenRenewer};
use crate::session::{Navigator, SessionTerminator};
use crate::tagger::RequestTagger;
use crate::token_store::TokenStore;
use crate::types::*;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Venue API client
///
/// Every call goes through the same pipeline: tag with the stored access
/// token, send, and on a first `401` wait for a (shared) token renewal and
/// replay the call once with the new token.
pub struct ApiClient<R = HttpRenewer> {
    config: ClientConfig,
    http_client: Client,
    token_store: Arc<dyn TokenStore>,
    tagger: RequestTagger,
    terminator: Arc<SessionTerminator>,
    coordinator: RefreshCoordinator<R>,
}

impl ApiClient {
    /// Create a new API client renewing tokens over `POST /auth/refresh`
    ///
    /// # Arguments
    /// * `config` - Base URL and routes
    /// * `token_store` - Where the session's tokens live
    /// * `navigator` - Called with the login route when the session ends
    pub fn new(
        config: ClientConfig,
        token_store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let http_client = Client::builder().build()?;
        let renewer = HttpRenewer::new(http_client.clone(), config.refresh_url());
        Ok(Self::assemble(config, http_client, token_store, navigator, renewer))
    }
}

impl<R: TokenRenewer + 'static> ApiClient<R> {
    /// Create a client with a custom way of renewing tokens
    pub fn with_renewer(
        config: ClientConfig,
        token_store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
        renewer: R,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let http_client = Client::builder().build()?;
        Ok(Self::assemble(config, http_client, token_store, navigator, renewer))
    }

    fn assemble(
        config: ClientConfig,
        http_client: Client,
        token_store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
        renewer: R,
    ) -> Arc<Self> {
        let terminator = Arc::new(SessionTerminator::new(
            Arc::clone(&token_store),
            navigator,
            config.login_route.clone(),
        ));
        let coordinator =
            RefreshCoordinator::new(renewer, Arc::clone(&token_store), Arc::clone(&terminator));

        Arc::new(Self {
            tagger: RequestTagger::new(Arc::clone(&token_store)),
            config,
            http_client,
            token_store,
            terminator,
            coordinator,
        })
    }

    /// Send a request, renewing the access token at most once on `401`
    ///
    /// Transport errors and non-`401` failures are returned as they are. A
    /// replay that fails again, `401` included, is returned as well.
    pub async fn send(&self, request: ApiRequest) -> Result<Response> {
        let mut attempt = RequestAttempt::first(request);
        let mut fresh_token: Option<String> = None;

        loop {
            let response = self.dispatch(&attempt, fresh_token.as_deref()).await?;
            let status = response.status();
            if status.is_success() {
                if attempt.retried() {
                    debug!(path = %attempt.request().path, "Replayed request succeeded");
                }
                return Ok(response);
            }

            match classify(Some(status), &attempt) {
                FailureClass::NotAuthFailure => return Err(status_error(response).await),
                FailureClass::AuthFailure => {
                    debug!(
                        method = %attempt.request().method,
                        path = %attempt.request().path,
                        "Access token rejected"
                    );
                    // Release the connection while waiting on the renewal
                    drop(response);
                    let (retry, access_token) = self.coordinator.handle_auth_failure(attempt).await?;
                    attempt = retry;
                    fresh_token = Some(access_token);
                }
            }
        }
    }

    async fn dispatch(&self, attempt: &RequestAttempt, access_token: Option<&str>) -> Result<Response> {
        let builder = self.build(attempt.request());
        let builder = match access_token {
            Some(token) => RequestTagger::tag_with(builder, token),
            None => self.tagger.tag(builder),
        };
        Ok(builder.send().await?)
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .http_client
            .request(request.method.clone(), self.config.url(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    /// Send without credentials and outside token renewal (login, register)
    async fn send_public(&self, request: ApiRequest) -> Result<Response> {
        let response = self.build(&request).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(ApiRequest::get(path)).await?;
        read_json(response).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = ApiRequest::post(path).json(serde_json::to_value(body)?);
        read_json(self.send(request).await?).await
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = ApiRequest::put(path).json(serde_json::to_value(body)?);
        read_json(self.send(request).await?).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Log in and install the returned tokens
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair> {
        let request = ApiRequest::post("/auth/login")
            .json(serde_json::to_value(LoginRequest { email, password })?);
        let tokens: TokenPair = read_json(self.send_public(request).await?).await?;
        if !tokens.is_complete() {
            return Err(ClientError::InvalidResponse(
                "login response is missing a token".to_string(),
            ));
        }

        self.token_store.set(tokens.clone());
        self.terminator.rearm();
        info!(email = %email, "Logged in");

        Ok(tokens)
    }

    /// Create an account; returns the server's confirmation message
    pub async fn register(&self, request: &RegisterRequest) -> Result<String> {
        let request = ApiRequest::post("/auth/register").json(serde_json::to_value(request)?);
        let response = self.send_public(request).await?;
        Ok(response.text().await?)
    }

    pub async fn current_user(&self) -> Result<UserInfo> {
        self.get_json("/auth/me").await
    }

    /// Drop the session and go back to the login route
    pub fn logout(&self) {
        info!("Logging out");
        self.terminator.terminate();
    }

    pub fn is_authenticated(&self) -> bool {
        self.token_store.get().is_some()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the token store (for advanced usage)
    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.token_store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator<R> {
        &self.coordinator
    }
}

async fn status_error(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ClientError::Status { status, body }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let bytes = response.bytes().await?;

    // 204/205 carry no body
    if bytes.is_empty() || status == StatusCode::NO_CONTENT || status == StatusCode::RESET_CONTENT {
        return serde_json::from_value(serde_json::Value::Null).map_err(|_| {
            ClientError::InvalidResponse(format!("empty {} response body", status.as_u16()))
        });
    }

    Ok(serde_json::from_slice(&bytes)?)
}
