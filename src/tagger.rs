//! Bearer credential tagging for outgoing requests

use crate::token_store::TokenStore;
use reqwest::RequestBuilder;
use std::sync::Arc;

/// Attaches `Authorization: Bearer <access token>` to outgoing requests
#[derive(Clone)]
pub struct RequestTagger {
    token_store: Arc<dyn TokenStore>,
}

impl RequestTagger {
    pub fn new(token_store: Arc<dyn TokenStore>) -> Self {
        Self { token_store }
    }

    /// Tag with the stored access token; untouched when logged out
    pub fn tag(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token_store.access_token() {
            Some(token) => Self::tag_with(builder, &token),
            None => builder,
        }
    }

    /// Tag with an explicit token, e.g. the one a renewal just produced
    pub fn tag_with(builder: RequestBuilder, access_token: &str) -> RequestBuilder {
        if access_token.is_empty() {
            return builder;
        }
        builder.bearer_auth(access_token)
    }
}
