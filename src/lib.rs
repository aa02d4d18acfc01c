//! Venue Rust Client
//!
//! A Rust client library for the venue management API (menus, products,
//! tables, reservations, orders), with bearer authentication, durable token
//! storage and transparent single-flight access token renewal.

pub mod api_client;
pub mod classifier;
pub mod config;
pub mod error;
pub mod refresh;
pub mod session;
pub mod tagger;
pub mod token_store;
pub mod types;

pub use api_client::ApiClient;
pub use classifier::{classify, FailureClass};
pub use config::ClientConfig;
pub use error::{ClientError, RefreshError, Result};
pub use refresh::{HttpRenewer, RefreshCoordinator, TokenRenewer};
pub use session::{Navigator, NavigatorNoop, SessionTerminator};
pub use tagger::RequestTagger;
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use types::{ApiRequest, RequestAttempt, TokenPair, UserInfo};
