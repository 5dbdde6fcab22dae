//! Authentication gate run before a connection is admitted.
//!
//! The server captures the WebSocket upgrade request as a [`ConnectionRequest`]
//! and hands it to an [`IdentityResolver`]. A connection whose identity cannot
//! be resolved is told why and closed; it never reaches the registry.

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::config::{AuthConfig, AuthMode};
use crate::protocol::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// The parts of an upgrade request that identity resolution may inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Decoded request path.
    pub path: String,
    /// Decoded query parameters; the last occurrence of a key wins.
    pub query: HashMap<String, String>,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
}

impl ConnectionRequest {
    /// Capture a request target (`/doc?key=value`) and its headers. The path
    /// and query are percent-decoded.
    pub fn from_parts<I, K, V>(path_and_query: &str, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let target = if path_and_query.starts_with('/') {
            format!("ws://localhost{path_and_query}")
        } else {
            format!("ws://localhost/{path_and_query}")
        };
        let (path, query) = match Url::parse(&target) {
            Ok(url) => (
                percent_decode_str(url.path()).decode_utf8_lossy().into_owned(),
                url.query_pairs()
                    .map(|(key, value)| (key.into_owned(), value.into_owned()))
                    .collect(),
            ),
            Err(e) => {
                log::debug!("Unparseable request target {path_and_query:?}: {e}");
                (String::from("/"), HashMap::new())
            }
        };
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.as_ref().to_ascii_lowercase(), value.into()))
            .collect();
        Self {
            path,
            query,
            headers,
        }
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// `Authorization: Bearer <token>`, falling back to `?token=`.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .or_else(|| self.query_param("token"))
    }

    /// Document named by the URL path, if any.
    pub fn document_id(&self) -> Option<&str> {
        let id = self.path.trim_matches('/');
        (!id.is_empty()).then_some(id)
    }
}

/// Resolves the user behind an upgrade request.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, request: &ConnectionRequest) -> Result<UserId, AuthError>;
}

/// Admits everyone. Uses `?user=` when given, otherwise a generated id.
#[derive(Debug, Default)]
pub struct AnonymousResolver;

#[async_trait]
impl IdentityResolver for AnonymousResolver {
    async fn resolve_identity(&self, request: &ConnectionRequest) -> Result<UserId, AuthError> {
        Ok(match request.query_param("user") {
            Some(user) => UserId::new(user),
            None => UserId::new(format!("anon-{}", uuid::Uuid::new_v4().simple())),
        })
    }
}

/// Static bearer-token table.
#[derive(Debug, Default)]
pub struct TokenResolver {
    tokens: HashMap<String, UserId>,
}

impl TokenResolver {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(token, user)| (token, UserId::new(user)))
                .collect(),
        }
    }
}

#[async_trait]
impl IdentityResolver for TokenResolver {
    async fn resolve_identity(&self, request: &ConnectionRequest) -> Result<UserId, AuthError> {
        let token = request.bearer_token().ok_or(AuthError::MissingCredentials)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)
    }
}

pub fn resolver_from_config(config: &AuthConfig) -> Arc<dyn IdentityResolver> {
    match config.mode {
        AuthMode::Anonymous => Arc::new(AnonymousResolver),
        AuthMode::Token => Arc::new(TokenResolver::new(config.tokens.clone())),
    }
}
