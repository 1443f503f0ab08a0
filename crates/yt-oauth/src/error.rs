use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

/// Errors produced while authorizing, persisting or refreshing OAuth tokens
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Client configuration file missing or structurally invalid
    #[error("invalid client configuration: {0}")]
    Config(String),

    /// Loopback listener could not bind its port
    #[error("failed to bind OAuth callback server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Callback reached the redirect path without an authorization code
    #[error("no authorization code in callback: {0}")]
    Callback(String),

    #[error("no OAuth callback received within {0:?}")]
    CallbackTimeout(Duration),

    /// Callback server went away before resolving the pending authorization
    #[error("OAuth callback server stopped before receiving a callback")]
    Aborted,

    /// Provider rejected the code-for-token exchange
    #[error("failed to exchange authorization code (status {status}): {body}")]
    Exchange { status: u16, body: String },

    #[error("failed to refresh OAuth token: {0}")]
    Refresh(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Token file unreadable or unwritable
    #[error("failed to access token file '{}': {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{}': {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl AuthError {
    pub(crate) fn bind(addr: impl Display, source: std::io::Error) -> Self {
        AuthError::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
