use serde::Deserialize;
use std::path::Path;
use url::{Host, Url};

use crate::error::{AuthError, Result};

/// Google's OAuth 2.0 authorization endpoint
pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// Google's OAuth 2.0 token endpoint
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Read-only access to the authenticated user's YouTube account
pub const YOUTUBE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/youtube.readonly";

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Registered OAuth application, as downloaded from the Google Cloud console
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// OAuth client ID
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Redirect URIs registered for this client; the first one is used
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

/// Client secret files nest the configuration under the application type
#[derive(Deserialize)]
struct KeyFile {
    installed: Option<ClientConfig>,
    web: Option<ClientConfig>,
}

impl ClientConfig {
    /// Load the client configuration from a client secret JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuthError::Config(format!(
                "failed to read client secret file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content).map_err(|e| match e {
            AuthError::Config(msg) => AuthError::Config(format!("'{}': {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse a client secret document; `installed` wins over `web`
    pub fn from_json(content: &str) -> Result<Self> {
        let key_file: KeyFile =
            serde_json::from_str(content).map_err(|e| AuthError::Config(e.to_string()))?;
        let config = key_file
            .installed
            .or(key_file.web)
            .ok_or_else(|| AuthError::Config("missing 'installed' or 'web' section".to_string()))?;
        if config.redirect_uris.is_empty() {
            return Err(AuthError::Config("no redirect URIs registered".to_string()));
        }
        Ok(config)
    }

    /// Endpoint derived from the first registered redirect URI
    pub fn redirect_endpoint(&self) -> Result<RedirectEndpoint> {
        let uri = self
            .redirect_uris
            .first()
            .ok_or_else(|| AuthError::Config("no redirect URIs registered".to_string()))?;
        RedirectEndpoint::parse(uri)
    }
}

/// Where the provider sends the browser back to after consent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEndpoint {
    uri: String,
    bind_host: String,
    port: u16,
    path: String,
}

impl RedirectEndpoint {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| AuthError::Config(format!("invalid redirect URI '{}': {}", uri, e)))?;
        if url.scheme() != "http" {
            return Err(AuthError::Config(format!(
                "redirect URI '{}' must use http for a loopback listener",
                uri
            )));
        }

        // `localhost` may resolve to ::1 first while browsers try 127.0.0.1
        let bind_host = match url.host() {
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            Some(Host::Domain(domain)) if domain.eq_ignore_ascii_case("localhost") => {
                "127.0.0.1".to_string()
            }
            Some(Host::Domain(domain)) => domain.to_string(),
            None => {
                return Err(AuthError::Config(format!(
                    "redirect URI '{}' has no host",
                    uri
                )));
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self {
            uri: uri.to_string(),
            bind_host,
            port,
            path: url.path().to_string(),
        })
    }

    /// Same endpoint on another port; the URI is rewritten to match
    pub fn with_port(&self, port: u16) -> Result<Self> {
        let mut url = Url::parse(&self.uri)
            .map_err(|e| AuthError::Config(format!("invalid redirect URI '{}': {}", self.uri, e)))?;
        url.set_port(Some(port))
            .map_err(|_| AuthError::Config(format!("cannot set port on '{}'", self.uri)))?;
        Ok(Self {
            uri: url.to_string(),
            port,
            ..self.clone()
        })
    }

    /// The redirect URI exactly as sent to the provider
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn bind_host(&self) -> &str {
        &self.bind_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path a callback must hit to be accepted
    pub fn path(&self) -> &str {
        &self.path
    }
}
