use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::{Arc, Mutex};

use crate::client::{AuthUrlRequest, OAuthClient, RefreshNotifier, RefreshObserver, Subscription};
use crate::config::ClientConfig;
use crate::credentials::{CredentialUpdate, Credentials, ExpiryDate};
use crate::error::{AuthError, Result};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Token endpoint response for both the code and the refresh grant
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl TokenResponse {
    fn into_update(self) -> CredentialUpdate {
        let now = Utc::now();
        CredentialUpdate {
            access_token: Some(self.access_token),
            refresh_token: self.refresh_token,
            expiry_date: self.expires_in.map(|secs| ExpiryDate::after(now, secs)),
            scope: self.scope,
            token_type: self.token_type,
            id_token: self.id_token,
        }
    }

    fn into_credentials(self) -> Credentials {
        let update = self.into_update();
        let mut credentials = Credentials::new(update.access_token.clone().unwrap_or_default());
        credentials.apply(&update);
        credentials
    }
}

/// Generate PKCE verifier and challenge
fn generate_pkce() -> (String, String) {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use rand::Rng;
    use rand::distributions::Alphanumeric;
    use sha2::{Digest, Sha256};

    // Generate random verifier (43-128 characters) using cryptographically secure RNG
    let verifier: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();

    // Generate challenge: base64url(SHA256(verifier))
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

    (verifier, challenge)
}

/// OAuth 2.0 client for Google's installed-application flow.
///
/// Keeps the installed credentials in memory and refreshes the access token
/// lazily when it is requested after expiry. Every refresh is reported to the
/// observers registered through [`OAuthClient::subscribe`].
pub struct GoogleOAuthClient {
    config: ClientConfig,
    http: reqwest::Client,
    credentials: Mutex<Option<Credentials>>,
    /// Verifier for the authorization URL most recently handed out
    pkce_verifier: Mutex<Option<String>>,
    refresh_lock: tokio::sync::Mutex<()>,
    notifier: RefreshNotifier,
}

impl GoogleOAuthClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_http_client(config, reqwest::Client::new())
    }

    pub fn with_http_client(config: ClientConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            credentials: Mutex::new(None),
            pkce_verifier: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            notifier: RefreshNotifier::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn post_token_form(&self, params: &[(&str, &str)]) -> Result<reqwest::Response> {
        Ok(self
            .http
            .post(&self.config.token_uri)
            .form(params)
            .send()
            .await?)
    }

    /// Refresh the access token using the refresh token
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialUpdate> {
        tracing::info!("refreshing OAuth token");

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self.post_token_form(&params).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            return Err(AuthError::Refresh(format!("status {}: {}", status, body)));
        }

        let token: TokenResponse = response.json().await?;
        tracing::info!("OAuth token refreshed successfully");
        Ok(token.into_update())
    }
}

#[async_trait]
impl OAuthClient for GoogleOAuthClient {
    fn authorization_url(&self, request: &AuthUrlRequest) -> String {
        let (verifier, challenge) = generate_pkce();
        *lock(&self.pkce_verifier) = Some(verifier);

        let separator = if self.config.auth_uri.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}\
            client_id={}&\
            redirect_uri={}&\
            response_type=code&\
            scope={}&\
            code_challenge={}&\
            code_challenge_method=S256&\
            access_type={}&\
            prompt={}",
            self.config.auth_uri,
            separator,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&request.redirect_uri),
            urlencoding::encode(&request.scopes.join(" ")),
            urlencoding::encode(&challenge),
            urlencoding::encode(&request.access_type),
            urlencoding::encode(&request.prompt),
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Credentials> {
        tracing::info!("exchanging authorization code for tokens");

        let verifier = lock(&self.pkce_verifier).take();
        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(verifier) = verifier.as_deref() {
            params.push(("code_verifier", verifier));
        }

        let response = self.post_token_form(&params).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(AuthError::Exchange { status, body });
        }

        let token: TokenResponse = response.json().await?;
        if token.refresh_token.is_none() {
            tracing::warn!("token response carried no refresh token; re-authorization will be needed once it expires");
        }
        tracing::info!("successfully obtained OAuth tokens");
        Ok(token.into_credentials())
    }

    fn set_credentials(&self, credentials: Credentials) {
        *lock(&self.credentials) = Some(credentials);
    }

    fn credentials(&self) -> Option<Credentials> {
        lock(&self.credentials).clone()
    }

    async fn access_token(&self) -> Result<String> {
        let current = self
            .credentials()
            .ok_or_else(|| AuthError::Refresh("no OAuth credentials installed".to_string()))?;
        if !current.is_expired() {
            return Ok(current.access_token);
        }

        let _refreshing = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited for the lock
        let current = self
            .credentials()
            .ok_or_else(|| AuthError::Refresh("no OAuth credentials installed".to_string()))?;
        if !current.is_expired() {
            return Ok(current.access_token);
        }

        tracing::info!("access token expired");
        let refresh_token = current.refresh_token.ok_or_else(|| {
            AuthError::Refresh("access token expired and no refresh token is stored".to_string())
        })?;
        let update = self.refresh(&refresh_token).await?;

        let access_token = {
            let mut credentials = lock(&self.credentials);
            let record = credentials.get_or_insert_with(|| Credentials::new(String::new()));
            record.apply(&update);
            record.access_token.clone()
        };
        self.notifier.notify(&update);

        Ok(access_token)
    }

    fn subscribe(&self, observer: Arc<dyn RefreshObserver>) -> Subscription {
        self.notifier.subscribe(observer)
    }
}

impl std::fmt::Debug for GoogleOAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleOAuthClient")
            .field("client_id", &self.config.client_id)
            .field("token_uri", &self.config.token_uri)
            .field("has_credentials", &lock(&self.credentials).is_some())
            .finish()
    }
}
