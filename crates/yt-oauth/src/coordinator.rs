use std::sync::Arc;
use std::time::Duration;

use crate::browser::{BrowserLauncher, SystemBrowser};
use crate::client::{AuthUrlRequest, OAuthClient, Subscription};
use crate::config::{ClientConfig, YOUTUBE_READONLY_SCOPE};
use crate::credentials::Credentials;
use crate::error::{AuthError, Result};
use crate::google::GoogleOAuthClient;
use crate::loopback::{LoopbackHandle, LoopbackServer};
use crate::refresh::RefreshListener;
use crate::store::TokenStore;

/// Knobs for the interactive authorization
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// OAuth scope(s)
    pub scopes: Vec<String>,
    /// Listen on this port instead of the redirect URI's; the URI is rewritten to match
    pub fixed_port: Option<u16>,
    /// Give up waiting for the browser callback after this long; `None` waits forever
    pub callback_timeout: Option<Duration>,
    /// Run the consent flow even when a token is already stored
    pub force_consent: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            scopes: vec![YOUTUBE_READONLY_SCOPE.to_string()],
            fixed_port: None,
            callback_timeout: None,
            force_consent: false,
        }
    }
}

/// OAuth client with credentials installed and refreshes persisted.
///
/// Refreshed tokens are written to the token file for as long as this handle
/// lives; dropping it detaches the refresh listener.
pub struct AuthenticatedClient<C> {
    client: Arc<C>,
    persistence_error: Option<AuthError>,
    _refresh_subscription: Subscription,
}

impl<C: OAuthClient> AuthenticatedClient<C> {
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Current access token, refreshed by the client when it has expired
    pub async fn access_token(&self) -> Result<String> {
        self.client.access_token().await
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.client.credentials()
    }

    /// Why a freshly granted token could not be written to the token file.
    ///
    /// The client still works for this run, but the next start will have to
    /// authorize again.
    pub fn persistence_error(&self) -> Option<&AuthError> {
        self.persistence_error.as_ref()
    }
}

impl<C> std::fmt::Debug for AuthenticatedClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedClient").finish_non_exhaustive()
    }
}

/// Produces an authenticated client, from the token file or through the browser
pub struct AuthorizationCoordinator<B = SystemBrowser> {
    store: Arc<TokenStore>,
    browser: B,
    options: CoordinatorOptions,
}

impl AuthorizationCoordinator<SystemBrowser> {
    pub fn new(store: TokenStore) -> Self {
        Self {
            store: Arc::new(store),
            browser: SystemBrowser,
            options: CoordinatorOptions::default(),
        }
    }
}

impl<B: BrowserLauncher> AuthorizationCoordinator<B> {
    pub fn with_browser<L: BrowserLauncher>(self, browser: L) -> AuthorizationCoordinator<L> {
        AuthorizationCoordinator {
            store: self.store,
            browser,
            options: self.options,
        }
    }

    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Authenticate a [`GoogleOAuthClient`] built from `config`
    pub async fn obtain_google_client(
        &self,
        config: &ClientConfig,
    ) -> Result<AuthenticatedClient<GoogleOAuthClient>> {
        self.obtain_client(config, GoogleOAuthClient::new(config.clone()))
            .await
    }

    /// Install stored credentials on `client`, or run the consent flow to get them.
    ///
    /// With a stored token nothing touches the network: an expired access
    /// token is refreshed by the client on first use. Without one, this waits
    /// for the browser callback, with no time limit unless
    /// [`CoordinatorOptions::callback_timeout`] is set.
    pub async fn obtain_client<C: OAuthClient>(
        &self,
        config: &ClientConfig,
        client: C,
    ) -> Result<AuthenticatedClient<C>> {
        let client = Arc::new(client);

        if !self.options.force_consent {
            if let Some(credentials) = self.store.load()? {
                tracing::info!(
                    path = %self.store.path().display(),
                    "using stored OAuth token"
                );
                client.set_credentials(credentials);
                return Ok(self.attach(client, None));
            }
        }

        let granted = self.authorize(config, client.as_ref()).await?;

        // Merged, so a re-grant without a refresh token keeps the stored one
        let (credentials, persistence_error) = match self.store.merge_record(&granted) {
            Ok(merged) => {
                tracing::info!(path = %self.store.path().display(), "OAuth token saved");
                (merged, None)
            }
            Err(e) => {
                tracing::warn!("OAuth token could not be saved: {}", e);
                (granted, Some(e))
            }
        };

        client.set_credentials(credentials);
        Ok(self.attach(client, persistence_error))
    }

    fn attach<C: OAuthClient>(
        &self,
        client: Arc<C>,
        persistence_error: Option<AuthError>,
    ) -> AuthenticatedClient<C> {
        let subscription = RefreshListener::attach(client.as_ref(), Arc::clone(&self.store));
        AuthenticatedClient {
            client,
            persistence_error,
            _refresh_subscription: subscription,
        }
    }

    async fn authorize<C: OAuthClient + ?Sized>(
        &self,
        config: &ClientConfig,
        client: &C,
    ) -> Result<Credentials> {
        let mut endpoint = config.redirect_endpoint()?;
        if let Some(port) = self.options.fixed_port {
            endpoint = endpoint.with_port(port)?;
        }

        let mut server = LoopbackServer::start(&endpoint).await?;
        if endpoint.port() == 0 {
            // Ephemeral port: the redirect must name the port actually bound
            endpoint = endpoint.with_port(server.local_addr().port())?;
        }

        let redirect_uri = endpoint.uri().to_string();
        let auth_url = client.authorization_url(&AuthUrlRequest::offline(
            redirect_uri.clone(),
            self.options.scopes.clone(),
        ));

        eprintln!("\n=================================================");
        eprintln!("OAuth 2.0 Authorization Required");
        eprintln!("=================================================");
        eprintln!("\nOpening your browser. If it does not open, visit this URL:\n");
        eprintln!("{}\n", auth_url);
        eprintln!("Waiting for authorization...");
        eprintln!("=================================================\n");

        if let Err(e) = self.browser.open(&auth_url) {
            tracing::warn!("failed to open browser: {}", e);
        }

        let code = self.wait_for_code(&mut server).await;
        server.shutdown().await;
        let code = code?;

        client.exchange_code(&code, &redirect_uri).await
    }

    async fn wait_for_code(&self, server: &mut LoopbackHandle) -> Result<String> {
        match self.options.callback_timeout {
            Some(limit) => tokio::time::timeout(limit, server.await_code())
                .await
                .unwrap_or_else(|_| Err(AuthError::CallbackTimeout(limit))),
            None => server.await_code().await,
        }
    }
}
