//! OAuth 2.0 for installed applications talking to the YouTube Data API.
//!
//! [`AuthorizationCoordinator`] reuses the token stored by [`TokenStore`] when
//! there is one. Otherwise it opens the browser on the consent page, captures
//! the redirect with a one-shot [`LoopbackServer`], exchanges the code and
//! stores the result. Either way the returned [`AuthenticatedClient`] keeps a
//! [`RefreshListener`] attached so refreshed tokens are written back without
//! losing the stored refresh token.

pub mod browser;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod google;
pub mod loopback;
pub mod refresh;
pub mod store;

pub use browser::{BrowserLauncher, SystemBrowser};
pub use client::{AuthUrlRequest, OAuthClient, RefreshNotifier, RefreshObserver, Subscription};
pub use config::{ClientConfig, RedirectEndpoint, YOUTUBE_READONLY_SCOPE};
pub use coordinator::{AuthenticatedClient, AuthorizationCoordinator, CoordinatorOptions};
pub use credentials::{CredentialUpdate, Credentials, ExpiryDate};
pub use error::{AuthError, Result};
pub use google::GoogleOAuthClient;
pub use loopback::{LoopbackHandle, LoopbackServer};
pub use refresh::RefreshListener;
pub use store::TokenStore;

/// Install a stderr `tracing` subscriber filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Ignore the error raised when a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
