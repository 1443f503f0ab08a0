use std::sync::Arc;

use crate::client::{OAuthClient, RefreshObserver, Subscription};
use crate::credentials::CredentialUpdate;
use crate::store::TokenStore;

/// Writes every refreshed token back to the token file
#[derive(Debug)]
pub struct RefreshListener {
    store: Arc<TokenStore>,
}

impl RefreshListener {
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self { store }
    }

    /// Register on `client` for as long as the returned subscription lives
    pub fn attach<C>(client: &C, store: Arc<TokenStore>) -> Subscription
    where
        C: OAuthClient + ?Sized,
    {
        client.subscribe(Arc::new(Self::new(store)))
    }
}

impl RefreshObserver for RefreshListener {
    fn on_refresh(&self, update: &CredentialUpdate) {
        // The refreshed token stays usable in memory even if it cannot be saved
        match self.store.merge(update) {
            Ok(_) => tracing::info!(
                path = %self.store.path().display(),
                rotated_refresh_token = update.refresh_token.is_some(),
                "persisted refreshed OAuth token"
            ),
            Err(e) => tracing::warn!("failed to persist refreshed OAuth token: {}", e),
        }
    }
}
