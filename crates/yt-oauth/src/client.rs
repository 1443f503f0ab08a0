use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::credentials::{CredentialUpdate, Credentials};
use crate::error::Result;

/// Parameters for building the provider's consent page URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUrlRequest {
    /// Redirect URI, byte-for-byte as it will be sent with the code exchange
    pub redirect_uri: String,
    /// `offline` asks for a refresh token
    pub access_type: String,
    /// `consent` forces the consent screen so a refresh token is always issued
    pub prompt: String,
    pub scopes: Vec<String>,
}

impl AuthUrlRequest {
    /// Offline access with forced consent
    pub fn offline(redirect_uri: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            access_type: "offline".to_string(),
            prompt: "consent".to_string(),
            scopes,
        }
    }
}

/// Receives the fields of every token refresh performed by an [`OAuthClient`]
pub trait RefreshObserver: Send + Sync {
    fn on_refresh(&self, update: &CredentialUpdate);
}

/// OAuth 2.0 client that can run the authorization code grant
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// URL of the consent page the user must visit
    fn authorization_url(&self, request: &AuthUrlRequest) -> String;

    /// Trade an authorization code for a credential record
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Credentials>;

    /// Install the credential record used for subsequent calls
    fn set_credentials(&self, credentials: Credentials);

    fn credentials(&self) -> Option<Credentials>;

    /// Current access token, refreshed first if it has expired
    async fn access_token(&self) -> Result<String>;

    /// Register an observer for token refreshes until the subscription is dropped
    fn subscribe(&self, observer: Arc<dyn RefreshObserver>) -> Subscription;
}

type Observers = Mutex<HashMap<u64, Arc<dyn RefreshObserver>>>;

/// Fan-out of refresh notifications to registered observers
#[derive(Default)]
pub struct RefreshNotifier {
    observers: Arc<Observers>,
    next_id: AtomicU64,
}

impl RefreshNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn RefreshObserver>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.observers).insert(id, observer);
        Subscription {
            observers: Arc::downgrade(&self.observers),
            id,
        }
    }

    /// Deliver `update` to every observer, one after another
    pub fn notify(&self, update: &CredentialUpdate) {
        // Snapshot so observers can subscribe or unsubscribe from a callback
        let observers: Vec<_> = lock(&self.observers).values().cloned().collect();
        for observer in observers {
            observer.on_refresh(update);
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }
}

impl std::fmt::Debug for RefreshNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshNotifier")
            .field("observers", &self.observer_count())
            .finish()
    }
}

fn lock(observers: &Observers) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn RefreshObserver>>> {
    observers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps an observer registered; dropping it detaches the observer
#[derive(Debug)]
#[must_use = "dropping a Subscription detaches its observer immediately"]
pub struct Subscription {
    observers: Weak<Observers>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            lock(&observers).remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CredentialUpdate>>);

    impl RefreshObserver for Recorder {
        fn on_refresh(&self, update: &CredentialUpdate) {
            self.0.lock().unwrap().push(update.clone());
        }
    }

    #[test]
    fn offline_request_forces_consent() {
        let request = AuthUrlRequest::offline("http://localhost:8080/cb", vec![]);
        assert_eq!(request.access_type, "offline");
        assert_eq!(request.prompt, "consent");
    }

    #[test]
    fn observers_receive_updates_until_dropped() {
        let notifier = RefreshNotifier::new();
        let recorder = Arc::new(Recorder::default());
        let subscription = notifier.subscribe(recorder.clone());

        let update = CredentialUpdate {
            access_token: Some("A2".to_string()),
            ..Default::default()
        };
        notifier.notify(&update);
        assert_eq!(notifier.observer_count(), 1);

        drop(subscription);
        notifier.notify(&update);

        assert_eq!(notifier.observer_count(), 0);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn subscription_outliving_notifier_is_harmless() {
        let notifier = RefreshNotifier::new();
        let subscription = notifier.subscribe(Arc::new(Recorder::default()));
        drop(notifier);
        drop(subscription);
    }
}
