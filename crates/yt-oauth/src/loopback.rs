//! One-shot HTTP listener that captures the provider's authorization redirect.
//!
//! The server accepts exactly one terminal callback on the redirect path. The
//! first callback either resolves the pending authorization with its `code` or
//! rejects it, and that same completion starts the shutdown: the listener stops
//! accepting, open connections finish the response they are writing, and any
//! connection still open after [`SHUTDOWN_GRACE`] is closed forcibly.

use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::RedirectEndpoint;
use crate::error::{AuthError, Result};

/// How long open connections may keep draining once shutdown has begun
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

const SUCCESS_BODY: &str =
    "Authentication successful! You may close this page and return to the console.";
const FAILURE_BODY: &str =
    "Authentication failed: no authorization code was received. You may close this page.";
const ALREADY_HANDLED_BODY: &str = "This authorization request has already been handled.";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single-assignment outcome of the authorization callback
struct PendingAuthorization {
    sender: Mutex<Option<oneshot::Sender<Result<String>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PendingAuthorization {
    /// Record the outcome and start shutdown; only the first call succeeds
    fn complete(&self, outcome: Result<String>) -> bool {
        let Some(sender) = lock(&self.sender).take() else {
            return false;
        };
        // The receiver may already be gone if the caller stopped waiting
        let _ = sender.send(outcome);
        self.shutdown.send_replace(true);
        true
    }
}

struct CallbackState {
    path: String,
    pending: PendingAuthorization,
}

/// Loopback listener for the authorization code redirect
pub struct LoopbackServer;

impl LoopbackServer {
    /// Bind the redirect endpoint's port and start serving callbacks
    pub async fn start(endpoint: &RedirectEndpoint) -> Result<LoopbackHandle> {
        let bind_addr = format!("{}:{}", endpoint.bind_host(), endpoint.port());
        let listener = TcpListener::bind((endpoint.bind_host(), endpoint.port()))
            .await
            .map_err(|e| AuthError::bind(&bind_addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AuthError::bind(&bind_addr, e))?;

        let (code_tx, code_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let state = Arc::new(CallbackState {
            path: endpoint.path().to_string(),
            pending: PendingAuthorization {
                sender: Mutex::new(Some(code_tx)),
                shutdown: shutdown_tx.clone(),
            },
        });
        let app = Router::new().fallback(handle_request).with_state(state);

        tracing::info!(
            addr = %local_addr,
            path = endpoint.path(),
            "OAuth callback server listening"
        );

        let task = tokio::spawn(serve(listener, app, shutdown_rx));

        Ok(LoopbackHandle {
            local_addr,
            code_rx: Some(code_rx),
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }
}

/// Running callback server; dropping it shuts the server down
pub struct LoopbackHandle {
    local_addr: SocketAddr,
    code_rx: Option<oneshot::Receiver<Result<String>>>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl LoopbackHandle {
    /// Address actually bound, useful when the endpoint asked for port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the callback's authorization code.
    ///
    /// Blocks until a callback arrives; there is no built-in timeout. The
    /// future can be cancelled and awaited again.
    pub async fn await_code(&mut self) -> Result<String> {
        let Some(code_rx) = self.code_rx.as_mut() else {
            return Err(AuthError::Aborted);
        };
        let outcome = code_rx.await.unwrap_or(Err(AuthError::Aborted));
        self.code_rx = None;
        outcome
    }

    /// Stop accepting, close open connections and wait for the server to exit
    pub async fn shutdown(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("OAuth callback server task failed: {}", e);
            }
        }
    }
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn handle_request(
    State(state): State<Arc<CallbackState>>,
    method: Method,
    uri: Uri,
) -> Response {
    if uri.path() != state.path {
        tracing::debug!(path = uri.path(), "ignoring request outside the redirect path");
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }
    if method != Method::GET {
        tracing::debug!(%method, "ignoring non-GET request on the redirect path");
        return (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response();
    }

    let params: HashMap<String, String> = uri
        .query()
        .map(|query| url::form_urlencoded::parse(query.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let outcome = match params.get("code").filter(|code| !code.is_empty()) {
        Some(code) => Ok(code.clone()),
        None => Err(AuthError::Callback(describe_denial(&params))),
    };
    let received_code = outcome.is_ok();

    if !state.pending.complete(outcome) {
        tracing::debug!("ignoring callback after the authorization was resolved");
        return (StatusCode::GONE, ALREADY_HANDLED_BODY).into_response();
    }

    if received_code {
        tracing::info!("received authorization code");
        (StatusCode::OK, SUCCESS_BODY).into_response()
    } else {
        tracing::warn!("authorization callback carried no code");
        (StatusCode::OK, FAILURE_BODY).into_response()
    }
}

fn describe_denial(params: &HashMap<String, String>) -> String {
    match (params.get("error"), params.get("error_description")) {
        (Some(error), Some(description)) => format!("{}: {}", error, description),
        (Some(error), None) => error.clone(),
        _ => "callback carried neither a code nor an error".to_string(),
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    // A closed channel means every handle is gone, which also ends the server
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn serve(listener: TcpListener, app: Router, mut shutdown_rx: watch::Receiver<bool>) {
    let connections = Arc::new(ConnectionRegistry::default());

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    connections.spawn(stream, remote, app.clone(), shutdown_rx.clone());
                }
                Err(e) => {
                    tracing::debug!("failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    drop(listener);
    connections.close_all(SHUTDOWN_GRACE).await;
    tracing::info!("OAuth callback server stopped");
}

/// Open connections keyed by an id assigned at accept time
#[derive(Default)]
struct ConnectionRegistry {
    open: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
    drained: Notify,
}

impl ConnectionRegistry {
    fn spawn(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        app: Router,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(self);

        // Held across the spawn so the task cannot deregister before it is registered
        let mut open = lock(&self.open);
        let task = tokio::spawn(async move {
            tracing::debug!(id, %remote, "connection opened");
            let service = TowerToHyperService::new(app);
            let conn = http1::Builder::new()
                .timer(TokioTimer::new())
                .serve_connection(TokioIo::new(stream), service);
            let mut conn = std::pin::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    // Finishes the in-flight response, then closes instead of keeping alive
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                tracing::debug!(id, "connection error: {}", e);
            }
            registry.remove(id);
        });
        open.insert(id, task.abort_handle());
    }

    fn remove(&self, id: u64) {
        lock(&self.open).remove(&id);
        tracing::debug!(id, "connection closed");
        self.drained.notify_waiters();
    }

    /// Wait up to `grace` for connections to close, then abort the rest
    async fn close_all(&self, grace: Duration) {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                if lock(&self.open).is_empty() {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(grace, drained).await.is_ok() {
            return;
        }

        let remaining: Vec<(u64, AbortHandle)> = lock(&self.open).drain().collect();
        for (id, handle) in remaining {
            tracing::debug!(id, "forcing connection closed");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn endpoint() -> RedirectEndpoint {
        RedirectEndpoint::parse("http://127.0.0.1:0/cb").unwrap()
    }

    fn http_client() -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap()
    }

    fn url(handle: &LoopbackHandle, path_and_query: &str) -> String {
        format!("http://{}{}", handle.local_addr(), path_and_query)
    }

    async fn wait_until_refused(addr: SocketAddr) -> bool {
        for _ in 0..40 {
            if TcpStream::connect(addr).await.is_err() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn code_resolves_pending_authorization() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();

        let response = http_client()
            .get(url(&handle, "/cb?code=ABC&scope=x"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), SUCCESS_BODY);

        assert_eq!(handle.await_code().await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn code_is_percent_decoded() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();
        http_client()
            .get(url(&handle, "/cb?code=4%2F0Ab"))
            .send()
            .await
            .unwrap();
        assert_eq!(handle.await_code().await.unwrap(), "4/0Ab");
    }

    #[tokio::test]
    async fn server_stops_after_callback() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();
        let addr = handle.local_addr();

        http_client()
            .get(url(&handle, "/cb?code=ABC"))
            .send()
            .await
            .unwrap();
        handle.await_code().await.unwrap();

        assert!(wait_until_refused(addr).await);
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_not_processed() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();
        let client = http_client();

        client.get(url(&handle, "/cb?code=ABC")).send().await.unwrap();
        assert_eq!(handle.await_code().await.unwrap(), "ABC");
        handle.shutdown().await;

        assert!(client.get(url(&handle, "/cb?code=DEF")).send().await.is_err());
    }

    #[tokio::test]
    async fn other_paths_are_not_found_and_keep_waiting() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();
        let client = http_client();

        let response = client
            .get(url(&handle, "/favicon.ico"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let response = client
            .get(url(&handle, "/cb/extra?code=NOPE"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let waited =
            tokio::time::timeout(Duration::from_millis(200), handle.await_code()).await;
        assert!(waited.is_err(), "stray request must not resolve the authorization");

        let response = client.get(url(&handle, "/cb?code=ABC")).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(handle.await_code().await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn non_get_callback_is_rejected_and_keeps_waiting() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();
        let client = http_client();

        let response = client
            .post(url(&handle, "/cb?code=POSTED"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 405);

        let waited =
            tokio::time::timeout(Duration::from_millis(200), handle.await_code()).await;
        assert!(waited.is_err(), "a POST must not resolve the authorization");

        client.get(url(&handle, "/cb?code=ABC")).send().await.unwrap();
        assert_eq!(handle.await_code().await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn late_callback_is_gone_and_first_code_wins() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();

        // Second tab: its request is already being read when the first one lands
        let mut late = TcpStream::connect(handle.local_addr()).await.unwrap();
        late.write_all(b"GET /cb?code=DEF HTTP/1.1\r\nHost: 127.0.0.1\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let response = http_client()
            .get(url(&handle, "/cb?code=ABC"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        late.write_all(b"\r\n").await.unwrap();
        let mut reply = Vec::new();
        tokio::time::timeout(SHUTDOWN_GRACE, late.read_to_end(&mut reply))
            .await
            .expect("late callback must be answered within the shutdown grace")
            .unwrap();
        let reply = String::from_utf8_lossy(&reply);
        assert!(reply.starts_with("HTTP/1.1 410"), "unexpected reply: {}", reply);
        assert!(reply.ends_with(ALREADY_HANDLED_BODY));

        assert_eq!(handle.await_code().await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn missing_code_rejects_with_callback_error() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();

        let response = http_client()
            .get(url(
                &handle,
                "/cb?error=access_denied&error_description=User%20denied",
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), FAILURE_BODY);

        match handle.await_code().await {
            Err(AuthError::Callback(message)) => {
                assert_eq!(message, "access_denied: User denied");
            }
            other => panic!("expected callback error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_code_is_not_a_code() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();
        http_client()
            .get(url(&handle, "/cb?code="))
            .send()
            .await
            .unwrap();
        assert!(matches!(
            handle.await_code().await,
            Err(AuthError::Callback(_))
        ));
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let endpoint = RedirectEndpoint::parse(&format!("http://127.0.0.1:{}/cb", port)).unwrap();

        let result = LoopbackServer::start(&endpoint).await;
        assert!(matches!(result, Err(AuthError::Bind { .. })));
    }

    #[tokio::test]
    async fn explicit_shutdown_aborts_pending_authorization() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();
        handle.shutdown().await;
        assert!(matches!(handle.await_code().await, Err(AuthError::Aborted)));
    }

    #[tokio::test]
    async fn idle_connections_are_closed_on_shutdown() {
        let mut handle = LoopbackServer::start(&endpoint()).await.unwrap();
        let mut idle = TcpStream::connect(handle.local_addr()).await.unwrap();

        http_client()
            .get(url(&handle, "/cb?code=ABC"))
            .send()
            .await
            .unwrap();
        handle.await_code().await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), handle.shutdown())
            .await
            .expect("shutdown must not wait on idle connections");

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(3), idle.read(&mut buf))
            .await
            .expect("idle connection must be closed");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[test]
    fn only_first_completion_wins() {
        let (tx, mut rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending = PendingAuthorization {
            sender: Mutex::new(Some(tx)),
            shutdown: Arc::new(shutdown_tx),
        };

        assert!(pending.complete(Ok("ABC".to_string())));
        assert!(!pending.complete(Ok("DEF".to_string())));
        assert!(!pending.complete(Err(AuthError::Callback("late".to_string()))));

        assert_eq!(rx.try_recv().unwrap().unwrap(), "ABC");
        assert!(*shutdown_rx.borrow());
    }
}
