use super::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use crate::context::Context;
use crate::error::WebhookError;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 7 * 1024 * 1024;
/// Per-request timeout enforced at the transport
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const JSON: &str = "application/json";

/// Handles one admission request.
///
/// Implemented for any `Fn(Context, AdmissionRequest) -> impl Future<Output =
/// anyhow::Result<AdmissionResponse>>`. An `Err` (or a panic) is answered
/// with status code 500 and no message.
#[async_trait]
pub trait AdmissionHook: Send + Sync + 'static {
    async fn admit(&self, ctx: Context, request: AdmissionRequest) -> anyhow::Result<AdmissionResponse>;
}

#[async_trait]
impl<F, Fut> AdmissionHook for F
where
    F: Fn(Context, AdmissionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AdmissionResponse>> + Send,
{
    async fn admit(&self, ctx: Context, request: AdmissionRequest) -> anyhow::Result<AdmissionResponse> {
        self(ctx, request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Registered,
    Started,
    Stopped,
}

struct Inner {
    bind_address: SocketAddr,
    hooks: RwLock<HashMap<String, Arc<dyn AdmissionHook>>>,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Admission webhook HTTP server. Clones share hooks and state.
///
/// Hooks may be registered before or after [`WebhookServer::start`]; a path
/// can only be registered once. TLS is terminated in front of this server.
#[derive(Clone)]
pub struct WebhookServer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct AppState {
    inner: Arc<Inner>,
    ctx: Context,
}

impl WebhookServer {
    #[must_use]
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                bind_address,
                hooks: RwLock::new(HashMap::new()),
                state: Mutex::new(ServerState::Registered),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Registers `hook` for requests to exactly `path`.
    pub fn register(&self, path: impl Into<String>, hook: impl AdmissionHook) -> Result<(), WebhookError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(WebhookError::InvalidPath(path));
        }
        let mut hooks = self.inner.hooks.write().unwrap_or_else(PoisonError::into_inner);
        if hooks.contains_key(&path) {
            return Err(WebhookError::DuplicatePath(path));
        }
        info!(path = %path, "Registered admission hook");
        hooks.insert(path, Arc::new(hook));
        Ok(())
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address actually bound, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The HTTP application. Each request's hook receives a child of `ctx`.
    pub fn router(&self, ctx: Context) -> Router {
        Router::new()
            .fallback(handle)
            .with_state(AppState {
                inner: self.inner.clone(),
                ctx,
            })
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
            )
    }

    /// Binds the listener and serves until `ctx` is cancelled.
    ///
    /// One-shot: a second call fails with [`WebhookError::AlreadyStarted`].
    pub async fn start(&self, ctx: Context) -> Result<JoinHandle<Result<(), WebhookError>>, WebhookError> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ServerState::Registered {
                return Err(WebhookError::AlreadyStarted);
            }
            *state = ServerState::Started;
        }

        let addr = self.inner.bind_address;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.inner.set_state(ServerState::Stopped);
                return Err(WebhookError::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        };
        let local_addr = listener.local_addr().ok();
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = local_addr;
        info!(address = ?local_addr, paths = ?self.paths(), "Webhook server listening");

        let router = self.router(ctx.clone());
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { ctx.cancelled().await })
                .await
                .map_err(WebhookError::Serve);
            inner.set_state(ServerState::Stopped);
            info!("Webhook server stopped");
            result
        }))
    }
}

impl fmt::Debug for WebhookServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookServer")
            .field("bind_address", &self.inner.bind_address)
            .field("paths", &self.paths())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn hook(&self, path: &str) -> Option<Arc<dyn AdmissionHook>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

async fn handle(State(state): State<AppState>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();
    let Some(hook) = state.inner.hook(&path) else {
        debug!(path = %path, "No admission hook registered");
        return StatusCode::NOT_FOUND.into_response();
    };

    let content_type = request.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if content_type != Some(JSON) {
        warn!(path = %path, content_type = ?content_type, "Rejecting admission request");
        return review(AdmissionResponse::errored(400, "received unexpected content-type"));
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to read admission request body");
            return review(AdmissionResponse::errored(400, format!("failed to read request body: {e}")));
        }
    };
    let admission = match serde_json::from_slice::<AdmissionReview>(&body) {
        Ok(AdmissionReview {
            request: Some(admission), ..
        }) => admission,
        Ok(_) => return review(AdmissionResponse::errored(400, "admission review has no request")),
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to decode admission review");
            return review(AdmissionResponse::errored(400, format!("failed to decode admission review: {e}")));
        }
    };

    debug!(path = %path, uid = %admission.uid, operation = ?admission.operation, "Admission request");
    let ctx = state.ctx.fork();
    let outcome = AssertUnwindSafe(hook.admit(ctx.clone(), admission.clone()))
        .catch_unwind()
        .await;
    ctx.cancel("admission request finished");

    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(path = %path, uid = %admission.uid, error = %format!("{e:#}"), "Admission hook failed");
            AdmissionResponse::errored(500, "")
        }
        Err(_) => {
            error!(path = %path, uid = %admission.uid, "Admission hook panicked");
            AdmissionResponse::errored(500, "")
        }
    };
    review(response.complete(&admission))
}

fn review(response: AdmissionResponse) -> Response {
    (StatusCode::OK, Json(response.into_review())).into_response()
}
