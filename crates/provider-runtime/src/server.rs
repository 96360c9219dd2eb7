//! Provider HTTP server.
//!
//! ```text
//! POST /          Request  ──► 202, dispatch on its own task ──► POST Response to responseHook
//! POST /response  Response ──► Tracker::resolve
//! GET  /health    liveness + registered tasks
//! ```

use crate::config::{ConfigError, ProviderConfig};
use crate::dispatch::{TaskHandler, TaskRegistry};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use shared_bus::listener::{hook_url, response_router};
use shared_bus::{HttpTransport, StreamConfig, StreamTransport, Tracker, TrackerConfig, Transport};
use shared_types::{BusError, Request, RequestOptions, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server already started")]
    AlreadyStarted,
}

/// Hosts registered task handlers and the response listener for its own
/// outbound requests.
pub struct Server {
    config: ProviderConfig,
    tasks: Arc<TaskRegistry>,
    tracker: Tracker,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Result<(), std::io::Error>>>,
    local_addr: Option<SocketAddr>,
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    service_name: Arc<str>,
    tasks: Arc<TaskRegistry>,
    tracker: Tracker,
    transport: Arc<dyn Transport>,
}

impl Server {
    pub fn new(config: ProviderConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        let tracker = Tracker::new(
            TrackerConfig {
                default_timeout: config.request_timeout,
                response_hook: None,
            },
            Arc::clone(&transport),
        );

        Ok(Self {
            config,
            tasks: Arc::new(TaskRegistry::new()),
            tracker,
            transport,
            shutdown: CancellationToken::new(),
            handle: None,
            local_addr: None,
        })
    }

    pub fn register_task(&self, name: impl Into<String>, handler: impl TaskHandler) {
        self.tasks.register(name, handler);
    }

    /// Registered task names, sorted.
    pub fn registered_tasks(&self) -> Vec<String> {
        self.tasks.registered_tasks()
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Tracker for requests this provider sends.
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Stream transport configured from this provider's settings.
    pub fn stream_transport(&self) -> StreamTransport {
        StreamTransport::new(StreamConfig {
            accept_timeout: self.config.stream_accept_timeout,
        })
    }

    /// Address the HTTP listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the HTTP listener and start serving in the background.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.handle.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let base = match &self.config.advertise_url {
            Some(url) => url.clone(),
            None => Url::parse(&format!("http://{local_addr}/"))
                .map_err(|e| BusError::InvalidRequest(e.to_string()))?,
        };
        self.tracker.set_response_hook(hook_url(&base)?);

        let router = self.router();
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }));
        self.local_addr = Some(local_addr);

        info!(
            service = %self.config.service_name,
            addr = %local_addr,
            tasks = ?self.registered_tasks(),
            "Provider server started"
        );
        Ok(local_addr)
    }

    /// Stop accepting requests and wait for the listener to wind down.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "HTTP server error"),
                Err(e) => error!(error = %e, "HTTP server task failed"),
            }
        }
        info!(service = %self.config.service_name, "Provider server stopped");
    }

    /// Block until SIGINT or SIGTERM, then stop.
    pub async fn stop_on_signal(&mut self) -> Result<(), ServerError> {
        wait_for_signal().await?;
        info!("Received shutdown signal");
        self.stop().await;
        Ok(())
    }

    /// Send a request and wait for its response.
    ///
    /// Goes to the request's task URL if set, otherwise to the coordinator.
    pub async fn request(
        &self,
        options: RequestOptions,
        timeout: Option<Duration>,
    ) -> Result<Response, BusError> {
        let destination = options
            .task_url
            .clone()
            .or_else(|| self.config.coordinator_url.clone())
            .ok_or_else(|| {
                BusError::InvalidRequest(format!(
                    "no task URL or coordinator for task {}",
                    options.task
                ))
            })?;
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        self.tracker
            .sync_request(&destination, options, timeout)
            .await
    }

    fn router(&self) -> Router {
        let state = AppState {
            service_name: Arc::from(self.config.service_name.as_str()),
            tasks: Arc::clone(&self.tasks),
            tracker: self.tracker.clone(),
            transport: Arc::clone(&self.transport),
        };

        Router::new()
            .route("/", post(handle_request))
            .route("/health", get(health_check))
            .with_state(state)
            .merge(response_router(self.tracker.clone()))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<(), std::io::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<(), std::io::Error> {
    tokio::signal::ctrl_c().await
}

async fn handle_request(
    State(state): State<AppState>,
    body: Result<Json<Request>, JsonRejection>,
) -> (StatusCode, String) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection, "Rejected malformed request envelope");
            return (StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    if let Err(e) = request.validate() {
        warn!(error = %e, "Rejected invalid request envelope");
        return (StatusCode::BAD_REQUEST, e.to_string());
    }
    let Some(hook) = request.response_hook.clone() else {
        warn!(request_id = %request.id, task = %request.task, "Request has no response hook");
        return (
            StatusCode::BAD_REQUEST,
            format!("request {} has no responseHook", request.id),
        );
    };

    debug!(request_id = %request.id, task = %request.task, "Request accepted");
    tokio::spawn(async move {
        let response = state.tasks.dispatch(request).await;
        if let Err(e) = state.transport.send_response(&hook, &response).await {
            error!(
                request_id = %response.id,
                hook = %hook,
                error = %e,
                "Failed to deliver response"
            );
        }
    });

    (StatusCode::ACCEPTED, String::new())
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": &*state.service_name,
        "tasks": state.tasks.registered_tasks(),
        "pending": state.tracker.pending_count(),
    }))
}
