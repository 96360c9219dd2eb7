//! # Request Tracker
//!
//! Async-to-sync bridge between a fire-and-forget send and the response that
//! eventually comes back on the requester's response hook.
//!
//! Flow:
//! 1. Caller builds a `Request` and calls [`Tracker::track`] (or [`Tracker::send`])
//! 2. Tracker stores the entry and arms a deadline timer
//! 3. Transport delivers the request
//! 4. Response listener receives the response and calls [`Tracker::resolve`]
//! 5. Exactly one handler fires: success, error, or the synthesized timeout
//!
//! ## Invariants
//!
//! - Lookup and removal happen under one lock, so an ID resolves at most once.
//! - A late response after a timeout returns `UnknownRequest` and runs nothing.
//! - Every timer carries the sequence number of the registration that armed
//!   it and never touches a later registration of the same ID.

use crate::transport::Transport;
use parking_lot::{Mutex, RwLock};
use shared_types::{BusError, Request, RequestId, RequestOptions, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Completion callback. Receives the resolving response by value.
pub type ResponseHandler = Box<dyn FnOnce(Response) + Send + 'static>;

/// How a tracked request is completed.
///
/// Handlers run on the resolving task (the response listener or the deadline
/// timer) and must not block.
pub enum ResponseHandlers {
    /// Separate callbacks for success and failure; either may be absent.
    Callbacks {
        on_success: Option<ResponseHandler>,
        on_error: Option<ResponseHandler>,
    },
    /// Single-slot rendezvous that receives whichever response resolves the request.
    Channel(oneshot::Sender<Response>),
}

impl ResponseHandlers {
    /// No completion behaviour; the caller observes the outcome some other way.
    pub fn none() -> Self {
        Self::Callbacks {
            on_success: None,
            on_error: None,
        }
    }

    pub fn callbacks<S, E>(on_success: S, on_error: E) -> Self
    where
        S: FnOnce(Response) + Send + 'static,
        E: FnOnce(Response) + Send + 'static,
    {
        Self::Callbacks {
            on_success: Some(Box::new(on_success)),
            on_error: Some(Box::new(on_error)),
        }
    }

    /// Rendezvous handlers plus the receiving end.
    pub fn channel() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (Self::Channel(tx), rx)
    }

    fn complete(self, response: Response) {
        match self {
            Self::Callbacks {
                on_success,
                on_error,
            } => {
                let handler = if response.is_success() {
                    on_success
                } else {
                    on_error
                };
                if let Some(handler) = handler {
                    handler(response);
                }
            }
            Self::Channel(tx) => {
                // Receiver dropped means the caller stopped waiting.
                let _ = tx.send(response);
            }
        }
    }
}

impl std::fmt::Debug for ResponseHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callbacks {
                on_success,
                on_error,
            } => f
                .debug_struct("Callbacks")
                .field("on_success", &on_success.is_some())
                .field("on_error", &on_error.is_some())
                .finish(),
            Self::Channel(_) => f.write_str("Channel"),
        }
    }
}

/// A request waiting for its response.
struct TrackedEntry {
    /// Registration sequence number
    seq: u64,
    /// Task name (for logging)
    task: String,
    /// When the entry expires
    deadline: Instant,
    handlers: ResponseHandlers,
    /// Deadline timer, aborted on resolution
    timer: JoinHandle<()>,
}

/// Statistics for the tracker.
#[derive(Debug, Default)]
pub struct TrackerStats {
    /// Total requests registered
    pub total_registered: AtomicU64,
    /// Total requests resolved by a real response
    pub total_completed: AtomicU64,
    /// Total requests resolved by their deadline
    pub total_timeouts: AtomicU64,
    /// Total requests removed without resolution
    pub total_untracked: AtomicU64,
    /// Total responses that matched no tracked request
    pub total_unknown: AtomicU64,
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Timeout used by callers that do not pick one.
    pub default_timeout: Duration,
    /// Address of the response listener feeding this tracker.
    pub response_hook: Option<Url>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_timeout: crate::DEFAULT_REQUEST_TIMEOUT,
            response_hook: None,
        }
    }
}

struct TrackerInner {
    pending: Mutex<HashMap<RequestId, TrackedEntry>>,
    next_seq: AtomicU64,
    response_hook: RwLock<Option<Url>>,
    default_timeout: Duration,
    transport: Arc<dyn Transport>,
    stats: TrackerStats,
}

/// Correlates outstanding requests with their responses.
///
/// Cheap to clone; every clone shares the same table.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    pub fn new(config: TrackerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                pending: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                response_hook: RwLock::new(config.response_hook),
                default_timeout: config.default_timeout,
                transport,
                stats: TrackerStats::default(),
            }),
        }
    }

    /// Register a request and arm its deadline.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` - empty ID or task
    /// - `InvalidTimeout` - zero timeout
    /// - `DuplicateRequest` - the ID is already tracked
    pub fn track(
        &self,
        request: &Request,
        handlers: ResponseHandlers,
        timeout: Duration,
    ) -> Result<(), BusError> {
        request.validate()?;
        if timeout.is_zero() {
            return Err(BusError::InvalidTimeout);
        }

        let id = request.id.clone();
        let deadline = Instant::now() + timeout;

        // The timer is spawned while the table is locked, so it cannot look
        // for its entry before the entry exists.
        let mut pending = self.inner.pending.lock();
        if pending.contains_key(&id) {
            return Err(BusError::DuplicateRequest { id });
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let timer = tokio::spawn(expire_at(
            Arc::downgrade(&self.inner),
            id.clone(),
            seq,
            deadline,
        ));

        pending.insert(
            id.clone(),
            TrackedEntry {
                seq,
                task: request.task.clone(),
                deadline,
                handlers,
                timer,
            },
        );
        drop(pending);

        self.inner
            .stats
            .total_registered
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %id,
            task = %request.task,
            timeout_ms = timeout.as_millis() as u64,
            "Tracking request"
        );
        Ok(())
    }

    /// Complete the tracked request matching `response.id`.
    ///
    /// # Errors
    ///
    /// `UnknownRequest` if nothing is tracked under that ID (already resolved,
    /// timed out, untracked or never registered). No handler runs in that case.
    pub fn resolve(&self, response: Response) -> Result<(), BusError> {
        let entry = self.inner.pending.lock().remove(&response.id);

        let Some(entry) = entry else {
            self.inner.stats.total_unknown.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %response.id, "Response for unknown or expired request");
            return Err(BusError::UnknownRequest { id: response.id });
        };

        entry.timer.abort();
        self.inner
            .stats
            .total_completed
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %response.id,
            task = %entry.task,
            remaining_ms = entry
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
            success = response.is_success(),
            "Resolved tracked request"
        );

        entry.handlers.complete(response);
        Ok(())
    }

    /// Stop tracking without running any handler.
    ///
    /// Returns `false` if the ID was not tracked.
    pub fn untrack(&self, id: &RequestId) -> bool {
        let Some(entry) = self.inner.pending.lock().remove(id) else {
            return false;
        };
        entry.timer.abort();
        self.inner
            .stats
            .total_untracked
            .fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %id, task = %entry.task, "Untracked request");
        true
    }

    /// Track a request and deliver it.
    ///
    /// Fills in the tracker's response hook when the request has none. If
    /// delivery fails the entry is removed again and the transport error is
    /// returned; no handler runs.
    pub async fn send(
        &self,
        destination: &Url,
        mut request: Request,
        handlers: ResponseHandlers,
        timeout: Duration,
    ) -> Result<(), BusError> {
        if request.response_hook.is_none() {
            request.response_hook = self.response_hook();
        }
        if request.response_hook.is_none() {
            return Err(BusError::InvalidRequest(format!(
                "request {} has no response hook",
                request.id
            )));
        }

        self.track(&request, handlers, timeout)?;

        if let Err(e) = self.inner.transport.send_request(destination, &request).await {
            self.untrack(&request.id);
            warn!(
                request_id = %request.id,
                task = %request.task,
                %destination,
                error = %e,
                "Request delivery failed"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Deliver a request without tracking it.
    pub async fn send_untracked(&self, destination: &Url, request: &Request) -> Result<(), BusError> {
        request.validate()?;
        self.inner.transport.send_request(destination, request).await
    }

    /// Send a request and wait for its response or its deadline.
    ///
    /// Only the calling task is suspended. Returns the successful `Response`
    /// (result and optional stream URL) or the failure that resolved it.
    pub async fn sync_request(
        &self,
        destination: &Url,
        options: RequestOptions,
        timeout: Duration,
    ) -> Result<Response, BusError> {
        let request = Request::new(options)?;
        let (handlers, mut rx) = ResponseHandlers::channel();

        // The deadline timer fills the slot even while delivery is still in flight.
        let send = self.send(destination, request, handlers, timeout);
        tokio::pin!(send);
        let response = tokio::select! {
            biased;
            sent = &mut send => {
                sent?;
                (&mut rx).await
            }
            response = &mut rx => response,
        };
        let response = response.map_err(|_| {
            BusError::TransportFailure("response channel closed before resolution".into())
        })?;
        response.into_result()
    }

    /// Default timeout configured for this tracker.
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// URL where responses for this tracker are delivered.
    pub fn response_hook(&self) -> Option<Url> {
        self.inner.response_hook.read().clone()
    }

    /// Point the tracker at its response listener once the listener is bound.
    pub fn set_response_hook(&self, url: Url) {
        *self.inner.response_hook.write() = Some(url);
    }

    /// Transport used for outbound deliveries.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_tracked(&self, id: &RequestId) -> bool {
        self.inner.pending.lock().contains_key(id)
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.inner.stats
    }
}

impl TrackerInner {
    /// Remove the entry armed with `seq` and fail it with a timeout.
    fn expire(&self, id: &RequestId, seq: u64) {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(id) {
                Some(entry) if entry.seq == seq => pending.remove(id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return;
        };

        self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(request_id = %id, task = %entry.task, "Request timed out");
        entry.handlers.complete(Response::timeout(id.clone()));
    }
}

async fn expire_at(inner: Weak<TrackerInner>, id: RequestId, seq: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    if let Some(inner) = inner.upgrade() {
        inner.expire(&id, seq);
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        for (_, entry) in self.pending.get_mut().drain() {
            entry.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::{create_test_channel, Delivery};
    use shared_types::{ErrorKind, ResponseError};
    use std::sync::atomic::AtomicUsize;

    fn tracker() -> Tracker {
        let (transport, _rx) = create_test_channel(16);
        let config = TrackerConfig {
            default_timeout: Duration::from_secs(1),
            response_hook: Some(Url::parse("http://127.0.0.1:1/response").unwrap()),
        };
        Tracker::new(config, Arc::new(transport))
    }

    fn request(id: &str) -> Request {
        Request {
            id: RequestId::from(id),
            task: "kv-get".into(),
            args: serde_json::Value::Null,
            task_url: None,
            stream_url: None,
            response_hook: None,
        }
    }

    fn counting() -> (ResponseHandlers, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ok = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let (ok2, failed2) = (ok.clone(), failed.clone());
        let handlers = ResponseHandlers::callbacks(
            move |_| {
                ok2.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                failed2.fetch_add(1, Ordering::SeqCst);
            },
        );
        (handlers, ok, failed)
    }

    #[tokio::test]
    async fn test_track_and_resolve_success() {
        let tracker = tracker();
        let (handlers, ok, failed) = counting();

        tracker
            .track(&request("abc"), handlers, Duration::from_secs(5))
            .unwrap();
        assert!(tracker.is_tracked(&RequestId::from("abc")));

        tracker
            .resolve(Response::success(RequestId::from("abc"), None, None))
            .unwrap();

        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_with_error_runs_error_handler() {
        let tracker = tracker();
        let (handlers, ok, failed) = counting();

        tracker
            .track(&request("abc"), handlers, Duration::from_secs(5))
            .unwrap();
        tracker
            .resolve(Response::failure(
                RequestId::from("abc"),
                ResponseError::task_failed("boom"),
            ))
            .unwrap();

        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_resolve_is_unknown() {
        let tracker = tracker();
        let (handlers, ok, _) = counting();

        tracker
            .track(&request("abc"), handlers, Duration::from_secs(5))
            .unwrap();
        let response = Response::success(RequestId::from("abc"), None, None);
        tracker.resolve(response.clone()).unwrap();

        let err = tracker.resolve(response).unwrap_err();
        assert!(matches!(err, BusError::UnknownRequest { .. }));
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.stats().total_unknown.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let tracker = tracker();
        tracker
            .track(&request("abc"), ResponseHandlers::none(), Duration::from_secs(5))
            .unwrap();

        let err = tracker
            .track(&request("abc"), ResponseHandlers::none(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateRequest { .. }));
    }

    #[tokio::test]
    async fn test_invalid_registrations() {
        let tracker = tracker();

        let err = tracker
            .track(&request("abc"), ResponseHandlers::none(), Duration::ZERO)
            .unwrap_err();
        assert_eq!(err, BusError::InvalidTimeout);

        let err = tracker
            .track(&request(""), ResponseHandlers::none(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidRequest(_)));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_error_handler_once() {
        let tracker = tracker();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handlers = ResponseHandlers::callbacks(
            |_| panic!("success handler must not run"),
            move |response| {
                let _ = tx.send(response);
            },
        );

        tracker
            .track(&request("abc"), handlers, Duration::from_millis(50))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        let response = rx.recv().await.unwrap();
        assert_eq!(response.id, RequestId::from("abc"));
        assert_eq!(response.error.unwrap().kind, ErrorKind::Timeout);
        assert!(rx.try_recv().is_err());

        let err = tracker
            .resolve(Response::success(RequestId::from("abc"), None, None))
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownRequest { .. }));
        assert_eq!(tracker.stats().total_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_entry_never_times_out() {
        let tracker = tracker();
        let (handlers, ok, failed) = counting();

        tracker
            .track(&request("abc"), handlers, Duration::from_millis(50))
            .unwrap();
        tracker
            .resolve(Response::success(RequestId::from("abc"), None, None))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_ignores_reused_id() {
        let tracker = tracker();

        tracker
            .track(&request("abc"), ResponseHandlers::none(), Duration::from_millis(50))
            .unwrap();
        assert!(tracker.untrack(&RequestId::from("abc")));

        let (handlers, _, failed) = counting();
        tracker
            .track(&request("abc"), handlers, Duration::from_secs(10))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tracker.is_tracked(&RequestId::from("abc")));
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_untrack_runs_no_handler() {
        let tracker = tracker();
        let (handlers, ok, failed) = counting();

        tracker
            .track(&request("abc"), handlers, Duration::from_secs(5))
            .unwrap();
        assert!(tracker.untrack(&RequestId::from("abc")));
        assert!(!tracker.untrack(&RequestId::from("abc")));

        assert_eq!(ok.load(Ordering::SeqCst) + failed.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.stats().total_untracked.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_send_fills_response_hook() {
        let (transport, mut rx) = create_test_channel(4);
        let hook = Url::parse("http://127.0.0.1:7000/response").unwrap();
        let tracker = Tracker::new(
            TrackerConfig {
                default_timeout: Duration::from_secs(1),
                response_hook: Some(hook.clone()),
            },
            Arc::new(transport),
        );
        let destination = Url::parse("http://coordinator:8080").unwrap();

        tracker
            .send(
                &destination,
                request("abc"),
                ResponseHandlers::none(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Delivery::Request { request, .. } => {
                assert_eq!(request.response_hook, Some(hook));
            }
            other => panic!("unexpected delivery {other:?}"),
        }
        assert!(tracker.is_tracked(&RequestId::from("abc")));
    }

    #[tokio::test]
    async fn test_failed_send_untracks() {
        let (transport, rx) = create_test_channel(1);
        drop(rx);
        let tracker = Tracker::new(
            TrackerConfig {
                default_timeout: Duration::from_secs(1),
                response_hook: Some(Url::parse("http://127.0.0.1:7000/response").unwrap()),
            },
            Arc::new(transport),
        );
        let destination = Url::parse("http://coordinator:8080").unwrap();
        let (handlers, ok, failed) = counting();

        let err = tracker
            .send(&destination, request("abc"), handlers, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::TransportFailure(_)));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(ok.load(Ordering::SeqCst) + failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_untracked_delivers_without_tracking() {
        let (transport, mut rx) = create_test_channel(4);
        let tracker = Tracker::new(TrackerConfig::default(), Arc::new(transport));
        let destination = Url::parse("http://coordinator:8080").unwrap();

        tracker
            .send_untracked(&destination, &request("abc"))
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            Delivery::Request { .. }
        ));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_without_hook_rejected() {
        let (transport, _rx) = create_test_channel(1);
        let tracker = Tracker::new(TrackerConfig::default(), Arc::new(transport));
        let destination = Url::parse("http://coordinator:8080").unwrap();

        let err = tracker
            .send(
                &destination,
                request("abc"),
                ResponseHandlers::none(),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidRequest(_)));
        assert_eq!(tracker.pending_count(), 0);
    }

    /// Accepts deliveries and never finishes them.
    struct SilentTransport;

    #[async_trait::async_trait]
    impl Transport for SilentTransport {
        async fn send_request(&self, _: &Url, _: &Request) -> Result<(), BusError> {
            std::future::pending().await
        }

        async fn send_response(&self, _: &Url, _: &Response) -> Result<(), BusError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_request_bounded_while_delivery_hangs() {
        let tracker = Tracker::new(
            TrackerConfig {
                default_timeout: Duration::from_secs(1),
                response_hook: Some(Url::parse("http://127.0.0.1:7000/response").unwrap()),
            },
            Arc::new(SilentTransport),
        );
        let destination = Url::parse("http://coordinator:8080").unwrap();

        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            tracker.sync_request(
                &destination,
                RequestOptions::new("kv-get"),
                Duration::from_millis(100),
            ),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(matches!(err, BusError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.stats().total_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_sync_request_resolved_by_response() {
        let (transport, mut rx) = create_test_channel(4);
        let tracker = Tracker::new(
            TrackerConfig {
                default_timeout: Duration::from_secs(1),
                response_hook: Some(Url::parse("http://127.0.0.1:7000/response").unwrap()),
            },
            Arc::new(transport),
        );

        // Play the remote side: answer whatever request arrives.
        let responder = tracker.clone();
        tokio::spawn(async move {
            if let Some(Delivery::Request { request, .. }) = rx.recv().await {
                let response =
                    Response::success(request.id, Some(serde_json::json!({"value": 42})), None);
                responder.resolve(response).unwrap();
            }
        });

        let destination = Url::parse("http://coordinator:8080").unwrap();
        let response = tracker
            .sync_request(
                &destination,
                RequestOptions::new("kv-get"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(response.result.unwrap()["value"], 42);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_request_times_out() {
        let (transport, _rx) = create_test_channel(4);
        let tracker = Tracker::new(
            TrackerConfig {
                default_timeout: Duration::from_secs(1),
                response_hook: Some(Url::parse("http://127.0.0.1:7000/response").unwrap()),
            },
            Arc::new(transport),
        );
        let destination = Url::parse("http://coordinator:8080").unwrap();

        let err = tracker
            .sync_request(
                &destination,
                RequestOptions::new("kv-get"),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Timeout { .. }));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_fire_once() {
        let tracker = tracker();
        let (handlers, ok, _) = counting();
        tracker
            .track(&request("abc"), handlers, Duration::from_secs(5))
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let t = tracker.clone();
            tasks.push(tokio::spawn(async move {
                t.resolve(Response::success(RequestId::from("abc"), None, None))
                    .is_ok()
            }));
        }

        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }
}
