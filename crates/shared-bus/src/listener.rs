//! # Response Listener
//!
//! HTTP endpoint that receives `Response` envelopes on the requester's
//! response hook and feeds them to [`Tracker::resolve`].
//!
//! | Outcome                   | Status            |
//! |---------------------------|-------------------|
//! | resolved a tracked request | `202 Accepted`   |
//! | no matching request        | `404 Not Found`  |
//! | malformed envelope         | `400 Bad Request`|

use crate::tracker::Tracker;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use shared_types::{BusError, Response};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Path the listener serves responses on.
pub const RESPONSE_PATH: &str = "/response";

/// Router exposing `POST /response` for the given tracker.
///
/// Can be merged into a larger router that shares the same listener.
pub fn response_router(tracker: Tracker) -> Router {
    Router::new()
        .route(RESPONSE_PATH, post(handle_response))
        .with_state(tracker)
}

async fn handle_response(
    State(tracker): State<Tracker>,
    body: Result<Json<Response>, JsonRejection>,
) -> (StatusCode, String) {
    let response = match body {
        Ok(Json(response)) => response,
        Err(rejection) => {
            warn!(error = %rejection, "Rejected malformed response envelope");
            return (StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    if let Err(e) = response.validate() {
        warn!(error = %e, "Rejected invalid response envelope");
        return (StatusCode::BAD_REQUEST, e.to_string());
    }

    match tracker.resolve(response) {
        Ok(()) => (StatusCode::ACCEPTED, String::new()),
        Err(e @ BusError::UnknownRequest { .. }) => (StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Build the hook URL for a listener reachable at `base`.
pub fn hook_url(base: &Url) -> Result<Url, BusError> {
    base.join(RESPONSE_PATH.trim_start_matches('/'))
        .map_err(|e| BusError::InvalidRequest(format!("response hook from {base}: {e}")))
}

/// A standalone response listener bound to its own TCP port.
///
/// Binding sets the tracker's response hook, so requests sent through the
/// tracker afterwards carry the listener's address.
pub struct ResponseListener {
    listener: TcpListener,
    tracker: Tracker,
    hook: Url,
}

impl ResponseListener {
    /// Bind on `addr`. `advertise` overrides the address peers should use
    /// to reach this listener; by default the bound address is used.
    pub async fn bind(
        addr: SocketAddr,
        tracker: Tracker,
        advertise: Option<&Url>,
    ) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let base = match advertise {
            Some(url) => url.clone(),
            None => Url::parse(&format!("http://{local}/"))
                .map_err(|e| BusError::InvalidRequest(e.to_string()))?,
        };
        let hook = hook_url(&base)?;
        tracker.set_response_hook(hook.clone());

        info!(addr = %local, hook = %hook, "Response listener bound");
        Ok(Self {
            listener,
            tracker,
            hook,
        })
    }

    pub fn hook(&self) -> &Url {
        &self.hook
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BusError> {
        let router = response_router(self.tracker);
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        debug!("Response listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{ResponseHandlers, TrackerConfig};
    use crate::transport::channel::create_test_channel;
    use crate::transport::HttpTransport;
    use shared_types::{Request, RequestId};
    use std::sync::Arc;
    use std::time::Duration;

    async fn start() -> (Tracker, Url, CancellationToken) {
        let (transport, _rx) = create_test_channel(1);
        let tracker = Tracker::new(TrackerConfig::default(), Arc::new(transport));
        let listener = ResponseListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            tracker.clone(),
            None,
        )
        .await
        .unwrap();
        let hook = listener.hook().clone();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.run(shutdown.clone()));
        (tracker, hook, shutdown)
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

    #[tokio::test]
    async fn test_bind_sets_tracker_hook() {
        let (tracker, hook, shutdown) = start().await;
        assert_eq!(tracker.response_hook(), Some(hook.clone()));
        assert_eq!(hook.path(), "/response");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_posted_response_resolves_request() {
        let (tracker, hook, shutdown) = start().await;
        let (handlers, rx) = ResponseHandlers::channel();
        tracker
            .track(&request("abc"), handlers, Duration::from_secs(5))
            .unwrap();

        let transport = HttpTransport::new().unwrap();
        crate::transport::Transport::send_response(
            &transport,
            &hook,
            &Response::success(RequestId::from("abc"), Some(serde_json::json!("ok")), None),
        )
        .await
        .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.result, Some(serde_json::json!("ok")));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_response_is_not_found() {
        let (_tracker, hook, shutdown) = start().await;

        let status = reqwest::Client::new()
            .post(hook)
            .json(&Response::success(RequestId::from("nobody"), None, None))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_bad_request() {
        let (_tracker, hook, shutdown) = start().await;
        let client = reqwest::Client::new();

        let status = client
            .post(hook.clone())
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

        let status = client
            .post(hook)
            .json(&serde_json::json!({
                "id": "abc",
                "result": 1,
                "error": {"kind": "taskFailed", "message": "boom"}
            }))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        shutdown.cancel();
    }
}
