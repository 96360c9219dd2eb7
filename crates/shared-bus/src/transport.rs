//! # Message Transport
//!
//! Delivery of control-plane envelopes to a URL. The tracker and the
//! provider server only see the [`Transport`] trait; the HTTP implementation
//! is what runs in production.

use async_trait::async_trait;
use shared_types::{BusError, Request, Response};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Sends requests and responses to remote endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a request to a task URL or the coordinator.
    async fn send_request(&self, destination: &Url, request: &Request) -> Result<(), BusError>;

    /// Deliver a response to the requester's response hook.
    async fn send_response(&self, destination: &Url, response: &Response)
        -> Result<(), BusError>;
}

/// JSON-over-HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Default connect timeout for outbound deliveries.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Upper bound on one whole delivery, connect included.
    pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Result<Self, BusError> {
        Self::with_connect_timeout(Self::DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, BusError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(Self::DEFAULT_DELIVERY_TIMEOUT.max(connect_timeout))
            .build()
            .map_err(BusError::transport)?;
        Ok(Self { client })
    }

    async fn post<T: serde::Serialize + Sync>(&self, destination: &Url, body: &T) -> Result<(), BusError> {
        let response = self
            .client
            .post(destination.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| BusError::TransportFailure(format!("{destination}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BusError::TransportFailure(format!(
                "{destination} answered {status}: {detail}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_request(&self, destination: &Url, request: &Request) -> Result<(), BusError> {
        self.post(destination, request).await?;
        debug!(request_id = %request.id, task = %request.task, %destination, "Request delivered");
        Ok(())
    }

    async fn send_response(
        &self,
        destination: &Url,
        response: &Response,
    ) -> Result<(), BusError> {
        self.post(destination, response).await?;
        debug!(request_id = %response.id, %destination, "Response delivered");
        Ok(())
    }
}

/// In-memory transport for tests and in-process wiring.
pub mod channel {
    use super::*;
    use tokio::sync::mpsc;

    /// A message captured by [`ChannelTransport`].
    #[derive(Debug, Clone)]
    pub enum Delivery {
        Request { destination: Url, request: Request },
        Response { destination: Url, response: Response },
    }

    /// Pushes every delivery into an mpsc channel instead of the network.
    pub struct ChannelTransport(pub mpsc::Sender<Delivery>);

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send_request(&self, destination: &Url, request: &Request) -> Result<(), BusError> {
            self.0
                .send(Delivery::Request {
                    destination: destination.clone(),
                    request: request.clone(),
                })
                .await
                .map_err(|_| BusError::TransportFailure("channel closed".into()))
        }

        async fn send_response(
            &self,
            destination: &Url,
            response: &Response,
        ) -> Result<(), BusError> {
            self.0
                .send(Delivery::Response {
                    destination: destination.clone(),
                    response: response.clone(),
                })
                .await
                .map_err(|_| BusError::TransportFailure("channel closed".into()))
        }
    }

    /// Create a transport plus the receiver that observes its deliveries.
    pub fn create_test_channel(buffer: usize) -> (ChannelTransport, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(buffer);
        (ChannelTransport(tx), rx)
    }
}
