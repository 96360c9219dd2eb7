//! # Stream Transport
//!
//! Exposes a byte source on a one-shot Unix-domain socket and hands back a
//! `unix://` URL for it. The first consumer to connect drains the source;
//! the socket file is removed as soon as that connection is accepted, so no
//! second consumer can ever attach.
//!
//! ```text
//! expose(dir, source) ──► bind <dir>/<uuid>.sock ──► unix://<dir>/<uuid>.sock
//!                                  │
//!                    accept once ──┴──► unlink ──► copy source ──► shutdown
//! ```
//!
//! The source is dropped as soon as the endpoint is done with it: after the
//! copy, when the consumer disconnects early, or when nobody connects in time.

use serde::{Deserialize, Serialize};
use shared_types::BusError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// URL scheme used for stream endpoints.
pub const STREAM_SCHEME: &str = "unix";

/// Stream transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long an exposed stream waits for its consumer.
    #[serde(with = "humantime_serde")]
    pub accept_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(300),
        }
    }
}

/// Creates and opens stream endpoints.
#[derive(Debug, Clone, Default)]
pub struct StreamTransport {
    config: StreamConfig,
}

impl StreamTransport {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Serve `source` on a fresh socket under `dir` and return its URL.
    ///
    /// The source is read only after a consumer connects. If nobody connects
    /// within the accept timeout the socket is removed and the source dropped.
    pub async fn expose<R>(&self, dir: &Path, source: R) -> Result<Url, BusError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.sock", Uuid::new_v4()));
        let url = socket_url(&path)?;

        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "Stream endpoint exposed");

        tokio::spawn(serve_once(
            listener,
            path,
            source,
            self.config.accept_timeout,
        ));
        Ok(url)
    }

    /// Connect to a stream endpoint.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` - the URL is not a `unix://` URL
    /// - `TransportFailure` - the endpoint is gone or already consumed
    pub async fn connect(&self, url: &Url) -> Result<UnixStream, BusError> {
        let path = socket_path(url)?;
        UnixStream::connect(&path)
            .await
            .map_err(|e| BusError::TransportFailure(format!("{url}: {e}")))
    }
}

/// Build the `unix://` URL for a socket path.
pub fn socket_url(path: &Path) -> Result<Url, BusError> {
    let url = Url::parse(&format!("{STREAM_SCHEME}://{}", path.display()))
        .map_err(|e| BusError::InvalidRequest(format!("stream path {}: {e}", path.display())))?;
    if Path::new(url.path()) != path {
        // Paths with characters the URL parser escapes cannot round-trip.
        return Err(BusError::InvalidRequest(format!(
            "stream path {} is not representable as a URL",
            path.display()
        )));
    }
    Ok(url)
}

/// Extract the socket path from a `unix://` URL.
pub fn socket_path(url: &Url) -> Result<PathBuf, BusError> {
    if url.scheme() != STREAM_SCHEME {
        return Err(BusError::InvalidRequest(format!(
            "unsupported stream scheme: {}",
            url.scheme()
        )));
    }
    if url.path().is_empty() {
        return Err(BusError::InvalidRequest(format!("stream URL {url} has no path")));
    }
    Ok(PathBuf::from(url.path()))
}

async fn serve_once<R>(listener: UnixListener, path: PathBuf, mut source: R, timeout: Duration)
where
    R: AsyncRead + Send + Unpin,
{
    let accepted = tokio::time::timeout(timeout, listener.accept()).await;

    drop(listener);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove stream socket");
    }

    let mut stream = match accepted {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "Stream accept failed");
            return;
        }
        Err(_) => {
            warn!(path = %path.display(), "No consumer connected to stream before timeout");
            return;
        }
    };

    let (mut from_consumer, mut to_consumer) = stream.split();
    tokio::select! {
        copied = tokio::io::copy(&mut source, &mut to_consumer) => {
            match copied {
                Ok(bytes) => debug!(path = %path.display(), bytes, "Stream drained"),
                Err(e) => warn!(path = %path.display(), error = %e, "Stream copy failed"),
            }
            let _ = to_consumer.shutdown().await;
        }
        _ = consumer_closed(&mut from_consumer) => {
            debug!(path = %path.display(), "Stream consumer disconnected");
        }
    }
}

/// Resolves once the consumer closes its end of the connection.
async fn consumer_closed<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
