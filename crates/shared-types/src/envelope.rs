//! # Request / Response Envelope
//!
//! The only shapes that cross process boundaries on the control plane.
//!
//! ## Correlation Contract
//!
//! - For requests: `id` is generated by the creator and never changes.
//! - For responses: `id` is copied from the request being answered.
//! - `args` / `result` are opaque to everything except the two endpoints.
//!
//! Keys are camelCase on the wire, with `taskURL` / `streamURL` spelled the
//! way the rest of the cluster tooling expects.

use crate::errors::{BusError, ErrorKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use url::Url;
use uuid::Uuid;

/// Correlation key shared by a request and its response.
///
/// Freshly generated IDs are UUID v7 strings (time-ordered, so a late
/// response after a timeout can never collide with a newer request). Any
/// non-empty string received on the wire is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new request ID (UUID v7).
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A named unit of work addressed to whichever handler owns `task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation key.
    pub id: RequestId,
    /// Handler name; must be non-empty.
    pub task: String,
    /// Handler-specific payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    /// Explicit destination; `None` routes through the coordinator.
    #[serde(default, rename = "taskURL", skip_serializing_if = "Option::is_none")]
    pub task_url: Option<Url>,
    /// Side-channel the requester exposes to the handler.
    #[serde(default, rename = "streamURL", skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<Url>,
    /// Where the handler must deliver its `Response`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_hook: Option<Url>,
}

impl Request {
    /// Build a request with a fresh ID from the given options.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidRequest` if the task name is empty.
    pub fn new(options: RequestOptions) -> Result<Self, BusError> {
        let request = Self {
            id: RequestId::new(),
            task: options.task,
            args: options.args,
            task_url: options.task_url,
            stream_url: options.stream_url,
            response_hook: options.response_hook,
        };
        request.validate()?;
        Ok(request)
    }

    /// Check the required envelope fields.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.id.is_empty() {
            return Err(BusError::InvalidRequest("missing request id".into()));
        }
        if self.task.trim().is_empty() {
            return Err(BusError::InvalidRequest(format!(
                "missing task for request {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Decode `args` into the handler's argument type.
    ///
    /// Absent args decode as an empty object so argument structs with
    /// defaulted fields still work.
    pub fn unmarshal_args<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        let value = if self.args.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.args.clone()
        };
        serde_json::from_value(value).map_err(|e| {
            BusError::InvalidRequest(format!("invalid args for task {}: {}", self.task, e))
        })
    }
}

/// Builder-style options for [`Request::new`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub task: String,
    pub args: Value,
    pub task_url: Option<Url>,
    pub stream_url: Option<Url>,
    pub response_hook: Option<Url>,
}

impl RequestOptions {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    /// Serialize `args` into the request payload.
    pub fn with_args<T: Serialize>(mut self, args: &T) -> Result<Self, BusError> {
        self.args = serde_json::to_value(args)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_task_url(mut self, url: Url) -> Self {
        self.task_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_stream_url(mut self, url: Url) -> Self {
        self.stream_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_response_hook(mut self, url: Url) -> Self {
        self.response_hook = Some(url);
        self
    }
}

/// Structured failure carried in a `Response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResponseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Generic handler failure.
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TaskFailed, message)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ResponseError {}

impl From<BusError> for ResponseError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Remote(e) => e,
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

/// The answer to exactly one `Request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Equals the `id` of the request being answered.
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Side-channel the caller may open to drain a result stream.
    #[serde(default, rename = "streamURL", skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// Successful response, optionally carrying a result and a stream.
    pub fn success(id: RequestId, result: Option<Value>, stream_url: Option<Url>) -> Self {
        Self {
            id,
            result,
            stream_url,
            error: None,
        }
    }

    /// Failed response.
    pub fn failure(id: RequestId, error: ResponseError) -> Self {
        Self {
            id,
            result: None,
            stream_url: None,
            error: Some(error),
        }
    }

    /// The response the tracker synthesizes when a deadline passes.
    pub fn timeout(id: RequestId) -> Self {
        Self::failure(id, ResponseError::new(ErrorKind::Timeout, "request timed out"))
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Check the envelope: non-empty ID, and never both a result and an error.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.id.is_empty() {
            return Err(BusError::InvalidRequest("missing response id".into()));
        }
        if self.result.is_some() && self.error.is_some() {
            return Err(BusError::InvalidRequest(format!(
                "response {} carries both a result and an error",
                self.id
            )));
        }
        Ok(())
    }

    /// Decode `result` into the caller's type. A missing result decodes as `null`.
    pub fn unmarshal_result<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        let value = self.result.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            BusError::InvalidRequest(format!("invalid result for request {}: {}", self.id, e))
        })
    }

    /// Turn a failed response into the matching `BusError`.
    pub fn into_result(self) -> Result<Self, BusError> {
        match self.error {
            None => Ok(self),
            Some(err) if err.kind == ErrorKind::Timeout => Err(BusError::Timeout { id: self.id }),
            Some(err) => Err(BusError::Remote(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_request_ids_are_unique() {
        let a = Request::new(RequestOptions::new("kv-get")).unwrap();
        let b = Request::new(RequestOptions::new("kv-get")).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.as_str().len(), 36);
    }

    #[test]
    fn test_empty_task_rejected() {
        let err = Request::new(RequestOptions::new("  ")).unwrap_err();
        assert!(matches!(err, BusError::InvalidRequest(_)));
    }

    #[test]
    fn test_empty_id_rejected() {
        let mut request = Request::new(RequestOptions::new("kv-get")).unwrap();
        request.id = RequestId::from("");
        assert!(matches!(
            request.validate(),
            Err(BusError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_request_wire_keys() {
        let request = Request {
            id: RequestId::from("abc"),
            task: "zfs-receive".into(),
            args: json!({"name": "data/x"}),
            task_url: Some(Url::parse("http://node-1:8080").unwrap()),
            stream_url: Some(Url::parse("unix:///tmp/s.sock").unwrap()),
            response_hook: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["taskURL"], "http://node-1:8080/");
        assert_eq!(value["streamURL"], "unix:///tmp/s.sock");
        assert!(value.get("responseHook").is_none());
    }

    #[test]
    fn test_unmarshal_args() {
        #[derive(Deserialize, Default)]
        struct Args {
            #[serde(default)]
            prefix: String,
        }

        let options = RequestOptions::new("kv-watch")
            .with_args(&json!({"prefix": "services/"}))
            .unwrap();
        let request = Request::new(options).unwrap();
        let args: Args = request.unmarshal_args().unwrap();
        assert_eq!(args.prefix, "services/");

        let empty = Request::new(RequestOptions::new("kv-watch")).unwrap();
        let args: Args = empty.unmarshal_args().unwrap();
        assert_eq!(args.prefix, "");
    }

    #[test]
    fn test_response_with_result_and_error_invalid() {
        let mut response = Response::success(RequestId::from("abc"), Some(json!(1)), None);
        assert!(response.validate().is_ok());
        response.error = Some(ResponseError::task_failed("boom"));
        assert!(response.validate().is_err());
    }

    #[test]
    fn test_timeout_response_into_result() {
        let response = Response::timeout(RequestId::from("abc"));
        assert!(!response.is_success());
        let err = response.into_result().unwrap_err();
        assert_eq!(
            err,
            BusError::Timeout {
                id: RequestId::from("abc")
            }
        );
    }

    #[test]
    fn test_remote_error_into_result() {
        let response = Response::failure(
            RequestId::from("abc"),
            ResponseError::new(ErrorKind::UnknownTask, "unknown task: nope"),
        );
        match response.into_result() {
            Err(BusError::Remote(e)) => assert_eq!(e.kind, ErrorKind::UnknownTask),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unmarshal_missing_result() {
        let response = Response::success(RequestId::from("abc"), None, None);
        let value: Option<u64> = response.unmarshal_result().unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_bus_error_to_response_error() {
        let err: ResponseError = BusError::UnknownTask {
            task: "nope".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::UnknownTask);
        assert_eq!(err.message, "unknown task: nope");
    }
}
