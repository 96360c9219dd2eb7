//! # Task Dispatch
//!
//! The shape every provider-side handler satisfies, and the registry that
//! routes a `Request` to its handler by task name.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use shared_types::{BusError, Request, Response, ResponseError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// What a handler produces on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    /// Inline result
    pub result: Option<Value>,
    /// Side-channel the caller may open, copied verbatim into the response
    pub stream_url: Option<Url>,
}

impl TaskOutput {
    /// Success with no payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Success with a serialized result.
    pub fn json<T: Serialize>(result: &T) -> Result<Self, ResponseError> {
        let value = serde_json::to_value(result)
            .map_err(|e| ResponseError::task_failed(format!("unserializable result: {e}")))?;
        Ok(Self {
            result: Some(value),
            stream_url: None,
        })
    }

    #[must_use]
    pub fn with_stream(mut self, url: Url) -> Self {
        self.stream_url = Some(url);
        self
    }
}

pub type TaskResult = Result<TaskOutput, ResponseError>;

/// A named task handler.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> TaskResult;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn handle(&self, request: Request) -> TaskResult {
        (self)(request).await
    }
}

/// Task name to handler table.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any earlier handler.
    pub fn register(&self, name: impl Into<String>, handler: impl TaskHandler) {
        let name = name.into();
        let previous = self.handlers.write().insert(name.clone(), Arc::new(handler));
        if previous.is_some() {
            warn!(task = %name, "Replaced existing task handler");
        } else {
            debug!(task = %name, "Registered task handler");
        }
    }

    /// Registered task names, sorted.
    pub fn registered_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.handlers.read().keys().cloned().collect();
        tasks.sort();
        tasks
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Run the handler for `request.task` and build its response.
    ///
    /// Never drops a request: unknown tasks and panicking handlers both
    /// produce an error response.
    pub async fn dispatch(&self, request: Request) -> Response {
        let id = request.id.clone();
        let task = request.task.clone();

        let Some(handler) = self.handlers.read().get(&task).cloned() else {
            warn!(request_id = %id, task = %task, "No handler for task");
            return Response::failure(id, BusError::UnknownTask { task }.into());
        };

        // Run on its own task so a panicking handler still yields a response.
        let outcome = tokio::spawn(async move { handler.handle(request).await }).await;

        match outcome {
            Ok(Ok(output)) => {
                debug!(request_id = %id, task = %task, "Task succeeded");
                Response::success(id, output.result, output.stream_url)
            }
            Ok(Err(error)) => {
                debug!(request_id = %id, task = %task, error = %error, "Task failed");
                Response::failure(id, error)
            }
            Err(join_error) => {
                warn!(request_id = %id, task = %task, error = %join_error, "Task handler aborted");
                Response::failure(
                    id,
                    ResponseError::task_failed(format!("handler for {task} aborted")),
                )
            }
        }
    }
}
