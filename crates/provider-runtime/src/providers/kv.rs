//! # KV Watch Provider
//!
//! In-memory key/value store with prefix watches. Watches stream their
//! changes over a one-shot socket and are stopped by cookie.
//!
//! | Task        | Args                   | Result                        |
//! |-------------|------------------------|-------------------------------|
//! | `kv-set`    | `{key, value}`         | `{index}`                     |
//! | `kv-get`    | `{key}`                | `{key, value, index}` or null |
//! | `kv-delete` | `{key}`                | `{index}`                     |
//! | `kv-watch`  | `{prefix, index}`      | `{cookie}` + stream URL       |
//! | `kv-stop`   | `{cookie}`             | none                          |

use crate::dispatch::{TaskOutput, TaskRegistry, TaskResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_bus::{multiplex_events, CookieRegistry, StreamTransport, DEFAULT_EVENT_BUFFER};
use shared_types::{ErrorKind, Request, ResponseError};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Changes kept for replaying watches that start in the past.
pub const DEFAULT_HISTORY: usize = 1024;

/// One stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub index: u64,
}

/// A change delivered to watchers. `value` is `None` for deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEvent {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub index: u64,
}

#[derive(Debug, Default)]
struct KvState {
    entries: BTreeMap<String, KvEntry>,
    history: VecDeque<KvEvent>,
    index: u64,
}

/// The backing store.
pub struct KvStore {
    state: Mutex<KvState>,
    changes: broadcast::Sender<KvEvent>,
    history_limit: usize,
}

impl KvStore {
    pub fn new(history_limit: usize) -> Self {
        let (changes, _) = broadcast::channel(history_limit.max(16));
        Self {
            state: Mutex::new(KvState::default()),
            changes,
            history_limit: history_limit.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<KvEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> u64 {
        let mut state = self.state.lock();
        state.index += 1;
        let index = state.index;
        state.entries.insert(
            key.to_string(),
            KvEntry {
                key: key.to_string(),
                value: value.to_string(),
                index,
            },
        );
        self.record(
            &mut state,
            KvEvent {
                key: key.to_string(),
                value: Some(value.to_string()),
                index,
            },
        );
        index
    }

    /// Delete a key. Returns the change index, or `None` if the key was absent.
    pub fn delete(&self, key: &str) -> Option<u64> {
        let mut state = self.state.lock();
        state.entries.remove(key)?;
        state.index += 1;
        let index = state.index;
        self.record(
            &mut state,
            KvEvent {
                key: key.to_string(),
                value: None,
                index,
            },
        );
        Some(index)
    }

    fn record(&self, state: &mut KvState, event: KvEvent) {
        if state.history.len() == self.history_limit {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        // No receivers just means nobody is watching.
        let _ = self.changes.send(event);
    }

    /// Retained changes at or after `from`, plus a live subscription for
    /// everything after them.
    ///
    /// Fails when `from` is older than the retained history.
    fn subscribe_from(
        &self,
        from: u64,
    ) -> Result<(Vec<KvEvent>, broadcast::Receiver<KvEvent>), String> {
        let state = self.state.lock();
        // Subscribing under the lock leaves no gap between backlog and live feed.
        let live = self.changes.subscribe();

        if from > 0 {
            let oldest = state
                .history
                .front()
                .map_or(state.index + 1, |event| event.index);
            if from < oldest && state.index >= from {
                return Err(format!(
                    "watch index {from} compacted; oldest retained index is {oldest}"
                ));
            }
        }
        let backlog = state
            .history
            .iter()
            .filter(|event| from > 0 && event.index >= from)
            .cloned()
            .collect();
        Ok((backlog, live))
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

#[derive(Debug, Deserialize)]
struct SetArgs {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct KeyArgs {
    key: String,
}

/// Arguments to `kv-watch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchArgs {
    #[serde(default)]
    pub prefix: String,
    /// First change index to deliver; `0` means only new changes.
    #[serde(default)]
    pub index: u64,
}

/// Handle for stopping a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    #[serde(default)]
    pub cookie: u64,
}

#[derive(Debug, Serialize)]
struct IndexResult {
    index: u64,
}

/// Task handlers over a shared [`KvStore`].
pub struct KvProvider {
    store: Arc<KvStore>,
    watches: Arc<CookieRegistry>,
    streams: StreamTransport,
    stream_dir: PathBuf,
}

impl KvProvider {
    pub fn new(
        store: Arc<KvStore>,
        watches: Arc<CookieRegistry>,
        streams: StreamTransport,
        stream_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            watches,
            streams,
            stream_dir,
        }
    }

    /// Register every KV task on `registry`.
    pub fn register(self: Arc<Self>, registry: &TaskRegistry) {
        let provider = Arc::clone(&self);
        registry.register("kv-set", move |req: Request| {
            let provider = Arc::clone(&provider);
            async move { provider.set(&req) }
        });
        let provider = Arc::clone(&self);
        registry.register("kv-get", move |req: Request| {
            let provider = Arc::clone(&provider);
            async move { provider.get(&req) }
        });
        let provider = Arc::clone(&self);
        registry.register("kv-delete", move |req: Request| {
            let provider = Arc::clone(&provider);
            async move { provider.delete(&req) }
        });
        let provider = Arc::clone(&self);
        registry.register("kv-watch", move |req: Request| {
            let provider = Arc::clone(&provider);
            async move { provider.watch(&req).await }
        });
        let provider = self;
        registry.register("kv-stop", move |req: Request| {
            let provider = Arc::clone(&provider);
            async move { provider.stop(&req) }
        });
        info!("KV provider tasks registered");
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// Number of watches still running.
    pub fn active_watches(&self) -> usize {
        self.watches.len()
    }

    fn set(&self, req: &Request) -> TaskResult {
        let args: SetArgs = req.unmarshal_args()?;
        if args.key.is_empty() {
            return Err(missing_arg("key"));
        }
        let index = self.store.set(&args.key, &args.value);
        TaskOutput::json(&IndexResult { index })
    }

    fn get(&self, req: &Request) -> TaskResult {
        let args: KeyArgs = req.unmarshal_args()?;
        TaskOutput::json(&self.store.get(&args.key))
    }

    fn delete(&self, req: &Request) -> TaskResult {
        let args: KeyArgs = req.unmarshal_args()?;
        match self.store.delete(&args.key) {
            Some(index) => TaskOutput::json(&IndexResult { index }),
            None => Err(ResponseError::task_failed(format!(
                "key not found: {}",
                args.key
            ))),
        }
    }

    async fn watch(&self, req: &Request) -> TaskResult {
        let args: WatchArgs = req.unmarshal_args()?;
        if args.prefix.is_empty() {
            return Err(missing_arg("prefix"));
        }

        let (backlog, live) = self
            .store
            .subscribe_from(args.index)
            .map_err(ResponseError::task_failed)?;

        let (event_tx, event_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(1);
        let reader = multiplex_events(event_rx, error_rx, DEFAULT_EVENT_BUFFER);
        let url = self.streams.expose(&self.stream_dir, reader).await?;

        let token = CancellationToken::new();
        let cookie = self.watches.add(token.clone())?;

        let watches = Arc::clone(&self.watches);
        let watch = Watch {
            prefix: args.prefix,
            from: args.index,
            token,
            events: event_tx,
            errors: error_tx,
        };
        tokio::spawn(async move {
            watch.run(backlog, live).await;
            watches.remove(cookie);
            debug!(cookie, "Watch finished");
        });

        info!(cookie, stream = %url, "Watch started");
        Ok(TaskOutput::json(&Cookie { cookie })?.with_stream(url))
    }

    fn stop(&self, req: &Request) -> TaskResult {
        let args: Cookie = req.unmarshal_args()?;
        if args.cookie == 0 {
            return Err(missing_arg("cookie"));
        }
        self.watches.cancel(args.cookie)?;
        info!(cookie = args.cookie, "Watch stopped");
        Ok(TaskOutput::empty())
    }
}

fn missing_arg(name: &str) -> ResponseError {
    ResponseError::new(ErrorKind::InvalidRequest, format!("missing arg: {name}"))
}

/// A running watch feeding the multiplexer.
struct Watch {
    prefix: String,
    from: u64,
    token: CancellationToken,
    events: mpsc::Sender<KvEvent>,
    errors: mpsc::Sender<String>,
}

impl Watch {
    async fn run(self, backlog: Vec<KvEvent>, mut live: broadcast::Receiver<KvEvent>) {
        for event in backlog {
            if self.matches(&event) && !self.forward(event).await {
                return;
            }
        }

        loop {
            let received = tokio::select! {
                _ = self.token.cancelled() => return,
                _ = self.events.closed() => return,
                received = live.recv() => received,
            };
            match received {
                Ok(event) => {
                    if self.matches(&event) && !self.forward(event).await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    let _ = self
                        .errors
                        .send(format!("watch fell behind by {missed} changes"))
                        .await;
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn matches(&self, event: &KvEvent) -> bool {
        event.key.starts_with(&self.prefix) && event.index >= self.from
    }

    /// Forward one event; `false` once the watch should end.
    async fn forward(&self, event: KvEvent) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}
