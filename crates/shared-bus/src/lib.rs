//! # Shared Bus - Request Correlation and Side-Channels
//!
//! The substrate every provider and the coordinator share for talking to
//! each other.
//!
//! ## Components
//!
//! - **Tracker:** turns a fire-and-forget send into a bounded, timeout-safe
//!   synchronous or callback-driven operation
//! - **Transport:** delivers envelopes (`HttpTransport` in production)
//! - **Response Listener:** `POST /response` endpoint feeding the tracker
//! - **Stream Transport:** one-shot Unix socket side-channels for bulk data
//! - **Event Records:** line-delimited JSON feeds for long-running watches
//! - **Cookie Registry:** opaque handles for cancelling those watches
//!
//! ```text
//! ┌──────────────┐   send()    ┌──────────────┐
//! │  Requester   │ ──────────► │   Handler    │
//! │   Tracker    │             │              │
//! │      ▲       │  /response  │              │
//! │      └───────┼─────────────┤              │
//! └──────────────┘             └──────┬───────┘
//!        │         unix://…sock       │
//!        └────────────────────────────┘ (optional stream)
//! ```
//!
//! ## Guarantees
//!
//! - Each tracked request resolves exactly once (response or timeout)
//! - Late responses are rejected with `UnknownRequest`
//! - An exposed stream serves exactly one consumer

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod cookies;
pub mod events;
pub mod listener;
pub mod stream;
pub mod tracker;
pub mod transport;

use std::time::Duration;

// Re-export main types
pub use cookies::CookieRegistry;
pub use events::{decode_records, multiplex_events, EventRecord, EventRecordReader, EventStream};
pub use listener::{response_router, ResponseListener, RESPONSE_PATH};
pub use stream::{StreamConfig, StreamTransport};
pub use tracker::{ResponseHandlers, Tracker, TrackerConfig, TrackerStats};
pub use transport::{HttpTransport, Transport};

/// Timeout used when a caller does not pick one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pipe size for multiplexed event streams.
pub const DEFAULT_EVENT_BUFFER: usize = 64 * 1024;
