//! # Taskmesh Provider Runtime
//!
//! Hosts task handlers behind the dispatch contract and gives them a
//! tracker for their own outbound requests.
//!
//! ## Modules
//!
//! - `config` - TOML file + `TASKMESH_*` environment configuration
//! - `logging` - tracing subscriber setup
//! - `dispatch` - `TaskHandler` contract and the task registry
//! - `server` - HTTP surface (`POST /`, `POST /response`, `GET /health`)
//! - `providers` - bundled providers (in-memory KV with watches)
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (from file/env)
//! 2. Initialize logging
//! 3. Register provider tasks
//! 4. Start the HTTP server
//! 5. Wait for SIGINT/SIGTERM, then stop

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod dispatch;
pub mod logging;
pub mod providers;
pub mod server;

pub use config::{ConfigError, LoggingConfig, ProviderConfig};
pub use dispatch::{TaskHandler, TaskOutput, TaskRegistry, TaskResult};
pub use logging::init_logging;
pub use server::{Server, ServerError};
