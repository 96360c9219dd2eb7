//! # Shared Types Crate
//!
//! The envelope every provider, requester and coordinator exchanges, plus the
//! error taxonomy that travels with it.
//!
//! ## Design Principles
//!
//! - **Correlation by ID only**: a `Response` resolves the `Request` whose
//!   `id` it carries. Nothing else on the wire is used for matching.
//! - **Opaque payloads**: `args` and `result` are JSON values that only the
//!   destination handler (or the requesting caller) interprets.
//! - **Process-local behaviour stays local**: completion handlers never
//!   appear in these types; they are attached when a request is tracked.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod envelope;
pub mod errors;

pub use envelope::{Request, RequestId, RequestOptions, Response, ResponseError};
pub use errors::{BusError, ErrorKind};
