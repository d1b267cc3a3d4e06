//! A client-side service core for content-addressed object stores and
//! remote calculation APIs.
//!
//! Gantry brokers and accelerates access to a remote that stores immutable
//! objects and evaluates calculation graphs. Its heart is a request
//! resolution engine: requests describe values lazily, are fingerprinted by
//! structure, and resolve through a concurrent in-memory cache so that
//! equal work is only ever in flight once. Around the engine sit worker
//! pools for CPU-bound and HTTP-bound jobs (each HTTP worker owning a
//! persistent connection), cooperative cancellation and progress reporting,
//! LRU eviction under a size cap, and a WebSocket boundary for clients.
//!
//! # High-level features
//! - Content-addressed identity: structural ids, SHA-256 composition
//! - Dynamic values with a canonical, round-trip-stable native encoding
//! - An immutable cache with per-entry state machines, waiters, and
//!   lock-free state/progress polling
//! - Request graphs (value / apply / meta) with structural memoization
//! - Priority worker pools with HTTP-connection affinity and cooperative
//!   cancellation
//! - A mockable HTTP capability and scripted test sessions
//! - Bindings for a Thinknode-style remote API and a JSON WebSocket
//!   protocol
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use gantry::config::ServiceConfig;
//! use gantry::request::{rq, Function, Outcome};
//! use gantry::service::ServiceCore;
//! use gantry::value::Value;
//!
//! # async fn example() -> Result<(), gantry::errors::Error> {
//! let core = ServiceCore::new(ServiceConfig::default());
//!
//! let sum = Function::new("sum", |args| {
//!     let mut total = 0;
//!     for arg in &args {
//!         total += arg.as_integer()?;
//!     }
//!     Ok(Outcome::Value(Value::from(total)))
//! });
//! let request = rq::apply(sum, vec![rq::value(4i64), rq::value(2i64)]);
//! let value = core.resolve_request(&request).await?;
//! assert_eq!(value.as_integer()?, 6);
//! # Ok(())
//! # }
//! ```
//!
//! # Key concepts
//! - [service::ServiceCore] bundles the cache and the pools; it is the
//!   public entry point.
//! - [request] describes work; [request::RequestResolutionSystem] resolves
//!   it with structural memoization.
//! - [cache::ImmutableCache] holds resolved values; consumers express
//!   interest through reference-counted pointers.
//! - [http::HttpConnection] is the outbound capability jobs use; mock it
//!   with [http::MockHttpSession].
//! - [ws] frames the client-facing WebSocket protocol.

/// The in-memory cache for immutable data.
pub mod cache;

/// Codecs: canonical native encoding, JSON/MessagePack adapters, LZ4.
pub mod codec;

/// Configuration types and config-file loading.
pub mod config;

/// Platform configuration-directory resolution.
pub mod dirs;

/// The structured error type shared across the crate.
pub mod errors;

/// The outbound HTTP capability, real and mock.
pub mod http;

/// Content-addressed identifiers.
pub mod identity;

/// The background job contract and its monitoring handle.
pub mod job;

/// Bounded worker pools for background jobs.
pub mod pool;

/// Progress reporting and cooperative cancellation primitives.
pub mod progress;

/// Client bindings for the remote object-store and calculation API.
pub mod remote;

/// The request graph and its resolution engine.
pub mod request;

/// The service core facade.
pub mod service;

/// Small shared utilities: environment access, checks, file IO.
pub mod util;

/// Dynamic values and blobs.
pub mod value;

/// The WebSocket boundary: protocol, server loop, client.
pub mod ws;

pub use errors::{Error, ErrorKind, Result};
pub use service::ServiceCore;
pub use value::Value;
