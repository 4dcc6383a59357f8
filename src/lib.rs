//! originpool - load-balanced HTTP request execution with weighted failover
//!
//! The crate is split in two layers:
//!
//! - [`lb`] is a thread-safe weighted round-robin balancer with primary and
//!   backup server tiers, per-server failure accounting and timed
//!   auto-recovery. It knows nothing about HTTP and carries an opaque payload
//!   per server.
//! - [`client`] is a retrying HTTP dispatcher built on the balancer: it
//!   selects a source, issues the request with a bounded deadline, and hands
//!   every outcome to a per-request callback that drives retries and
//!   server-health signals.

pub mod client;
pub mod lb;

pub use client::{
    Client, ClientEvent, Error, RequestBody, RequestBuilder, RequestError, Response, Source,
    SourceOptions, SourceState,
};
pub use lb::{BalancerError, LoadBalancer, ServerEvent, ServerHandle, ServerOptions};
