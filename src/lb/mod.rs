//! Weighted round-robin load balancing with failure tracking
//!
//! This module provides upstream server selection for clients that spread
//! requests across a pool of interchangeable servers.
//!
//! # Components
//!
//! - [`ServerOptions`]: per-server weight, failure budget and backup flag
//! - [`LoadBalancer`]: two-tier (primary/backup) weighted round-robin selector
//! - [`ServerHandle`]: a selected server, used to report attempt outcomes
//!
//! # Selection Model
//!
//! Primary servers are walked with a weighted round-robin cursor; a server
//! with weight `n` absorbs `n` consecutive selections before the cursor
//! advances. Backup servers use the same discipline but are only consulted
//! while every primary is offline.
//!
//! # Failure Tracking
//!
//! Callers report outcomes through [`ServerHandle::set_online`] and
//! [`ServerHandle::set_offline`]. A primary server that accumulates
//! `max_fails` failures within its `fail_timeout` window is quarantined for
//! that same duration and then re-admitted automatically. Backup servers and
//! servers with `max_fails == 0` never go offline.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use originpool::lb::{LoadBalancer, ServerOptions};
//! use std::time::Duration;
//!
//! let lb = LoadBalancer::new();
//!
//! lb.add(
//!     ServerOptions {
//!         weight: 5,
//!         max_fails: 3,
//!         fail_timeout: Duration::from_secs(10),
//!         ..Default::default()
//!     },
//!     "primary-1",
//! )?;
//! lb.add(ServerOptions { is_backup: true, ..Default::default() }, "backup-1")?;
//!
//! if let Some(srv) = lb.next() {
//!     println!("selected {}", srv.user_data());
//!
//!     // ... perform the request ...
//!
//!     srv.set_online();
//! }
//! # Ok::<(), originpool::lb::BalancerError>(())
//! ```
//!
//! # Thread Safety
//!
//! The balancer is `Clone` and all clones share state behind a single mutex;
//! selection and state reporting can happen from any number of threads. The
//! mutex is never held across event callbacks, which run on the thread that
//! caused the transition.

pub mod balancer;
pub mod server;

pub use balancer::{BalancerError, EventHandler, LoadBalancer};
pub use server::{ServerEvent, ServerHandle, ServerOptions};
