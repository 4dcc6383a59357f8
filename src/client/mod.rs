//! Load-balanced HTTP request execution
//!
//! This module layers a retrying HTTP dispatcher on top of the
//! [`lb`](crate::lb) balancer. Each registered [`Source`] pairs a balancer
//! server with a base URL and default headers; executing a request selects a
//! source, issues the HTTP call with a bounded deadline, and hands the
//! outcome to a per-request callback that decides whether to retry on the
//! next server and whether the attempt counts as a server failure.
//!
//! Status codes are never interpreted here. A 500 is delivered to the
//! callback exactly like a 200; only the callback knows whether a response
//! is acceptable.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use originpool::client::{Client, SourceOptions};
//! use hyper::header::HeaderMap;
//! use hyper::Method;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), originpool::client::Error> {
//! let client = Client::new();
//! for base_url in ["http://origin-1.example.com:8080", "http://origin-2.example.com:8080"] {
//!     client.add_source(
//!         base_url,
//!         HeaderMap::new(),
//!         SourceOptions {
//!             weight: 1,
//!             max_fails: 3,
//!             fail_timeout: Duration::from_secs(10),
//!             ..Default::default()
//!         },
//!     )?;
//! }
//!
//! client
//!     .new_request(Method::GET, "/status")
//!     .timeout(Duration::from_secs(5))
//!     .exec(CancellationToken::new(), |res| async move {
//!         if let Some(err) = res.err() {
//!             // Transport failure: try the next source.
//!             res.retry_on_next_server();
//!             return Err(err.clone());
//!         }
//!         match res.status() {
//!             Some(status) if status.is_success() => Ok(()),
//!             Some(status) => Err(res.error(format!("unexpected status code {}", status))),
//!             None => Ok(()),
//!         }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod exec;
pub mod request;
pub mod response;
pub mod source;

use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::Method;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use tracing::info;

use crate::lb::{LoadBalancer, ServerEvent, ServerOptions};

pub use error::{Error, RequestError};
pub use request::{RequestBody, RequestBuilder};
pub use response::Response;
pub use source::{Source, SourceState};

/// Per-source balancer options.
pub type SourceOptions = ServerOptions;

/// The transport type used for outgoing requests. Build one yourself to tune
/// it and pass it to [`Client::with_transport`].
pub type Transport = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Events emitted as sources change availability and requests settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    ServerUp,
    ServerDown,
    RequestSucceeded,
    RequestFailed,
}

type ClientEventHandler = Box<dyn Fn(ClientEvent, u32, Option<&Error>) + Send + Sync>;

/// A load-balanced HTTP client.
///
/// Cloning is cheap; clones share the source pool, the balancer state and
/// the underlying connection pool.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) lb: LoadBalancer<Arc<Source>>,
    pub(crate) http: Transport,
    sources: RwLock<Vec<Arc<Source>>>,
    event_handler: RwLock<Option<ClientEventHandler>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Creates a client with a tuned default transport: 100 idle connections
    /// per host, 60s idle timeout, 5s connect timeout, TCP_NODELAY.
    pub fn new() -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(Duration::from_secs(5)));

        let tls = TlsConnector::new().expect("failed to build TLS connector");
        let https = HttpsConnector::from((http, tls.into()));

        let transport = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(100)
            .build(https);

        Self::with_transport(transport)
    }

    /// Creates a client that issues requests through the given transport.
    pub fn with_transport(transport: Transport) -> Self {
        let inner = Arc::new(ClientInner {
            lb: LoadBalancer::new(),
            http: transport,
            sources: RwLock::new(Vec::new()),
            event_handler: RwLock::new(None),
        });

        // The balancer owns a handler that reaches back into the client, so
        // the back-reference must be weak to avoid a cycle.
        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        inner.lb.set_event_handler(move |event, srv| {
            let source: &Arc<Source> = srv.user_data();
            source.set_online_status(event == ServerEvent::Up);

            if let Some(client) = weak.upgrade() {
                match event {
                    ServerEvent::Up => {
                        client.raise_event(ClientEvent::ServerUp, source.id(), None);
                    }
                    ServerEvent::Down => {
                        client.raise_event(
                            ClientEvent::ServerDown,
                            source.id(),
                            Some(&Error::ServerDown),
                        );
                    }
                }
            }
        });

        Self { inner }
    }

    /// Registers a new source.
    ///
    /// The base URL must be `http(s)://host(:port)` with at most a trailing
    /// slash, which is stripped before storage. The default headers are sent
    /// with every request against this source unless the request overrides
    /// them.
    pub fn add_source(
        &self,
        base_url: &str,
        headers: HeaderMap,
        opts: SourceOptions,
    ) -> Result<(), Error> {
        let base_url = source::validate_base_url(base_url)?;

        let mut sources = self
            .inner
            .sources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = sources.len() as u32 + 1;
        let source = Arc::new(Source::new(id, base_url, headers, opts.is_backup));
        sources.push(Arc::clone(&source));

        if let Err(err) = self.inner.lb.add(opts, Arc::clone(&source)) {
            sources.pop();
            return Err(err.into());
        }

        info!(id, base_url = source.base_url(), "source registered");
        Ok(())
    }

    /// Number of registered sources.
    pub fn sources_count(&self) -> usize {
        self.inner
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// State snapshot of the source at the given zero-based index.
    pub fn source_state(&self, index: usize) -> Option<SourceState> {
        self.inner
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .map(|source| source.state())
    }

    /// State snapshot of the source with the given identifier.
    pub fn source_state_by_id(&self, id: u32) -> Option<SourceState> {
        self.source_state(id.checked_sub(1)? as usize)
    }

    /// Installs the event sink, replacing any previous one. The sink runs on
    /// the thread that produced the event and must not block.
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(ClientEvent, u32, Option<&Error>) + Send + Sync + 'static,
    {
        let mut guard = self
            .inner
            .event_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Box::new(handler));
    }

    /// Starts building a request for the given method and resource path. The
    /// path is appended verbatim to the selected source's base URL.
    pub fn new_request(&self, method: Method, resource: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, resource.into())
    }
}

impl ClientInner {
    pub(crate) fn raise_event(&self, event: ClientEvent, source_id: u32, err: Option<&Error>) {
        let guard = self
            .event_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = guard.as_ref() {
            handler(event, source_id, err);
        }
    }
}
