use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::Method;
use tokio_util::sync::CancellationToken;

use super::error::Error;
use super::exec;
use super::response::Response;
use super::Client;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// A request body that can be replayed across retries.
///
/// Every retry of a request must send exactly the bytes of the first
/// attempt, so only body kinds that can produce a fresh copy on demand are
/// accepted: captured byte buffers (which also cover strings and vectors)
/// and factories that rebuild the bytes per attempt. One-shot streams have
/// no representation here on purpose; wrap them in a factory if the bytes
/// can be reproduced.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Factory(Arc<dyn Fn() -> Bytes + Send + Sync>),
}

impl RequestBody {
    /// Wraps a factory that rebuilds the body bytes for each attempt.
    pub fn from_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Bytes + Send + Sync + 'static,
    {
        RequestBody::Factory(Arc::new(factory))
    }

    /// Produces a fresh transport body over the captured bytes.
    pub(crate) fn materialize(&self) -> Full<Bytes> {
        match self {
            RequestBody::Empty => Full::new(Bytes::new()),
            RequestBody::Bytes(bytes) => Full::new(bytes.clone()),
            RequestBody::Factory(factory) => Full::new(factory()),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            RequestBody::Factory(_) => f.write_str("Factory"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(body: String) -> Self {
        RequestBody::Bytes(Bytes::from(body))
    }
}

impl From<&'static str> for RequestBody {
    fn from(body: &'static str) -> Self {
        RequestBody::Bytes(Bytes::from(body))
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(body: &'static [u8]) -> Self {
        RequestBody::Bytes(Bytes::from(body))
    }
}

/// Describes one HTTP call against the source pool.
///
/// Built by [`Client::new_request`]; the resource path is appended verbatim
/// to the selected source's base URL, so callers are responsible for the
/// leading slash.
pub struct RequestBuilder {
    pub(crate) client: Client,
    pub(crate) method: Method,
    pub(crate) resource: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: RequestBody,
    pub(crate) timeout: Duration,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, resource: String) -> Self {
        Self {
            client,
            method,
            resource,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Replaces the per-request headers. They are overlaid on the selected
    /// source's default headers, winning per header name.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Appends a single header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the request body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the request body from a byte slice, capturing a copy.
    pub fn body_bytes(mut self, body: &[u8]) -> Self {
        self.body = RequestBody::Bytes(Bytes::copy_from_slice(body));
        self
    }

    /// Sets the per-attempt timeout. Each retry gets a fresh deadline; a
    /// total budget belongs on the cancellation token instead.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Executes the request, retrying across sources as directed by the
    /// callback.
    ///
    /// The callback is invoked once per attempt with a [`Response`] handle,
    /// whether the transport succeeded or not, and decides what happens
    /// next: calling [`Response::retry_on_next_server`] re-runs the request
    /// against the next selected source, and [`Response::set_offline`]
    /// counts the attempt as a server failure. The callback's return value
    /// for the final attempt becomes the result of `exec`.
    ///
    /// Cancelling `cancel` aborts the in-flight attempt and ends the loop
    /// with [`Error::Canceled`].
    pub async fn exec<F, Fut>(self, cancel: CancellationToken, callback: F) -> Result<(), Error>
    where
        F: FnMut(Response) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        if self.resource.is_empty() {
            return Err(Error::InvalidParameter("resource path"));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidParameter("timeout"));
        }

        exec::run(self, cancel, callback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn collect(body: Full<Bytes>) -> Bytes {
        body.collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn bytes_body_replays_identically() {
        let body = RequestBody::from("this is a sample body".to_string());
        let first = collect(body.materialize()).await;
        let second = collect(body.materialize()).await;
        assert_eq!(first, second);
        assert_eq!(first, Bytes::from("this is a sample body"));
    }

    #[tokio::test]
    async fn factory_body_rebuilds_per_attempt() {
        let body = RequestBody::from_factory(|| Bytes::from_static(b"rebuilt"));
        assert_eq!(collect(body.materialize()).await, Bytes::from_static(b"rebuilt"));
        assert_eq!(collect(body.materialize()).await, Bytes::from_static(b"rebuilt"));
    }

    #[tokio::test]
    async fn empty_body_materializes_empty() {
        let body = RequestBody::Empty;
        assert!(collect(body.materialize()).await.is_empty());
    }

    #[test]
    fn conversions_capture_bytes() {
        for body in [
            RequestBody::from(Bytes::from_static(b"x")),
            RequestBody::from(vec![b'x']),
            RequestBody::from("x".to_string()),
            RequestBody::from("x"),
            RequestBody::from(&b"x"[..]),
        ] {
            match body {
                RequestBody::Bytes(bytes) => assert_eq!(bytes, Bytes::from_static(b"x")),
                other => panic!("expected captured bytes, got {:?}", other),
            }
        }
    }
}
