use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::{Response as HttpResponse, StatusCode};

use super::error::{Error, RequestError};
use super::source::Source;

/// Out-signals a callback raises to steer the retry loop.
#[derive(Default)]
pub(crate) struct Signals {
    pub(crate) upstream_offline: AtomicBool,
    pub(crate) retry: AtomicBool,
}

/// What the request callback receives for one attempt.
///
/// The handle owns the HTTP response, if the transport produced one, and is
/// only meaningful for the duration of the callback invocation it was passed
/// to. The response body is dropped with the handle, so callbacks that need
/// it must read it before returning.
pub struct Response {
    http: Option<HttpResponse<Incoming>>,
    full_url: String,
    source: Arc<Source>,
    retry_count: u32,
    err: Option<Error>,
    signals: Arc<Signals>,
}

impl Response {
    pub(crate) fn new(
        http: Option<HttpResponse<Incoming>>,
        full_url: String,
        source: Arc<Source>,
        retry_count: u32,
        err: Option<Error>,
        signals: Arc<Signals>,
    ) -> Self {
        Self {
            http,
            full_url,
            source,
            retry_count,
            err,
            signals,
        }
    }

    /// The HTTP response, or `None` when the transport failed (see
    /// [`err`](Self::err)).
    pub fn http_response(&self) -> Option<&HttpResponse<Incoming>> {
        self.http.as_ref()
    }

    /// Takes ownership of the HTTP response, e.g. to read the body.
    pub fn take_http_response(&mut self) -> Option<HttpResponse<Incoming>> {
        self.http.take()
    }

    /// Status code of the HTTP response, when one was received.
    pub fn status(&self) -> Option<StatusCode> {
        self.http.as_ref().map(|res| res.status())
    }

    /// Headers of the HTTP response, when one was received.
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.http.as_ref().map(|res| res.headers())
    }

    /// The base URL of the selected source plus the resource path.
    pub fn url(&self) -> &str {
        &self.full_url
    }

    /// The transport error of a failed attempt. Non-2xx status codes are not
    /// considered errors.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Number of retries so far; zero on the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Identifier of the source that served this attempt.
    pub fn source_id(&self) -> u32 {
        self.source.id()
    }

    /// Base URL of the source that served this attempt.
    pub fn source_base_url(&self) -> &str {
        self.source.base_url()
    }

    /// Marks the accessed server as an offline candidate; the attempt counts
    /// against its failure window once the callback returns.
    pub fn set_offline(&self) {
        self.signals.upstream_offline.store(true, Ordering::Release);
    }

    /// Requests that the call be retried on the next available server after
    /// the callback returns.
    pub fn retry_on_next_server(&self) {
        self.signals.retry.store(true, Ordering::Release);
    }

    /// Convenience for building a structured error bound to this attempt's
    /// URL.
    pub fn error(&self, message: impl Into<String>) -> Error {
        Error::Request(RequestError::new(message, self.full_url.clone()))
    }
}
