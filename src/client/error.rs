use std::fmt;
use std::sync::Arc;

use hyper::StatusCode;

use crate::lb::BalancerError;

/// Shared, cloneable wrapped cause.
type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the client.
///
/// Transport timeouts and caller cancellation are sentinels so they can be
/// matched directly; everything else that happens while talking to a server
/// is a structured [`RequestError`] carrying the URL and the wrapped cause.
/// Non-2xx responses are never turned into errors here; interpreting status
/// codes is left to the request callback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The attempt deadline elapsed or the transport reported a timeout.
    #[error("timeout")]
    Timeout,

    /// The caller cancelled the request.
    #[error("canceled")]
    Canceled,

    /// Both server tiers are empty or unavailable.
    #[error("no available upstream server [url={0}]")]
    NoAvailableServer(String),

    /// Carried by server-down events.
    #[error("server down")]
    ServerDown,

    /// An argument failed validation before any state was touched.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error(transparent)]
    Balancer(#[from] BalancerError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

impl Error {
    /// Builds a structured request error, e.g. from a callback rejecting a
    /// response after inspecting it.
    pub fn request(message: impl Into<String>, url: impl Into<String>) -> Self {
        Error::Request(RequestError::new(message, url))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// The URL of the attempt this error belongs to, when one applies.
    pub fn url(&self) -> Option<&str> {
        match self {
            Error::Request(err) => Some(err.url()),
            Error::NoAvailableServer(url) => Some(url),
            _ => None,
        }
    }

    /// The HTTP status code attached to a structured request error.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::Request(err) => err.status_code(),
            _ => None,
        }
    }

    /// Whether a transport-layer failure sits anywhere in the cause chain.
    pub fn is_network_error(&self) -> bool {
        let Error::Request(err) = self else {
            return false;
        };

        let mut cause = std::error::Error::source(err);
        while let Some(err) = cause {
            if err.is::<hyper::Error>()
                || err.is::<hyper_util::client::legacy::Error>()
                || err.is::<std::io::Error>()
            {
                return true;
            }
            cause = err.source();
        }
        false
    }
}

/// A request attempt failure with its URL, optional status code and cause.
#[derive(Debug, Clone)]
pub struct RequestError {
    message: String,
    url: String,
    status: Option<StatusCode>,
    source: Option<Cause>,
}

impl RequestError {
    pub fn new(message: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            url: url.into(),
            status: None,
            source: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(cause));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.status
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [url={}]", self.message, self.url)?;
        if let Some(status) = self.status {
            write!(f, " [status={}]", status)?;
        }
        if let Some(cause) = &self.source {
            write!(f, " [err={}]", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}
