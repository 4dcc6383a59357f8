use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use hyper::header::HeaderMap;
use url::Url;

use super::error::Error;

/// A single origin the client can direct requests at.
///
/// Sources are created by [`Client::add_source`](super::Client::add_source)
/// and shared with the balancer as the server payload. The online flag and
/// last error are updated as requests settle and can be read from any thread
/// without touching the balancer lock.
pub struct Source {
    id: u32,
    base_url: String,
    headers: HeaderMap,
    is_backup: bool,
    is_online: AtomicBool,
    last_error: RwLock<Option<Error>>,
}

/// Snapshot of a source's state.
#[derive(Debug, Clone)]
pub struct SourceState {
    pub base_url: String,
    pub is_online: bool,
    pub last_error: Option<Error>,
    pub is_backup: bool,
}

impl Source {
    pub(crate) fn new(id: u32, base_url: String, headers: HeaderMap, is_backup: bool) -> Self {
        Self {
            id,
            base_url,
            headers,
            is_backup,
            is_online: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// The source identifier. IDs start from 1 and are stable for the
    /// lifetime of the client.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The base URL, without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_backup(&self) -> bool {
        self.is_backup
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::Acquire)
    }

    /// The outcome of the most recent attempt against this source. A
    /// successful attempt overwrites any previous error with `None`.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn state(&self) -> SourceState {
        SourceState {
            base_url: self.base_url.clone(),
            is_online: self.is_online(),
            last_error: self.last_error(),
            is_backup: self.is_backup,
        }
    }

    pub(crate) fn set_online_status(&self, online: bool) {
        self.is_online.store(online, Ordering::Release);
    }

    pub(crate) fn set_last_error(&self, err: Option<Error>) {
        let mut guard = self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = err;
    }
}

/// Checks that a base URL is `http(s)://host(:port)` with nothing else, and
/// returns it with any trailing slash stripped.
pub(crate) fn validate_base_url(raw: &str) -> Result<String, Error> {
    let parsed = Url::parse(raw).map_err(|_| Error::InvalidParameter("base url"))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::InvalidParameter("base url"));
    }
    if parsed.host_str().is_none()
        || !parsed.username().is_empty()
        || parsed.password().is_some()
        || parsed.query().is_some()
        || parsed.fragment().is_some()
        || !matches!(parsed.path(), "" | "/")
    {
        return Err(Error::InvalidParameter("base url"));
    }

    Ok(raw.trim_end_matches('/').to_string())
}
