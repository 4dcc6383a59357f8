use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::Request as HttpRequest;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{Error, RequestError};
use super::request::RequestBuilder;
use super::response::{Response, Signals};
use super::source::Source;
use super::ClientEvent;

const ERR_EXECUTE_REQUEST: &str = "failed to execute http request";

/// Retry loop behind [`RequestBuilder::exec`].
pub(super) async fn run<F, Fut>(
    req: RequestBuilder,
    cancel: CancellationToken,
    mut callback: F,
) -> Result<(), Error>
where
    F: FnMut(Response) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let client = Arc::clone(&req.client.inner);
    let mut retry_count: u32 = 0;

    loop {
        // A cancelled caller never reaches the next selection.
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let Some(server) = client.lb.next() else {
            return Err(Error::NoAvailableServer(req.resource.clone()));
        };
        let source: Arc<Source> = server.user_data().clone();
        let full_url = format!("{}{}", source.base_url(), req.resource);

        let http_req = match build_http_request(&req, &source, &full_url) {
            Ok(http_req) => http_req,
            Err(err) => {
                source.set_last_error(Some(err.clone()));
                return Err(err);
            }
        };

        debug!(
            url = %full_url,
            source = source.id(),
            retry = retry_count,
            "dispatching request"
        );

        let (http_res, attempt_err) = tokio::select! {
            _ = cancel.cancelled() => (None, Some(Error::Canceled)),
            outcome = tokio::time::timeout(req.timeout, client.http.request(http_req)) => {
                match outcome {
                    Err(_) => {
                        server.set_offline();
                        (None, Some(Error::Timeout))
                    }
                    Ok(Err(err)) => {
                        server.set_offline();
                        if has_timeout_cause(&err) {
                            (None, Some(Error::Timeout))
                        } else {
                            let err = RequestError::new(ERR_EXECUTE_REQUEST, full_url.clone())
                                .with_cause(err);
                            (None, Some(Error::Request(err)))
                        }
                    }
                    Ok(Ok(res)) => (Some(res), None),
                }
            }
        };

        let signals = Arc::new(Signals::default());
        let response = Response::new(
            http_res,
            full_url,
            Arc::clone(&source),
            retry_count,
            attempt_err,
            Arc::clone(&signals),
        );

        let result = reclassify(callback(response).await);

        // The last outcome is recorded even on success.
        source.set_last_error(result.as_ref().err().cloned());

        match &result {
            Ok(()) => client.raise_event(ClientEvent::RequestSucceeded, source.id(), None),
            Err(err) => client.raise_event(ClientEvent::RequestFailed, source.id(), Some(err)),
        }

        if signals.upstream_offline.load(Ordering::Acquire) {
            server.set_offline();
        } else {
            server.set_online();
        }

        if !signals.retry.load(Ordering::Acquire) {
            return result;
        }

        retry_count += 1;
    }
}

fn build_http_request(
    req: &RequestBuilder,
    source: &Source,
    full_url: &str,
) -> Result<HttpRequest<Full<Bytes>>, Error> {
    let mut http_req = HttpRequest::builder()
        .method(req.method.clone())
        .uri(full_url)
        .body(req.body.materialize())
        .map_err(|err| {
            Error::Request(RequestError::new(ERR_EXECUTE_REQUEST, full_url).with_cause(err))
        })?;

    *http_req.headers_mut() = compose_headers(source.headers(), &req.headers);
    Ok(http_req)
}

/// Overlays the request headers on the source defaults. The request wins per
/// header name; multi-valued headers keep all their values.
fn compose_headers(defaults: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut headers = defaults.clone();
    for name in overrides.keys() {
        headers.remove(name);
    }
    for (name, value) in overrides.iter() {
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Collapses timeout-shaped failures returned by the callback into the
/// sentinel, so callers always observe the same classification whether the
/// failure happened during the attempt or while reading the body.
fn reclassify(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(Error::Request(err)) => {
            if has_timeout_cause(&err) {
                Err(Error::Timeout)
            } else {
                Err(Error::Request(err))
            }
        }
        other => other,
    }
}

/// Whether the cause chain carries a transport-level timeout.
fn has_timeout_cause(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = cause {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            if hyper_err.is_timeout() {
                return true;
            }
        }
        cause = err.source();
    }
    false
}
