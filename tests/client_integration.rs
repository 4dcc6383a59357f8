//! End-to-end tests for the load-balanced HTTP client
//!
//! These tests stand up real loopback HTTP servers and verify source
//! selection, callback-driven failover, body replay across retries, error
//! classification and cancellation.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use originpool::client::{Client, ClientEvent, SourceOptions};

struct MockServer {
    base_url: String,
}

async fn spawn_mock_server(name: &'static str) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(name, req));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    MockServer { base_url }
}

async fn handle(
    name: &'static str,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let echo_tag = req.headers().get("x-tag").cloned();

    let mut response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/test") => {
            let body = serde_json::json!({ "server": name }).to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header("x-server", name)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        (&Method::GET, "/slow") => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Response::builder()
                .status(StatusCode::OK)
                .header("x-server", name)
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
        (&Method::POST, "/bodytest") => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let payload =
                serde_json::json!({ "received-body": String::from_utf8_lossy(&body) }).to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header("x-server", name)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(payload)))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::from_static(b"bad request")))
            .unwrap(),
    };

    if let Some(tag) = echo_tag {
        response.headers_mut().insert("x-echo-tag", tag);
    }
    Ok(response)
}

fn pool_options() -> SourceOptions {
    SourceOptions {
        weight: 1,
        max_fails: 1,
        fail_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

async fn test_environment() -> (MockServer, MockServer, Client) {
    let server1 = spawn_mock_server("server1").await;
    let server2 = spawn_mock_server("server2").await;

    let client = Client::new();
    let mut default_headers = HeaderMap::new();
    default_headers.insert("x-tag", HeaderValue::from_static("source-default"));

    client
        .add_source(&server1.base_url, default_headers.clone(), pool_options())
        .unwrap();
    client
        .add_source(&server2.base_url, default_headers, pool_options())
        .unwrap();

    (server1, server2, client)
}

fn server_header(res: &originpool::client::Response) -> String {
    res.headers()
        .and_then(|headers| headers.get("x-server"))
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn expect_server(client: &Client, expected: &'static str) {
    client
        .new_request(Method::GET, "/test")
        .exec(CancellationToken::new(), move |res| async move {
            if res.status() != Some(StatusCode::OK) {
                return Err(res.error(format!("unexpected status {:?}", res.status())));
            }
            let server = server_header(&res);
            if server == expected {
                Ok(())
            } else {
                Err(res.error(format!("expected {}, got {}", expected, server)))
            }
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn requests_alternate_between_sources() {
    let (_server1, _server2, client) = test_environment().await;

    expect_server(&client, "server1").await;
    expect_server(&client, "server2").await;
    expect_server(&client, "server1").await;
}

#[tokio::test]
async fn callback_offline_signal_fails_over() {
    let (_server1, _server2, client) = test_environment().await;

    // First request lands on server 1; the callback declares it offline.
    client
        .new_request(Method::GET, "/test")
        .exec(CancellationToken::new(), |res| async move {
            let server = server_header(&res);
            if server != "server1" {
                return Err(res.error(format!("expected server1, got {}", server)));
            }
            res.set_offline();
            Ok(())
        })
        .await
        .unwrap();

    // Server 1 sits in its fail timeout, so both follow-ups go to server 2.
    expect_server(&client, "server2").await;
    expect_server(&client, "server2").await;

    let state = client.source_state(0).unwrap();
    assert!(!state.is_online);
}

#[tokio::test]
async fn post_body_is_replayed_across_retries() {
    let (_server1, _server2, client) = test_environment().await;

    client
        .new_request(Method::POST, "/bodytest")
        .body_bytes(b"this is a sample body")
        .exec(CancellationToken::new(), |mut res| async move {
            if res.status() != Some(StatusCode::OK) {
                return Err(res.error(format!("unexpected status {:?}", res.status())));
            }

            let server = server_header(&res);
            match res.retry_count() {
                0 | 2 => {
                    if server != "server1" {
                        return Err(res.error(format!("expected server1, got {}", server)));
                    }
                    res.retry_on_next_server();
                    Ok(())
                }
                1 | 3 => {
                    if server != "server2" {
                        return Err(res.error(format!("expected server2, got {}", server)));
                    }
                    res.retry_on_next_server();
                    Ok(())
                }
                4 => {
                    // The body the last server echoes must match the original
                    // bytes even after four replays.
                    let http_res = res
                        .take_http_response()
                        .ok_or_else(|| res.error("missing http response"))?;
                    let body = http_res
                        .into_body()
                        .collect()
                        .await
                        .map_err(|err| res.error(format!("failed to read body: {}", err)))?
                        .to_bytes();
                    let value: serde_json::Value = serde_json::from_slice(&body)
                        .map_err(|err| res.error(format!("bad json: {}", err)))?;
                    if value["received-body"] == "this is a sample body" {
                        Ok(())
                    } else {
                        Err(res.error("received-body mismatch"))
                    }
                }
                other => Err(res.error(format!("unexpected retry count {}", other))),
            }
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn source_default_headers_are_overridable_per_request() {
    let (_server1, _server2, client) = test_environment().await;

    // Without an override the source default is sent.
    client
        .new_request(Method::GET, "/test")
        .exec(CancellationToken::new(), |res| async move {
            let tag = res
                .headers()
                .and_then(|headers| headers.get("x-echo-tag"))
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if tag == "source-default" {
                Ok(())
            } else {
                Err(res.error(format!("expected source default header, got {:?}", tag)))
            }
        })
        .await
        .unwrap();

    // A request header with the same name wins.
    client
        .new_request(Method::GET, "/test")
        .header("x-tag".parse().unwrap(), HeaderValue::from_static("request"))
        .exec(CancellationToken::new(), |res| async move {
            let tag = res
                .headers()
                .and_then(|headers| headers.get("x-echo-tag"))
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if tag == "request" {
                Ok(())
            } else {
                Err(res.error(format!("expected request header to win, got {:?}", tag)))
            }
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn dns_failure_is_a_network_error() {
    let client = Client::new();
    client
        .add_source(
            "http://originpool-no-such-host.invalid",
            HeaderMap::new(),
            pool_options(),
        )
        .unwrap();

    let err = client
        .new_request(Method::GET, "/test")
        .timeout(Duration::from_secs(10))
        .exec(CancellationToken::new(), |res| async move {
            res.set_offline();
            res.err().cloned().map_or(Ok(()), Err)
        })
        .await
        .unwrap_err();

    assert!(err.is_network_error());
    assert!(!err.is_timeout());
    assert!(!err.is_canceled());
    assert_eq!(
        err.url(),
        Some("http://originpool-no-such-host.invalid/test")
    );

    let state = client.source_state(0).unwrap();
    assert!(!state.is_online);
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = spawn_mock_server("slow").await;
    let client = Client::new();
    client
        .add_source(&server.base_url, HeaderMap::new(), pool_options())
        .unwrap();

    let err = client
        .new_request(Method::GET, "/slow")
        .timeout(Duration::from_millis(200))
        .exec(CancellationToken::new(), |res| async move {
            res.set_offline();
            res.err().cloned().map_or(Ok(()), Err)
        })
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(!client.source_state(0).unwrap().is_online);
}

#[tokio::test]
async fn cancelling_the_caller_stops_the_retry_loop() {
    let server = spawn_mock_server("slow").await;
    let client = Client::new();
    client
        .add_source(&server.base_url, HeaderMap::new(), pool_options())
        .unwrap();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let err = {
        let calls = Arc::clone(&calls);
        client
            .new_request(Method::GET, "/slow")
            .timeout(Duration::from_secs(10))
            .exec(cancel, move |res| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Even though a retry is requested, a cancelled caller
                    // must not reach another server.
                    res.retry_on_next_server();
                    res.err().cloned().map_or(Ok(()), Err)
                }
            })
            .await
            .unwrap_err()
    };

    assert!(err.is_canceled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn events_follow_request_outcomes() {
    let (_server1, _server2, client) = test_environment().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        client.set_event_handler(move |event, source_id, _err| {
            events.lock().unwrap().push((event, source_id));
        });
    }

    client
        .new_request(Method::GET, "/test")
        .exec(CancellationToken::new(), |res| async move {
            res.set_offline();
            Ok(())
        })
        .await
        .unwrap();
    expect_server(&client, "server2").await;

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            (ClientEvent::RequestSucceeded, 1),
            (ClientEvent::ServerDown, 1),
            (ClientEvent::RequestSucceeded, 2),
        ]
    );
}

#[tokio::test]
async fn exec_validates_arguments() {
    let client = Client::new();

    let err = client
        .new_request(Method::GET, "")
        .exec(CancellationToken::new(), |_res| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, originpool::client::Error::InvalidParameter(_)));

    let err = client
        .new_request(Method::GET, "/x")
        .timeout(Duration::ZERO)
        .exec(CancellationToken::new(), |_res| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, originpool::client::Error::InvalidParameter(_)));

    // No sources registered: the balancer has nothing to offer.
    let err = client
        .new_request(Method::GET, "/x")
        .exec(CancellationToken::new(), |_res| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        originpool::client::Error::NoAvailableServer(_)
    ));
}
