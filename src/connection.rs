//! Per-request processing for one HTTP/1.1 connection.
//!
//! hyper owns the wire protocol: it parses request heads, frames bodies and
//! keeps the connection alive between exchanges. For every request this
//! module routes on the head, feeds the body through a bounded
//! [`BodyParser`], runs the matched handler and writes the response with its
//! transfer strategy.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::FutureExt;
use hyper::body::HttpBody;
use hyper::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Version};

use crate::body::{BodyLimits, BodyParser};
use crate::error::Error;
use crate::exceptions::default_translate;
use crate::executor::{panic_message, Executor};
use crate::filter::BoxHandler;
use crate::http::{self, WriteContext};
use crate::request::{decode_path, Request};
use crate::response::{Response, ResponseBody, WsHandler};
use crate::router::Router;
use crate::websocket;

/// State shared by every connection of a server.
pub(crate) struct ServerShared {
    pub router: Router,
    pub limits: BodyLimits,
    pub chunk_capacity: usize,
    pub executor: Executor,
}

/// A pending upgrade and the outcome of validating its handshake.
struct Upgrade {
    on_upgrade: OnUpgrade,
    handshake: Result<String, Response>,
}

/// Whether the connection stays open after this exchange.
fn keep_alive(version: Version, headers: &hyper::HeaderMap) -> bool {
    let has = |token: &str| {
        headers.get_all(CONNECTION).iter().any(|value| {
            value
                .to_str()
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    };
    match version {
        Version::HTTP_10 => has("keep-alive"),
        _ => !has("close"),
    }
}

/// Serves one request.
///
/// Only transport failures while reading the body are returned as errors;
/// hyper then closes the connection.
pub(crate) async fn handle(
    shared: Arc<ServerShared>,
    remote: Option<SocketAddr>,
    mut req: hyper::Request<hyper::Body>,
) -> Result<hyper::Response<hyper::Body>, hyper::Error> {
    let path = decode_path(req.uri().path());
    let routing = shared.router.find(req.method(), &path);
    log::debug!("{} {} -> {:?}", req.method(), path, routing.resolution);

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let mut parser = BodyParser::select(
        req.method(),
        content_type.as_deref(),
        routing.body_parser.as_ref(),
        &shared.limits,
    );

    let keep_alive = keep_alive(req.version(), req.headers());
    let head = req.method() == Method::HEAD;

    let upgrade = if req.method() == Method::GET && req.headers().contains_key(UPGRADE) {
        Some(Upgrade {
            handshake: websocket::handshake(req.headers()),
            on_upgrade: hyper::upgrade::on(&mut req),
        })
    } else {
        None
    };

    let (parts, mut body) = req.into_parts();
    while let Some(chunk) = body.data().await {
        parser.offer(&chunk?);
    }

    let cx = WriteContext {
        head,
        keep_alive,
        chunk_capacity: shared.chunk_capacity,
        executor: &shared.executor,
    };

    if parser.is_maximum_exceeded() {
        log::debug!("Request body of {} bytes rejected as too large", parser.size());
        parser.release();
        return Ok(http::into_hyper(Response::payload_too_large(), &cx));
    }

    let request_body = parser.finish();
    parser.release();

    let mut builder = Request::builder()
        .method(parts.method)
        .parsed_uri(parts.uri)
        .path(path)
        .version(parts.version)
        .headers(parts.headers)
        .path_params(routing.params)
        .body(request_body);
    if let Some(remote) = remote {
        builder = builder.remote_addr(remote);
    }
    let request = builder.build();

    let response = match run_handler(&shared.executor, routing.handler, request).await {
        Ok(response) => response,
        Err(_) => default_translate(Error::Panic("handler task was dropped".to_owned())),
    };

    let (status, headers, body) = response.into_parts();
    if let ResponseBody::WebSocket(on_open) = body {
        return Ok(accept_upgrade(upgrade, on_open, &cx, &shared.executor));
    }

    Ok(http::into_hyper(Response::from_parts(status, headers, body), &cx))
}

/// Runs the handler as its own task.
///
/// Dropping the returned future, as hyper does when the client goes away,
/// only drops the receiver; the handler still runs to completion.
fn run_handler(
    executor: &Executor,
    handler: BoxHandler,
    request: Request,
) -> oneshot::Receiver<Response> {
    let (tx, rx) = oneshot::channel();
    executor.spawn(async move {
        let response = match AssertUnwindSafe(handler.call(request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => default_translate(error),
            Err(panic) => default_translate(Error::Panic(panic_message(&*panic))),
        };
        if tx.send(response).is_err() {
            log::debug!("Client went away, discarding handler response");
        }
    });
    rx
}

fn accept_upgrade(
    upgrade: Option<Upgrade>,
    on_open: WsHandler,
    cx: &WriteContext<'_>,
    executor: &Executor,
) -> hyper::Response<hyper::Body> {
    match upgrade {
        Some(Upgrade {
            on_upgrade,
            handshake: Ok(accept),
        }) => {
            executor.spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => websocket::run_session(upgraded, on_open).await,
                    Err(e) => log::debug!("WebSocket upgrade failed: {}", e),
                }
            });
            websocket::switching_protocols(&accept)
        }
        Some(Upgrade {
            handshake: Err(rejection),
            ..
        }) => http::into_hyper(rejection, cx),
        None => http::into_hyper(
            Response::bad_request().text("websocket responses require an upgrade request"),
            cx,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(connection: Option<&'static str>) -> hyper::HeaderMap {
        let mut headers = hyper::HeaderMap::new();
        if let Some(value) = connection {
            headers.insert(CONNECTION, HeaderValue::from_static(value));
        }
        headers
    }

    /// The handler keeps running after the caller stops waiting for it.
    #[test]
    fn test_handler_outlives_dropped_receiver() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::{Duration, Instant};

        let executor = Executor::new(Some(2), None);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = std::sync::Mutex::new(Some(release_rx));
        let completed = Arc::new(AtomicBool::new(false));

        let done = completed.clone();
        let handler: BoxHandler = Arc::new(move |_request: Request| {
            let release = release_rx.lock().unwrap().take();
            let done = done.clone();
            async move {
                if let Some(release) = release {
                    let _ = release.await;
                }
                done.store(true, Ordering::SeqCst);
                crate::error::Result::Ok(Response::ok())
            }
        });

        let receiver = run_handler(&executor, handler, Request::builder().uri("/").build());
        drop(receiver);
        release_tx.send(()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !completed.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(completed.load(Ordering::SeqCst));
    }

    /// Errors and panics come back as translated responses.
    #[test]
    fn test_handler_failures_are_translated() {
        let executor = Executor::new(Some(2), None);
        let panicking: BoxHandler = Arc::new(|_request: Request| async move {
            if true {
                panic!("boom");
            }
            crate::error::Result::Ok(Response::ok())
        });

        let rx = run_handler(&executor, panicking, Request::builder().uri("/").build());
        let response = futures::executor::block_on(rx).unwrap();
        assert_eq!(response.status(), 500);
    }

    #[test]
    fn test_keep_alive() {
        assert!(keep_alive(Version::HTTP_11, &headers(None)));
        assert!(!keep_alive(Version::HTTP_11, &headers(Some("close"))));
        assert!(!keep_alive(Version::HTTP_11, &headers(Some("foo, Close"))));
        assert!(!keep_alive(Version::HTTP_10, &headers(None)));
        assert!(keep_alive(Version::HTTP_10, &headers(Some("Keep-Alive"))));
    }
}
