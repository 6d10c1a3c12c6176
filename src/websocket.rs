//! WebSocket upgrades.
//!
//! A GET handler answers with [`Response::websocket`]. The connection
//! validates the handshake, replies `101 Switching Protocols` and, once
//! hyper hands over the raw connection, runs a session task that feeds
//! incoming messages to the listeners registered on the [`WsChannel`].
//!
//! [`Response::websocket`]: crate::Response::websocket

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::{self, Either};
use futures::{SinkExt, StreamExt};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::upgrade::Upgraded;
use hyper::StatusCode;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::response::{Response, WsHandler};

/// A complete text or binary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

type MessageListener = Arc<dyn Fn(WsMessage) + Send + Sync>;
type DisconnectListener = Box<dyn FnOnce() + Send>;

/// The application side of a WebSocket session.
///
/// Cloning is cheap; all clones talk to the same session. Writes are queued
/// and never block.
#[derive(Clone)]
pub struct WsChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    outgoing: mpsc::UnboundedSender<Message>,
    listeners: Mutex<Vec<MessageListener>>,
    disconnect_listeners: Mutex<Vec<DisconnectListener>>,
    disconnected: AtomicBool,
}

impl WsChannel {
    fn new(outgoing: mpsc::UnboundedSender<Message>) -> Self {
        WsChannel {
            inner: Arc::new(ChannelInner {
                outgoing,
                listeners: Mutex::new(Vec::new()),
                disconnect_listeners: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    /// Receives every text and binary message.
    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(WsMessage) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push(Arc::new(listener));
        }
    }

    pub fn on_text<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_message(move |message| {
            if let WsMessage::Text(text) = message {
                listener(&text);
            }
        });
    }

    pub fn on_binary<F>(&self, listener: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_message(move |message| {
            if let WsMessage::Binary(data) = message {
                listener(&data);
            }
        });
    }

    /// Runs `listener` once the session ended, immediately if it already has.
    pub fn on_disconnect<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_disconnected() {
            listener();
            return;
        }
        if let Ok(mut listeners) = self.inner.disconnect_listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    pub fn write_text(&self, text: impl Into<String>) -> io::Result<()> {
        self.send(Message::text(text.into()))
    }

    pub fn write_binary(&self, data: impl Into<Bytes>) -> io::Result<()> {
        self.send(Message::binary(data.into()))
    }

    /// Starts the closing handshake.
    pub fn close(&self) -> io::Result<()> {
        self.send(Message::Close(None))
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::Acquire)
    }

    fn send(&self, message: Message) -> io::Result<()> {
        if self.is_disconnected() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed"));
        }
        self.inner
            .outgoing
            .unbounded_send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed"))
    }

    fn deliver(&self, message: WsMessage) {
        let listeners = match self.inner.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(message.clone());
        }
    }

    fn disconnect(&self) {
        if self.inner.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        // Listeners often hold a clone of the channel.
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.clear();
        }
        let pending = match self.inner.disconnect_listeners.lock() {
            Ok(mut listeners) => std::mem::take(&mut *listeners),
            Err(_) => Vec::new(),
        };
        for listener in pending {
            listener();
        }
    }
}

impl fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsChannel")
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// Validates an upgrade request and derives the `Sec-WebSocket-Accept`
/// value, or returns the rejection to send instead.
pub(crate) fn handshake(headers: &HeaderMap) -> Result<String, Response> {
    let has_token = |name: HeaderName, token: &str| {
        headers.get_all(name).iter().any(|value: &HeaderValue| {
            value
                .to_str()
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    };

    if !has_token(UPGRADE, "websocket") || !has_token(CONNECTION, "upgrade") {
        return Err(Response::bad_request().text("not a websocket upgrade request"));
    }
    let key = match headers.get(SEC_WEBSOCKET_KEY) {
        Some(key) => key,
        None => return Err(Response::bad_request().text("missing Sec-WebSocket-Key")),
    };
    if headers.get(SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes()) != Some(&b"13"[..]) {
        return Err(
            Response::new(StatusCode::UPGRADE_REQUIRED).set_header(SEC_WEBSOCKET_VERSION, "13")
        );
    }
    Ok(derive_accept_key(key.as_bytes()))
}

/// The `101 Switching Protocols` response.
pub(crate) fn switching_protocols(accept: &str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(value) = HeaderValue::from_str(accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    response
}

/// Drives one WebSocket session until either side closes it.
pub(crate) async fn run_session(upgraded: Upgraded, on_open: WsHandler) {
    let stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    let (mut sink, mut incoming) = stream.split();

    let (tx, mut outgoing) = mpsc::unbounded();
    let channel = WsChannel::new(tx);
    on_open(channel.clone());

    loop {
        match future::select(incoming.next(), outgoing.next()).await {
            Either::Left((message, _)) => match message {
                Some(Ok(Message::Text(text))) => {
                    channel.deliver(WsMessage::Text(text.as_str().to_owned()))
                }
                Some(Ok(Message::Binary(data))) => channel.deliver(WsMessage::Binary(data)),
                // Pings are answered by the protocol layer.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    let _ = sink.flush().await;
                    break;
                }
                Some(Ok(Message::Frame(_))) => {
                    log::warn!("Unexpected raw websocket frame, closing session");
                    break;
                }
                Some(Err(e)) => {
                    log::debug!("WebSocket session failed: {}", e);
                    break;
                }
                None => break,
            },
            Either::Right((message, _)) => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        log::debug!("WebSocket write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    channel.disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn upgrade_headers(version: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_str(version).unwrap());
        headers
    }

    /// The accept key from the protocol's own example.
    #[test]
    fn test_handshake_accepts() {
        let accept = handshake(&upgrade_headers("13")).unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        let response = switching_protocols(&accept);
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[SEC_WEBSOCKET_ACCEPT], accept.as_str());
    }

    #[test]
    fn test_wrong_version_requires_upgrade() {
        let rejected = handshake(&upgrade_headers("8")).unwrap_err();
        assert_eq!(rejected.status(), 426);
        assert_eq!(rejected.header_value("sec-websocket-version"), Some("13"));
    }

    #[test]
    fn test_plain_request_is_rejected() {
        let rejected = handshake(&HeaderMap::new()).unwrap_err();
        assert_eq!(rejected.status(), 400);

        let mut headers = upgrade_headers("13");
        headers.remove(SEC_WEBSOCKET_KEY);
        assert_eq!(handshake(&headers).unwrap_err().status(), 400);
    }

    /// Listeners see messages; disconnect fires once and late registrations
    /// run immediately.
    #[test]
    fn test_channel_listeners() {
        let (tx, mut rx) = mpsc::unbounded();
        let channel = WsChannel::new(tx);
        let texts = Arc::new(Mutex::new(Vec::new()));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let t = texts.clone();
        channel.on_text(move |text| t.lock().unwrap().push(text.to_string()));
        let d = disconnects.clone();
        channel.on_disconnect(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        channel.deliver(WsMessage::Text("hi".into()));
        channel.deliver(WsMessage::Binary(Bytes::from_static(b"ignored")));
        channel.write_text("out").unwrap();
        assert_eq!(rx.try_next().unwrap(), Some(Message::text("out")));

        channel.disconnect();
        channel.disconnect();
        let d = disconnects.clone();
        channel.on_disconnect(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(*texts.lock().unwrap(), vec!["hi".to_string()]);
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
        assert!(channel.write_text("late").is_err());
    }
}
