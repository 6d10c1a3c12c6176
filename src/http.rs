//! Response body transfer strategies.
//!
//! Turns an engine [`Response`] into the hyper response that is written to
//! the socket: fixed buffers, chunked streams fed from a blocking producer,
//! and files copied through a reader stream.

use core::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH};
use hyper::StatusCode;

pub use hyper::body::Bytes;

use crate::executor::{self, Executor};
use crate::response::{Response, ResponseBody};

/// Per-response settings for [`into_hyper`].
pub(crate) struct WriteContext<'a> {
    /// The request was `HEAD`; only headers are written.
    pub head: bool,
    pub keep_alive: bool,
    pub chunk_capacity: usize,
    pub executor: &'a Executor,
}

/// Applies the response's body strategy.
pub(crate) fn into_hyper(response: Response, cx: &WriteContext<'_>) -> hyper::Response<hyper::Body> {
    let (status, mut headers, body) = response.into_parts();

    let body = match body {
        ResponseBody::Empty => {
            if !(status.is_informational()
                || status == StatusCode::NO_CONTENT
                || status == StatusCode::NOT_MODIFIED)
            {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
            }
            hyper::Body::empty()
        }
        ResponseBody::Fixed(bytes) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            if cx.head {
                hyper::Body::empty()
            } else {
                hyper::Body::from(bytes)
            }
        }
        ResponseBody::Chunked(producer) => match producer.take() {
            Some(producer) if !cx.head => {
                let (sender, body) = hyper::Body::channel();
                let sink = ChunkSink::new(sender, cx.chunk_capacity);
                cx.executor.spawn_blocking(move || producer(sink));
                body
            }
            _ => hyper::Body::empty(),
        },
        ResponseBody::Stream(stream) => match stream.take() {
            Some(stream) if !cx.head => {
                hyper::Body::wrap_stream(stream.map(Ok::<_, io::Error>))
            }
            _ => hyper::Body::empty(),
        },
        ResponseBody::File(path) => match open_file(&path) {
            Ok((file, len)) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                if cx.head {
                    hyper::Body::empty()
                } else {
                    hyper::Body::wrap_stream(ReaderStream::new(file))
                }
            }
            Err(e) => {
                log::error!("Failed to open {}: {}", path.display(), e);
                return with_connection(
                    hyper::Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(hyper::Body::empty()),
                    cx.keep_alive,
                );
            }
        },
        ResponseBody::WebSocket(_) => {
            // Upgrades are answered by the connection handler; reaching this
            // point means the handshake was not applicable.
            log::error!("WebSocket response produced outside an upgrade");
            return with_connection(
                hyper::Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(hyper::Body::empty()),
                cx.keep_alive,
            );
        }
    };

    let mut out = hyper::Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    set_connection(out.headers_mut(), cx.keep_alive);
    out
}

fn with_connection(
    built: hyper::http::Result<hyper::Response<hyper::Body>>,
    keep_alive: bool,
) -> hyper::Response<hyper::Body> {
    let mut out = built.unwrap_or_else(|_| hyper::Response::new(hyper::Body::empty()));
    set_connection(out.headers_mut(), keep_alive);
    out
}

pub(crate) fn set_connection(headers: &mut hyper::HeaderMap, keep_alive: bool) {
    let value = if keep_alive { "keep-alive" } else { "close" };
    headers.insert(CONNECTION, HeaderValue::from_static(value));
}

fn open_file(path: &Path) -> io::Result<(File, u64)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

type DisconnectListener = Box<dyn FnOnce() + Send>;

/// The writer handed to chunked response producers.
///
/// Writes are batched into buffers of the configured capacity; each full
/// buffer is sent as one chunk and the writing thread blocks until the
/// connection accepts it. Dropping the sink ends the body.
pub struct ChunkSink {
    sender: Option<hyper::body::Sender>,
    buf: BytesMut,
    capacity: usize,
    listeners: Vec<DisconnectListener>,
}

impl ChunkSink {
    pub(crate) fn new(sender: hyper::body::Sender, capacity: usize) -> Self {
        ChunkSink {
            sender: Some(sender),
            buf: BytesMut::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            listeners: Vec::new(),
        }
    }

    /// Registers a callback run once when a write finds the peer gone.
    pub fn on_disconnect<F>(&mut self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.is_none() {
            listener();
        } else {
            self.listeners.push(Box::new(listener));
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.sender.is_none()
    }

    /// Flushes pending bytes and ends the body.
    pub fn close(mut self) -> io::Result<()> {
        self.flush()
    }

    fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        let sender = self.sender.as_mut().ok_or_else(broken_pipe)?;
        match executor::block_on(sender.send_data(chunk)) {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.disconnect();
                Err(broken_pipe())
            }
        }
    }

    fn disconnect(&mut self) {
        self.sender = None;
        self.buf = BytesMut::new();
        for listener in self.listeners.drain(..) {
            listener();
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

impl Write for ChunkSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.sender.is_none() {
            return Err(broken_pipe());
        }
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.capacity {
            let chunk = self.buf.split_to(self.capacity).freeze();
            self.send(chunk)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return if self.sender.is_some() {
                Ok(())
            } else {
                Err(broken_pipe())
            };
        }
        let chunk = self.buf.split().freeze();
        self.send(chunk)
    }
}

impl Drop for ChunkSink {
    fn drop(&mut self) {
        if self.sender.is_some() && !self.buf.is_empty() {
            let _ = self.flush();
        }
    }
}

impl fmt::Debug for ChunkSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSink")
            .field("buffered", &self.buf.len())
            .field("capacity", &self.capacity)
            .field("disconnected", &self.sender.is_none())
            .finish()
    }
}

/// Adapts an [`io::Read`] into a [`Stream`] of [`CAP`] sized chunks.
struct ReaderStream<R> {
    reader: Option<R>,
    buf: Vec<u8>,
}

/// Default capacity for reader buffer chunks.
const CAP: usize = 8192;

impl<R> ReaderStream<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            buf: vec![0; CAP],
        }
    }
}

impl<R> Unpin for ReaderStream<R> {}

impl<R> Stream for ReaderStream<R>
where
    R: io::Read,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let ReaderStream { reader, buf } = &mut *self;

        let reader = match reader {
            Some(reader) => reader,
            None => return Poll::Ready(None),
        };

        if buf.len() < CAP {
            buf.resize(CAP, 0);
        }

        match reader.read(buf) {
            Err(err) => {
                self.reader.take();
                Poll::Ready(Some(Err(err)))
            }
            Ok(0) => {
                self.reader.take();
                Poll::Ready(None)
            }
            Ok(n) => {
                let remaining = buf.split_off(n);
                let chunk = std::mem::replace(buf, remaining);
                Poll::Ready(Some(Ok(Bytes::from(chunk))))
            }
        }
    }
}
