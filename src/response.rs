use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LANGUAGE, CONTENT_TYPE, LAST_MODIFIED, LOCATION,
    SET_COOKIE,
};
use hyper::StatusCode;

use crate::http::ChunkSink;
use crate::websocket::WsChannel;

type Producer = Box<dyn FnOnce(ChunkSink) + Send>;
pub(crate) type WsHandler = Arc<dyn Fn(WsChannel) + Send + Sync>;

/// An HTTP response.
///
/// Responses are plain values: handlers build them with the status helpers
/// and the chaining builder methods, filters may replace or adjust them, and
/// the connection writes each one exactly once.
///
/// ```
/// use ferrite::Response;
///
/// let response = Response::created()
///     .location("/users/42")
///     .text("created");
/// assert_eq!(response.status(), 201);
/// ```
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

/// How the response body is transferred.
pub enum ResponseBody {
    Empty,
    Fixed(Bytes),
    /// Produced on a worker thread through a [`ChunkSink`].
    Chunked(ChunkProducer),
    File(PathBuf),
    /// Each item is written as one chunk, as fast as the connection takes it.
    Stream(BodyStream),
    WebSocket(WsHandler),
}

/// An asynchronous source of body chunks.
pub struct BodyStream(Mutex<Option<BoxStream<'static, Bytes>>>);

impl BodyStream {
    pub(crate) fn take(self) -> Option<BoxStream<'static, Bytes>> {
        self.0.into_inner().ok().flatten()
    }
}

/// A one-shot chunk producer.
pub struct ChunkProducer(Mutex<Option<Producer>>);

impl ChunkProducer {
    pub(crate) fn take(self) -> Option<Producer> {
        self.0.into_inner().ok().flatten()
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self::new(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn created() -> Self {
        Self::new(StatusCode::CREATED)
    }

    /// `201 Created` pointing at the new resource.
    pub fn created_at(location: &str) -> Self {
        Self::created().location(location)
    }

    pub fn accepted() -> Self {
        Self::new(StatusCode::ACCEPTED)
    }

    pub fn no_content() -> Self {
        Self::new(StatusCode::NO_CONTENT)
    }

    pub fn see_other(location: &str) -> Self {
        Self::new(StatusCode::SEE_OTHER).location(location)
    }

    pub fn temporary_redirect(location: &str) -> Self {
        Self::new(StatusCode::TEMPORARY_REDIRECT).location(location)
    }

    pub fn not_modified() -> Self {
        Self::new(StatusCode::NOT_MODIFIED)
    }

    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED)
    }

    pub fn not_acceptable() -> Self {
        Self::new(StatusCode::NOT_ACCEPTABLE)
    }

    pub fn conflict() -> Self {
        Self::new(StatusCode::CONFLICT)
    }

    pub fn payload_too_large() -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE)
    }

    pub fn unsupported_media_type() -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE)
    }

    pub fn internal_server_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn not_implemented() -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED)
    }

    /// Appends a header. Invalid names or values are logged and skipped.
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        if let Some((name, value)) = header_pair(name, value) {
            self.headers.append(name, value);
        }
        self
    }

    /// Replaces every value of a header.
    pub fn set_header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        if let Some((name, value)) = header_pair(name, value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn location(self, location: &str) -> Self {
        self.set_header(LOCATION, location)
    }

    pub fn language(self, language: &str) -> Self {
        self.set_header(CONTENT_LANGUAGE, language)
    }

    pub fn last_modified(self, time: SystemTime) -> Self {
        self.set_header(LAST_MODIFIED, httpdate::fmt_http_date(time))
    }

    pub fn content_type(self, content_type: &str) -> Self {
        self.set_header(CONTENT_TYPE, content_type)
    }

    /// Adds a `Set-Cookie` header.
    pub fn cookie(self, cookie: cookie::Cookie<'_>) -> Self {
        let value = cookie.encoded().to_string();
        self.header(SET_COOKIE, value)
    }

    /// Sends `bytes` with a `Content-Length`.
    pub fn body(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Fixed(bytes.into());
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.content_type("text/plain; charset=utf-8")
            .body(text.into())
    }

    pub fn html(self, html: impl Into<String>) -> Self {
        self.content_type("text/html; charset=utf-8")
            .body(html.into())
    }

    /// Streams the body from a blocking writer. The body ends when `writer`
    /// returns; an error is logged and cuts the body short.
    pub fn stream<F>(self, writer: F) -> Self
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        self.chunks(move |mut sink| {
            let result = writer(&mut sink).and_then(|_| sink.close());
            if let Err(e) = result {
                log::debug!("Chunked response ended early: {}", e);
            }
        })
    }

    /// Hands a [`ChunkSink`] to `producer`. The body ends when the sink is
    /// closed or dropped, which may happen long after `producer` returns.
    pub fn chunks<F>(mut self, producer: F) -> Self
    where
        F: FnOnce(ChunkSink) + Send + 'static,
    {
        self.body = ResponseBody::Chunked(ChunkProducer(Mutex::new(Some(Box::new(producer)))));
        self
    }

    /// Streams the body from `stream` without tying up a worker thread.
    /// The body ends with the stream.
    pub fn body_stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.body = ResponseBody::Stream(BodyStream(Mutex::new(Some(stream.boxed()))));
        self
    }

    /// Sends a file with its length taken from the file system.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.body = ResponseBody::File(path.into());
        self
    }

    /// Upgrades the connection to a WebSocket; `on_open` receives the
    /// channel once the handshake completed.
    pub fn websocket<F>(mut self, on_open: F) -> Self
    where
        F: Fn(WsChannel) + Send + Sync + 'static,
    {
        self.body = ResponseBody::WebSocket(Arc::new(on_open));
        self
    }

    pub fn status(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// First value of a header as text.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_ref(&self) -> &ResponseBody {
        &self.body
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, ResponseBody) {
        (self.status, self.headers, self.body)
    }

    pub(crate) fn from_parts(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Response { status, headers, body }
    }
}

impl Default for Response {
    fn default() -> Self {
        Response::ok()
    }
}

fn header_pair<K, V>(name: K, value: V) -> Option<(HeaderName, HeaderValue)>
where
    K: TryInto<HeaderName>,
    V: TryInto<HeaderValue>,
{
    match (name.try_into(), value.try_into()) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => {
            log::warn!("Ignoring invalid response header");
            None
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Fixed(bytes) => write!(f, "Fixed({} bytes)", bytes.len()),
            ResponseBody::Chunked(_) => f.write_str("Chunked"),
            ResponseBody::File(path) => write!(f, "File({})", path.display()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
            ResponseBody::WebSocket(_) => f.write_str("WebSocket"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_helpers() {
        assert_eq!(Response::ok().status(), 200);
        assert_eq!(Response::no_content().status(), 204);
        assert_eq!(Response::payload_too_large().status(), 413);
        assert_eq!(Response::with_status(418).status(), 418);
        assert_eq!(Response::with_status(42).status(), 500);

        let redirect = Response::see_other("/login");
        assert_eq!(redirect.status(), 303);
        assert_eq!(redirect.header_value("location"), Some("/login"));
    }

    /// `header` appends while `set_header` replaces.
    #[test]
    fn test_headers() {
        let response = Response::ok()
            .header("x-tag", "a")
            .header("x-tag", "b")
            .set_header("x-only", "1")
            .set_header("x-only", "2")
            .header("bad header", "ignored");

        let tags: Vec<_> = response.headers().get_all("x-tag").iter().collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert_eq!(response.header_value("x-only"), Some("2"));
        assert_eq!(response.headers().len(), 3);
    }

    #[test]
    fn test_metadata_helpers() {
        let modified = std::time::UNIX_EPOCH + std::time::Duration::from_secs(784111777);
        let response = Response::created_at("/items/7")
            .language("de")
            .last_modified(modified);

        assert_eq!(response.status(), 201);
        assert_eq!(response.header_value("location"), Some("/items/7"));
        assert_eq!(response.header_value("content-language"), Some("de"));
        assert_eq!(
            response.header_value("last-modified"),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
    }

    #[test]
    fn test_text_body() {
        let response = Response::ok().text("hi");
        assert_eq!(response.header_value("content-type"), Some("text/plain; charset=utf-8"));
        assert!(matches!(response.body_ref(), ResponseBody::Fixed(b) if b.as_ref() == b"hi"));
    }

    #[test]
    fn test_cookie() {
        let response = Response::ok().cookie(
            cookie::Cookie::build(("session", "a b"))
                .path("/")
                .http_only(true)
                .build(),
        );
        let value = response.header_value("set-cookie").unwrap();
        assert!(value.starts_with("session=a%20b"));
        assert!(value.contains("HttpOnly"));
    }
}
