//! Bounded, incremental request body parsing.
//!
//! A [`BodyParser`] is chosen once the request head has been read. It is
//! offered every chunk as it arrives and keeps a running byte count against
//! its limit. Once the limit is crossed the decoder is released and further
//! chunks are only counted, so the handler is never invoked with a partial
//! body and memory stays bounded.

use std::fmt;
use std::io::{self, Cursor, Read};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hyper::Method;

use crate::error::BodyError;
use crate::form::{FormParams, MultipartDecoder, UrlEncodedDecoder};

/// Creates the parser for a route that wants to decode its own bodies.
pub type BodyParserFactory = Arc<dyn Fn() -> BodyParser + Send + Sync>;

/// Incremental decoder behind a [`BodyParser`].
pub trait BodyDecoder: Send {
    /// Consumes the next chunk of the body.
    fn decode(&mut self, chunk: &[u8]);

    /// Drops everything retained so far. Called when the size limit is
    /// exceeded and when the parser goes away.
    fn release(&mut self);

    /// Produces the decoded body once all chunks were offered.
    fn finish(&mut self) -> RequestBody;
}

/// Size limits applied while selecting a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimits {
    /// `None` means unlimited.
    pub max_request_size: Option<u64>,
    pub max_multipart_request_size: Option<u64>,
}

impl Default for BodyLimits {
    fn default() -> Self {
        BodyLimits {
            max_request_size: Some(10 * 1024 * 1024),
            max_multipart_request_size: Some(50 * 1024 * 1024),
        }
    }
}

/// Accumulates a request body up to an optional limit.
pub struct BodyParser {
    max_size: Option<u64>,
    seen: u64,
    exceeded: bool,
    released: bool,
    decoder: Box<dyn BodyDecoder>,
}

impl BodyParser {
    pub fn new<D>(max_size: Option<u64>, decoder: D) -> Self
    where
        D: BodyDecoder + 'static,
    {
        BodyParser {
            max_size,
            seen: 0,
            exceeded: false,
            released: false,
            decoder: Box::new(decoder),
        }
    }

    /// Discards the body.
    pub fn empty() -> Self {
        Self::new(None, EmptyDecoder)
    }

    /// Keeps the body as raw bytes.
    pub fn raw(max_size: Option<u64>) -> Self {
        Self::new(max_size, RawDecoder::default())
    }

    pub fn url_encoded(max_size: Option<u64>) -> Self {
        Self::new(max_size, UrlEncodedDecoder::default())
    }

    /// Decodes `multipart/form-data`. A missing boundary yields a malformed
    /// body.
    pub fn multipart(max_size: Option<u64>, boundary: Option<&str>) -> Self {
        Self::new(max_size, MultipartDecoder::new(boundary))
    }

    /// Feeds the next chunk. Chunks beyond the limit are counted but not
    /// retained.
    pub fn offer(&mut self, chunk: &[u8]) {
        let len = chunk.len() as u64;
        if !self.exceeded {
            if let Some(max) = self.max_size {
                if self.seen.saturating_add(len) > max {
                    self.exceeded = true;
                    self.release();
                }
            }
        }
        if !self.exceeded {
            self.decoder.decode(chunk);
        }
        self.seen = self.seen.saturating_add(len);
    }

    /// Number of bytes offered so far, including discarded ones.
    pub fn size(&self) -> u64 {
        self.seen
    }

    pub fn is_maximum_exceeded(&self) -> bool {
        self.exceeded
    }

    /// Frees retained resources. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.decoder.release();
        }
    }

    /// Produces the decoded body. An exceeded parser yields an empty body.
    pub fn finish(&mut self) -> RequestBody {
        if self.exceeded || self.released {
            return RequestBody::Empty;
        }
        self.decoder.finish()
    }

    /// Picks the parser for a request.
    ///
    /// Bodies are only decoded for `POST`, `PUT` and `PATCH`. A route supplied
    /// factory wins; otherwise the content type decides.
    pub fn select(
        method: &Method,
        content_type: Option<&str>,
        factory: Option<&BodyParserFactory>,
        limits: &BodyLimits,
    ) -> BodyParser {
        if !(method == Method::POST || method == Method::PUT || method == Method::PATCH) {
            return BodyParser::empty();
        }
        if let Some(factory) = factory {
            return factory();
        }

        let mime = content_type.and_then(|ct| ct.parse::<mime::Mime>().ok());
        match mime {
            Some(m) if m.type_() == mime::MULTIPART && m.subtype() == mime::FORM_DATA => {
                let boundary = m.get_param(mime::BOUNDARY).map(|b| b.as_str().to_string());
                BodyParser::multipart(limits.max_multipart_request_size, boundary.as_deref())
            }
            Some(m) if m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str() => {
                BodyParser::url_encoded(limits.max_request_size)
            }
            _ => BodyParser::raw(limits.max_request_size),
        }
    }
}

impl Drop for BodyParser {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for BodyParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyParser")
            .field("max_size", &self.max_size)
            .field("seen", &self.seen)
            .field("exceeded", &self.exceeded)
            .finish()
    }
}

struct EmptyDecoder;

impl BodyDecoder for EmptyDecoder {
    fn decode(&mut self, _chunk: &[u8]) {}

    fn release(&mut self) {}

    fn finish(&mut self) -> RequestBody {
        RequestBody::Empty
    }
}

#[derive(Default)]
struct RawDecoder {
    buf: BytesMut,
}

impl BodyDecoder for RawDecoder {
    fn decode(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn release(&mut self) {
        self.buf = BytesMut::new();
    }

    fn finish(&mut self) -> RequestBody {
        let bytes = std::mem::take(&mut self.buf).freeze();
        if bytes.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Raw(bytes)
        }
    }
}

/// A fully received request body.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    /// No body, or a body that was discarded.
    #[default]
    Empty,
    Raw(Bytes),
    Form(Arc<FormParams>),
    /// The body could not be decoded; reported when it is accessed.
    Malformed(String),
}

impl RequestBody {
    fn parser_name(&self) -> &'static str {
        match self {
            RequestBody::Empty => "empty",
            RequestBody::Raw(_) => "raw",
            RequestBody::Form(_) => "form",
            RequestBody::Malformed(_) => "malformed",
        }
    }

    fn raw(&self, requested: &'static str) -> Result<Bytes, BodyError> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Raw(bytes) => Ok(bytes.clone()),
            RequestBody::Malformed(reason) => Err(BodyError::Malformed(reason.clone())),
            RequestBody::Form(_) => Err(BodyError::Unsupported {
                parser: self.parser_name(),
                requested,
            }),
        }
    }

    pub fn as_bytes(&self) -> Result<Bytes, BodyError> {
        self.raw("bytes")
    }

    /// The body as UTF-8 text, with invalid sequences replaced.
    pub fn as_text(&self) -> Result<String, BodyError> {
        self.raw("text")
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn as_stream(&self) -> Result<impl Read, BodyError> {
        self.raw("stream").map(Cursor::new)
    }

    pub fn as_form(&self) -> Result<&FormParams, BodyError> {
        match self {
            RequestBody::Form(form) => Ok(form),
            RequestBody::Malformed(reason) => Err(BodyError::Malformed(reason.clone())),
            _ => Err(BodyError::Unsupported {
                parser: self.parser_name(),
                requested: "form",
            }),
        }
    }

    /// Decodes the raw body with a caller supplied reader.
    pub fn read_with<T, F>(&self, reader: F) -> Result<T, BodyError>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<T>,
    {
        let mut stream = self.raw("reader").map(Cursor::new)?;
        Ok(reader(&mut stream)?)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(request: u64, multipart: u64) -> BodyLimits {
        BodyLimits {
            max_request_size: Some(request),
            max_multipart_request_size: Some(multipart),
        }
    }

    #[test]
    fn test_raw_body_accumulates_chunks() {
        let mut parser = BodyParser::raw(Some(16));
        parser.offer(b"hello ");
        parser.offer(b"world");

        assert!(!parser.is_maximum_exceeded());
        assert_eq!(parser.size(), 11);
        let body = parser.finish();
        assert_eq!(body.as_text().unwrap(), "hello world");
        assert_eq!(body.as_bytes().unwrap(), Bytes::from_static(b"hello world"));
    }

    /// A body exactly at the limit is accepted; one byte more is not.
    #[test]
    fn test_limit_boundary() {
        let mut parser = BodyParser::raw(Some(10));
        parser.offer(b"0123456789");
        assert!(!parser.is_maximum_exceeded());

        let mut parser = BodyParser::raw(Some(10));
        parser.offer(b"01234");
        parser.offer(b"567890");
        assert!(parser.is_maximum_exceeded());
        parser.offer(b"more");
        assert_eq!(parser.size(), 15);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_unlimited_parser() {
        let mut parser = BodyParser::raw(None);
        for _ in 0..64 {
            parser.offer(&[0u8; 1024]);
        }
        assert!(!parser.is_maximum_exceeded());
        assert_eq!(parser.finish().as_bytes().unwrap().len(), 64 * 1024);
    }

    #[test]
    fn test_selection_by_method_and_content_type() {
        let limits = limits(8, 1024);

        let mut get = BodyParser::select(&Method::GET, Some("text/plain"), None, &limits);
        get.offer(&[0u8; 100]);
        assert!(!get.is_maximum_exceeded());
        assert!(get.finish().is_empty());

        let mut post = BodyParser::select(&Method::POST, Some("text/plain"), None, &limits);
        post.offer(&[0u8; 100]);
        assert!(post.is_maximum_exceeded());

        let multipart = BodyParser::select(
            &Method::PUT,
            Some("multipart/form-data; boundary=xyz"),
            None,
            &limits,
        );
        assert_eq!(multipart.max_size, Some(1024));

        let mut form = BodyParser::select(
            &Method::PATCH,
            Some("application/x-www-form-urlencoded; charset=utf-8"),
            None,
            &limits,
        );
        form.offer(b"a=1&b=2");
        let body = form.finish();
        assert_eq!(body.as_form().unwrap().get("b"), Some("2"));
    }

    #[test]
    fn test_route_factory_wins() {
        let factory: BodyParserFactory = Arc::new(|| BodyParser::raw(Some(2)));
        let mut parser = BodyParser::select(
            &Method::POST,
            Some("application/x-www-form-urlencoded"),
            Some(&factory),
            &BodyLimits::default(),
        );
        parser.offer(b"abc");
        assert!(parser.is_maximum_exceeded());
    }

    #[test]
    fn test_accessor_support() {
        let empty = RequestBody::Empty;
        assert_eq!(empty.as_text().unwrap(), "");
        assert!(matches!(empty.as_form(), Err(BodyError::Unsupported { .. })));

        let raw = RequestBody::Raw(Bytes::from_static(b"42"));
        let n: u32 = raw
            .read_with(|r| {
                let mut s = String::new();
                r.read_to_string(&mut s)?;
                s.parse().map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "nan"))
            })
            .unwrap();
        assert_eq!(n, 42);
        assert!(matches!(raw.as_form(), Err(BodyError::Unsupported { .. })));

        let bad = RequestBody::Malformed("truncated".into());
        assert!(matches!(bad.as_bytes(), Err(BodyError::Malformed(_))));
    }
}
