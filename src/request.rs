use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use httpdate::HttpDate;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use hyper::{Method, Uri, Version};

use crate::body::RequestBody;
use crate::error::{Error, ParamKind, Result};

/// An ordered multi-valued view over request parameters.
///
/// Used for path, query, cookie and form parameters. Lookups by name return
/// the first value; [`Params::get_all`] returns every value in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    kind: ParamKind,
    entries: Vec<(String, String)>,
}

impl Params {
    pub(crate) fn new(kind: ParamKind) -> Self {
        Params {
            kind,
            entries: Vec::new(),
        }
    }

    pub(crate) fn from_entries(kind: ParamKind, entries: Vec<(String, String)>) -> Self {
        Params { kind, entries }
    }

    /// Decodes an `application/x-www-form-urlencoded` string.
    pub(crate) fn parse_urlencoded(kind: ParamKind, input: &[u8]) -> Self {
        let entries = form_urlencoded::parse(input)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Params { kind, entries }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value for `name` parsed as `T`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] when the value does not parse.
    pub fn get_as<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(name)
            .map(|value| parse_param(self.kind, name, value))
            .transpose()
    }

    /// Every value for `name` parsed as `T`.
    pub fn get_all_as<T>(&self, name: &str) -> Result<Vec<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get_all(name)
            .into_iter()
            .map(|value| parse_param(self.kind, name, value))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    /// Distinct names in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for (k, _) in &self.entries {
            if !keys.contains(&k.as_str()) {
                keys.push(k);
            }
        }
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_param<T>(kind: ParamKind, name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| Error::InvalidParameter {
        kind,
        name: name.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Typed read access to request headers.
#[derive(Debug, Clone, Default)]
pub struct HeaderParams(HeaderMap);

impl HeaderParams {
    /// First value of the header, if present and valid visible ASCII.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn get_as<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(name)
            .map(|value| parse_param(ParamKind::Header, name, value))
            .transpose()
    }

    /// Parses an HTTP date such as `Last-Modified` or `If-Modified-Since`.
    pub fn get_date(&self, name: &str) -> Result<Option<SystemTime>> {
        Ok(self.get_as::<HttpDate>(name)?.map(SystemTime::from))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// The raw header map.
    pub fn map(&self) -> &HeaderMap {
        &self.0
    }
}

type Attributes = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// An HTTP request whose body has been fully received.
///
/// Requests are immutable and cheap to clone. Filters that want to pass
/// extra data downstream use [`Request::with_attribute`], which returns a new
/// request sharing everything with the original.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
    attributes: Arc<Attributes>,
}

struct Inner {
    method: Method,
    uri: Uri,
    path: String,
    version: Version,
    headers: HeaderParams,
    query: Params,
    path_params: Params,
    cookies: Params,
    remote_addr: Option<SocketAddr>,
    body: RequestBody,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// The percent-decoded request path, without query string.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn headers(&self) -> &HeaderParams {
        &self.inner.headers
    }

    pub fn query_params(&self) -> &Params {
        &self.inner.query
    }

    pub fn path_params(&self) -> &Params {
        &self.inner.path_params
    }

    pub fn cookies(&self) -> &Params {
        &self.inner.cookies
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn body(&self) -> &RequestBody {
        &self.inner.body
    }

    /// Returns a copy of this request carrying an extra attribute.
    pub fn with_attribute<T>(&self, key: impl Into<String>, value: T) -> Request
    where
        T: Any + Send + Sync,
    {
        let mut attributes = Attributes::clone(&self.attributes);
        attributes.insert(key.into(), Arc::new(value));
        Request {
            inner: self.inner.clone(),
            attributes: Arc::new(attributes),
        }
    }

    pub fn attribute<T>(&self, key: &str) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.attributes.get(key).and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .field("version", &self.inner.version)
            .field("body", &self.inner.body)
            .finish()
    }
}

/// Assembles a [`Request`].
///
/// The connection handler builds every request through this type; it is
/// public so handlers and filters can be exercised without a socket.
#[derive(Default)]
pub struct RequestBuilder {
    method: Method,
    uri: Uri,
    path: Option<String>,
    version: Version,
    headers: HeaderMap,
    path_params: Option<Params>,
    remote_addr: Option<SocketAddr>,
    body: RequestBody,
}

impl RequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the request target. Unparseable targets are ignored.
    pub fn uri(mut self, uri: &str) -> Self {
        if let Ok(uri) = uri.parse() {
            self.uri = uri;
        }
        self
    }

    pub(crate) fn parsed_uri(mut self, uri: Uri) -> Self {
        self.uri = uri;
        self
    }

    /// Overrides the decoded path; defaults to the percent-decoded URI path.
    pub(crate) fn path(mut self, path: String) -> Self {
        self.path = Some(path);
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Appends a header; invalid names or values are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => log::warn!("Ignoring invalid request header {:?}", name),
        }
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn path_params(mut self, params: Params) -> Self {
        self.path_params = Some(params);
        self
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Request {
        let path = self
            .path
            .unwrap_or_else(|| decode_path(self.uri.path()));
        let query = Params::parse_urlencoded(
            ParamKind::Query,
            self.uri.query().unwrap_or("").as_bytes(),
        );
        let cookies = parse_cookies(&self.headers);

        Request {
            inner: Arc::new(Inner {
                method: self.method,
                uri: self.uri,
                path,
                version: self.version,
                headers: HeaderParams(self.headers),
                query,
                path_params: self.path_params.unwrap_or_else(|| Params::new(ParamKind::Path)),
                cookies,
                remote_addr: self.remote_addr,
                body: self.body,
            }),
            attributes: Arc::new(Attributes::new()),
        }
    }
}

/// Percent-decodes a request path, keeping it as-is when the result is not
/// valid UTF-8.
pub(crate) fn decode_path(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn parse_cookies(headers: &HeaderMap) -> Params {
    let entries = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|header| {
            cookie::Cookie::split_parse_encoded(header)
                .filter_map(|c| c.ok())
                .map(|c| (c.name().to_string(), c.value().to_string()))
                .collect::<Vec<_>>()
        })
        .collect();
    Params::from_entries(ParamKind::Cookie, entries)
}
