//! Handlers and the filters wrapped around them.
//!
//! A [`Handler`] turns a request into a response asynchronously. A
//! [`Filter`] sits in front of a handler and decides whether, and with which
//! request, the next handler runs. Both are implemented for closures:
//!
//! ```
//! use ferrite::{filters, BoxHandler, Request, Response, Result};
//!
//! async fn hello(_request: Request) -> Result<Response> {
//!     Ok(Response::ok().text("hello"))
//! }
//!
//! async fn tag(request: Request, next: BoxHandler) -> Result<Response> {
//!     let response = next.call(request).await?;
//!     Ok(response.header("x-tagged", "yes"))
//! }
//!
//! let filter = filters([ferrite::filter(tag)]);
//! let handler = ferrite::handler(filter.around(ferrite::handler(hello)));
//! # let _ = handler;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{PatternError, Result};
use crate::request::Request;
use crate::response::Response;

/// Produces the response for a request.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    async fn call(&self, request: Request) -> Result<Response> {
        (self)(request).await
    }
}

pub type BoxHandler = Arc<dyn Handler>;

/// Boxes a handler.
pub fn handler<H: Handler>(handler: H) -> BoxHandler {
    Arc::new(handler)
}

/// Intercepts a request on its way to `next`.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    async fn apply(&self, request: Request, next: BoxHandler) -> Result<Response>;
}

#[async_trait]
impl<F, Fut> Filter for F
where
    F: Fn(Request, BoxHandler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    async fn apply(&self, request: Request, next: BoxHandler) -> Result<Response> {
        (self)(request, next).await
    }
}

pub type BoxFilter = Arc<dyn Filter>;

/// Boxes a filter.
pub fn filter<F: Filter>(filter: F) -> BoxFilter {
    Arc::new(filter)
}

/// A handler running a filter in front of another handler.
pub struct Filtered {
    filter: BoxFilter,
    handler: BoxHandler,
}

impl Filtered {
    pub fn new(filter: BoxFilter, handler: BoxHandler) -> Self {
        Filtered { filter, handler }
    }
}

#[async_trait]
impl Handler for Filtered {
    async fn call(&self, request: Request) -> Result<Response> {
        self.filter.apply(request, self.handler.clone()).await
    }
}

/// Tries handlers in order until one answers with something other than
/// `404 Not Found`.
pub struct Chain {
    handlers: Vec<BoxHandler>,
}

/// Builds a [`Chain`].
pub fn handlers<I>(handlers: I) -> Chain
where
    I: IntoIterator<Item = BoxHandler>,
{
    Chain {
        handlers: handlers.into_iter().collect(),
    }
}

#[async_trait]
impl Handler for Chain {
    async fn call(&self, request: Request) -> Result<Response> {
        let mut last = None;
        for handler in &self.handlers {
            let response = handler.call(request.clone()).await?;
            if response.status() != 404 {
                return Ok(response);
            }
            last = Some(response);
        }
        Ok(last.unwrap_or_else(Response::not_found))
    }
}

/// Filters applied left to right: the first one sees the request first.
pub struct CompositeFilter {
    filters: Vec<BoxFilter>,
}

/// Builds a [`CompositeFilter`].
pub fn filters<I>(filters: I) -> CompositeFilter
where
    I: IntoIterator<Item = BoxFilter>,
{
    CompositeFilter {
        filters: filters.into_iter().collect(),
    }
}

impl CompositeFilter {
    /// Wraps `handler` so that it runs behind every filter.
    pub fn around(&self, handler: BoxHandler) -> Filtered {
        Filtered::new(Arc::new(self.clone()), handler)
    }
}

impl Clone for CompositeFilter {
    fn clone(&self) -> Self {
        CompositeFilter {
            filters: self.filters.clone(),
        }
    }
}

#[async_trait]
impl Filter for CompositeFilter {
    async fn apply(&self, request: Request, next: BoxHandler) -> Result<Response> {
        let handler = self
            .filters
            .iter()
            .rev()
            .fold(next, |inner, filter| Arc::new(Filtered::new(filter.clone(), inner)));
        handler.call(request).await
    }
}

/// Applies a filter only to request paths selected by Ant style globs.
///
/// `?` matches one character and `*` any run of characters within a
/// segment, `**` matches across segments. A path is filtered when it is not
/// excluded and either no includes were given or one of them matches.
pub struct PatternFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
    filter: BoxFilter,
}

impl PatternFilter {
    pub fn new(filter: BoxFilter, includes: &[&str], excludes: &[&str]) -> std::result::Result<Self, PatternError> {
        Ok(PatternFilter {
            includes: includes.iter().map(|g| glob(g)).collect::<std::result::Result<_, _>>()?,
            excludes: excludes.iter().map(|g| glob(g)).collect::<std::result::Result<_, _>>()?,
            filter,
        })
    }

    pub fn applies_to(&self, path: &str) -> bool {
        if self.excludes.iter().any(|r| r.is_match(path)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|r| r.is_match(path))
    }
}

#[async_trait]
impl Filter for PatternFilter {
    async fn apply(&self, request: Request, next: BoxHandler) -> Result<Response> {
        if self.applies_to(request.path()) {
            self.filter.apply(request, next).await
        } else {
            next.call(request).await
        }
    }
}

fn glob(pattern: &str) -> std::result::Result<Regex, PatternError> {
    let mut source = String::from("^");
    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("/**") {
            source.push_str("(?:/.*)?");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("**") {
            source.push_str(".*");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('*') {
            source.push_str("[^/]*");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('?') {
            source.push_str("[^/]");
            rest = tail;
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
            }
            rest = chars.as_str();
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| PatternError::Regex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
