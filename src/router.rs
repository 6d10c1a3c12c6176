//! Route table and request routing.
//!
//! Routes are matched in registration order. A path matched by routes of
//! other methods only is answered with `405 Method Not Allowed`, except for
//! `OPTIONS`, which lists the allowed methods, and `HEAD`, which falls back
//! to `GET`.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::ALLOW;
use hyper::Method;

use crate::body::{BodyParser, BodyParserFactory};
use crate::error::{ParamKind, PatternError, Result};
use crate::filter::{handler, BoxFilter, BoxHandler, Filtered, Handler};
use crate::pattern::Pattern;
use crate::request::{Params, Request};
use crate::response::Response;

/// A compiled route.
pub struct Route {
    method: Method,
    pattern: Pattern,
    body_parser: Option<BodyParserFactory>,
    handler: BoxHandler,
}

impl Route {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Matched,
    NotFound,
    MethodNotAllowed,
}

/// The outcome of [`Router::find`]. Always carries a handler to run.
pub struct RoutingResult {
    pub resolution: Resolution,
    pub params: Params,
    pub body_parser: Option<BodyParserFactory>,
    pub handler: BoxHandler,
}

/// An immutable route table.
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new("ferrite")
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Resolves `method` and `path` (already percent-decoded).
    pub fn find(&self, method: &Method, path: &str) -> RoutingResult {
        let candidates: Vec<(&Route, Params)> = self
            .routes
            .iter()
            .filter_map(|route| route.pattern.match_path(path).map(|params| (route, params)))
            .collect();

        if candidates.is_empty() {
            return RoutingResult {
                resolution: Resolution::NotFound,
                params: Params::new(ParamKind::Path),
                body_parser: None,
                handler: handler(not_found),
            };
        }

        let allow = allowed_methods(candidates.iter().map(|(route, _)| &route.method));

        if let Some(result) = matched(&candidates, method, &allow) {
            return result;
        }
        if method == Method::HEAD {
            if let Some(result) = matched(&candidates, &Method::GET, &allow) {
                return result;
            }
        }

        let (resolution, response): (Resolution, fn() -> Response) = if method == Method::OPTIONS {
            (Resolution::Matched, Response::ok)
        } else {
            (Resolution::MethodNotAllowed, Response::method_not_allowed)
        };

        RoutingResult {
            resolution,
            params: Params::new(ParamKind::Path),
            body_parser: None,
            handler: Arc::new(Allowed { response, allow }),
        }
    }
}

fn matched(candidates: &[(&Route, Params)], method: &Method, allow: &str) -> Option<RoutingResult> {
    let (route, params) = candidates.iter().find(|(route, _)| &route.method == method)?;
    let handler = if method == Method::OPTIONS {
        Arc::new(MergeAllow {
            allow: allow.to_string(),
            inner: route.handler.clone(),
        }) as BoxHandler
    } else {
        route.handler.clone()
    };
    Some(RoutingResult {
        resolution: Resolution::Matched,
        params: params.clone(),
        body_parser: route.body_parser.clone(),
        handler,
    })
}

/// Sorted, distinct, comma separated.
fn allowed_methods<'a>(methods: impl Iterator<Item = &'a Method>) -> String {
    let mut names: Vec<&str> = methods.map(Method::as_str).collect();
    names.sort_unstable();
    names.dedup();
    names.join(", ")
}

async fn not_found(_request: Request) -> Result<Response> {
    Ok(Response::not_found())
}

/// Answers with the methods matched by the path.
struct Allowed {
    response: fn() -> Response,
    allow: String,
}

#[async_trait]
impl Handler for Allowed {
    async fn call(&self, _request: Request) -> Result<Response> {
        Ok((self.response)().set_header(ALLOW, self.allow.as_str()))
    }
}

/// Adds the methods matched by the path to the `Allow` header of an
/// explicit `OPTIONS` handler.
struct MergeAllow {
    allow: String,
    inner: BoxHandler,
}

#[async_trait]
impl Handler for MergeAllow {
    async fn call(&self, request: Request) -> Result<Response> {
        let response = self.inner.call(request).await?;
        let mut methods: Vec<String> = self.allow.split(", ").map(str::to_string).collect();
        for value in response.headers().get_all(ALLOW) {
            if let Ok(value) = value.to_str() {
                methods.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string),
                );
            }
        }
        methods.sort_unstable();
        methods.dedup();
        Ok(response.set_header(ALLOW, methods.join(", ")))
    }
}

struct RouteEntry {
    method: Method,
    pattern: String,
    body_parser: Option<BodyParserFactory>,
    filter: Option<BoxFilter>,
    handler: BoxHandler,
}

/// A group of routes, typically all routes of one resource.
///
/// ```
/// use ferrite::{Request, Response, Result, Routes};
///
/// async fn list(_request: Request) -> Result<Response> {
///     Ok(Response::ok().text("[]"))
/// }
///
/// async fn show(request: Request) -> Result<Response> {
///     let id: u64 = request.path_params().get_as("id")?.unwrap_or_default();
///     Ok(Response::ok().text(id.to_string()))
/// }
///
/// let routes = Routes::new()
///     .get("/users", list)
///     .get("/users/:id", show);
/// # let _ = routes;
/// ```
#[derive(Default)]
pub struct Routes {
    entries: Vec<RouteEntry>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<H: Handler>(mut self, method: Method, pattern: &str, handler: H) -> Self {
        self.entries.push(RouteEntry {
            method,
            pattern: pattern.to_string(),
            body_parser: None,
            filter: None,
            handler: Arc::new(handler),
        });
        self
    }

    /// Registers a route that decodes its bodies with its own parser.
    pub fn route_with_parser<H, P>(mut self, method: Method, pattern: &str, parser: P, handler: H) -> Self
    where
        H: Handler,
        P: Fn() -> BodyParser + Send + Sync + 'static,
    {
        self.entries.push(RouteEntry {
            method,
            pattern: pattern.to_string(),
            body_parser: Some(Arc::new(parser)),
            filter: None,
            handler: Arc::new(handler),
        });
        self
    }

    /// Registers a route behind its own filter.
    pub fn route_filtered<H: Handler>(
        mut self,
        method: Method,
        pattern: &str,
        filter: BoxFilter,
        handler: H,
    ) -> Self {
        self.entries.push(RouteEntry {
            method,
            pattern: pattern.to_string(),
            body_parser: None,
            filter: Some(filter),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn get<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::POST, pattern, handler)
    }

    pub fn put<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::PUT, pattern, handler)
    }

    pub fn patch<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::PATCH, pattern, handler)
    }

    pub fn delete<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::DELETE, pattern, handler)
    }

    pub fn head<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::HEAD, pattern, handler)
    }

    pub fn options<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::OPTIONS, pattern, handler)
    }

    /// Appends every route of `other`.
    pub fn merge(mut self, other: Routes) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects routes and a global filter, then compiles them into a [`Router`].
pub struct RouterBuilder {
    name: String,
    routes: Routes,
    filter: Option<BoxFilter>,
}

impl RouterBuilder {
    /// `name` prefixes the route log lines.
    pub fn new(name: impl Into<String>) -> Self {
        RouterBuilder {
            name: name.into(),
            routes: Routes::new(),
            filter: None,
        }
    }

    pub fn routes(mut self, routes: Routes) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Sets the filter placed in front of every route.
    pub fn filter(mut self, filter: BoxFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Compiles every pattern.
    ///
    /// # Errors
    /// Returns the first pattern that fails to compile.
    pub fn build(self) -> std::result::Result<Router, PatternError> {
        let mut routes = Vec::with_capacity(self.routes.len());
        for entry in self.routes.entries {
            let pattern = Pattern::compile(&entry.pattern)?;

            let mut handler = entry.handler;
            if let Some(filter) = entry.filter {
                handler = Arc::new(Filtered::new(filter, handler));
            }
            if let Some(filter) = &self.filter {
                handler = Arc::new(Filtered::new(filter.clone(), handler));
            }

            log::info!("{} route added: {:<7} {}", self.name, entry.method.as_str(), pattern);
            routes.push(Route {
                method: entry.method,
                pattern,
                body_parser: entry.body_parser,
                handler,
            });
        }
        Ok(Router { routes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{filter, BoxHandler};
    use futures::executor::block_on;

    async fn ok(_request: Request) -> Result<Response> {
        Ok(Response::ok().text("ok"))
    }

    async fn options(_request: Request) -> Result<Response> {
        Ok(Response::no_content().set_header(ALLOW, "TRACE"))
    }

    fn router() -> Router {
        Router::builder()
            .routes(
                Routes::new()
                    .get("/users", ok)
                    .post("/users", ok)
                    .delete("/users/:id", ok)
                    .get("/users/:id", ok)
                    .options("/files/*path", options)
                    .put("/files/*path", ok),
            )
            .build()
            .unwrap()
    }

    fn run(result: &RoutingResult) -> Response {
        let request = Request::builder().uri("/").build();
        block_on(result.handler.call(request)).unwrap()
    }

    #[test]
    fn test_match_with_params() {
        let result = router().find(&Method::GET, "/users/42");
        assert_eq!(result.resolution, Resolution::Matched);
        assert_eq!(result.params.get("id"), Some("42"));
    }

    #[test]
    fn test_not_found() {
        let result = router().find(&Method::GET, "/nothing");
        assert_eq!(result.resolution, Resolution::NotFound);
        assert_eq!(run(&result).status(), 404);
    }

    /// 405 lists the methods the path does support.
    #[test]
    fn test_method_not_allowed() {
        let result = router().find(&Method::PATCH, "/users");
        assert_eq!(result.resolution, Resolution::MethodNotAllowed);

        let response = run(&result);
        assert_eq!(response.status(), 405);
        assert_eq!(response.header_value("allow"), Some("GET, POST"));
    }

    /// Every route whose pattern matches counts towards 405, in any order.
    #[test]
    fn test_method_not_allowed_across_patterns() {
        let router = Router::builder()
            .routes(
                Routes::new()
                    .get("/a/b", ok)
                    .post("/a/*path", ok)
                    .get("/a/*path", ok),
            )
            .build()
            .unwrap();

        let result = router.find(&Method::PUT, "/a/b");
        assert_eq!(result.resolution, Resolution::MethodNotAllowed);
        assert_eq!(run(&result).header_value("allow"), Some("GET, POST"));

        let result = router.find(&Method::GET, "/z");
        assert_eq!(result.resolution, Resolution::NotFound);
        assert_eq!(run(&result).status(), 404);
    }

    #[test]
    fn test_options_collects_methods_of_all_matches() {
        let router = Router::builder()
            .routes(Routes::new().get("/a/:id", ok).post("/a/*path", ok))
            .build()
            .unwrap();

        let response = run(&router.find(&Method::OPTIONS, "/a/1"));
        assert_eq!(response.status(), 200);
        assert_eq!(response.header_value("allow"), Some("GET, POST"));
    }

    #[test]
    fn test_implicit_options() {
        let response = run(&router().find(&Method::OPTIONS, "/users/7"));
        assert_eq!(response.status(), 200);
        assert_eq!(response.header_value("allow"), Some("DELETE, GET"));
    }

    /// An explicit OPTIONS handler gets the path's methods merged in.
    #[test]
    fn test_explicit_options_merges_allow() {
        let response = run(&router().find(&Method::OPTIONS, "/files/a/b"));
        assert_eq!(response.status(), 204);
        assert_eq!(response.header_value("allow"), Some("OPTIONS, PUT, TRACE"));
    }

    #[test]
    fn test_head_falls_back_to_get() {
        let result = router().find(&Method::HEAD, "/users");
        assert_eq!(result.resolution, Resolution::Matched);
        assert_eq!(run(&result).status(), 200);
    }

    /// The first registered route for a method wins.
    #[test]
    fn test_registration_order() {
        async fn first(_request: Request) -> Result<Response> {
            Ok(Response::ok().text("first"))
        }
        async fn second(_request: Request) -> Result<Response> {
            Ok(Response::accepted())
        }

        let router = Router::builder()
            .routes(Routes::new().get("/a/:x", first).get("/a/b", second))
            .build()
            .unwrap();
        assert_eq!(run(&router.find(&Method::GET, "/a/b")).status(), 200);
    }

    #[test]
    fn test_invalid_pattern_fails_build() {
        let result = Router::builder()
            .routes(Routes::new().get("/ok", ok).get("/:a/:a", ok))
            .build();
        assert!(matches!(result, Err(PatternError::DuplicateIdentifier { .. })));
    }

    /// The global filter wraps the route filter, which wraps the handler.
    #[test]
    fn test_filter_order() {
        async fn global(request: Request, next: BoxHandler) -> Result<Response> {
            let response = next.call(request).await?;
            let trail = format!("{},global", response.header_value("x-trail").unwrap_or(""));
            Ok(response.set_header("x-trail", trail))
        }
        async fn local(request: Request, next: BoxHandler) -> Result<Response> {
            let response = next.call(request).await?;
            Ok(response.set_header("x-trail", "local"))
        }

        let router = Router::builder()
            .filter(filter(global))
            .routes(Routes::new().route_filtered(Method::GET, "/", filter(local), ok))
            .build()
            .unwrap();

        let response = run(&router.find(&Method::GET, "/"));
        assert_eq!(response.header_value("x-trail"), Some("local,global"));
    }

    #[test]
    fn test_route_parser_is_exposed() {
        let router = Router::builder()
            .routes(Routes::new().route_with_parser(Method::POST, "/raw", || BodyParser::raw(Some(4)), ok))
            .build()
            .unwrap();
        assert!(router.find(&Method::POST, "/raw").body_parser.is_some());
        assert!(router.find(&Method::GET, "/raw").body_parser.is_none());
    }
}
