//! Maps errors escaping a handler to responses.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BodyError, Error, ErrorKind, Result};
use crate::filter::{BoxHandler, Filter};
use crate::request::Request;
use crate::response::Response;

type ErrorHandler = Arc<dyn Fn(&Request, Error) -> Result<Response> + Send + Sync>;

enum Matcher {
    Kind(ErrorKind),
    /// Concrete application error type.
    Type(fn(&Error) -> bool),
}

impl Matcher {
    /// How far `error` is from this matcher, `None` if it does not match.
    fn distance(&self, error: &Error) -> Option<usize> {
        match self {
            Matcher::Type(is) => is(error).then_some(0),
            Matcher::Kind(kind) => {
                let steps = error.kind().distance_to(*kind)?;
                // Application errors sit one level below their kind.
                if error.kind() == ErrorKind::Application {
                    Some(steps + 1)
                } else {
                    Some(steps)
                }
            }
        }
    }
}

/// A filter translating handler errors with registered error handlers.
///
/// The handler whose matcher is closest to the error wins: a concrete error
/// type beats its kind, a kind beats its ancestors. Ties go to the handler
/// registered first. Unmatched errors get the [default translation].
///
/// ```
/// use ferrite::{ErrorKind, ExceptionsFilter, Response};
///
/// let exceptions = ExceptionsFilter::new()
///     .on_kind(ErrorKind::Request, |_request, error| {
///         Ok(Response::bad_request().text(error.to_string()))
///     });
/// # let _ = exceptions;
/// ```
///
/// [default translation]: default_translate
#[derive(Default)]
pub struct ExceptionsFilter {
    handlers: Vec<(Matcher, ErrorHandler)>,
}

impl ExceptionsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles every error of `kind` or one of its descendants.
    pub fn on_kind<F>(mut self, kind: ErrorKind, handler: F) -> Self
    where
        F: Fn(&Request, Error) -> Result<Response> + Send + Sync + 'static,
    {
        self.handlers.push((Matcher::Kind(kind), Arc::new(handler)));
        self
    }

    /// Handles application errors of type `T`.
    pub fn on<T, F>(mut self, handler: F) -> Self
    where
        T: StdError + 'static,
        F: Fn(&Request, &T) -> Result<Response> + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(move |request: &Request, error: Error| {
            let handled = error.downcast_ref::<T>().map(|e| handler(request, e));
            handled.unwrap_or(Err(error))
        });
        self.handlers
            .push((Matcher::Type(|e| e.downcast_ref::<T>().is_some()), handler));
        self
    }

    fn resolve(&self, error: &Error) -> Option<&ErrorHandler> {
        let mut best: Option<(usize, &ErrorHandler)> = None;
        for (matcher, handler) in &self.handlers {
            if let Some(distance) = matcher.distance(error) {
                if best.map_or(true, |(d, _)| distance < d) {
                    best = Some((distance, handler));
                }
            }
        }
        best.map(|(_, handler)| handler)
    }

    /// Translates `error`, falling back to [`default_translate`].
    pub fn translate(&self, request: &Request, error: Error) -> Result<Response> {
        let error = error.into_cause();
        match self.resolve(&error) {
            Some(handler) => handler(request, error),
            None => Ok(default_translate(error)),
        }
    }
}

#[async_trait]
impl Filter for ExceptionsFilter {
    async fn apply(&self, request: Request, next: BoxHandler) -> Result<Response> {
        match next.call(request.clone()).await {
            Ok(response) => Ok(response),
            Err(error) => self.translate(&request, error),
        }
    }
}

/// The translation applied to errors nobody handled.
///
/// - an explicit response is sent as is (logged when it is a server error)
/// - invalid parameters and malformed bodies become `400 Bad Request`
/// - everything else is logged and becomes `500 Internal Server Error`
pub fn default_translate(error: Error) -> Response {
    match error.into_cause() {
        Error::Response(response) => {
            if response.status() >= 500 {
                log::error!("Request answered with status {}", response.status());
            }
            *response
        }
        error @ (Error::InvalidParameter { .. } | Error::Body(BodyError::Malformed(_))) => {
            log::debug!("Rejecting request: {}", error);
            Response::bad_request().text(error.to_string())
        }
        error => {
            log::error!("Request failed: {}", error);
            Response::internal_server_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParamKind;
    use crate::filter::handler;
    use futures::executor::block_on;
    use std::fmt;

    #[derive(Debug)]
    struct OutOfStock;

    impl fmt::Display for OutOfStock {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("out of stock")
        }
    }

    impl StdError for OutOfStock {}

    fn request() -> Request {
        Request::builder().uri("/").build()
    }

    fn invalid_parameter() -> Error {
        Error::InvalidParameter {
            kind: ParamKind::Query,
            name: "page".into(),
            value: "x".into(),
            reason: "invalid digit".into(),
        }
    }

    fn respond(status: u16) -> impl Fn(&Request, Error) -> Result<Response> + Send + Sync {
        move |_, _| Ok(Response::with_status(status))
    }

    #[test]
    fn test_default_translation() {
        assert_eq!(default_translate(Response::forbidden().into()).status(), 403);
        assert_eq!(default_translate(invalid_parameter()).status(), 400);
        assert_eq!(
            default_translate(BodyError::Malformed("bad".into()).into()).status(),
            400
        );
        assert_eq!(default_translate(Error::Panic("boom".into())).status(), 500);
        assert_eq!(default_translate(Error::application(OutOfStock)).status(), 500);
    }

    /// The nearest matcher wins regardless of registration order.
    #[test]
    fn test_closest_kind_wins() {
        let filter = ExceptionsFilter::new()
            .on_kind(ErrorKind::Any, respond(599))
            .on_kind(ErrorKind::Request, respond(420))
            .on_kind(ErrorKind::InvalidParameter, respond(421));

        assert_eq!(filter.translate(&request(), invalid_parameter()).unwrap().status(), 421);
        assert_eq!(
            filter
                .translate(&request(), BodyError::Malformed("x".into()).into())
                .unwrap()
                .status(),
            420
        );
        assert_eq!(filter.translate(&request(), Error::Panic("p".into())).unwrap().status(), 599);
    }

    /// Equal distances are resolved by registration order.
    #[test]
    fn test_ties_go_to_first_registration() {
        let filter = ExceptionsFilter::new()
            .on_kind(ErrorKind::Request, respond(401))
            .on_kind(ErrorKind::Request, respond(402));
        assert_eq!(filter.translate(&request(), invalid_parameter()).unwrap().status(), 401);
    }

    #[test]
    fn test_concrete_type_beats_kind() {
        let filter = ExceptionsFilter::new()
            .on_kind(ErrorKind::Application, respond(500))
            .on::<OutOfStock, _>(|_, e| Ok(Response::conflict().text(e.to_string())));

        let wrapped = Error::application(Error::application(OutOfStock));
        let response = filter.translate(&request(), wrapped).unwrap();
        assert_eq!(response.status(), 409);
    }

    #[test]
    fn test_unmatched_errors_use_default() {
        let filter = ExceptionsFilter::new().on_kind(ErrorKind::Internal, respond(503));
        assert_eq!(filter.translate(&request(), invalid_parameter()).unwrap().status(), 400);
    }

    /// Used as a filter, errors from the wrapped handler are translated.
    #[test]
    fn test_as_filter() {
        async fn failing(_request: Request) -> Result<Response> {
            Err(Error::application(OutOfStock))
        }

        let filter = ExceptionsFilter::new()
            .on::<OutOfStock, _>(|_, _| Ok(Response::conflict()));
        let response = block_on(filter.apply(request(), handler(failing))).unwrap();
        assert_eq!(response.status(), 409);
    }
}
