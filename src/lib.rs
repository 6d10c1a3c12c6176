#![allow(clippy::return_self_not_must_use)]

//! # Ferrite
//!
//! An embeddable HTTP/1.1 server engine built on hyper.
//!
//! ## Features
//! - Custom reactor-based async I/O and an elastic worker pool
//! - Method and path routing with `:name` and `*rest` parameters, `404`,
//!   `405` with `Allow`, automatic `HEAD` and `OPTIONS`
//! - Size bounded body parsing: raw, urlencoded and multipart with file
//!   uploads spooled to temporary files
//! - Handler filters and error translation
//! - Fixed, chunked and file response bodies
//! - WebSockets and server-sent events
//!
//! ## Example
//! ```no_run
//! use ferrite::{Request, Response, Result, Routes, Server, ServerConfig};
//!
//! async fn hello(request: Request) -> Result<Response> {
//!     let name = request.path_params().get("name").unwrap_or("world");
//!     Ok(Response::ok().text(format!("Hello, {}!", name)))
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), ferrite::ServerError> {
//!     let routes = Routes::new().get("/hello/:name", hello);
//!
//!     Server::new(ServerConfig::new()?)
//!         .routes(routes)
//!         .serve()
//!         .await
//! }
//! ```
//!
//! ## Architecture
//! - `Server`: configuration, the accept loop and startup
//! - `Reactor`: mio event loops driving socket readiness
//! - `Executor`: thread pool running connections, chunk producers and event
//!   dispatch
//! - `Router`: compiled routes with their filters and body parsers
//!
//! ## Configuration
//! Server settings are read from:
//! - Environment variables (prefixed with `FERRITE_`)
//! - A `config` file (`config.toml`, `config.json`, ...)
//! - The builder API

pub use crate::body::{BodyDecoder, BodyLimits, BodyParser, BodyParserFactory, RequestBody};
pub use crate::config::ServerConfig;
pub use crate::error::{
    BodyError, Error, ErrorKind, ExecutorError, ParamKind, PatternError, ReactorError, Result,
    ServerError,
};
pub use crate::exceptions::{default_translate, ExceptionsFilter};
pub use crate::executor::Executor;
pub use crate::filter::{
    filter, filters, handler, handlers, BoxFilter, BoxHandler, Chain, CompositeFilter, Filter,
    Filtered, Handler, PatternFilter,
};
pub use crate::form::{FileUpload, FormParams, MultipartDecoder, UrlEncodedDecoder};
pub use crate::http::ChunkSink;
pub use crate::pattern::Pattern;
pub use crate::request::{HeaderParams, Params, Request, RequestBuilder};
pub use crate::response::{BodyStream, ChunkProducer, Response, ResponseBody};
pub use crate::router::{Resolution, Route, Router, RouterBuilder, Routes, RoutingResult};
pub use crate::server::{Server, ServerHandle};
pub use crate::sse::{Dispatcher, Event, EventBroadcast, EventEmitter, EventSource};
pub use crate::websocket::{WsChannel, WsMessage};

mod body;
mod config;
mod connection;
mod error;
mod exceptions;
mod executor;
mod filter;
mod form;
mod http;
mod net;
mod pattern;
mod request;
mod response;
mod router;
mod server;
mod sse;
mod websocket;

// Re-export common types
pub use hyper;
