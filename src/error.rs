use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

use crate::response::Response;

/// Represents errors that can occur during task execution in the executor system.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// Error during task execution with a descriptive message
    #[error("task execution failed: {0}")]
    TaskExecution(String),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Represents errors that can occur in the reactor system responsible for I/O events.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    /// Error when registering resources with the reactor
    #[error("registration failed: {0}")]
    Registration(io::Error),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while compiling a route pattern.
///
/// These are always reported when the route table is built, never while a
/// request is being matched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("invalid identifier '{0}', it does not match [a-zA-Z][0-9a-zA-Z]*")]
    InvalidIdentifier(String),

    #[error("cannot use identifier '{name}' more than once in pattern '{pattern}'")]
    DuplicateIdentifier { name: String, pattern: String },

    #[error("dynamic part '{0}' spans more than one segment and must be placed at the end")]
    MisplacedWildcard(String),

    #[error("pattern '{pattern}' could not be compiled: {reason}")]
    Regex { pattern: String, reason: String },
}

/// Errors raised by the typed accessors of a request body.
#[derive(Debug, Error)]
pub enum BodyError {
    /// The representation is not available for the parser that decoded the body.
    #[error("{parser} body does not support {requested}")]
    Unsupported {
        parser: &'static str,
        requested: &'static str,
    },

    #[error("malformed request body: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The kind of request parameter an [`Error::InvalidParameter`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Path,
    Query,
    Header,
    Cookie,
    Form,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::Path => "path",
            ParamKind::Query => "query",
            ParamKind::Header => "header",
            ParamKind::Cookie => "cookie",
            ParamKind::Form => "form",
        };
        f.write_str(name)
    }
}

/// The error type flowing out of handlers and filters.
///
/// Every variant maps onto an [`ErrorKind`], which is what the exceptions
/// filter resolves handlers against.
#[derive(Debug, Error)]
pub enum Error {
    /// Answer the request with this response.
    #[error("request answered with status {}", .0.status())]
    Response(Box<Response>),

    #[error("invalid {kind} parameter '{name}' with value '{value}': {reason}")]
    InvalidParameter {
        kind: ParamKind,
        name: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Body(#[from] BodyError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),

    /// An application error, possibly wrapping another `Error`.
    #[error("{0}")]
    Application(Box<dyn StdError + Send + Sync>),

    #[error("handler panicked: {0}")]
    Panic(String),
}

impl Error {
    /// Wraps an arbitrary application error.
    pub fn application<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::Application(error.into())
    }

    /// Returns the position of this error in the [`ErrorKind`] hierarchy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Response(_) => ErrorKind::Response,
            Error::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Error::Body(_) => ErrorKind::Body,
            Error::Io(_) => ErrorKind::Io,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Application(_) => ErrorKind::Application,
            Error::Panic(_) => ErrorKind::Panic,
        }
    }

    /// Unwraps application errors that merely carry another `Error`.
    ///
    /// Errors which crossed an asynchronous boundary are often boxed on the
    /// way; classification always happens on the innermost cause.
    pub fn into_cause(self) -> Error {
        let mut current = self;
        loop {
            match current {
                Error::Application(inner) if inner.is::<Error>() => match inner.downcast::<Error>() {
                    Ok(inner) => current = *inner,
                    Err(inner) => return Error::Application(inner),
                },
                other => return other,
            }
        }
    }

    /// Returns the wrapped application error if it is of type `T`.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: StdError + 'static,
    {
        match self {
            Error::Application(inner) => inner.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<Response> for Error {
    fn from(response: Response) -> Self {
        Error::Response(Box::new(response))
    }
}

/// Closed hierarchy of error kinds.
///
/// ```text
/// Any
/// ├── Request
/// │   ├── InvalidParameter
/// │   └── Body
/// ├── Response
/// └── Internal
///     ├── Io
///     ├── Transport
///     ├── Application
///     └── Panic
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Any,
    Request,
    InvalidParameter,
    Body,
    Response,
    Internal,
    Io,
    Transport,
    Application,
    Panic,
}

impl ErrorKind {
    /// The direct ancestor of this kind, `None` for [`ErrorKind::Any`].
    pub fn parent(self) -> Option<ErrorKind> {
        match self {
            ErrorKind::Any => None,
            ErrorKind::Request | ErrorKind::Response | ErrorKind::Internal => Some(ErrorKind::Any),
            ErrorKind::InvalidParameter | ErrorKind::Body => Some(ErrorKind::Request),
            ErrorKind::Io | ErrorKind::Transport | ErrorKind::Application | ErrorKind::Panic => {
                Some(ErrorKind::Internal)
            }
        }
    }

    /// Number of parent steps from `self` up to `ancestor`, or `None` when
    /// `ancestor` is not an ancestor of (or equal to) `self`.
    pub fn distance_to(self, ancestor: ErrorKind) -> Option<usize> {
        let mut current = Some(self);
        let mut steps = 0;
        while let Some(kind) = current {
            if kind == ancestor {
                return Some(steps);
            }
            current = kind.parent();
            steps += 1;
        }
        None
    }
}

/// Errors raised while building or starting a server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error("invalid route pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Results using ExecutorError as the error type
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// Type alias for Results using ReactorError as the error type
pub type ReactorResult<T> = std::result::Result<T, ReactorError>;

/// Result type returned by handlers and filters.
pub type Result<T> = std::result::Result<T, Error>;
