use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::Method;

use crate::body::BodyParser;
use crate::config::ServerConfig;
use crate::connection::{self, ServerShared};
use crate::error::ServerError;
use crate::executor::Executor;
use crate::filter::{BoxFilter, Handler};
use crate::net::ReactorPool;
use crate::router::{RouterBuilder, Routes};

/// An HTTP/1.1 server.
///
/// ```no_run
/// use ferrite::{Request, Response, Result, Server, ServerConfig};
///
/// async fn hello(request: Request) -> Result<Response> {
///     let name = request.path_params().get("name").unwrap_or("world");
///     Ok(Response::ok().text(format!("Hello, {}!", name)))
/// }
///
/// #[tokio::main]
/// async fn main() -> std::result::Result<(), ferrite::ServerError> {
///     Server::new(ServerConfig::default())
///         .bind("127.0.0.1:3000")
///         .register(hyper::Method::GET, "/hello/:name", hello)
///         .serve()
///         .await
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    addr: String,
    name: String,
    routes: Routes,
    filter: Option<BoxFilter>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            addr: config.address(),
            config,
            name: "ferrite".to_string(),
            routes: Routes::new(),
            filter: None,
        }
    }

    /// Overrides the configured listen address.
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Names the server in its log lines.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn register<H: Handler>(mut self, method: Method, pattern: &str, handler: H) -> Self {
        self.routes = self.routes.route(method, pattern, handler);
        self
    }

    /// Registers a route that decodes its body with its own parser.
    pub fn register_with_parser<H, P>(mut self, method: Method, pattern: &str, parser: P, handler: H) -> Self
    where
        H: Handler,
        P: Fn() -> BodyParser + Send + Sync + 'static,
    {
        self.routes = self.routes.route_with_parser(method, pattern, parser, handler);
        self
    }

    /// Registers a route behind its own filter.
    pub fn register_filtered<H: Handler>(
        mut self,
        method: Method,
        pattern: &str,
        filter: BoxFilter,
        handler: H,
    ) -> Self {
        self.routes = self.routes.route_filtered(method, pattern, filter, handler);
        self
    }

    pub fn routes(mut self, routes: Routes) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Sets the filter applied in front of every route.
    pub fn filter(mut self, filter: BoxFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Binds the listener and starts accepting connections in the
    /// background.
    ///
    /// # Errors
    /// Fails if a route pattern is invalid, the address cannot be bound or
    /// the reactors cannot be started.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let mut builder = RouterBuilder::new(self.name.clone()).routes(self.routes);
        if let Some(filter) = self.filter {
            builder = builder.filter(filter);
        }
        let router = builder.build()?;

        let listener = TcpListener::bind(&self.addr).map_err(|source| ServerError::Bind {
            addr: self.addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let pool = ReactorPool::new(self.config.io_workers.max(1))?;
        let executor = Executor::new(
            Some(self.config.max_workers),
            Some(self.config.worker_keep_alive()),
        );

        let mut http = Http::new().with_executor(executor.clone());
        http.http1_only(true)
            .http1_keep_alive(self.config.http1_keep_alive)
            .http1_half_close(self.config.http1_half_close)
            .http1_title_case_headers(self.config.http1_title_case_headers)
            .max_buf_size(self.config.http1_max_buf_size.max(8192));

        let shared = Arc::new(ServerShared {
            router,
            limits: self.config.body_limits(),
            chunk_capacity: self.config.chunk_capacity,
            executor: executor.clone(),
        });

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = oneshot::channel();

        let acceptor = Acceptor {
            listener,
            pool,
            http,
            shared,
            executor,
            running: running.clone(),
            name: self.name.clone(),
        };
        std::thread::Builder::new()
            .name("ferrite-acceptor".to_string())
            .spawn(move || {
                acceptor.run();
                let _ = done_tx.send(());
            })?;

        log::info!("{} listening on http://{}", self.name, local_addr);

        Ok(ServerHandle {
            local_addr,
            running,
            done: done_rx.shared(),
        })
    }

    /// Starts the server and waits until it stopped.
    pub async fn serve(self) -> Result<(), ServerError> {
        self.start()?.wait().await;
        Ok(())
    }
}

struct Acceptor {
    listener: TcpListener,
    pool: ReactorPool,
    http: Http<Executor>,
    shared: Arc<ServerShared>,
    executor: Executor,
    running: Arc<AtomicBool>,
    name: String,
}

impl Acceptor {
    fn run(self) {
        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let stream = match self.pool.register(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Failed to register connection: {}", e);
                    continue;
                }
            };
            let remote = stream.peer_addr();
            log::debug!("Connection accepted from {:?}", remote);

            let shared = self.shared.clone();
            let service = service_fn(move |req| connection::handle(shared.clone(), remote, req));
            let conn = self.http.serve_connection(stream, service).with_upgrades();
            self.executor.spawn(async move {
                if let Err(e) = conn.await {
                    log::warn!("Connection from {:?} failed: {}", remote, e);
                }
            });
        }
        log::info!("{} stopped accepting connections", self.name);
    }
}

/// Controls a started server.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    done: Shared<oneshot::Receiver<()>>,
}

impl ServerHandle {
    /// The bound address, with the actual port when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Open connections are served until
    /// their clients close them.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept.
        let mut target = self.local_addr;
        if target.ip().is_unspecified() {
            target.set_ip(match target.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        if let Err(e) = std::net::TcpStream::connect(target) {
            log::warn!("Failed to wake the acceptor: {}", e);
        }
    }

    /// Resolves once the server stopped accepting connections.
    pub async fn wait(&self) {
        let _ = self.done.clone().await;
    }
}
