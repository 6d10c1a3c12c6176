//! Non-blocking sockets driven by mio event loops.
//!
//! Each [`Reactor`] owns one event loop thread. Accepted connections are
//! spread across a [`ReactorPool`] so that readiness dispatch scales with the
//! number of configured I/O workers.
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{self as sys, Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use mio::{Events, Token};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{ReactorError, ReactorResult};

/// A readiness event loop for TCP connections.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

struct Shared {
    registry: mio::Registry,
    /// Next token handed out on registration
    token: AtomicUsize,
    /// Registered sources by token
    sources: Mutex<HashMap<Token, Arc<Source>>>,
}

impl Reactor {
    /// Creates a reactor and spawns its event loop thread.
    ///
    /// # Errors
    /// Returns `ReactorError::Init` if the poller or the thread cannot be
    /// created.
    pub fn new(name: &str) -> ReactorResult<Self> {
        let poll = mio::Poll::new().map_err(ReactorError::Init)?;
        let shared = Arc::new(Shared {
            token: AtomicUsize::new(0),
            registry: poll.registry().try_clone().map_err(ReactorError::Init)?,
            sources: Mutex::new(HashMap::with_capacity(64)),
        });

        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn({
                let shared = shared.clone();
                move || shared.run(poll)
            })
            .map_err(ReactorError::Init)?;

        Ok(Reactor { shared })
    }

    /// Registers an accepted stream for readiness notifications.
    ///
    /// # Errors
    /// - `ReactorError::Registration` if the stream cannot be registered
    /// - `ReactorError::LockPoisoned` if the source table is poisoned
    pub fn register(&self, sys: sys::TcpStream) -> ReactorResult<TcpStream> {
        sys.set_nonblocking(true).map_err(ReactorError::Registration)?;
        let peer_addr = sys.peer_addr().ok();
        let mut sys = mio::net::TcpStream::from_std(sys);
        let token = Token(self.shared.token.fetch_add(1, Ordering::Relaxed));

        // Data may already be queued, and the edge for it can fire before
        // the first poll; start triggered so the first read is attempted.
        let source = Arc::new(Source {
            token,
            interest: Default::default(),
            triggered: [AtomicBool::new(true), AtomicBool::new(true)],
        });

        {
            let mut sources = self
                .shared
                .sources
                .lock()
                .map_err(|_| ReactorError::LockPoisoned)?;
            sources.insert(token, source.clone());
        }

        if let Err(err) = self.shared.registry.register(
            &mut sys,
            token,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        ) {
            if let Ok(mut sources) = self.shared.sources.lock() {
                sources.remove(&token);
            }
            return Err(ReactorError::Registration(err));
        }

        Ok(TcpStream {
            sys,
            peer_addr,
            source,
            reactor: self.clone(),
        })
    }

    /// Checks readiness in `direction`, storing the waker when not ready.
    ///
    /// The triggered flag is re-checked after the waker is stored so that an
    /// event arriving in between is not lost.
    fn poll_ready(
        &self,
        source: &Source,
        direction: usize,
        cx: &Context<'_>,
    ) -> Poll<io::Result<()>> {
        if source.triggered[direction].load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }

        {
            let mut interest = source
                .interest
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, ReactorError::LockPoisoned))?;

            match &mut interest[direction] {
                Some(existing) if existing.will_wake(cx.waker()) => {}
                _ => {
                    interest[direction] = Some(cx.waker().clone());
                }
            }
        }

        if source.triggered[direction].load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }

        Poll::Pending
    }

    fn clear_trigger(&self, source: &Source, direction: usize) {
        source.triggered[direction].store(false, Ordering::Release);
    }

    /// Number of streams currently registered.
    pub fn connections(&self) -> usize {
        self.shared.sources.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Shared {
    fn run(&self, mut poll: mio::Poll) -> ReactorResult<()> {
        let mut events = Events::with_capacity(64);
        let mut wakers = Vec::new();

        loop {
            if let Err(err) = self.poll(&mut poll, &mut events, &mut wakers) {
                log::warn!("Failed to poll reactor: {}", err);
            }

            events.clear();
        }
    }

    fn poll(
        &self,
        poll: &mut mio::Poll,
        events: &mut Events,
        wakers: &mut Vec<Waker>,
    ) -> ReactorResult<()> {
        if let Err(err) = poll.poll(events, None) {
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("Polling error: {}", err);
                return Err(ReactorError::Polling(err));
            }
            return Ok(());
        }

        for event in events.iter() {
            let source = {
                let sources = self.sources.lock().map_err(|_| ReactorError::LockPoisoned)?;
                match sources.get(&event.token()) {
                    Some(source) => source.clone(),
                    None => continue,
                }
            };

            let mut interest = source
                .interest
                .lock()
                .map_err(|_| ReactorError::LockPoisoned)?;

            // Errors and hangups wake both directions; the next I/O call
            // reports the actual failure.
            let closed = event.is_error() || event.is_read_closed() || event.is_write_closed();

            if event.is_readable() || closed {
                if let Some(waker) = interest[direction::READ].take() {
                    wakers.push(waker);
                }
                source.triggered[direction::READ].store(true, Ordering::Release);
            }

            if event.is_writable() || closed {
                if let Some(waker) = interest[direction::WRITE].take() {
                    wakers.push(waker);
                }
                source.triggered[direction::WRITE].store(true, Ordering::Release);
            }
        }

        for waker in wakers.drain(..) {
            waker.wake();
        }

        Ok(())
    }
}

mod direction {
    pub const READ: usize = 0;
    pub const WRITE: usize = 1;
}

struct Source {
    interest: Mutex<[Option<Waker>; 2]>,
    triggered: [AtomicBool; 2],
    token: Token,
}

/// A fixed set of reactors handing out registrations round robin.
#[derive(Clone)]
pub struct ReactorPool {
    reactors: Arc<[Reactor]>,
    next: Arc<AtomicUsize>,
}

impl ReactorPool {
    /// Starts `size` reactors (at least one).
    pub fn new(size: usize) -> ReactorResult<Self> {
        let reactors = (0..size.max(1))
            .map(|i| Reactor::new(&format!("ferrite-io-{}", i)))
            .collect::<ReactorResult<Vec<_>>>()?;

        Ok(ReactorPool {
            reactors: reactors.into(),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Registers `stream` with the next reactor in turn.
    pub fn register(&self, stream: sys::TcpStream) -> ReactorResult<TcpStream> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        self.reactors[index].register(stream)
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }
}

/// A non-blocking TCP connection registered with a [`Reactor`].
pub struct TcpStream {
    sys: mio::net::TcpStream,
    peer_addr: Option<SocketAddr>,
    reactor: Reactor,
    source: Arc<Source>,
}

impl TcpStream {
    /// Runs `f` once the socket is ready in `direction`, re-arming on
    /// `WouldBlock`.
    fn poll_io<T>(
        &self,
        direction: usize,
        mut f: impl FnMut() -> io::Result<T>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<T>> {
        loop {
            if self.reactor.poll_ready(&self.source, direction, cx)?.is_pending() {
                return Poll::Pending;
            }

            match f() {
                // Clear and poll again so a waker is stored before parking.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.reactor.clear_trigger(&self.source, direction);
                }
                val => return Poll::Ready(val),
            }
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();

        match self.poll_io(direction::READ, || (&self.sys).read(unfilled), cx) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_io(direction::WRITE, || (&self.sys).write(buf), cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_io(direction::WRITE, || (&self.sys).flush(), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.sys.shutdown(Shutdown::Write) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Poll::Ready(Ok(())),
            other => Poll::Ready(other),
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        if let Ok(mut sources) = self.reactor.shared.sources.lock() {
            sources.remove(&self.source.token);
        }
        let _ = self.reactor.shared.registry.deregister(&mut self.sys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Tests that a new reactor can be created successfully.
    #[test]
    fn test_reactor_creation() {
        let reactor = Reactor::new("test-reactor");
        assert!(reactor.is_ok());
    }

    /// Tests that a TCP stream can be registered and remembers its peer.
    #[test]
    fn test_tcp_stream_registration() {
        let reactor = Reactor::new("test-reactor").unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let registered = reactor.register(stream).unwrap();
        assert_eq!(registered.peer_addr(), Some(addr));
    }

    /// Tests asynchronous write then read against a blocking echo peer.
    #[test]
    fn test_async_io_operations() {
        let reactor = Reactor::new("test-reactor").unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 13];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"Hello, World!");
            stream.write_all(b"Response!").unwrap();
        });

        futures::executor::block_on(async {
            let stream = TcpStream::connect(addr).unwrap();
            let mut async_stream = reactor.register(stream).unwrap();

            async_stream.write_all(b"Hello, World!").await.unwrap();

            let mut buf = vec![0; 9];
            async_stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"Response!");
        });
    }

    /// A fresh source is not ready until the event loop says so.
    #[test]
    fn test_reactor_poll_ready() {
        use futures::task::noop_waker;
        use std::task::{Context, Poll};

        let reactor = Reactor::new("test-reactor").unwrap();
        let waker = noop_waker();
        let cx = Context::from_waker(&waker);

        let source = Arc::new(Source {
            token: Token(0),
            interest: Default::default(),
            triggered: Default::default(),
        });

        let poll_result = reactor.poll_ready(&source, direction::READ, &cx);
        assert!(matches!(poll_result, Poll::Pending));
    }

    /// Dropping a stream removes its source.
    #[test]
    fn test_source_cleanup() {
        let reactor = Reactor::new("test-reactor").unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        {
            let stream = TcpStream::connect(addr).unwrap();
            let _registered = reactor.register(stream).unwrap();
            assert_eq!(reactor.connections(), 1);
        }

        assert_eq!(reactor.connections(), 0);
    }

    /// Registrations are spread over the pool in turn.
    #[test]
    fn test_pool_round_robin() {
        let pool = ReactorPool::new(2).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let streams: Vec<_> = (0..4)
            .map(|_| pool.register(TcpStream::connect(addr).unwrap()).unwrap())
            .collect();

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.reactors[0].connections(), 2);
        assert_eq!(pool.reactors[1].connections(), 2);
        drop(streams);
    }

    #[test]
    fn test_pool_has_at_least_one_reactor() {
        assert_eq!(ReactorPool::new(0).unwrap().len(), 1);
    }

    /// Bytes sent before registration are still read.
    #[test]
    fn test_data_queued_before_registration() {
        let reactor = Reactor::new("test-reactor").unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        for _ in 0..20 {
            let mut client = TcpStream::connect(addr).unwrap();
            let (accepted, _) = listener.accept().unwrap();
            client.write_all(b"ping").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));

            let mut registered = reactor.register(accepted).unwrap();
            let mut buf = [0u8; 4];
            futures::executor::block_on(registered.read_exact(&mut buf)).unwrap();
            assert_eq!(&buf, b"ping");
        }
    }

    /// Reads on an idle registered stream do not block.
    #[test]
    fn test_nonblocking_operations() {
        let reactor = Reactor::new("test-reactor").unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let async_stream = reactor.register(stream).unwrap();

        let mut buf = [0; 10];
        let result = (&async_stream.sys).read(&mut buf);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::WouldBlock);
    }
}
