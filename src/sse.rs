//! Server-sent events over chunked responses.

use std::fmt;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use hyper::header::CACHE_CONTROL;
use uuid::Uuid;

use crate::executor::{panic_message, Executor};
use crate::http::ChunkSink;
use crate::response::Response;

/// One event of a `text/event-stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    name: Option<String>,
    id: Option<String>,
    data: String,
}

impl Event {
    pub fn new(data: impl Into<String>) -> Self {
        Event {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// The wire format, terminated by a blank line. Multi-line data is split
/// into one `data:` field per line.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            writeln!(f, "event: {}", name)?;
        }
        if let Some(id) = &self.id {
            writeln!(f, "id: {}", id)?;
        }
        for line in lines(&self.data) {
            writeln!(f, "data: {}", line)?;
        }
        writeln!(f)
    }
}

/// Splits on `\r\n`, `\n` and `\r`.
fn lines(data: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(|c| c == '\r' || c == '\n') {
            Some(at) => {
                let skip = if current[at..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[at + skip..]);
                Some(&current[..at])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

fn event_stream() -> Response {
    Response::ok()
        .content_type("text/event-stream")
        .set_header(CACHE_CONTROL, "no-cache")
}

/// A single client event stream.
///
/// ```
/// use ferrite::{Event, EventSource};
///
/// let response = EventSource::response(|emitter| {
///     let _ = emitter.send(&Event::new("ready").name("status"));
/// });
/// assert_eq!(response.header_value("content-type"), Some("text/event-stream"));
/// ```
pub struct EventSource;

impl EventSource {
    /// A response whose body stays open for as long as an [`EventEmitter`]
    /// clone is alive and the client is connected.
    pub fn response<F>(on_open: F) -> Response
    where
        F: FnOnce(EventEmitter) + Send + 'static,
    {
        event_stream().chunks(move |sink| on_open(EventEmitter::new(sink)))
    }
}

/// Writes events to one client.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<Mutex<Option<ChunkSink>>>,
}

impl EventEmitter {
    fn new(sink: ChunkSink) -> Self {
        EventEmitter {
            sink: Arc::new(Mutex::new(Some(sink))),
        }
    }

    /// Writes and flushes one event, blocking until the connection took it.
    pub fn send(&self, event: &Event) -> io::Result<()> {
        let mut guard = self.lock()?;
        let sink = guard.as_mut().ok_or_else(closed)?;
        write!(sink, "{}", event)?;
        sink.flush()
    }

    /// Runs `listener` once a send finds the client gone, or right away if
    /// it already is.
    pub fn on_disconnect<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(sink) => sink.on_disconnect(listener),
                None => listener(),
            },
            Err(_) => listener(),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.lock()
            .map(|guard| guard.as_ref().map_or(true, ChunkSink::is_disconnected))
            .unwrap_or(true)
    }

    /// Ends the stream.
    pub fn close(&self) -> io::Result<()> {
        let sink = self.lock()?.take();
        match sink {
            Some(sink) => sink.close(),
            None => Ok(()),
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Option<ChunkSink>>> {
        self.sink
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "event emitter poisoned"))
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "event stream closed")
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Tasks drained per wake-up before the dispatcher yields its worker.
const THROUGHPUT: usize = 25;

/// Runs queued tasks one at a time, in order, on an executor.
///
/// Enqueueing never blocks. At most one worker drains the queue at any time;
/// it runs up to 25 tasks and then re-schedules itself if more are pending,
/// so a busy dispatcher shares the pool with other work.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    /// Tasks counted after they were queued; may dip below zero briefly.
    pending: AtomicIsize,
    running: AtomicBool,
    executor: Executor,
}

impl Dispatcher {
    pub fn new(executor: Executor) -> Self {
        let (tx, rx) = mpsc::unbounded();
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                tx,
                rx: Mutex::new(rx),
                pending: AtomicIsize::new(0),
                running: AtomicBool::new(false),
                executor,
            }),
        }
    }

    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.tx.unbounded_send(Box::new(task)).is_err() {
            return;
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        self.schedule();
    }

    fn schedule(&self) {
        if self.inner.pending.load(Ordering::Acquire) <= 0 {
            return;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let this = self.clone();
            self.inner.executor.spawn_blocking(move || this.run());
        }
    }

    fn run(&self) {
        if let Ok(mut rx) = self.inner.rx.lock() {
            for _ in 0..THROUGHPUT {
                let task = match rx.try_next() {
                    Ok(Some(task)) => task,
                    _ => break,
                };
                self.inner.pending.fetch_sub(1, Ordering::AcqRel);
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    log::error!("Dispatched task panicked: {}", panic_message(&*panic));
                }
            }
        }
        self.inner.running.store(false, Ordering::Release);
        self.schedule();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.inner.pending.load(Ordering::Relaxed))
            .finish()
    }
}

type Hook = Arc<dyn Fn(&str) + Send + Sync>;

/// Events queued per subscriber before it counts as too slow.
const SUBSCRIBER_QUEUE: usize = 1024;

/// An event stream shared by many clients.
///
/// Subscribing, unsubscribing and broadcasting all go through one
/// [`Dispatcher`], so the subscriber set is only touched by one task at a
/// time and events reach every client in the order they were broadcast.
/// Every subscriber has its own bounded queue that its connection drains;
/// a subscriber whose queue is full is dropped rather than holding up the
/// others.
///
/// ```no_run
/// use ferrite::{Event, EventBroadcast, Request, Response, Result};
///
/// let chat = EventBroadcast::new();
/// let subscribe = {
///     let chat = chat.clone();
///     move |_request: Request| {
///         let chat = chat.clone();
///         async move { Result::Ok(chat.subscribe()) }
///     }
/// };
/// chat.broadcast(Event::new("hello"));
/// # let _ = subscribe;
/// ```
#[derive(Clone)]
pub struct EventBroadcast {
    inner: Arc<BroadcastInner>,
}

struct BroadcastInner {
    subscribers: Mutex<Vec<(String, mpsc::Sender<Event>)>>,
    on_subscribe: Mutex<Vec<Hook>>,
    on_unsubscribe: Mutex<Vec<Hook>>,
    dispatcher: Dispatcher,
    queue: usize,
}

impl EventBroadcast {
    pub fn new() -> Self {
        Self::with_executor(Executor::background().clone())
    }

    pub fn with_executor(executor: Executor) -> Self {
        Self::with_queue(executor, SUBSCRIBER_QUEUE)
    }

    /// Uses `queue` as the number of events a subscriber may fall behind
    /// before it is dropped.
    pub fn with_queue(executor: Executor, queue: usize) -> Self {
        EventBroadcast {
            inner: Arc::new(BroadcastInner {
                subscribers: Mutex::new(Vec::new()),
                on_subscribe: Mutex::new(Vec::new()),
                on_unsubscribe: Mutex::new(Vec::new()),
                dispatcher: Dispatcher::new(executor),
                queue: queue.max(1),
            }),
        }
    }

    /// Called with the subscriber id after a client joined.
    pub fn on_subscribe<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.inner.on_subscribe.lock() {
            hooks.push(Arc::new(hook));
        }
    }

    /// Called with the subscriber id after a client left.
    pub fn on_unsubscribe<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.inner.on_unsubscribe.lock() {
            hooks.push(Arc::new(hook));
        }
    }

    /// The event stream response for a new subscriber.
    pub fn subscribe(&self) -> Response {
        let id = Uuid::new_v4().to_string();
        // The channel adds one slot per sender.
        let (tx, rx) = mpsc::channel(self.inner.queue - 1);

        let inner = self.inner.clone();
        let joined = id.clone();
        self.inner.dispatcher.dispatch(move || {
            if let Ok(mut subscribers) = inner.subscribers.lock() {
                subscribers.push((joined.clone(), tx));
            }
            log::debug!("Event subscriber {} joined", joined);
            run_hooks(&inner.on_subscribe, &joined);
        });

        let subscription = Subscription {
            events: rx,
            broadcast: self.clone(),
            id,
        };
        event_stream().body_stream(subscription.map(|event| Bytes::from(event.to_string())))
    }

    /// Queues `event` for every subscriber. Subscribers that are gone or
    /// whose queue is full are dropped.
    pub fn broadcast(&self, event: Event) {
        let this = self.clone();
        self.inner.dispatcher.dispatch(move || {
            let dropped: Vec<String> = match this.inner.subscribers.lock() {
                Ok(mut subscribers) => subscribers
                    .iter_mut()
                    .filter_map(|(id, tx)| {
                        if offer(id, tx, &event) {
                            None
                        } else {
                            Some(id.clone())
                        }
                    })
                    .collect(),
                Err(_) => Vec::new(),
            };
            for id in dropped {
                this.remove(&id);
            }
        });
    }

    /// Queues `event` for one subscriber.
    pub fn send_to(&self, id: &str, event: Event) {
        let this = self.clone();
        let id = id.to_string();
        self.inner.dispatcher.dispatch(move || {
            let delivered = match this.inner.subscribers.lock() {
                Ok(mut subscribers) => subscribers
                    .iter_mut()
                    .find(|(subscriber, _)| *subscriber == id)
                    .map(|(id, tx)| offer(id, tx, &event)),
                Err(_) => None,
            };
            if delivered == Some(false) {
                this.remove(&id);
            }
        });
    }

    /// Ends every stream once its queued events are written and forgets all
    /// subscribers.
    pub fn close(&self) {
        let this = self.clone();
        self.inner.dispatcher.dispatch(move || {
            let ids: Vec<String> = match this.inner.subscribers.lock() {
                Ok(subscribers) => subscribers.iter().map(|(id, _)| id.clone()).collect(),
                Err(_) => Vec::new(),
            };
            for id in ids {
                this.remove(&id);
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn unsubscribe(&self, id: String) {
        let this = self.clone();
        self.inner.dispatcher.dispatch(move || this.remove(&id));
    }

    /// Dropping the sender ends that subscriber's stream.
    fn remove(&self, id: &str) {
        let removed = match self.inner.subscribers.lock() {
            Ok(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|(subscriber, _)| subscriber != id);
                subscribers.len() != before
            }
            Err(_) => false,
        };
        if removed {
            log::debug!("Event subscriber {} left", id);
            run_hooks(&self.inner.on_unsubscribe, id);
        }
    }
}

/// Queues without waiting; false when the subscriber should be dropped.
fn offer(id: &str, tx: &mut mpsc::Sender<Event>, event: &Event) -> bool {
    match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(e) if e.is_full() => {
            log::warn!("Event subscriber {} is not keeping up, dropping it", id);
            false
        }
        Err(_) => false,
    }
}

/// The receiving end of one subscriber's queue. Dropped by the connection
/// when the client goes away.
struct Subscription {
    events: mpsc::Receiver<Event>,
    broadcast: EventBroadcast,
    id: String,
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcast.unsubscribe(std::mem::take(&mut self.id));
    }
}

impl Default for EventBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBroadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBroadcast")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn run_hooks(hooks: &Mutex<Vec<Hook>>, id: &str) {
    let hooks = hooks.lock().map(|h| h.clone()).unwrap_or_default();
    for hook in hooks {
        hook(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseBody;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_event_format() {
        let event = Event::new("first\nsecond\r\nthird\rfourth")
            .name("update")
            .id("7");
        assert_eq!(
            event.to_string(),
            "event: update\nid: 7\ndata: first\ndata: second\ndata: third\ndata: fourth\n\n"
        );
        assert_eq!(Event::new("").to_string(), "data: \n\n");
        assert_eq!(Event::new("a\n").to_string(), "data: a\ndata: \n\n");
    }

    #[test]
    fn test_event_source_headers() {
        let response = EventSource::response(|_| {});
        assert_eq!(response.header_value("content-type"), Some("text/event-stream"));
        assert_eq!(response.header_value("cache-control"), Some("no-cache"));
        assert!(matches!(response.body_ref(), ResponseBody::Chunked(_)));
    }

    /// Tasks run in order, including when more than one batch is queued.
    #[test]
    fn test_dispatcher_order() {
        let dispatcher = Dispatcher::new(Executor::new(Some(4), None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std_mpsc::channel();

        for i in 0..100 {
            let seen = seen.clone();
            dispatcher.dispatch(move || seen.lock().unwrap().push(i));
        }
        dispatcher.dispatch(move || done_tx.send(()).unwrap());

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    /// Concurrent producers leave the dispatcher idle with nothing counted
    /// once every task ran.
    #[test]
    fn test_dispatcher_settles_after_concurrent_dispatch() {
        let dispatcher = Dispatcher::new(Executor::new(Some(4), None));
        let ran = Arc::new(AtomicIsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let ran = ran.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let ran = ran.clone();
                        dispatcher.dispatch(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) < 200 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 200);

        let (done_tx, done_rx) = std_mpsc::channel();
        dispatcher.dispatch(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        while dispatcher.inner.running.load(Ordering::Acquire)
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dispatcher.inner.pending.load(Ordering::Acquire), 0);
    }

    /// A panicking task is logged and the queue keeps draining.
    #[test]
    fn test_dispatcher_survives_panics() {
        let dispatcher = Dispatcher::new(Executor::new(Some(2), None));
        let (done_tx, done_rx) = std_mpsc::channel();

        dispatcher.dispatch(|| panic!("task failed"));
        dispatcher.dispatch(move || done_tx.send(()).unwrap());

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    /// Subscribers are added through the dispatcher and announced to hooks.
    #[test]
    fn test_broadcast_subscribe() {
        let executor = Executor::new(Some(4), None);
        let broadcast = EventBroadcast::with_executor(executor.clone());
        let (joined_tx, joined_rx) = std_mpsc::channel();
        let joined_tx = Mutex::new(joined_tx);
        broadcast.on_subscribe(move |id| {
            let _ = joined_tx.lock().unwrap().send(id.to_string());
        });

        let body = body_of(broadcast.subscribe(), &executor);

        let id = joined_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);
        assert_eq!(broadcast.subscriber_count(), 1);

        broadcast.broadcast(Event::new("hi"));
        broadcast.close();
        let bytes = futures::executor::block_on(hyper::body::to_bytes(body)).unwrap();
        assert_eq!(&bytes[..], b"data: hi\n\n");
    }

    fn body_of(response: Response, executor: &Executor) -> hyper::Body {
        crate::http::into_hyper(
            response,
            &crate::http::WriteContext {
                head: false,
                keep_alive: true,
                chunk_capacity: 1024,
                executor,
            },
        )
        .into_body()
    }

    /// A subscriber that reads nothing neither holds up the others nor
    /// stays subscribed once its queue is full.
    #[test]
    fn test_slow_subscriber_is_dropped() {
        let executor = Executor::new(Some(4), None);
        let broadcast = EventBroadcast::with_queue(executor.clone(), 3);
        let (left_tx, left_rx) = std_mpsc::channel();
        let left_tx = Mutex::new(left_tx);
        broadcast.on_unsubscribe(move |id| {
            let _ = left_tx.lock().unwrap().send(id.to_string());
        });

        let stalled = body_of(broadcast.subscribe(), &executor);
        for i in 0..5 {
            broadcast.broadcast(Event::new(i.to_string()));
        }

        left_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(broadcast.subscriber_count(), 0);

        // What was queued before the drop is still delivered, then the stream ends.
        let bytes = futures::executor::block_on(hyper::body::to_bytes(stalled)).unwrap();
        assert_eq!(&bytes[..], b"data: 0\n\ndata: 1\n\ndata: 2\n\n");
    }

    /// Broadcasting never waits for a subscriber to read.
    #[test]
    fn test_broadcast_does_not_wait_for_readers() {
        let executor = Executor::new(Some(4), None);
        let broadcast = EventBroadcast::with_executor(executor.clone());
        let idle = body_of(broadcast.subscribe(), &executor);
        let reader = body_of(broadcast.subscribe(), &executor);

        for i in 0..100 {
            broadcast.broadcast(Event::new(i.to_string()));
        }
        let (done_tx, done_rx) = std_mpsc::channel();
        broadcast.inner.dispatcher.dispatch(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(broadcast.subscriber_count(), 2);

        broadcast.close();
        let bytes = futures::executor::block_on(hyper::body::to_bytes(reader)).unwrap();
        let expected: String = (0..100).map(|i| format!("data: {}\n\n", i)).collect();
        assert_eq!(bytes, expected.as_bytes());
        drop(idle);
    }
}
