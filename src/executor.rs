use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::task::{Context, Poll, Wake};
use std::thread::{self, Thread};
use std::time::Duration;

use crate::error::{ExecutorError, ExecutorResult};

/// Blocks the current thread until a future completes.
///
/// Connection tasks, chunk producers and event dispatch all run on worker
/// threads; whenever they need to wait for an asynchronous operation they
/// park through this type.
pub struct Parker {
    thread: Thread,
    parked: AtomicBool,
}

impl Parker {
    /// Creates a parker bound to the current thread.
    ///
    /// The parker starts in a parked state to ensure any wakeups that occur
    /// between polling and parking are not missed.
    pub fn new() -> Arc<Self> {
        Arc::new(Parker {
            thread: thread::current(),
            parked: AtomicBool::new(true),
        })
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        if self.parked.swap(false, Ordering::Release) {
            self.thread.unpark();
        }
    }
}

impl Parker {
    /// Polls `fut` to completion, parking between polls.
    pub fn block_on<F>(self: &Arc<Self>, fut: F) -> ExecutorResult<F::Output>
    where
        F: Future,
    {
        self.parked.store(true, Ordering::Relaxed);

        let waker = self.clone().into();
        let mut cx = Context::from_waker(&waker);

        let mut fut = std::pin::pin!(fut);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(res) => break Ok(res),
                Poll::Pending => {
                    while self.parked.swap(true, Ordering::Acquire) {
                        thread::park();
                    }
                }
            }
        }
    }
}

/// Blocks the calling thread on `fut` with a fresh [`Parker`].
pub fn block_on<F: Future>(fut: F) -> ExecutorResult<F::Output> {
    Parker::new().block_on(fut)
}

/// The message carried by a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A growable pool of worker threads.
///
/// - Grows up to `max_workers` threads
/// - Idle workers exit after `keep_alive`
/// - Tasks may block their worker; the pool simply grows instead
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    keep_alive: Duration,
    shared: Mutex<Shared>,
    max_workers: usize,
    condvar: Condvar,
}

struct Shared {
    queue: VecDeque<Box<dyn Future<Output = ()> + Send>>,
    workers: usize,
    idle: usize,
    /// Workers woken for new work but not yet running
    notified: usize,
}

impl Executor {
    /// Creates a new executor.
    ///
    /// # Arguments
    /// * `max_workers` - Maximum number of worker threads. Defaults to 15 * CPU cores
    /// * `keep_alive` - How long idle workers wait for new tasks. Defaults to 6 seconds
    pub fn new(max_workers: Option<usize>, keep_alive: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    notified: 0,
                }),
                condvar: Condvar::new(),
                keep_alive: keep_alive.unwrap_or_else(|| Duration::from_secs(6)),
                max_workers: max_workers.unwrap_or_else(|| num_cpus::get() * 15).max(1),
            }),
        }
    }

    /// The process-wide executor used for work that is not tied to a server,
    /// such as event broadcast dispatch.
    pub fn background() -> &'static Executor {
        static BACKGROUND: OnceLock<Executor> = OnceLock::new();
        BACKGROUND.get_or_init(|| Executor::new(None, None))
    }

    /// Queues `fut` on the pool.
    ///
    /// This will either wake up an idle worker or spawn a new one if needed.
    /// Failures are logged, not propagated.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = self.try_spawn(Box::new(fut)) {
            log::error!("Failed to execute task: {}", e);
        }
    }

    /// Runs a blocking closure on the pool.
    pub fn spawn_blocking<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { f() });
    }

    fn try_spawn(&self, fut: Box<dyn Future<Output = ()> + Send>) -> ExecutorResult<()> {
        let mut shared = self
            .inner
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        shared.queue.push_back(fut);

        if shared.idle == 0 && shared.workers < self.inner.max_workers {
            shared.workers += 1;
            if let Err(e) = self.spawn_worker(self.inner.clone()) {
                shared.workers -= 1;
                return Err(e);
            }
        } else if shared.idle > 0 {
            shared.idle -= 1;
            shared.notified += 1;
            self.inner.condvar.notify_one();
        }
        Ok(())
    }

    /// Spawns a worker thread that drains the queue.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    fn spawn_worker(&self, inner: Arc<Inner>) -> ExecutorResult<()> {
        std::thread::Builder::new()
            .name("ferrite-worker".to_owned())
            .spawn(move || {
                if let Err(e) = inner.run() {
                    log::error!("Worker thread error: {}", e);
                }
            })
            .map_err(ExecutorError::ThreadSpawn)?;
        Ok(())
    }
}

impl<F> hyper::rt::Executor<F> for Executor
where
    F: Future<Output = ()> + Send + 'static,
{
    fn execute(&self, fut: F) {
        self.spawn(fut);
    }
}

impl Inner {
    /// Worker loop.
    ///
    /// 1. Run every queued task
    /// 2. Wait on the condition variable for more
    /// 3. Exit when nothing arrives within the keep-alive duration
    fn run(&self) -> ExecutorResult<()> {
        let parker = Parker::new();
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        'alive: loop {
            while let Some(task) = shared.queue.pop_front() {
                drop(shared);
                parker.block_on(Pin::from(task))?;
                shared = self
                    .shared
                    .lock()
                    .map_err(|_| ExecutorError::LockPoisoned)?;
            }

            shared.idle += 1;

            loop {
                let result = self
                    .condvar
                    .wait_timeout(shared, self.keep_alive)
                    .map_err(|_| ExecutorError::LockPoisoned)?;

                shared = result.0;
                let timeout = result.1;

                if shared.notified != 0 {
                    shared.notified -= 1;
                    continue 'alive;
                }

                if timeout.timed_out() {
                    break 'alive;
                }
            }
        }

        shared.workers -= 1;
        shared.idle -= 1;
        Ok(())
    }
}
