use core::{fmt, future::Future, time::Duration};

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::{
    runtime,
    sync::mpsc::{UnboundedSender, unbounded_channel},
    task::{JoinHandle, LocalSet},
    time::Instant,
};
use tracing::error;

type Callback = Box<dyn FnOnce() + Send>;

/// The per-thread cooperative scheduler.
///
/// Owns a current-thread tokio runtime and a `LocalSet`. Everything spawned
/// through it runs serially on the owning thread; the only way in from other
/// threads is [LoopHandle::add_callback].
pub struct EventLoop {
    rt: runtime::Runtime,
    local: LocalSet,
    handle: LoopHandle,
}

impl EventLoop {
    pub fn new() -> std::io::Result<Self> {
        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        let local = LocalSet::new();
        let (tx, mut rx) = unbounded_channel::<Callback>();

        // drain externally queued callbacks on the loop thread. a panicking
        // callback is logged and must not take the loop down.
        local.spawn_local(async move {
            while let Some(cb) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(cb)).is_err() {
                    error!(target: "event_loop", "queued callback panicked");
                }
            }
        });

        Ok(Self {
            rt,
            local,
            handle: LoopHandle { callback_tx: tx },
        })
    }

    /// thread-safe handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// run `fut` to completion, driving all spawned tasks meanwhile.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.local.block_on(&self.rt, fut)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}

/// Cloneable handle to an [EventLoop].
#[derive(Clone)]
pub struct LoopHandle {
    callback_tx: UnboundedSender<Callback>,
}

impl LoopHandle {
    /// enqueue `f` to run on the loop thread at the next tick.
    ///
    /// This is the single thread-safe entry point of the loop. Callbacks
    /// run in the order they were queued; a send after the loop is gone is
    /// silently dropped.
    pub fn add_callback<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.callback_tx.send(Box::new(f));
    }
}

/// spawn a task on the current loop. must be called from loop context.
#[inline]
pub fn spawn<F>(fut: F) -> TaskHandle<F::Output>
where
    F: Future + 'static,
{
    TaskHandle(tokio::task::spawn_local(fut))
}

/// Handle of a spawned task. Await it for the result; drop detaches;
/// [TaskHandle::cancel] aborts the task at its next suspension point.
pub struct TaskHandle<T>(JoinHandle<T>);

impl<T> TaskHandle<T> {
    pub fn cancel(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    /// wait for the task. `None` when it was cancelled first.
    pub async fn join(self) -> Option<T> {
        self.0.await.ok()
    }
}

/// schedule `f` to run after `delay`. cancellable through the returned
/// [TimerHandle]. timers fire in non-decreasing deadline order.
pub fn call_later<F>(delay: Duration, f: F) -> TimerHandle
where
    F: FnOnce() + 'static,
{
    call_at(Instant::now() + delay, f)
}

/// schedule `f` to run at an absolute deadline on the loop clock.
pub fn call_at<F>(deadline: Instant, f: F) -> TimerHandle
where
    F: FnOnce() + 'static,
{
    let handle = tokio::task::spawn_local(async move {
        tokio::time::sleep_until(deadline).await;
        f();
    });
    TimerHandle(handle)
}

/// Cancellation handle of a pending timer.
pub struct TimerHandle(JoinHandle<()>);

impl TimerHandle {
    /// cancel the timer. a no-op when it already fired.
    pub fn cancel(&self) {
        self.0.abort();
    }
}

/// Error from the blocking executor bridge.
#[derive(Debug)]
pub enum ExecutorError {
    /// the submitted closure panicked.
    Panicked,
    /// the executor was shut down before the closure completed.
    Shutdown,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panicked => f.write_str("executor task panicked"),
            Self::Shutdown => f.write_str("executor shut down"),
        }
    }
}

impl std::error::Error for ExecutorError {}

impl LoopHandle {
    /// run blocking or CPU-bound `f` on the worker pool, resolving on the
    /// loop thread. long work must never run on the loop itself.
    pub fn run_in_executor<F, T>(&self, f: F) -> impl Future<Output = Result<T, ExecutorError>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(f);
        async move {
            handle.await.map_err(|e| {
                if e.is_panic() {
                    ExecutorError::Panicked
                } else {
                    ExecutorError::Shutdown
                }
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{
        cell::RefCell,
        rc::Rc,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    #[test]
    fn callbacks_from_other_threads_run_in_order() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = seen.clone();
        let t = std::thread::spawn(move || {
            for i in 0..10 {
                let seen = seen2.clone();
                handle.add_callback(move || {
                    // callbacks must drain in queue order.
                    assert_eq!(seen.fetch_add(1, Ordering::SeqCst), i);
                });
            }
        });
        t.join().unwrap();

        event_loop.block_on(async {
            while seen.load(Ordering::SeqCst) < 10 {
                tokio::task::yield_now().await;
            }
        });
    }

    #[test]
    fn panicking_callback_does_not_kill_the_loop() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let seen = Arc::new(AtomicUsize::new(0));

        handle.add_callback(|| panic!("boom"));
        let seen2 = seen.clone();
        handle.add_callback(move || {
            seen2.store(1, Ordering::SeqCst);
        });

        event_loop.block_on(async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        });
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.block_on(async {
            let order = Rc::new(RefCell::new(Vec::new()));
            let o1 = order.clone();
            let o2 = order.clone();
            let o3 = order.clone();
            // registered out of deadline order on purpose.
            call_later(Duration::from_millis(30), move || o1.borrow_mut().push(3));
            call_later(Duration::from_millis(10), move || o2.borrow_mut().push(1));
            call_later(Duration::from_millis(20), move || o3.borrow_mut().push(2));

            tokio::time::sleep(Duration::from_millis(80)).await;
            assert_eq!(*order.borrow(), vec![1, 2, 3]);
        });
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.block_on(async {
            let fired = Rc::new(RefCell::new(false));
            let f = fired.clone();
            let timer = call_later(Duration::from_millis(5), move || *f.borrow_mut() = true);
            timer.cancel();
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(!*fired.borrow());
        });
    }

    #[test]
    fn executor_marshals_result_back() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let got = event_loop.block_on(handle.run_in_executor(|| 21 * 2)).unwrap();
        assert_eq!(got, 42);
    }

    #[test]
    fn executor_surfaces_panics() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let got = event_loop.block_on(handle.run_in_executor(|| -> i32 { panic!("work failed") }));
        assert!(matches!(got, Err(ExecutorError::Panicked)));
    }
}
