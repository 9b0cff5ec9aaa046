//! cooperative synchronization primitives.
//!
//! Everything here is single-threaded: waiters suspend the current task and
//! are woken in FIFO order on the same loop. The types are `Clone` handles
//! sharing interior state, which matches how connection tasks hand them
//! around.

use core::{cmp::Reverse, fmt};

use std::{
    cell::RefCell,
    collections::{BinaryHeap, VecDeque},
    rc::Rc,
};

use tokio::{sync::oneshot, time::Instant};

use crate::time::{TimeoutError, timeout_at};

/// queue of parked tasks, woken strictly in arrival order.
#[derive(Default)]
struct Waiters(VecDeque<oneshot::Sender<()>>);

impl Waiters {
    fn park(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.0.push_back(tx);
        rx
    }

    /// wake the oldest still-interested waiter.
    fn wake_one(&mut self) {
        while let Some(tx) = self.0.pop_front() {
            // a send error means the waiter timed out and dropped its end;
            // skip it and try the next.
            if tx.send(()).is_ok() {
                return;
            }
        }
    }

    fn wake_all(&mut self) {
        for tx in self.0.drain(..) {
            let _ = tx.send(());
        }
    }

    fn wake_n(&mut self, mut n: usize) {
        while n > 0 && !self.0.is_empty() {
            let before = self.0.len();
            self.wake_one();
            if self.0.len() < before {
                n -= 1;
            } else {
                break;
            }
        }
    }
}

/// `put_nowait` on a queue at capacity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is full")
    }
}

impl std::error::Error for QueueFull {}

/// `get_nowait` on an empty queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueEmpty;

impl fmt::Display for QueueEmpty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is empty")
    }
}

impl std::error::Error for QueueEmpty {}

trait Store<T>: Default {
    fn push(&mut self, item: T);
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;
}

struct FifoStore<T>(VecDeque<T>);

impl<T> Default for FifoStore<T> {
    fn default() -> Self {
        Self(VecDeque::new())
    }
}

impl<T> Store<T> for FifoStore<T> {
    fn push(&mut self, item: T) {
        self.0.push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

struct LifoStore<T>(Vec<T>);

impl<T> Default for LifoStore<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Store<T> for LifoStore<T> {
    fn push(&mut self, item: T) {
        self.0.push(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

struct PriorityStore<T: Ord>(BinaryHeap<Reverse<T>>);

impl<T: Ord> Default for PriorityStore<T> {
    fn default() -> Self {
        Self(BinaryHeap::new())
    }
}

impl<T: Ord> Store<T> for PriorityStore<T> {
    fn push(&mut self, item: T) {
        self.0.push(Reverse(item));
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop().map(|Reverse(t)| t)
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

struct QueueState<T, S: Store<T>> {
    store: S,
    maxsize: usize,
    getters: Waiters,
    putters: Waiters,
    unfinished_tasks: usize,
    join_waiters: Waiters,
    _marker: core::marker::PhantomData<T>,
}

struct QueueCore<T, S: Store<T>> {
    state: Rc<RefCell<QueueState<T, S>>>,
}

impl<T, S: Store<T>> Clone for QueueCore<T, S> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<T, S: Store<T>> QueueCore<T, S> {
    /// maxsize of 0 means unbounded.
    fn new(maxsize: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(QueueState {
                store: S::default(),
                maxsize,
                getters: Waiters::default(),
                putters: Waiters::default(),
                unfinished_tasks: 0,
                join_waiters: Waiters::default(),
                _marker: core::marker::PhantomData,
            })),
        }
    }

    fn len(&self) -> usize {
        self.state.borrow().store.len()
    }

    fn is_full(&self) -> bool {
        let state = self.state.borrow();
        state.maxsize != 0 && state.store.len() >= state.maxsize
    }

    /// push `item`, handing it back when the queue is at capacity.
    fn try_put(&self, item: T) -> Result<(), T> {
        let mut state = self.state.borrow_mut();
        if state.maxsize != 0 && state.store.len() >= state.maxsize {
            return Err(item);
        }
        state.store.push(item);
        state.unfinished_tasks += 1;
        state.getters.wake_one();
        Ok(())
    }

    fn put_nowait(&self, item: T) -> Result<(), QueueFull> {
        self.try_put(item).map_err(|_| QueueFull)
    }

    async fn put(&self, item: T, deadline: Option<Instant>) -> Result<(), TimeoutError> {
        let mut item = item;
        loop {
            match self.try_put(item) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    item = back;
                    let parked = self.state.borrow_mut().putters.park();
                    wait_parked(parked, deadline).await?;
                }
            }
        }
    }

    fn get_nowait(&self) -> Result<T, QueueEmpty> {
        let mut state = self.state.borrow_mut();
        match state.store.pop() {
            Some(item) => {
                state.putters.wake_one();
                Ok(item)
            }
            None => Err(QueueEmpty),
        }
    }

    async fn get(&self, deadline: Option<Instant>) -> Result<T, TimeoutError> {
        loop {
            match self.get_nowait() {
                Ok(item) => return Ok(item),
                Err(QueueEmpty) => {
                    let parked = self.state.borrow_mut().getters.park();
                    wait_parked(parked, deadline).await?;
                }
            }
        }
    }

    fn task_done(&self) {
        let mut state = self.state.borrow_mut();
        assert!(state.unfinished_tasks > 0, "task_done called more often than put");
        state.unfinished_tasks -= 1;
        if state.unfinished_tasks == 0 {
            state.join_waiters.wake_all();
        }
    }

    async fn join(&self, deadline: Option<Instant>) -> Result<(), TimeoutError> {
        loop {
            if self.state.borrow().unfinished_tasks == 0 {
                return Ok(());
            }
            let parked = self.state.borrow_mut().join_waiters.park();
            wait_parked(parked, deadline).await?;
        }
    }
}

async fn wait_parked(parked: oneshot::Receiver<()>, deadline: Option<Instant>) -> Result<(), TimeoutError> {
    match deadline {
        Some(at) => {
            // drop of the receiver on timeout invalidates the wake slot.
            timeout_at(at, parked).await?.map_err(|_| TimeoutError)
        }
        None => parked.await.map_err(|_| TimeoutError),
    }
}

macro_rules! queue_api {
    ($queue: ident, $store: ty $(, $bound: tt)?) => {
        impl<T $(: $bound)?> $queue<T> {
            /// construct with a capacity. 0 means unbounded.
            pub fn new(maxsize: usize) -> Self {
                Self(QueueCore::new(maxsize))
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_full(&self) -> bool {
                self.0.is_full()
            }

            /// add an item, waiting for room when the queue is at capacity.
            pub async fn put(&self, item: T) -> Result<(), TimeoutError> {
                self.0.put(item, None).await
            }

            /// like [Self::put] bounded by an absolute deadline.
            pub async fn put_timeout(&self, item: T, deadline: Instant) -> Result<(), TimeoutError> {
                self.0.put(item, Some(deadline)).await
            }

            pub fn put_nowait(&self, item: T) -> Result<(), QueueFull> {
                self.0.put_nowait(item)
            }

            /// remove an item, waiting when the queue is empty.
            pub async fn get(&self) -> T {
                self.0.get(None).await.expect("get without deadline can not time out")
            }

            /// like [Self::get] bounded by an absolute deadline.
            pub async fn get_timeout(&self, deadline: Instant) -> Result<T, TimeoutError> {
                self.0.get(Some(deadline)).await
            }

            pub fn get_nowait(&self) -> Result<T, QueueEmpty> {
                self.0.get_nowait()
            }

            /// signal that a previously gotten item is fully processed.
            pub fn task_done(&self) {
                self.0.task_done()
            }

            /// wait until every put item had a matching [Self::task_done].
            pub async fn join(&self) {
                self.0.join(None).await.expect("join without deadline can not time out")
            }

            pub async fn join_timeout(&self, deadline: Instant) -> Result<(), TimeoutError> {
                self.0.join(Some(deadline)).await
            }
        }

        impl<T $(: $bound)?> Clone for $queue<T> {
            fn clone(&self) -> Self {
                Self(self.0.clone())
            }
        }
    };
}

/// FIFO queue with cooperative blocking `put`/`get` and `join` accounting.
pub struct Queue<T>(QueueCore<T, FifoStore<T>>);

queue_api!(Queue, FifoStore<T>);

/// stack flavored queue; `get` returns the most recently put item.
pub struct LifoQueue<T>(QueueCore<T, LifoStore<T>>);

queue_api!(LifoQueue, LifoStore<T>);

/// min-heap flavored queue; `get` returns the smallest item.
pub struct PriorityQueue<T: Ord>(QueueCore<T, PriorityStore<T>>);

queue_api!(PriorityQueue, PriorityStore<T>, Ord);

/// A flag tasks can wait on.
#[derive(Clone, Default)]
pub struct Event {
    state: Rc<RefCell<(bool, Waiters)>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.state.borrow().0
    }

    /// set the flag and wake every waiter.
    pub fn set(&self) {
        let mut state = self.state.borrow_mut();
        state.0 = true;
        state.1.wake_all();
    }

    pub fn clear(&self) {
        self.state.borrow_mut().0 = false;
    }

    /// wait for the flag. resolves immediately when already set.
    pub async fn wait(&self) {
        self.wait_inner(None).await.expect("wait without deadline can not time out")
    }

    pub async fn wait_timeout(&self, deadline: Instant) -> Result<(), TimeoutError> {
        self.wait_inner(Some(deadline)).await
    }

    async fn wait_inner(&self, deadline: Option<Instant>) -> Result<(), TimeoutError> {
        loop {
            if self.state.borrow().0 {
                return Ok(());
            }
            let parked = self.state.borrow_mut().1.park();
            wait_parked(parked, deadline).await?;
        }
    }
}

/// Condition variable with FIFO wake-up.
#[derive(Clone, Default)]
pub struct Condition {
    waiters: Rc<RefCell<Waiters>>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// park until notified. returns `false` on deadline expiry.
    pub async fn wait(&self, deadline: Option<Instant>) -> bool {
        let parked = self.waiters.borrow_mut().park();
        wait_parked(parked, deadline).await.is_ok()
    }

    pub fn notify(&self, n: usize) {
        self.waiters.borrow_mut().wake_n(n);
    }

    pub fn notify_all(&self) {
        self.waiters.borrow_mut().wake_all();
    }
}

/// Counting semaphore with FIFO acquisition order.
#[derive(Clone)]
pub struct Semaphore {
    state: Rc<RefCell<(usize, Waiters)>>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new((permits, Waiters::default()))),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.0 > 0 {
            state.0 -= 1;
            true
        } else {
            false
        }
    }

    pub async fn acquire(&self) {
        self.acquire_inner(None).await.expect("acquire without deadline can not time out")
    }

    pub async fn acquire_timeout(&self, deadline: Instant) -> Result<(), TimeoutError> {
        self.acquire_inner(Some(deadline)).await
    }

    async fn acquire_inner(&self, deadline: Option<Instant>) -> Result<(), TimeoutError> {
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            let parked = self.state.borrow_mut().1.park();
            wait_parked(parked, deadline).await?;
        }
    }

    pub fn release(&self) {
        let mut state = self.state.borrow_mut();
        state.0 += 1;
        state.1.wake_one();
    }
}

/// Mutual exclusion with a drop-releasing guard.
#[derive(Clone)]
pub struct Lock {
    sem: Semaphore,
}

impl Lock {
    pub fn new() -> Self {
        Self { sem: Semaphore::new(1) }
    }

    pub async fn acquire(&self) -> LockGuard {
        self.sem.acquire().await;
        LockGuard { sem: self.sem.clone() }
    }

    pub async fn acquire_timeout(&self, deadline: Instant) -> Result<LockGuard, TimeoutError> {
        self.sem.acquire_timeout(deadline).await?;
        Ok(LockGuard { sem: self.sem.clone() })
    }
}

/// releases the owning [Lock] on drop.
pub struct LockGuard {
    sem: Semaphore,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use crate::time::deadline;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    fn local<F: core::future::Future>(fut: F) -> F::Output {
        rt().block_on(tokio::task::LocalSet::new().run_until(fut))
    }

    #[test]
    fn queue_is_fifo_and_bounded() {
        local(async {
            let q = Queue::new(2);
            q.put_nowait(1).unwrap();
            q.put_nowait(2).unwrap();
            assert_eq!(q.put_nowait(3), Err(QueueFull));
            assert_eq!(q.get().await, 1);
            assert_eq!(q.get().await, 2);
            assert_eq!(q.get_nowait(), Err(QueueEmpty));
        });
    }

    #[test]
    fn blocked_put_resumes_after_get() {
        local(async {
            let q = Queue::new(1);
            q.put_nowait(1).unwrap();
            let q2 = q.clone();
            let putter = tokio::task::spawn_local(async move { q2.put(2).await });
            tokio::task::yield_now().await;
            assert_eq!(q.get().await, 1);
            putter.await.unwrap().unwrap();
            assert_eq!(q.get().await, 2);
        });
    }

    #[test]
    fn get_timeout_expires() {
        local(async {
            let q: Queue<u8> = Queue::new(0);
            let res = q.get_timeout(deadline(Duration::from_millis(10))).await;
            assert_eq!(res, Err(TimeoutError));
        });
    }

    #[test]
    fn join_waits_for_task_done() {
        local(async {
            let q = Queue::new(0);
            q.put_nowait("job").unwrap();
            let q2 = q.clone();
            let worker = tokio::task::spawn_local(async move {
                let _job = q2.get().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                q2.task_done();
            });
            q.join().await;
            worker.await.unwrap();
        });
    }

    #[test]
    fn priority_queue_pops_smallest() {
        local(async {
            let q = PriorityQueue::new(0);
            q.put_nowait(3).unwrap();
            q.put_nowait(1).unwrap();
            q.put_nowait(2).unwrap();
            assert_eq!(q.get().await, 1);
            assert_eq!(q.get().await, 2);
            assert_eq!(q.get().await, 3);
        });
    }

    #[test]
    fn lifo_queue_pops_newest() {
        local(async {
            let q = LifoQueue::new(0);
            q.put_nowait(1).unwrap();
            q.put_nowait(2).unwrap();
            assert_eq!(q.get().await, 2);
            assert_eq!(q.get().await, 1);
        });
    }

    #[test]
    fn event_wakes_all_waiters() {
        local(async {
            let e = Event::new();
            let e2 = e.clone();
            let w = tokio::task::spawn_local(async move { e2.wait().await });
            tokio::task::yield_now().await;
            e.set();
            w.await.unwrap();
            // a set event resolves immediately.
            e.wait().await;
            e.clear();
            assert!(!e.is_set());
        });
    }

    #[test]
    fn lock_serializes_critical_sections() {
        local(async {
            let lock = Lock::new();
            let counter = Rc::new(RefCell::new(0u32));
            let mut tasks = Vec::new();
            for _ in 0..3 {
                let lock = lock.clone();
                let counter = counter.clone();
                tasks.push(tokio::task::spawn_local(async move {
                    let _guard = lock.acquire().await;
                    let v = *counter.borrow();
                    tokio::task::yield_now().await;
                    *counter.borrow_mut() = v + 1;
                }));
            }
            for t in tasks {
                t.await.unwrap();
            }
            assert_eq!(*counter.borrow(), 3);
        });
    }

    #[test]
    fn semaphore_fifo() {
        local(async {
            let sem = Semaphore::new(1);
            sem.acquire().await;
            let order = Rc::new(RefCell::new(Vec::new()));
            let mut tasks = Vec::new();
            for i in 0..3 {
                let sem = sem.clone();
                let order = order.clone();
                tasks.push(tokio::task::spawn_local(async move {
                    sem.acquire().await;
                    order.borrow_mut().push(i);
                    sem.release();
                }));
                // make each waiter park before spawning the next.
                tokio::task::yield_now().await;
            }
            sem.release();
            for t in tasks {
                t.await.unwrap();
            }
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
        });
    }
}
