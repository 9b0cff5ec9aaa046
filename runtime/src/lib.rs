//! Single threaded cooperative scheduling for gale.
//!
//! One [EventLoop] per thread drives every IO readiness event, timer and
//! queued callback serially; no two callbacks ever overlap. Cross-thread
//! interaction is restricted to [LoopHandle::add_callback] and the blocking
//! executor bridge.
//!
//! The loop is a thin shell over a current-thread tokio runtime plus a
//! `LocalSet`; suspension points are ordinary `await`s, cancellation is
//! dropping (or aborting) a task.

#![forbid(unsafe_code)]

mod event_loop;
mod time;

pub mod sync;

pub use self::{
    event_loop::{EventLoop, ExecutorError, LoopHandle, TaskHandle, TimerHandle, call_at, call_later, spawn},
    time::{TimeoutError, deadline, timeout, timeout_at},
};
