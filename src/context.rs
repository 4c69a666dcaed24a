//! Cancellation contexts for blocking kernel operations
//!
//! Every blocking operation accepts a [`Context`]. Cancellation is prompt
//! but not preemptive: an in-flight operation runs to completion and the
//! next suspension point returns `Canceled`. Timeouts are absolute deadlines
//! on the monotonic clock; both cancellation and deadline expiry wake any
//! parked waiter registered with the context.

use crate::{
    errors::KernelError,
    sync::{ClassCondvar, ClassMutex, CLASS_WAIT_CELL},
    time::{Clock, KernelTime},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

/// A cell a blocked thread parks on. Contexts keep weak references to the
/// cells of their in-flight waits so `cancel` can wake them.
pub struct WaitCell {
    pub(crate) mu: ClassMutex<bool>,
    pub(crate) cond: ClassCondvar,
}

impl WaitCell {
    pub fn new() -> Arc<WaitCell> {
        Arc::new(WaitCell {
            mu: ClassMutex::new(&CLASS_WAIT_CELL, false),
            cond: ClassCondvar::new(),
        })
    }

    /// Marks the cell signaled and wakes the parked thread.
    pub fn fire(&self) {
        let mut signaled = self.mu.lock();
        *signaled = true;
        self.cond.notify_all();
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        WaitCell {
            mu: ClassMutex::new(&CLASS_WAIT_CELL, false),
            cond: ClassCondvar::new(),
        }
    }
}

struct ContextInner {
    cancelled: AtomicBool,
    deadline: Option<KernelTime>,
    clock: Arc<dyn Clock>,
    cells: Mutex<Vec<Weak<WaitCell>>>,
}

/// Handle threaded through blocking entry points.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A context that never cancels and never expires.
    pub fn background(clock: Arc<dyn Clock>) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                clock,
                cells: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A child context with an absolute monotonic deadline.
    pub fn with_deadline(&self, deadline: KernelTime) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
                clock: self.inner.clock.clone(),
                cells: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Requests cancellation and wakes every parked waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let cells = self.inner.cells.lock().unwrap();
        for cell in cells.iter() {
            if let Some(cell) = cell.upgrade() {
                cell.fire();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the error a suspension point should surface right now, if
    /// any. Cancellation takes precedence over deadline expiry.
    pub fn check(&self) -> Result<(), KernelError> {
        if self.is_cancelled() {
            return Err(KernelError::Canceled);
        }
        if let Some(deadline) = self.inner.deadline {
            if self.inner.clock.now() >= deadline {
                return Err(KernelError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Remaining time until the deadline, if one is set.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.inner.deadline.map(|deadline| {
            let now = self.inner.clock.now();
            if now >= deadline {
                std::time::Duration::ZERO
            } else {
                std::time::Duration::from_nanos((deadline.nanoseconds() - now.nanoseconds()) as u64)
            }
        })
    }

    pub(crate) fn attach(&self, cell: &Arc<WaitCell>) {
        let mut cells = self.inner.cells.lock().unwrap();
        cells.retain(|c| c.strong_count() > 0);
        cells.push(Arc::downgrade(cell));
    }

    /// Parks on `cell` until it fires, the context cancels, or the deadline
    /// passes. The cell's signaled flag is consumed.
    pub fn block_on(&self, cell: &Arc<WaitCell>) -> Result<(), KernelError> {
        self.attach(cell);
        let mut signaled = cell.mu.lock();
        loop {
            if *signaled {
                *signaled = false;
                return Ok(());
            }
            if let Err(err) = self.check() {
                return Err(err);
            }
            match self.remaining() {
                None => {
                    signaled = cell.cond.wait(signaled);
                }
                Some(timeout) => {
                    let (guard, _timed_out) = cell.cond.wait_timeout(signaled, timeout);
                    signaled = guard;
                }
            }
        }
    }
}
