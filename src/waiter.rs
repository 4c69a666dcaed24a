//! Readiness masks and the waiter/notifier graph
//!
//! Every waitable kernel object owns a [`Queue`] of `(mask, callback)`
//! entries. Notification with mask `E` invokes each entry whose mask
//! intersects `E`, in registration order. Notifiers take the queue's read
//! side so they may run concurrently; registration and removal take the
//! write side, so a notification can never be observed by an entry after
//! its `event_unregister` has returned.

use crate::{
    context::{Context, WaitCell},
    errors::{KernelError, WaiterError},
    sync::{ClassRwLock, CLASS_WAITER_QUEUE},
};
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Readiness event mask, mirroring the poll events the guest sees.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EventMask: u64 {
        const READABLE = 0x01;
        const WRITABLE = 0x04;
        const ERROR = 0x08;
        const HANGUP = 0x10;
    }
}

/// Key identifying a registered entry within its queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitKey(u64);

pub type EventCallback = Arc<dyn Fn(EventMask) + Send + Sync>;

struct Entry {
    key: WaitKey,
    mask: EventMask,
    callback: EventCallback,
}

struct QueueInner {
    entries: Vec<Entry>,
    next_key: u64,
    closed: bool,
}

/// Registration-ordered waiter queue attached to a waitable object.
pub struct Queue {
    inner: ClassRwLock<QueueInner>,
}

impl Queue {
    pub fn new() -> Queue {
        Queue {
            inner: ClassRwLock::new(
                &CLASS_WAITER_QUEUE,
                QueueInner {
                    entries: Vec::new(),
                    next_key: 1,
                    closed: false,
                },
            ),
        }
    }

    /// Attaches an entry. Fails only while the queue is being torn down.
    pub fn event_register(
        &self,
        mask: EventMask,
        callback: EventCallback,
    ) -> Result<WaitKey, WaiterError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(WaiterError::QueueClosed);
        }
        let key = WaitKey(inner.next_key);
        inner.next_key += 1;
        inner.entries.push(Entry {
            key,
            mask,
            callback,
        });
        Ok(key)
    }

    /// Detaches an entry. Idempotent; unknown keys are ignored.
    pub fn event_unregister(&self, key: WaitKey) {
        let mut inner = self.inner.write();
        inner.entries.retain(|entry| entry.key != key);
    }

    /// Invokes every registered callback whose mask intersects `mask`, in
    /// registration order.
    pub fn notify(&self, mask: EventMask) {
        let inner = self.inner.read();
        for entry in &inner.entries {
            if entry.mask.intersects(mask) {
                (entry.callback)(mask & entry.mask);
            }
        }
    }

    /// Marks the queue closed; further registrations fail with
    /// `QueueClosed`. Existing entries are dropped.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Queue::new()
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Queue").field("len", &self.len()).finish()
    }
}

/// A waitable kernel object: anything exposing readiness and a queue.
pub trait Waitable {
    /// Returns the subset of `mask` that is currently ready.
    fn readiness(&self, mask: EventMask) -> EventMask;

    fn event_register(
        &self,
        mask: EventMask,
        callback: EventCallback,
    ) -> Result<WaitKey, WaiterError>;

    fn event_unregister(&self, key: WaitKey);
}

/// Blocks until `waitable` reports readiness intersecting `mask`, the
/// context cancels, or its deadline passes. Level-triggered: readiness
/// already present returns immediately.
pub fn wait_for<W: Waitable + ?Sized>(
    waitable: &W,
    mask: EventMask,
    ctx: &Context,
) -> Result<EventMask, KernelError> {
    let cell = WaitCell::new();
    let fire_cell = cell.clone();
    let key = waitable
        .event_register(
            mask,
            Arc::new(move |_events| {
                fire_cell.fire();
            }),
        )
        .map_err(|err| KernelError::Vfs(err.into()))?;
    let result = loop {
        let ready = waitable.readiness(mask);
        if !ready.is_empty() {
            break Ok(ready);
        }
        if let Err(err) = ctx.block_on(&cell) {
            break Err(err);
        }
    };
    waitable.event_unregister(key);
    result
}
