//! Event file descriptions
//!
//! An eventfd is an 8-byte kernel counter. Reads drain it to zero (counter
//! mode) or decrement it by one (semaphore mode); writes add to it, with
//! `WouldBlock` when the sum would overflow. Both sides notify the waiter
//! queue.

use crate::{
    errors::{VfsError, WaiterError},
    vfs::{FileCaps, FileDescription, FileDescriptionOps, SavedDescription},
    waiter::{EventCallback, EventMask, Queue, WaitKey, Waitable},
};
use std::sync::{Arc, Mutex};

/// Linux rejects writes that would push the counter to u64::MAX.
const MAX_COUNTER: u64 = u64::MAX - 1;

pub struct EventFile {
    events: Queue,
    val: Mutex<u64>,
    semaphore: bool,
}

impl EventFile {
    pub fn new(initval: u64, semaphore: bool) -> (Arc<FileDescription>, Arc<EventFile>) {
        let file = Arc::new(EventFile {
            events: Queue::new(),
            val: Mutex::new(initval),
            semaphore,
        });
        let fd = FileDescription::new_anonymous("[eventfd]", file.clone());
        (fd, file)
    }

    /// Rebuilds an eventfd from its serialized image.
    pub fn restore(val: u64, semaphore: bool) -> (Arc<FileDescription>, Arc<EventFile>) {
        EventFile::new(val, semaphore)
    }

    pub fn value(&self) -> u64 {
        *self.val.lock().unwrap()
    }

    pub fn is_semaphore(&self) -> bool {
        self.semaphore
    }
}

impl Waitable for EventFile {
    fn readiness(&self, mask: EventMask) -> EventMask {
        let val = *self.val.lock().unwrap();
        let mut ready = EventMask::empty();
        if val > 0 {
            ready |= EventMask::READABLE;
        }
        if val < MAX_COUNTER {
            ready |= EventMask::WRITABLE;
        }
        ready & mask
    }

    fn event_register(
        &self,
        mask: EventMask,
        callback: EventCallback,
    ) -> Result<WaitKey, WaiterError> {
        self.events.event_register(mask, callback)
    }

    fn event_unregister(&self, key: WaitKey) {
        self.events.event_unregister(key);
    }
}

impl FileDescriptionOps for EventFile {
    fn read(&self, dst: &mut [u8]) -> Result<usize, VfsError> {
        const SIZEOF_U64: usize = 8;
        if dst.len() < SIZEOF_U64 {
            return Err(VfsError::InvalidArgument);
        }
        let out = {
            let mut val = self.val.lock().unwrap();
            if *val == 0 {
                return Err(VfsError::WouldBlock);
            }
            if self.semaphore {
                *val -= 1;
                1
            } else {
                std::mem::take(&mut *val)
            }
        };
        dst[..SIZEOF_U64].copy_from_slice(&out.to_le_bytes());
        self.events.notify(EventMask::WRITABLE);
        Ok(SIZEOF_U64)
    }

    fn write(&self, src: &[u8]) -> Result<usize, VfsError> {
        const SIZEOF_U64: usize = 8;
        if src.len() < SIZEOF_U64 {
            return Err(VfsError::InvalidArgument);
        }
        let add = u64::from_le_bytes(src[..SIZEOF_U64].try_into().unwrap());
        if add == u64::MAX {
            return Err(VfsError::InvalidArgument);
        }
        {
            let mut val = self.val.lock().unwrap();
            if MAX_COUNTER - *val < add {
                return Err(VfsError::WouldBlock);
            }
            *val += add;
        }
        self.events.notify(EventMask::READABLE);
        Ok(SIZEOF_U64)
    }

    fn caps(&self) -> FileCaps {
        FileCaps::READ | FileCaps::WRITE | FileCaps::EPOLLABLE
    }

    fn save(&self) -> Option<SavedDescription> {
        Some(SavedDescription::EventFd {
            val: *self.val.lock().unwrap(),
            semaphore: self.semaphore,
        })
    }

    fn release(&self) {
        self.events.close();
    }
}
