//! Timer file descriptions
//!
//! A timerfd counts expirations of its backing timer. `read` returns the
//! 8-byte little-endian count accumulated since the last successful read
//! and resets it; an empty counter reads as `WouldBlock`. Short destination
//! buffers fail before the counter is consumed.

use crate::{
    errors::{TimeError, VfsError, WaiterError},
    time::{Clock, KernelTime, SavedTimer, Setting, Timer, TimerListener},
    vfs::{FileCaps, FileDescription, FileDescriptionOps, SavedDescription},
    waiter::{EventCallback, EventMask, Queue, WaitKey, Waitable},
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

pub struct TimerFile {
    events: Queue,
    timer: Timer,
    /// Expirations since the last successful read or set.
    val: AtomicU64,
}

impl TimerFile {
    /// Creates a timerfd on `clock`, returning the description and the
    /// typed handle used for set/get and pause/resume.
    pub fn new(clock: Arc<dyn Clock>) -> (Arc<FileDescription>, Arc<TimerFile>) {
        let file = Arc::new_cyclic(|weak: &Weak<TimerFile>| TimerFile {
            events: Queue::new(),
            timer: Timer::new(clock, weak.clone() as Weak<dyn TimerListener>),
            val: AtomicU64::new(0),
        });
        let fd = FileDescription::new_anonymous("[timerfd]", file.clone());
        (fd, file)
    }

    /// Rebuilds a timerfd from its serialized image.
    pub fn restore(
        clock: Arc<dyn Clock>,
        saved: SavedTimer,
        val: u64,
    ) -> (Arc<FileDescription>, Arc<TimerFile>) {
        let file = Arc::new_cyclic(|weak: &Weak<TimerFile>| TimerFile {
            events: Queue::new(),
            timer: Timer::restore(clock, weak.clone() as Weak<dyn TimerListener>, saved),
            val: AtomicU64::new(val),
        });
        let fd = FileDescription::new_anonymous("[timerfd]", file.clone());
        (fd, file)
    }

    /// Atomically replaces the timer setting, resetting the expiration
    /// counter. Returns the observed time and the prior setting.
    pub fn set_time(&self, setting: Setting) -> Result<(KernelTime, Setting), TimeError> {
        self.timer.set(setting, || self.val.store(0, Ordering::SeqCst))
    }

    /// The current setting and the time at which it was observed.
    pub fn get_time(&self) -> (KernelTime, Setting) {
        self.timer.get()
    }

    pub fn clock_id(&self) -> crate::time::ClockId {
        self.timer.clock().id()
    }

    pub fn pause(&self) {
        self.timer.pause();
    }

    pub fn resume(&self) -> Result<(), TimeError> {
        self.timer.resume()
    }
}

impl TimerListener for TimerFile {
    fn notify_timer(&self, exp: u64) {
        self.val.fetch_add(exp, Ordering::SeqCst);
        self.events.notify(EventMask::READABLE);
    }
}

impl Waitable for TimerFile {
    fn readiness(&self, mask: EventMask) -> EventMask {
        let mut ready = EventMask::empty();
        if self.val.load(Ordering::SeqCst) != 0 {
            ready |= EventMask::READABLE;
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

impl FileDescriptionOps for TimerFile {
    fn read(&self, dst: &mut [u8]) -> Result<usize, VfsError> {
        const SIZEOF_U64: usize = 8;
        // checked before the swap so a short buffer never consumes the count
        if dst.len() < SIZEOF_U64 {
            return Err(VfsError::InvalidArgument);
        }
        let val = self.val.swap(0, Ordering::SeqCst);
        if val == 0 {
            return Err(VfsError::WouldBlock);
        }
        dst[..SIZEOF_U64].copy_from_slice(&val.to_le_bytes());
        Ok(SIZEOF_U64)
    }

    fn write(&self, _src: &[u8]) -> Result<usize, VfsError> {
        Err(VfsError::NotPermitted)
    }

    fn caps(&self) -> FileCaps {
        FileCaps::READ | FileCaps::EPOLLABLE
    }

    fn pause_timers(&self) {
        self.timer.pause();
    }

    fn resume_timers(&self) {
        // restored timers land paused; an unpaused timer here is a bug in
        // the caller's pause bracket, not ours
        if let Err(err) = self.timer.resume() {
            log::warn!("timerfd resume: {}", err);
        }
    }

    fn save(&self) -> Option<SavedDescription> {
        Some(SavedDescription::TimerFd {
            clock: self.timer.clock().id(),
            timer: self.timer.save(),
            val: self.val.load(Ordering::SeqCst),
        })
    }

    fn release(&self) {
        self.timer.destroy();
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MonotonicClock;
    use std::{thread, time::Duration};

    const MS: i64 = 1_000_000;

    fn new_timerfd() -> (Arc<FileDescription>, Arc<TimerFile>) {
        TimerFile::new(Arc::new(MonotonicClock::new()))
    }

    #[test]
    fn read_reports_expirations_then_blocks() {
        let (fd, timer) = new_timerfd();
        timer
            .set_time(Setting {
                enabled: true,
                initial: 10 * MS,
                interval: 10 * MS,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(35));

        let mut buf = [0u8; 8];
        assert_eq!(fd.read(&mut buf).unwrap(), 8);
        let count = u64::from_le_bytes(buf);
        assert!((3..=4).contains(&count), "expirations: {}", count);

        match fd.read(&mut buf) {
            Err(VfsError::WouldBlock) => {}
            other => panic!("expected WouldBlock, got {:?}", other),
        }
    }

    #[test]
    fn short_buffer_does_not_consume() {
        let (fd, timer) = new_timerfd();
        timer
            .set_time(Setting {
                enabled: true,
                initial: 1,
                interval: 0,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let mut short = [0u8; 4];
        assert!(matches!(
            fd.read(&mut short),
            Err(VfsError::InvalidArgument)
        ));
        let mut buf = [0u8; 8];
        assert_eq!(fd.read(&mut buf).unwrap(), 8);
        assert_eq!(u64::from_le_bytes(buf), 1);
    }

    #[test]
    fn set_time_resets_counter_and_returns_prior() {
        let (fd, timer) = new_timerfd();
        timer
            .set_time(Setting {
                enabled: true,
                initial: 1,
                interval: 0,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let (_, prior) = timer
            .set_time(Setting {
                enabled: true,
                initial: 500 * MS,
                interval: 20 * MS,
            })
            .unwrap();
        assert!(!prior.enabled);

        let mut buf = [0u8; 8];
        assert!(matches!(fd.read(&mut buf), Err(VfsError::WouldBlock)));

        let (_, current) = timer.get_time();
        assert!(current.enabled);
        assert_eq!(current.interval, 20 * MS);
    }

    #[test]
    fn expiration_notifies_readable() {
        let (fd, timer) = new_timerfd();
        let cell = crate::context::WaitCell::new();
        let fire = cell.clone();
        fd.event_register(
            EventMask::READABLE,
            Arc::new(move |_| {
                fire.fire();
            }),
        )
        .unwrap();
        timer
            .set_time(Setting {
                enabled: true,
                initial: 5 * MS,
                interval: 0,
            })
            .unwrap();
        let ctx = crate::context::Context::background(Arc::new(MonotonicClock::new()));
        ctx.block_on(&cell).unwrap();
        assert_eq!(
            fd.readiness(EventMask::READABLE | EventMask::WRITABLE),
            EventMask::READABLE
        );
    }

    #[test]
    fn save_restore_preserves_counter_and_remaining() {
        let (fd, timer) = new_timerfd();
        timer
            .set_time(Setting {
                enabled: true,
                initial: 5 * MS,
                interval: 300 * MS,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        timer.pause();

        let saved = fd.save().unwrap();
        let (restored_fd, restored) = match &saved {
            SavedDescription::TimerFd { clock: _, timer, val } => {
                TimerFile::restore(Arc::new(MonotonicClock::new()), *timer, *val)
            }
            other => panic!("unexpected image: {:?}", other),
        };
        restored.resume().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(restored_fd.read(&mut buf).unwrap(), 8);
        assert_eq!(u64::from_le_bytes(buf), 1);
        let (_, setting) = restored.get_time();
        assert!(setting.enabled);
        assert_eq!(setting.interval, 300 * MS);
    }

    #[test]
    fn release_tears_down_queue() {
        let (fd, _timer) = new_timerfd();
        fd.dec_ref();
        assert!(matches!(
            fd.event_register(EventMask::READABLE, Arc::new(|_| {})),
            Err(WaiterError::QueueClosed)
        ));
    }
}
