//! Monotonic and realtime clocks, and the pausable timers built on them
//!
//! A [`Timer`] is a state machine over {Disabled, Armed, Paused} driven by a
//! dedicated worker thread parked on a condvar deadline. Expirations are
//! delivered to the timer's listener while the timer mutex is held, so a
//! `pause()` that has returned implies no further listener invocations until
//! `resume()`. Listeners therefore must not call back into timer operations.

use crate::{
    errors::TimeError,
    sync::{ClassCondvar, ClassMutex, CLASS_TIMER},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// A point on a kernel clock, in nanoseconds from the clock's epoch.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct KernelTime(i64);

impl KernelTime {
    pub fn from_nanos(ns: i64) -> KernelTime {
        KernelTime(ns)
    }

    pub fn nanoseconds(&self) -> i64 {
        self.0
    }

    pub fn add_nanos(&self, ns: i64) -> KernelTime {
        KernelTime(self.0.saturating_add(ns))
    }

    /// Nanoseconds from `earlier` to `self`, saturating at zero.
    pub fn since(&self, earlier: KernelTime) -> i64 {
        (self.0 - earlier.0).max(0)
    }
}

impl fmt::Display for KernelTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ClockId {
    Monotonic,
    Realtime,
}

/// A kernel clock. `Monotonic` never moves backward and is unaffected by
/// wall-clock adjustments; `Realtime` may jump.
pub trait Clock: Send + Sync {
    fn now(&self) -> KernelTime;
    fn id(&self) -> ClockId;
}

pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> KernelTime {
        KernelTime(self.epoch.elapsed().as_nanos() as i64)
    }

    fn id(&self) -> ClockId {
        ClockId::Monotonic
    }
}

pub struct RealtimeClock;

impl Clock for RealtimeClock {
    fn now(&self) -> KernelTime {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => KernelTime(elapsed.as_nanos() as i64),
            Err(before) => KernelTime(-(before.duration().as_nanos() as i64)),
        }
    }

    fn id(&self) -> ClockId {
        ClockId::Realtime
    }
}

/// Timer configuration: time to first expiration, repeat interval, armed
/// flag. Durations are nanoseconds and must be non-negative.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub enabled: bool,
    pub initial: i64,
    pub interval: i64,
}

/// Receiver for timer expirations. `exp` is the number of periods crossed
/// since the previous delivery.
pub trait TimerListener: Send + Sync {
    fn notify_timer(&self, exp: u64);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
enum TimerState {
    Disabled,
    Armed { next: KernelTime, period: i64 },
    Paused { remaining: i64, period: i64 },
}

/// Serialized form of a timer. Deadlines are stored clock-relative so they
/// survive wall-clock shifts between checkpoint and restore.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SavedTimer {
    Disabled,
    Armed { remaining: i64, period: i64 },
    Paused { remaining: i64, period: i64 },
}

struct TimerShared {
    clock: Arc<dyn Clock>,
    listener: Weak<dyn TimerListener>,
    mu: ClassMutex<TimerMut>,
    cond: ClassCondvar,
}

struct TimerMut {
    state: TimerState,
    destroyed: bool,
}

/// A one-shot or periodic timer bound to a clock and a listener.
pub struct Timer {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Timer {
    pub fn new(clock: Arc<dyn Clock>, listener: Weak<dyn TimerListener>) -> Timer {
        let shared = Arc::new(TimerShared {
            clock,
            listener,
            mu: ClassMutex::new(
                &CLASS_TIMER,
                TimerMut {
                    state: TimerState::Disabled,
                    destroyed: false,
                },
            ),
            cond: ClassCondvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || timer_worker(worker_shared))
            .expect("spawning timer worker");
        Timer {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Reconstructs a timer from its serialized state.
    pub fn restore(
        clock: Arc<dyn Clock>,
        listener: Weak<dyn TimerListener>,
        saved: SavedTimer,
    ) -> Timer {
        let timer = Timer::new(clock, listener);
        {
            let mut state = timer.shared.mu.lock();
            state.state = match saved {
                SavedTimer::Disabled => TimerState::Disabled,
                SavedTimer::Armed { remaining, period } => TimerState::Armed {
                    next: timer.shared.clock.now().add_nanos(remaining),
                    period,
                },
                SavedTimer::Paused { remaining, period } => {
                    TimerState::Paused { remaining, period }
                }
            };
            timer.shared.cond.notify_all();
        }
        timer
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    /// Atomically replaces the setting, invoking `reset_fn` under the timer
    /// mutex. Returns the observed time and the prior setting.
    pub fn set<F: FnOnce()>(
        &self,
        setting: Setting,
        reset_fn: F,
    ) -> Result<(KernelTime, Setting), TimeError> {
        if setting.initial < 0 || setting.interval < 0 {
            return Err(TimeError::InvalidSetting);
        }
        let mut state = self.shared.mu.lock();
        let now = self.shared.clock.now();
        let prior = snapshot(state.state, now);
        reset_fn();
        state.state = if setting.enabled {
            TimerState::Armed {
                next: now.add_nanos(setting.initial),
                period: setting.interval,
            }
        } else {
            TimerState::Disabled
        };
        self.shared.cond.notify_all();
        Ok((now, prior))
    }

    /// Returns the observed time and the current setting, with `initial`
    /// reported as the remaining time to the next expiration.
    pub fn get(&self) -> (KernelTime, Setting) {
        let state = self.shared.mu.lock();
        let now = self.shared.clock.now();
        (now, snapshot(state.state, now))
    }

    /// Captures the remaining time to the next expiration and stops
    /// deliveries. Idempotent.
    pub fn pause(&self) {
        let mut state = self.shared.mu.lock();
        if let TimerState::Armed { next, period } = state.state {
            let now = self.shared.clock.now();
            state.state = TimerState::Paused {
                remaining: next.since(now),
                period,
            };
        }
    }

    /// Re-arms from the captured remaining time, relative to the clock's
    /// current reading.
    pub fn resume(&self) -> Result<(), TimeError> {
        let mut state = self.shared.mu.lock();
        match state.state {
            TimerState::Paused { remaining, period } => {
                let now = self.shared.clock.now();
                state.state = TimerState::Armed {
                    next: now.add_nanos(remaining),
                    period,
                };
                self.shared.cond.notify_all();
                Ok(())
            }
            _ => Err(TimeError::NotPaused),
        }
    }

    /// Serialized snapshot for checkpoint.
    pub fn save(&self) -> SavedTimer {
        let state = self.shared.mu.lock();
        match state.state {
            TimerState::Disabled => SavedTimer::Disabled,
            TimerState::Armed { next, period } => SavedTimer::Armed {
                remaining: next.since(self.shared.clock.now()),
                period,
            },
            TimerState::Paused { remaining, period } => {
                SavedTimer::Paused { remaining, period }
            }
        }
    }

    /// Releases pending expirations and stops the worker. Subsequent calls
    /// are no-ops.
    pub fn destroy(&self) {
        {
            let mut state = self.shared.mu.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.state = TimerState::Disabled;
            self.shared.cond.notify_all();
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (now, setting) = self.get();
        f.debug_struct("Timer")
            .field("clock", &self.shared.clock.id())
            .field("now", &now)
            .field("setting", &setting)
            .finish()
    }
}

fn snapshot(state: TimerState, now: KernelTime) -> Setting {
    match state {
        TimerState::Disabled => Setting::default(),
        TimerState::Armed { next, period } => Setting {
            enabled: true,
            initial: next.since(now),
            interval: period,
        },
        TimerState::Paused { remaining, period } => Setting {
            enabled: true,
            initial: remaining,
            interval: period,
        },
    }
}

fn timer_worker(shared: Arc<TimerShared>) {
    let mut state = shared.mu.lock();
    loop {
        if state.destroyed {
            break;
        }
        match state.state {
            TimerState::Armed { next, period } => {
                let now = shared.clock.now();
                if now >= next {
                    let exp;
                    if period > 0 {
                        let missed = 1 + (now.since(next) / period) as u64;
                        exp = missed;
                        state.state = TimerState::Armed {
                            next: next.add_nanos(period.saturating_mul(missed as i64)),
                            period,
                        };
                    } else {
                        exp = 1;
                        state.state = TimerState::Disabled;
                    }
                    if let Some(listener) = shared.listener.upgrade() {
                        listener.notify_timer(exp);
                    }
                } else {
                    let timeout = Duration::from_nanos(next.since(now) as u64);
                    let (guard, _) = shared.cond.wait_timeout(state, timeout);
                    state = guard;
                }
            }
            _ => {
                state = shared.cond.wait(state);
            }
        }
    }
}
