//! Lock-class-checked synchronization primitives
//!
//! Every long-lived kernel lock belongs to a [`LockClass`] with a fixed rank.
//! Acquisitions must happen in increasing rank order within a thread; taking
//! a lock whose rank is not greater than the highest rank already held is a
//! fatal bug and panics. Nested locks of the same class must go through
//! `lock_nested`.

use std::{
    cell::RefCell,
    sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// A declared lock class. Classes are static; their ranks define the partial
/// order enforced at acquisition time.
#[derive(Debug)]
pub struct LockClass {
    pub name: &'static str,
    pub rank: u32,
}

pub static CLASS_PID_TABLE: LockClass = LockClass { name: "pid-table", rank: 20 };
pub static CLASS_THREAD_GROUP: LockClass = LockClass { name: "thread-group", rank: 30 };
pub static CLASS_FD_TABLE: LockClass = LockClass { name: "fd-table", rank: 40 };
pub static CLASS_MOUNT_NS: LockClass = LockClass { name: "mount-ns", rank: 45 };
pub static CLASS_MEMORY_FILE: LockClass = LockClass { name: "memory-file", rank: 50 };
pub static CLASS_TIMER: LockClass = LockClass { name: "timer", rank: 60 };
pub static CLASS_WAITER_QUEUE: LockClass = LockClass { name: "waiter-queue", rank: 70 };
pub static CLASS_WAIT_CELL: LockClass = LockClass { name: "wait-cell", rank: 80 };

thread_local! {
    static HELD: RefCell<Vec<(u32, &'static str)>> = const { RefCell::new(Vec::new()) };
}

fn push_class(class: &'static LockClass, nested: bool) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(&(top_rank, top_name)) = held.last() {
            let ok = if nested {
                top_rank == class.rank
            } else {
                top_rank < class.rank
            };
            if !ok {
                panic!(
                    "lock order violation: acquiring {:?} (rank {}) while holding {:?} (rank {})",
                    class.name, class.rank, top_name, top_rank
                );
            }
        } else if nested {
            panic!(
                "nested lock of {:?} taken with no lock of that class held",
                class.name
            );
        }
        held.push((class.rank, class.name));
    });
}

fn pop_class(class: &'static LockClass) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        match held.pop() {
            Some((rank, _)) if rank == class.rank => {}
            other => panic!(
                "unbalanced lock release of {:?}, top of stack was {:?}",
                class.name, other
            ),
        }
    });
}

/// Mutex carrying a lock class.
#[derive(Debug)]
pub struct ClassMutex<T> {
    class: &'static LockClass,
    inner: Mutex<T>,
}

pub struct ClassMutexGuard<'a, T> {
    class: &'static LockClass,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> ClassMutex<T> {
    pub fn new(class: &'static LockClass, value: T) -> Self {
        ClassMutex {
            class,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> ClassMutexGuard<'_, T> {
        push_class(self.class, false);
        ClassMutexGuard {
            class: self.class,
            guard: Some(self.inner.lock().unwrap()),
        }
    }

    /// Locks knowing that another lock of the same class is already held.
    pub fn lock_nested(&self) -> ClassMutexGuard<'_, T> {
        push_class(self.class, true);
        ClassMutexGuard {
            class: self.class,
            guard: Some(self.inner.lock().unwrap()),
        }
    }
}

impl<T> std::ops::Deref for ClassMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for ClassMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for ClassMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        pop_class(self.class);
    }
}

/// Condvar usable with [`ClassMutex`] guards. The class is released from the
/// held stack for the duration of the wait, since the mutex itself is
/// released while blocked.
#[derive(Debug, Default)]
pub struct ClassCondvar {
    inner: Condvar,
}

impl ClassCondvar {
    pub fn new() -> Self {
        ClassCondvar {
            inner: Condvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, mut guard: ClassMutexGuard<'a, T>) -> ClassMutexGuard<'a, T> {
        let class = guard.class;
        let inner = guard.guard.take().unwrap();
        pop_class(class);
        let inner = self.inner.wait(inner).unwrap();
        push_class(class, false);
        ClassMutexGuard {
            class,
            guard: Some(inner),
        }
    }

    pub fn wait_timeout<'a, T>(
        &self,
        mut guard: ClassMutexGuard<'a, T>,
        timeout: Duration,
    ) -> (ClassMutexGuard<'a, T>, bool) {
        let class = guard.class;
        let inner = guard.guard.take().unwrap();
        pop_class(class);
        let (inner, result) = self.inner.wait_timeout(inner, timeout).unwrap();
        push_class(class, false);
        (
            ClassMutexGuard {
                class,
                guard: Some(inner),
            },
            result.timed_out(),
        )
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

/// RwLock carrying a lock class. Readers and writers obey the same ordering.
#[derive(Debug)]
pub struct ClassRwLock<T> {
    class: &'static LockClass,
    inner: RwLock<T>,
}

pub struct ClassReadGuard<'a, T> {
    class: &'static LockClass,
    guard: Option<RwLockReadGuard<'a, T>>,
}

pub struct ClassWriteGuard<'a, T> {
    class: &'static LockClass,
    guard: Option<RwLockWriteGuard<'a, T>>,
}

impl<T> ClassRwLock<T> {
    pub fn new(class: &'static LockClass, value: T) -> Self {
        ClassRwLock {
            class,
            inner: RwLock::new(value),
        }
    }

    pub fn read(&self) -> ClassReadGuard<'_, T> {
        push_class(self.class, false);
        ClassReadGuard {
            class: self.class,
            guard: Some(self.inner.read().unwrap()),
        }
    }

    pub fn write(&self) -> ClassWriteGuard<'_, T> {
        push_class(self.class, false);
        ClassWriteGuard {
            class: self.class,
            guard: Some(self.inner.write().unwrap()),
        }
    }
}

impl<T> std::ops::Deref for ClassReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> Drop for ClassReadGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        pop_class(self.class);
    }
}

impl<T> std::ops::Deref for ClassWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for ClassWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for ClassWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        pop_class(self.class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static CLASS_LOW: LockClass = LockClass { name: "test-low", rank: 1 };
    static CLASS_HIGH: LockClass = LockClass { name: "test-high", rank: 2 };

    #[test]
    fn ordered_acquisition() {
        let low = ClassMutex::new(&CLASS_LOW, 1u32);
        let high = ClassMutex::new(&CLASS_HIGH, 2u32);
        let a = low.lock();
        let b = high.lock();
        assert_eq!(*a + *b, 3);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn reversed_acquisition_panics() {
        let low = ClassMutex::new(&CLASS_LOW, 1u32);
        let high = ClassMutex::new(&CLASS_HIGH, 2u32);
        let _b = high.lock();
        let _a = low.lock();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn same_class_without_nested_panics() {
        let a = ClassMutex::new(&CLASS_LOW, ());
        let b = ClassMutex::new(&CLASS_LOW, ());
        let _a = a.lock();
        let _b = b.lock();
    }

    #[test]
    fn same_class_nested_allowed() {
        let a = ClassMutex::new(&CLASS_LOW, 1u32);
        let b = ClassMutex::new(&CLASS_LOW, 2u32);
        let ga = a.lock();
        let gb = b.lock_nested();
        assert_eq!(*ga + *gb, 3);
    }

    #[test]
    fn release_restores_order() {
        let low = ClassMutex::new(&CLASS_LOW, ());
        let high = ClassMutex::new(&CLASS_HIGH, ());
        {
            let _b = high.lock();
        }
        let _a = low.lock();
        let _b = high.lock();
    }

    #[test]
    fn rwlock_readers_track_order() {
        let low = ClassRwLock::new(&CLASS_LOW, 5u32);
        let high = ClassRwLock::new(&CLASS_HIGH, 7u32);
        let r = low.read();
        let w = high.write();
        assert_eq!(*r + *w, 12);
    }

    #[test]
    fn condvar_wait_releases_class() {
        use std::{sync::Arc, thread};

        let pair = Arc::new((ClassMutex::new(&CLASS_HIGH, false), ClassCondvar::new()));
        let pair2 = pair.clone();
        let waiter = thread::spawn(move || {
            let (lock, cond) = &*pair2;
            let mut guard = lock.lock();
            while !*guard {
                guard = cond.wait(guard);
            }
        });
        {
            let (lock, cond) = &*pair;
            let mut guard = lock.lock();
            *guard = true;
            cond.notify_all();
        }
        waiter.join().unwrap();
    }
}
