//! Virtual filesystem shim: file descriptions and mount namespaces
//!
//! File descriptions are refcounted trait objects behind numeric
//! descriptors. Anonymous descriptions (timerfd, eventfd) are backed by a
//! virtual dentry and deny positional reads and writes.

pub mod eventfd;
pub mod mount;
pub mod timerfd;

pub use mount::{GoferConf, MountNamespace, MountOptions, Propagation};

use crate::{
    errors::VfsError,
    time::{ClockId, SavedTimer},
    waiter::{EventCallback, EventMask, WaitKey, Waitable},
};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

bitflags! {
    /// Capabilities a description advertises.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FileCaps: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const PREAD = 0x04;
        const PWRITE = 0x08;
        const EPOLLABLE = 0x10;
        const SEEK = 0x20;
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FileDescriptionOptions {
    pub use_dentry_metadata: bool,
    pub deny_pread: bool,
    pub deny_pwrite: bool,
}

impl FileDescriptionOptions {
    /// The options every anonymous description is created with.
    pub fn anonymous() -> FileDescriptionOptions {
        FileDescriptionOptions {
            use_dentry_metadata: true,
            deny_pread: true,
            deny_pwrite: true,
        }
    }
}

/// Serialized image of an anonymous description, sufficient to rebuild it
/// and re-attach its waiter queue on restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SavedDescription {
    TimerFd {
        clock: ClockId,
        timer: SavedTimer,
        val: u64,
    },
    EventFd {
        val: u64,
        semaphore: bool,
    },
}

/// Implementation behind a [`FileDescription`].
pub trait FileDescriptionOps: Waitable + Send + Sync {
    fn read(&self, dst: &mut [u8]) -> Result<usize, VfsError>;

    fn write(&self, src: &[u8]) -> Result<usize, VfsError>;

    fn pread(&self, _dst: &mut [u8], _offset: u64) -> Result<usize, VfsError> {
        Err(VfsError::NotPermitted)
    }

    fn pwrite(&self, _src: &[u8], _offset: u64) -> Result<usize, VfsError> {
        Err(VfsError::NotPermitted)
    }

    fn caps(&self) -> FileCaps;

    fn epollable(&self) -> bool {
        self.caps().contains(FileCaps::EPOLLABLE)
    }

    /// Pauses any timers feeding this description. Default: none.
    fn pause_timers(&self) {}

    /// Resumes any timers feeding this description. Default: none.
    fn resume_timers(&self) {}

    /// Serialized image for checkpoint, if this description supports it.
    fn save(&self) -> Option<SavedDescription> {
        None
    }

    /// Invoked when the last reference is dropped.
    fn release(&self);
}

/// The dentry behind an anonymous description, e.g. `[timerfd]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnonDentry {
    pub name: &'static str,
}

/// A refcounted polymorphic file handle.
pub struct FileDescription {
    ops: Arc<dyn FileDescriptionOps>,
    dentry: AnonDentry,
    options: FileDescriptionOptions,
    refs: AtomicU64,
}

const MAX_REFS: u64 = i64::MAX as u64;

impl FileDescription {
    pub fn new_anonymous(
        name: &'static str,
        ops: Arc<dyn FileDescriptionOps>,
    ) -> Arc<FileDescription> {
        Arc::new(FileDescription {
            ops,
            dentry: AnonDentry { name },
            options: FileDescriptionOptions::anonymous(),
            refs: AtomicU64::new(1),
        })
    }

    pub fn dentry(&self) -> &AnonDentry {
        &self.dentry
    }

    pub fn options(&self) -> FileDescriptionOptions {
        self.options
    }

    pub fn ops(&self) -> &Arc<dyn FileDescriptionOps> {
        &self.ops
    }

    /// Takes a reference for a handoff across subsystems.
    pub fn inc_ref(&self) -> Result<(), VfsError> {
        let prior = self.refs.fetch_add(1, Ordering::SeqCst);
        if prior == 0 || prior >= MAX_REFS {
            self.refs.fetch_sub(1, Ordering::SeqCst);
            return Err(VfsError::RefCountOverflow);
        }
        Ok(())
    }

    /// Releases one reference; the last one tears the description down.
    pub fn dec_ref(&self) {
        let prior = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prior > 0, "file description over-released");
        if prior == 1 {
            self.ops.release();
        }
    }

    pub fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<usize, VfsError> {
        if !self.ops.caps().contains(FileCaps::READ) {
            return Err(VfsError::NotPermitted);
        }
        self.ops.read(dst)
    }

    pub fn write(&self, src: &[u8]) -> Result<usize, VfsError> {
        if !self.ops.caps().contains(FileCaps::WRITE) {
            return Err(VfsError::NotPermitted);
        }
        self.ops.write(src)
    }

    pub fn pread(&self, dst: &mut [u8], offset: u64) -> Result<usize, VfsError> {
        if self.options.deny_pread {
            return Err(VfsError::NotPermitted);
        }
        self.ops.pread(dst, offset)
    }

    pub fn pwrite(&self, src: &[u8], offset: u64) -> Result<usize, VfsError> {
        if self.options.deny_pwrite {
            return Err(VfsError::NotPermitted);
        }
        self.ops.pwrite(src, offset)
    }

    pub fn epollable(&self) -> bool {
        self.ops.epollable()
    }

    pub fn pause_timers(&self) {
        self.ops.pause_timers();
    }

    pub fn resume_timers(&self) {
        self.ops.resume_timers();
    }

    pub fn save(&self) -> Option<SavedDescription> {
        self.ops.save()
    }
}

impl Waitable for FileDescription {
    fn readiness(&self, mask: EventMask) -> EventMask {
        self.ops.readiness(mask)
    }

    fn event_register(
        &self,
        mask: EventMask,
        callback: EventCallback,
    ) -> Result<WaitKey, crate::errors::WaiterError> {
        self.ops.event_register(mask, callback)
    }

    fn event_unregister(&self, key: WaitKey) {
        self.ops.event_unregister(key);
    }
}

impl std::fmt::Debug for FileDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FileDescription")
            .field("dentry", &self.dentry.name)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Rebuilds an anonymous description from its serialized image,
/// re-attaching a fresh waiter queue and re-arming any timer.
pub fn restore_description(
    saved: &SavedDescription,
    monotonic: &Arc<dyn crate::time::Clock>,
    realtime: &Arc<dyn crate::time::Clock>,
) -> Arc<FileDescription> {
    match saved {
        SavedDescription::TimerFd { clock, timer, val } => {
            let clock = match clock {
                ClockId::Monotonic => monotonic.clone(),
                ClockId::Realtime => realtime.clone(),
            };
            timerfd::TimerFile::restore(clock, *timer, *val).0
        }
        SavedDescription::EventFd { val, semaphore } => {
            eventfd::EventFile::restore(*val, *semaphore).0
        }
    }
}
