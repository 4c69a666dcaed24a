//! Per-thread-group file descriptor tables
//!
//! The table owns one reference to each installed description; removal and
//! table drop release it. Descriptor numbers are allocated lowest-first.

use crate::{
    errors::VfsError,
    sync::{ClassMutex, CLASS_FD_TABLE},
    vfs::FileDescription,
};
use std::{collections::BTreeMap, sync::Arc};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FdFlags {
    pub close_on_exec: bool,
}

struct FdEntry {
    file: Arc<FileDescription>,
    flags: FdFlags,
}

pub struct FdTable {
    inner: ClassMutex<BTreeMap<i32, FdEntry>>,
}

impl FdTable {
    pub fn new() -> Arc<FdTable> {
        Arc::new(FdTable {
            inner: ClassMutex::new(&CLASS_FD_TABLE, BTreeMap::new()),
        })
    }

    /// Installs `file` at the lowest free descriptor, taking over the
    /// caller's reference.
    pub fn new_fd(&self, file: Arc<FileDescription>, flags: FdFlags) -> i32 {
        let mut inner = self.inner.lock();
        let mut fd = 0;
        for &used in inner.keys() {
            if used == fd {
                fd += 1;
            } else {
                break;
            }
        }
        inner.insert(fd, FdEntry { file, flags });
        fd
    }

    /// Installs `file` at a specific descriptor, releasing whatever was
    /// there.
    pub fn set_fd(&self, fd: i32, file: Arc<FileDescription>, flags: FdFlags) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.insert(fd, FdEntry { file, flags }) {
            old.file.dec_ref();
        }
    }

    /// A caller-owned reference to the description at `fd`.
    pub fn get(&self, fd: i32) -> Result<Arc<FileDescription>, VfsError> {
        let inner = self.inner.lock();
        let entry = inner.get(&fd).ok_or(VfsError::BadDescriptor(fd))?;
        entry.file.inc_ref()?;
        Ok(entry.file.clone())
    }

    pub fn flags(&self, fd: i32) -> Result<FdFlags, VfsError> {
        let inner = self.inner.lock();
        inner
            .get(&fd)
            .map(|entry| entry.flags)
            .ok_or(VfsError::BadDescriptor(fd))
    }

    /// Removes `fd`, dropping the table's reference.
    pub fn remove(&self, fd: i32) -> Result<(), VfsError> {
        let mut inner = self.inner.lock();
        let entry = inner.remove(&fd).ok_or(VfsError::BadDescriptor(fd))?;
        entry.file.dec_ref();
        Ok(())
    }

    pub fn fds(&self) -> Vec<i32> {
        self.inner.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Applies `f` to every installed description, in descriptor order.
    pub fn for_each<F: FnMut(i32, &Arc<FileDescription>)>(&self, mut f: F) {
        let inner = self.inner.lock();
        for (&fd, entry) in inner.iter() {
            f(fd, &entry.file);
        }
    }

    /// Drops every entry, releasing the table's references.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, entry) in std::mem::take(&mut *inner) {
            entry.file.dec_ref();
        }
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for FdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FdTable").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::eventfd::EventFile;

    #[test]
    fn descriptors_allocate_lowest_first() {
        let table = FdTable::new();
        let (a, _) = EventFile::new(0, false);
        let (b, _) = EventFile::new(0, false);
        let (c, _) = EventFile::new(0, false);
        assert_eq!(table.new_fd(a, FdFlags::default()), 0);
        assert_eq!(table.new_fd(b, FdFlags::default()), 1);
        table.remove(0).unwrap();
        assert_eq!(table.new_fd(c, FdFlags::default()), 0);
    }

    #[test]
    fn get_hands_out_references() {
        let table = FdTable::new();
        let (fd, _) = EventFile::new(0, false);
        let n = table.new_fd(fd, FdFlags::default());
        let file = table.get(n).unwrap();
        assert_eq!(file.ref_count(), 2);
        file.dec_ref();
        assert!(matches!(table.get(99), Err(VfsError::BadDescriptor(99))));
    }

    #[test]
    fn clear_releases_table_references() {
        let table = FdTable::new();
        let (fd, _) = EventFile::new(0, false);
        let n = table.new_fd(fd, FdFlags::default());
        let held = table.get(n).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(held.ref_count(), 1);
        held.dec_ref();
    }
}
