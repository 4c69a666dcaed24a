//! The memory file: sparse backing storage for guest pages
//!
//! All bookkeeping lives in four interval maps keyed by file offset:
//! *unwaste* (freed ranges that may be recycled), *unfree* (in-use ranges),
//! *memacct* (accounting class per in-use range), and *unloaded* (ranges
//! migrated to the secondary page store). Every offset below `file_size` is
//! in exactly one of unwaste, unfree, unloaded, or a file hole.

use crate::{
    errors::MemoryError,
    memory::{
        loader::{self, WorkerMsg},
        page_round_up,
        ranges::{FileRange, RangeMap, RangeSet},
        AccountingClass, PAGE_SIZE,
    },
    sync::{ClassCondvar, ClassMutex, CLASS_MEMORY_FILE},
};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io,
    os::unix::{fs::FileExt, io::AsRawFd},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
};

lazy_static! {
    static ref HOST_PAGE_SIZE: u64 = determine_host_page_size();
}

fn determine_host_page_size() -> u64 {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 };
    assert_eq!(page_size & (page_size - 1), 0);
    page_size
}

static BACKING_COUNTER: AtomicU64 = AtomicU64::new(0);

fn create_backing_file(tag: &str) -> io::Result<File> {
    let dir = std::env::var_os("TEST_TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let path = dir.join(format!(
        "sentrybox-{}-{}-{}",
        tag,
        std::process::id(),
        BACKING_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)?;
    // keep only the handle; the file stays anonymous
    std::fs::remove_file(&path)?;
    Ok(file)
}

fn punch_hole(file: &File, range: FileRange) -> io::Result<()> {
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            range.start as libc::off_t,
            range.len() as libc::off_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

bitflags! {
    /// Allocation options.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct AllocOpts: u32 {
        /// Ask the host to commit pages eagerly.
        const TRY_POPULATE = 0x1;
        /// The caller tolerates huge-page-aligned placement.
        const HUGE_PAGES_OK = 0x2;
        /// On exhaustion, fire the eviction pass and retry once.
        const MAY_EVICT_OTHERS = 0x4;
    }
}

/// Invoked during an eviction pass for each evictable range. The owner is
/// expected to drop its references, normally by calling `free`.
pub type EvictCallback = Arc<dyn Fn(&MemoryFile, FileRange) + Send + Sync>;

/// Location of an unloaded range in the page store. Splits of the range
/// keep `base`, so the store offset of any file offset `x` inside is
/// `store_offset + (x - base)`.
#[derive(Clone, Debug, Eq, PartialEq)]
struct StoreLoc {
    base: u64,
    store_offset: u64,
    class: AccountingClass,
}

struct Evictor {
    ranges: RangeSet,
    callback: EvictCallback,
}

pub(super) struct Inner {
    pub(super) file_size: u64,
    pub(super) unwaste: RangeSet,
    pub(super) unfree: RangeSet,
    pub(super) memacct: RangeMap<AccountingClass>,
    unloaded: RangeMap<StoreLoc>,
    /// Decommitted ranges: zero-filled holes available for reuse.
    holes: RangeSet,
    /// Queued or in-flight asynchronous unloads; always a subset of unfree.
    pub(super) pending: RangeSet,
    store: File,
    store_next: u64,
    evictors: HashMap<u64, Evictor>,
    quotas: HashMap<AccountingClass, u64>,
}

impl Inner {
    fn class_usage(&self, class: AccountingClass) -> u64 {
        self.memacct
            .iter()
            .filter(|(_, &c)| c == class)
            .map(|(range, _)| range.len())
            .sum::<u64>()
            + self
                .unloaded
                .iter()
                .filter(|(_, loc)| loc.class == class)
                .map(|(range, _)| range.len())
                .sum::<u64>()
    }
}

pub(super) struct Shared {
    pub(super) file: File,
    max_bytes: u64,
    pub(super) inner: ClassMutex<Inner>,
    pub(super) settled: ClassCondvar,
}

impl Shared {
    /// Migrates the still-pending parts of `range` out to the page store.
    /// A racing free or load may have cancelled any part of the request.
    pub(super) fn unload_parts(&self, range: FileRange) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock();
        let result = (|| {
            let parts: Vec<FileRange> = inner.pending.intersection(range);
            for part in parts {
                for (sub, class) in inner.memacct.intersection(part) {
                    let mut data = vec![0u8; sub.len() as usize];
                    self.file.read_exact_at(&mut data, sub.start)?;
                    let store_offset = inner.store_next;
                    inner.store.write_all_at(&data, store_offset)?;
                    inner.store_next += sub.len();
                    inner.unloaded.insert(
                        sub,
                        StoreLoc {
                            base: sub.start,
                            store_offset,
                            class,
                        },
                    );
                    inner.unfree.remove(sub);
                    inner.memacct.remove(sub);
                    punch_hole(&self.file, sub)?;
                    log::trace!("unloaded {} to page store", sub);
                }
                inner.pending.remove(part);
            }
            Ok(())
        })();
        // never leave cancelled or failed requests marked in flight
        inner.pending.remove(range);
        self.settled.notify_all();
        result
    }
}

/// Reported memory usage. `system` and `anonymous` (and the other class
/// buckets) are populated only by a full collection.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub mapped: u64,
    pub total: u64,
    pub system: u64,
    pub anonymous: u64,
    pub page_cache: u64,
    pub tmpfs: u64,
    pub kernel: u64,
}

/// Serialized image of the memory file: allocated ranges with their class
/// and contents, plus the recyclable set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SavedMemory {
    pub file_size: u64,
    pub max_bytes: u64,
    pub chunks: Vec<SavedChunk>,
    pub unwaste: Vec<FileRange>,
    pub holes: Vec<FileRange>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedChunk {
    pub range: FileRange,
    pub class: AccountingClass,
    pub data: Vec<u8>,
}

/// A page-granular allocator over a sparse backing file.
pub struct MemoryFile {
    shared: Arc<Shared>,
    worker_tx: Mutex<mpsc::Sender<WorkerMsg>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MemoryFile {
    /// Creates an empty memory file bounded at `max_bytes`.
    pub fn create(max_bytes: u64) -> Result<MemoryFile, MemoryError> {
        if PAGE_SIZE % *HOST_PAGE_SIZE != 0 {
            log::warn!(
                "host page size {} does not divide page size {}; hole punching may overshoot",
                *HOST_PAGE_SIZE,
                PAGE_SIZE
            );
        }
        let file = create_backing_file("mem")?;
        let store = create_backing_file("pagestore")?;
        let shared = Arc::new(Shared {
            file,
            max_bytes,
            inner: ClassMutex::new(
                &CLASS_MEMORY_FILE,
                Inner {
                    file_size: 0,
                    unwaste: RangeSet::new(),
                    unfree: RangeSet::new(),
                    memacct: RangeMap::new(),
                    unloaded: RangeMap::new(),
                    holes: RangeSet::new(),
                    pending: RangeSet::new(),
                    store,
                    store_next: 0,
                    evictors: HashMap::new(),
                    quotas: HashMap::new(),
                },
            ),
            settled: ClassCondvar::new(),
        });
        let (tx, rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("page-loader".to_string())
            .spawn(move || loader::run(worker_shared, rx))
            .map_err(MemoryError::Io)?;
        Ok(MemoryFile {
            shared,
            worker_tx: Mutex::new(tx),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Reconstructs a memory file from its serialized image.
    pub fn restore(saved: &SavedMemory) -> Result<MemoryFile, MemoryError> {
        let mf = MemoryFile::create(saved.max_bytes)?;
        {
            let mut inner = mf.shared.inner.lock();
            mf.shared.file.set_len(saved.file_size)?;
            inner.file_size = saved.file_size;
            for chunk in &saved.chunks {
                mf.shared.file.write_all_at(&chunk.data, chunk.range.start)?;
                inner.unfree.insert(chunk.range);
                inner.memacct.insert(chunk.range, chunk.class);
            }
            for range in &saved.unwaste {
                inner.unwaste.insert(*range);
            }
            for range in &saved.holes {
                inner.holes.insert(*range);
            }
        }
        Ok(mf)
    }

    /// Allocates `len` bytes (rounded up to whole pages) tagged with
    /// `class`, recycling wasted ranges before growing the file.
    pub fn allocate(
        &self,
        len: u64,
        class: AccountingClass,
        opts: AllocOpts,
    ) -> Result<FileRange, MemoryError> {
        match self.try_allocate(len, class, opts) {
            Err(MemoryError::OutOfMemory { .. }) if opts.contains(AllocOpts::MAY_EVICT_OTHERS) => {
                log::debug!("allocation of {} bytes blocked, starting evictions", len);
                self.start_evictions()?;
                self.try_allocate(len, class, opts.difference(AllocOpts::MAY_EVICT_OTHERS))
            }
            result => result,
        }
    }

    fn try_allocate(
        &self,
        len: u64,
        class: AccountingClass,
        opts: AllocOpts,
    ) -> Result<FileRange, MemoryError> {
        if len == 0 {
            return Err(MemoryError::InvalidRange { start: 0, end: 0 });
        }
        let len = page_round_up(len);
        let mut inner = self.shared.inner.lock();
        if let Some(&quota) = inner.quotas.get(&class) {
            if inner.class_usage(class) + len > quota {
                return Err(MemoryError::QuotaExceeded { class });
            }
        }
        let range = if let Some(range) = inner.unwaste.first_fit(len) {
            inner.unwaste.remove(range);
            // recycled pages must read back zeroed
            punch_hole(&self.shared.file, range)?;
            range
        } else if let Some(range) = inner.holes.first_fit(len) {
            inner.holes.remove(range);
            range
        } else {
            let start = inner.file_size;
            let end = start
                .checked_add(len)
                .filter(|&end| end <= self.shared.max_bytes)
                .ok_or(MemoryError::OutOfMemory {
                    requested: len,
                    limit: self.shared.max_bytes,
                })?;
            self.shared.file.set_len(end)?;
            inner.file_size = end;
            FileRange::new(start, end)
        };
        if opts.contains(AllocOpts::TRY_POPULATE) {
            let ret = unsafe {
                libc::fallocate(
                    self.shared.file.as_raw_fd(),
                    0,
                    range.start as libc::off_t,
                    range.len() as libc::off_t,
                )
            };
            if ret < 0 {
                log::warn!("populate of {} failed: {}", range, io::Error::last_os_error());
            }
        }
        inner.unfree.insert(range);
        inner.memacct.insert(range, class);
        log::trace!("allocated {} as {:?}", range, class);
        Ok(range)
    }

    /// Returns `range` to the recyclable set. A migrated copy of any
    /// unloaded part is discarded; queued migrations are cancelled.
    pub fn free(&self, range: FileRange) -> Result<(), MemoryError> {
        let mut inner = self.shared.inner.lock();
        Self::free_locked(&mut inner, range)?;
        self.shared.settled.notify_all();
        log::trace!("freed {}", range);
        Ok(())
    }

    fn free_locked(inner: &mut Inner, range: FileRange) -> Result<(), MemoryError> {
        let covered: u64 = inner
            .unfree
            .intersection(range)
            .iter()
            .map(FileRange::len)
            .sum::<u64>()
            + inner
                .unloaded
                .intersection(range)
                .iter()
                .map(|(r, _)| r.len())
                .sum::<u64>();
        if covered != range.len() || range.is_empty() {
            return Err(MemoryError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        inner.pending.remove(range);
        inner.unfree.remove(range);
        inner.memacct.remove(range);
        inner.unloaded.remove(range);
        inner.unwaste.insert(range);
        Ok(())
    }

    /// Punches holes for the entire recyclable set, returning those offsets
    /// to the host.
    pub fn reclaim(&self) -> Result<u64, MemoryError> {
        let mut inner = self.shared.inner.lock();
        let mut reclaimed = 0;
        let wasted: Vec<FileRange> = inner.unwaste.iter().collect();
        for range in wasted {
            punch_hole(&self.shared.file, range)?;
            inner.unwaste.remove(range);
            inner.holes.insert(range);
            reclaimed += range.len();
        }
        log::debug!("reclaimed {} bytes", reclaimed);
        Ok(reclaimed)
    }

    /// Writes into an allocated range, faulting unloaded pages back in.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let range = FileRange::new(offset, offset + buf.len() as u64);
        let mut inner = self.shared.inner.lock();
        self.fault_in_locked(&mut inner, range)?;
        if !inner.unfree.contains_range(range) {
            return Err(MemoryError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        self.shared.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Reads from an allocated range, faulting unloaded pages back in.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = FileRange::new(offset, offset + buf.len() as u64);
        let mut inner = self.shared.inner.lock();
        self.fault_in_locked(&mut inner, range)?;
        if !inner.unfree.contains_range(range) {
            return Err(MemoryError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        self.shared.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn fault_in_locked(&self, inner: &mut Inner, range: FileRange) -> Result<(), MemoryError> {
        inner.pending.remove(range);
        let parts = inner.unloaded.intersection(range);
        if parts.is_empty() {
            return Ok(());
        }
        for (part, loc) in parts {
            let mut data = vec![0u8; part.len() as usize];
            let store_offset = loc.store_offset + (part.start - loc.base);
            inner.store.read_exact_at(&mut data, store_offset)?;
            self.shared.file.write_all_at(&data, part.start)?;
            inner.unloaded.remove(part);
            inner.unfree.insert(part);
            inner.memacct.insert(part, loc.class);
            log::trace!("loaded {} back from page store", part);
        }
        self.shared.settled.notify_all();
        Ok(())
    }

    /// Synchronously loads any unloaded pages of `range` back into the
    /// memory file and cancels queued migrations over it.
    pub fn load(&self, range: FileRange) -> Result<(), MemoryError> {
        let mut inner = self.shared.inner.lock();
        self.fault_in_locked(&mut inner, range)
    }

    /// Queues an allocated range for asynchronous migration to the page
    /// store.
    pub fn unload_async(&self, range: FileRange) -> Result<(), MemoryError> {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.unfree.contains_range(range) || range.is_empty() {
                return Err(MemoryError::InvalidRange {
                    start: range.start,
                    end: range.end,
                });
            }
            inner.pending.insert(range);
        }
        self.worker_tx
            .lock()
            .unwrap()
            .send(WorkerMsg::Unload(range))
            .map_err(|_| MemoryError::Io(io::Error::new(io::ErrorKind::Other, "loader gone")))?;
        Ok(())
    }

    /// Migrates the still-pending parts of `range` out to the page store.
    /// This is what the loader worker runs; it is also usable directly.
    pub fn unload(&self, range: FileRange) -> Result<(), MemoryError> {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.unfree.contains_range(range) || range.is_empty() {
                return Err(MemoryError::InvalidRange {
                    start: range.start,
                    end: range.end,
                });
            }
            inner.pending.insert(range);
        }
        self.shared.unload_parts(range)
    }

    /// Blocks until no asynchronous migrations are queued or in flight.
    pub fn wait_for_loads(&self) {
        let mut inner = self.shared.inner.lock();
        while !inner.pending.is_empty() {
            inner = self.shared.settled.wait(inner);
        }
    }

    /// Caps how much may be allocated under `class`. Existing allocations
    /// are unaffected.
    pub fn set_class_quota(&self, class: AccountingClass, bytes: u64) {
        let mut inner = self.shared.inner.lock();
        inner.quotas.insert(class, bytes);
    }

    pub fn clear_class_quota(&self, class: AccountingClass) {
        let mut inner = self.shared.inner.lock();
        inner.quotas.remove(&class);
    }

    pub fn set_evictor(&self, owner: u64, callback: EvictCallback) {
        let mut inner = self.shared.inner.lock();
        inner.evictors.insert(
            owner,
            Evictor {
                ranges: RangeSet::new(),
                callback,
            },
        );
    }

    /// Drops the evictor and all of its evictable ranges.
    pub fn remove_evictor(&self, owner: u64) {
        let mut inner = self.shared.inner.lock();
        inner.evictors.remove(&owner);
    }

    pub fn mark_evictable(&self, owner: u64, range: FileRange) {
        let mut inner = self.shared.inner.lock();
        if let Some(evictor) = inner.evictors.get_mut(&owner) {
            evictor.ranges.insert(range);
        }
    }

    pub fn mark_unevictable(&self, owner: u64, range: FileRange) {
        let mut inner = self.shared.inner.lock();
        if let Some(evictor) = inner.evictors.get_mut(&owner) {
            evictor.ranges.remove(range);
        }
    }

    /// Runs one eviction pass: each owner callback is asked to drop its
    /// references, then ranges actually released are returned to the host.
    /// Ranges still allocated after the callback are skipped.
    pub fn start_evictions(&self) -> Result<(), MemoryError> {
        let victims: Vec<(u64, FileRange, EvictCallback)> = {
            let inner = self.shared.inner.lock();
            inner
                .evictors
                .iter()
                .flat_map(|(&owner, evictor)| {
                    evictor
                        .ranges
                        .iter()
                        .map(move |range| (owner, range, evictor.callback.clone()))
                })
                .collect()
        };
        for (owner, range, callback) in victims {
            callback(self, range);
            let mut inner = self.shared.inner.lock();
            if inner.unfree.intersects(range) || !inner.unloaded.intersection(range).is_empty() {
                log::warn!("evictable range {} still referenced, skipping", range);
                continue;
            }
            let wasted = inner.unwaste.intersection(range);
            for part in wasted {
                punch_hole(&self.shared.file, part)?;
                inner.unwaste.remove(part);
                inner.holes.insert(part);
            }
            if let Some(evictor) = inner.evictors.get_mut(&owner) {
                evictor.ranges.remove(range);
            }
            log::debug!("evicted {}", range);
        }
        Ok(())
    }

    /// Usage accounting. `mapped` counts bytes resident in the backing
    /// file; `total` counts allocated bytes wherever they live.
    pub fn usage(&self, full: bool) -> UsageStats {
        let inner = self.shared.inner.lock();
        let mut stats = UsageStats {
            mapped: inner.unfree.total() + inner.unwaste.total(),
            total: inner.unfree.total() + inner.unloaded.total(),
            ..Default::default()
        };
        if full {
            let classified = inner
                .memacct
                .iter()
                .map(|(range, &class)| (range, class))
                .chain(
                    inner
                        .unloaded
                        .iter()
                        .map(|(range, loc)| (range, loc.class)),
                );
            for (range, class) in classified {
                let bucket = match class {
                    AccountingClass::Anonymous => &mut stats.anonymous,
                    AccountingClass::PageCache => &mut stats.page_cache,
                    AccountingClass::System => &mut stats.system,
                    AccountingClass::Kernel => &mut stats.kernel,
                    AccountingClass::Tmpfs => &mut stats.tmpfs,
                };
                *bucket += range.len();
            }
        }
        stats
    }

    /// Serializes every allocated range with its contents. Unloaded ranges
    /// are folded back into the image from the page store.
    pub fn save(&self) -> Result<SavedMemory, MemoryError> {
        let inner = self.shared.inner.lock();
        let mut chunks = Vec::new();
        for (range, &class) in inner.memacct.iter() {
            let mut data = vec![0u8; range.len() as usize];
            self.shared.file.read_exact_at(&mut data, range.start)?;
            chunks.push(SavedChunk { range, class, data });
        }
        for (range, loc) in inner.unloaded.iter() {
            let mut data = vec![0u8; range.len() as usize];
            let store_offset = loc.store_offset + (range.start - loc.base);
            inner.store.read_exact_at(&mut data, store_offset)?;
            chunks.push(SavedChunk {
                range,
                class: loc.class,
                data,
            });
        }
        chunks.sort_by_key(|chunk| chunk.range.start);
        Ok(SavedMemory {
            file_size: inner.file_size,
            max_bytes: self.shared.max_bytes,
            chunks,
            unwaste: inner.unwaste.iter().collect(),
            holes: inner.holes.iter().collect(),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.shared.inner.lock().file_size
    }

    pub fn total_allocated(&self) -> u64 {
        let inner = self.shared.inner.lock();
        inner.unfree.total() + inner.unloaded.total()
    }

    /// Checks the partition invariant: every offset below `file_size`
    /// belongs to exactly one of {unwaste, unfree, unloaded, hole}, and
    /// the accounting map covers unfree exactly.
    pub fn verify_partition(&self) -> Result<(), MemoryError> {
        let inner = self.shared.inner.lock();
        let span = FileRange::new(0, inner.file_size);
        let mut seen = RangeSet::new();
        let mut disjoint_total = 0;
        let sets: [Vec<FileRange>; 4] = [
            inner.unwaste.iter().collect(),
            inner.unfree.iter().collect(),
            inner.unloaded.iter().map(|(range, _)| range).collect(),
            inner.holes.iter().collect(),
        ];
        for ranges in &sets {
            for &range in ranges {
                if !span.contains_range(range) {
                    return Err(MemoryError::InvalidRange {
                        start: range.start,
                        end: range.end,
                    });
                }
                disjoint_total += range.len();
                seen.insert(range);
            }
        }
        if seen.total() != disjoint_total || seen.total() != inner.file_size {
            return Err(MemoryError::InvalidRange {
                start: 0,
                end: inner.file_size,
            });
        }
        if inner.memacct.total() != inner.unfree.total()
            || !inner
                .unfree
                .iter()
                .all(|range| inner.memacct.contains_range(range))
        {
            return Err(MemoryError::InvalidRange {
                start: 0,
                end: inner.file_size,
            });
        }
        for range in inner.pending.iter() {
            if !inner.unfree.contains_range(range) {
                return Err(MemoryError::InvalidRange {
                    start: range.start,
                    end: range.end,
                });
            }
        }
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        let _ = self.worker_tx.lock().unwrap().send(WorkerMsg::Shutdown);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for MemoryFile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("MemoryFile")
            .field("file_size", &inner.file_size)
            .field("unfree", &inner.unfree.total())
            .field("unwaste", &inner.unwaste.total())
            .field("unloaded", &inner.unloaded.total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASS: AccountingClass = AccountingClass::Anonymous;

    fn new_file() -> MemoryFile {
        MemoryFile::create(64 * 1024 * 1024).unwrap()
    }

    #[test]
    fn allocate_rounds_to_pages() {
        let mf = new_file();
        let range = mf.allocate(1, CLASS, AllocOpts::empty()).unwrap();
        assert_eq!(range.len(), PAGE_SIZE);
        mf.verify_partition().unwrap();
    }

    #[test]
    fn free_then_allocate_reuses_range() {
        let mf = new_file();
        let first = mf.allocate(3 * PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        mf.free(first).unwrap();
        let second = mf.allocate(3 * PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        assert_eq!(first, second);
        mf.verify_partition().unwrap();
    }

    #[test]
    fn recycled_pages_read_back_zeroed() {
        let mf = new_file();
        let range = mf.allocate(PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        mf.write_at(range.start, &[0xabu8; 128]).unwrap();
        mf.free(range).unwrap();
        let again = mf.allocate(PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        assert_eq!(again, range);
        let mut buf = [0xffu8; 128];
        mf.read_at(again.start, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 128]);
    }

    #[test]
    fn allocation_beyond_limit_is_oom() {
        let mf = MemoryFile::create(4 * PAGE_SIZE).unwrap();
        mf.allocate(4 * PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        match mf.allocate(PAGE_SIZE, CLASS, AllocOpts::empty()) {
            Err(MemoryError::OutOfMemory { .. }) => {}
            other => panic!("expected OOM, got {:?}", other),
        }
    }

    #[test]
    fn class_quota_is_enforced() {
        let mf = new_file();
        mf.set_class_quota(AccountingClass::Tmpfs, PAGE_SIZE);
        mf.allocate(PAGE_SIZE, AccountingClass::Tmpfs, AllocOpts::empty())
            .unwrap();
        match mf.allocate(PAGE_SIZE, AccountingClass::Tmpfs, AllocOpts::empty()) {
            Err(MemoryError::QuotaExceeded { class }) => {
                assert_eq!(class, AccountingClass::Tmpfs)
            }
            other => panic!("expected quota error, got {:?}", other),
        }
        // other classes are not affected
        mf.allocate(PAGE_SIZE, AccountingClass::Anonymous, AllocOpts::empty())
            .unwrap();
        mf.clear_class_quota(AccountingClass::Tmpfs);
        mf.allocate(PAGE_SIZE, AccountingClass::Tmpfs, AllocOpts::empty())
            .unwrap();
        mf.verify_partition().unwrap();
    }

    #[test]
    fn double_free_is_invalid() {
        let mf = new_file();
        let range = mf.allocate(PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        mf.free(range).unwrap();
        assert!(matches!(
            mf.free(range),
            Err(MemoryError::InvalidRange { .. })
        ));
    }

    #[test]
    fn usage_reports_allocations() {
        let mf = new_file();
        assert_eq!(mf.usage(false).total, 0);
        mf.allocate(2 * PAGE_SIZE, AccountingClass::Anonymous, AllocOpts::empty())
            .unwrap();
        mf.allocate(PAGE_SIZE, AccountingClass::System, AllocOpts::empty())
            .unwrap();

        let quick = mf.usage(false);
        assert_eq!(quick.total, 3 * PAGE_SIZE);
        assert!(quick.mapped >= quick.total);
        assert_eq!(quick.anonymous, 0);

        let full = mf.usage(true);
        assert_eq!(full.anonymous, 2 * PAGE_SIZE);
        assert_eq!(full.system, PAGE_SIZE);
    }

    #[test]
    fn unload_and_load_round_trip() {
        let mf = new_file();
        let range = mf.allocate(2 * PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        let pattern: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        mf.write_at(range.start, &pattern).unwrap();

        mf.unload_async(range).unwrap();
        mf.wait_for_loads();
        assert_eq!(mf.usage(false).total, 2 * PAGE_SIZE);
        mf.verify_partition().unwrap();

        // read faults the pages back in
        let mut buf = vec![0u8; pattern.len()];
        mf.read_at(range.start, &mut buf).unwrap();
        assert_eq!(buf, pattern);
        mf.verify_partition().unwrap();
    }

    #[test]
    fn free_discards_unloaded_copy() {
        let mf = new_file();
        let range = mf.allocate(PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        mf.write_at(range.start, &[7u8; 64]).unwrap();
        mf.unload(range).unwrap();
        mf.free(range).unwrap();
        mf.verify_partition().unwrap();
        assert_eq!(mf.usage(false).total, 0);
        // reuse sees zeroed pages, not the stale migrated copy
        let again = mf.allocate(PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        assert_eq!(again, range);
        let mut buf = [1u8; 64];
        mf.read_at(again.start, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn eviction_releases_unreferenced_ranges() {
        let mf = Arc::new(new_file());
        let range = mf.allocate(PAGE_SIZE, CLASS, AllocOpts::empty()).unwrap();
        mf.set_evictor(
            1,
            Arc::new(move |file: &MemoryFile, victim: FileRange| {
                file.free(victim).unwrap();
            }),
        );
        mf.mark_evictable(1, range);
        mf.start_evictions().unwrap();
        mf.verify_partition().unwrap();
        assert_eq!(mf.usage(false).total, 0);
        assert_eq!(mf.usage(false).mapped, 0);
    }

    #[test]
    fn eviction_makes_room_for_allocation() {
        let mf = MemoryFile::create(2 * PAGE_SIZE).unwrap();
        let hog = mf
            .allocate(2 * PAGE_SIZE, CLASS, AllocOpts::empty())
            .unwrap();
        mf.set_evictor(
            9,
            Arc::new(move |file: &MemoryFile, victim: FileRange| {
                file.free(victim).unwrap();
            }),
        );
        mf.mark_evictable(9, hog);
        let range = mf
            .allocate(PAGE_SIZE, CLASS, AllocOpts::MAY_EVICT_OTHERS)
            .unwrap();
        assert_eq!(range.len(), PAGE_SIZE);
        mf.verify_partition().unwrap();
    }

    #[test]
    fn save_restore_preserves_contents() {
        let mf = new_file();
        let a = mf.allocate(PAGE_SIZE, AccountingClass::Anonymous, AllocOpts::empty()).unwrap();
        let b = mf.allocate(PAGE_SIZE, AccountingClass::Tmpfs, AllocOpts::empty()).unwrap();
        mf.write_at(a.start, b"hello pages").unwrap();
        mf.write_at(b.start, b"tmpfs bytes").unwrap();
        mf.unload(b).unwrap();

        let saved = mf.save().unwrap();
        let restored = MemoryFile::restore(&saved).unwrap();
        restored.verify_partition().unwrap();
        assert_eq!(restored.usage(false).total, 2 * PAGE_SIZE);

        let mut buf = [0u8; 11];
        restored.read_at(a.start, &mut buf).unwrap();
        assert_eq!(&buf, b"hello pages");
        restored.read_at(b.start, &mut buf).unwrap();
        assert_eq!(&buf, b"tmpfs bytes");

        let full = restored.usage(true);
        assert_eq!(full.anonymous, PAGE_SIZE);
        assert_eq!(full.tmpfs, PAGE_SIZE);
    }
}
