//! The kernel object model: pid table, process creation, pause gates
//!
//! There is no global kernel; every entry point receives an explicit
//! [`Kernel`] handle, and dropping the last handle tears everything down.

pub mod auth;
pub mod fdtable;
pub mod task;

pub use auth::{Credentials, Kgid, Kuid};
pub use fdtable::{FdFlags, FdTable};
pub use task::{Pid, ProcessInfo, Signal, Task, TaskState, ThreadGroup, WaitStatus};

use crate::{
    context::Context,
    errors::KernelError,
    memory::MemoryFile,
    sync::{ClassMutex, CLASS_PID_TABLE},
    time::{Clock, ClockId, MonotonicClock, RealtimeClock},
    vfs::{eventfd::EventFile, timerfd::TimerFile, FileDescription, MountNamespace},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// Resource limits for a thread group.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LimitSet {
    pub max_memory: Option<u64>,
    pub max_open_files: Option<u32>,
    pub max_processes: Option<u32>,
}

/// Everything needed to create a process inside the sandbox.
#[derive(Clone, Debug, Default)]
pub struct CreateProcessArgs {
    /// Executable to load. Guessed from `argv[0]` when empty.
    pub filename: String,
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    pub working_directory: String,
    pub credentials: Credentials,
    pub umask: u32,
    pub limits: LimitSet,
    pub container_id: String,
    /// The container's namespace, already reference-incremented by the
    /// caller; ownership moves to the thread group.
    pub mount_namespace: Option<MountNamespace>,
}

struct PidTable {
    next_pid: Pid,
    groups: BTreeMap<Pid, Arc<ThreadGroup>>,
}

/// The sentry kernel root.
pub struct Kernel {
    monotonic: Arc<dyn Clock>,
    realtime: Arc<dyn Clock>,
    memory: MemoryFile,
    pids: ClassMutex<PidTable>,
    mount_namespaces: Mutex<HashMap<String, MountNamespace>>,
    paused: AtomicBool,
}

impl Kernel {
    /// Creates a kernel whose memory file is bounded at `max_memory`
    /// bytes.
    pub fn new(max_memory: u64) -> Result<Arc<Kernel>, KernelError> {
        Ok(Kernel::from_parts(MemoryFile::create(max_memory)?))
    }

    /// Assembles a kernel around an existing memory file, as restore does.
    pub(crate) fn from_parts(memory: MemoryFile) -> Arc<Kernel> {
        Arc::new(Kernel {
            monotonic: Arc::new(MonotonicClock::new()),
            realtime: Arc::new(RealtimeClock),
            memory,
            pids: ClassMutex::new(
                &CLASS_PID_TABLE,
                PidTable {
                    next_pid: 0,
                    groups: BTreeMap::new(),
                },
            ),
            mount_namespaces: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
        })
    }

    /// Marks the kernel paused without touching tasks or timers; restored
    /// state arrives already quiesced.
    pub(crate) fn mark_paused(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Re-inserts a restored thread group under its original pid.
    pub(crate) fn insert_restored_group(&self, tg: Arc<ThreadGroup>) {
        let mut pids = self.pids.lock();
        pids.next_pid = pids.next_pid.max(tg.pid);
        pids.groups.insert(tg.pid, tg);
    }

    /// Every registered mount namespace.
    pub fn mount_namespaces_snapshot(&self) -> Vec<MountNamespace> {
        self.mount_namespaces.lock().unwrap().values().cloned().collect()
    }

    pub fn monotonic_clock(&self) -> &Arc<dyn Clock> {
        &self.monotonic
    }

    pub fn realtime_clock(&self) -> &Arc<dyn Clock> {
        &self.realtime
    }

    pub fn clock(&self, id: ClockId) -> &Arc<dyn Clock> {
        match id {
            ClockId::Monotonic => &self.monotonic,
            ClockId::Realtime => &self.realtime,
        }
    }

    pub fn memory_file(&self) -> &MemoryFile {
        &self.memory
    }

    /// A background context on the kernel's monotonic clock.
    pub fn background_context(&self) -> Context {
        Context::background(self.monotonic.clone())
    }

    /// Registers a container's mount namespace, to be looked up by id when
    /// its init process starts.
    pub fn register_mount_namespace(&self, ns: MountNamespace) {
        let mut namespaces = self.mount_namespaces.lock().unwrap();
        namespaces.insert(ns.owner().to_string(), ns);
    }

    pub fn mount_namespace(&self, container_id: &str) -> Option<MountNamespace> {
        self.mount_namespaces.lock().unwrap().get(container_id).cloned()
    }

    pub fn remove_mount_namespace(&self, container_id: &str) -> Option<MountNamespace> {
        self.mount_namespaces.lock().unwrap().remove(container_id)
    }

    /// Creates (but does not start) a thread group from `args`.
    pub fn create_process(
        self: &Arc<Kernel>,
        args: CreateProcessArgs,
    ) -> Result<(Arc<ThreadGroup>, Pid), KernelError> {
        if args.argv.is_empty() && args.filename.is_empty() {
            return Err(KernelError::InvalidProcessArgs(
                "neither filename nor argv provided".to_string(),
            ));
        }
        if args.container_id.is_empty() {
            return Err(KernelError::InvalidProcessArgs(
                "container id must be set".to_string(),
            ));
        }
        let filename = resolve_executable(&args)?;
        let mut argv = args.argv;
        if argv.is_empty() {
            argv.push(filename.clone());
        }

        let mut pids = self.pids.lock();
        pids.next_pid += 1;
        let pid = pids.next_pid;
        let tg = ThreadGroup::new(
            pid,
            args.container_id,
            filename,
            argv,
            args.envv,
            args.working_directory,
            args.umask,
            args.credentials,
            args.limits,
            FdTable::new(),
            args.mount_namespace,
        );
        pids.groups.insert(pid, tg.clone());
        log::debug!("created pid {} ({:?})", pid, tg.argv);
        Ok((tg, pid))
    }

    /// Starts a created thread group's leader task.
    pub fn start_process(&self, tg: &Arc<ThreadGroup>) {
        tg.start();
    }

    pub fn thread_group(&self, pid: Pid) -> Result<Arc<ThreadGroup>, KernelError> {
        self.pids
            .lock()
            .groups
            .get(&pid)
            .cloned()
            .ok_or(KernelError::NoSuchProcess(pid))
    }

    pub fn thread_groups(&self) -> Vec<Arc<ThreadGroup>> {
        self.pids.lock().groups.values().cloned().collect()
    }

    /// The init thread group of a container: its lowest live pid.
    pub fn container_init(&self, container_id: &str) -> Option<Arc<ThreadGroup>> {
        self.pids
            .lock()
            .groups
            .values()
            .find(|tg| tg.container_id == container_id)
            .cloned()
    }

    /// Pauses every task and every timer feeding a file description.
    /// Idempotent.
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let groups = self.thread_groups();
        for tg in &groups {
            tg.pause_tasks();
        }
        for tg in &groups {
            tg.fd_table.for_each(|_, file| file.pause_timers());
        }
        log::info!("kernel paused ({} thread groups)", groups.len());
    }

    /// Reverses [`Kernel::pause`]. Idempotent.
    pub fn unpause(&self) {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        let groups = self.thread_groups();
        for tg in &groups {
            tg.fd_table.for_each(|_, file| file.resume_timers());
        }
        for tg in &groups {
            tg.resume_tasks();
        }
        log::info!("kernel resumed ({} thread groups)", groups.len());
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Delivers a signal to one process.
    pub fn signal_process(&self, pid: Pid, signal: Signal) -> Result<(), KernelError> {
        self.thread_group(pid)?.deliver_signal(signal);
        Ok(())
    }

    /// Delivers a signal to a container's init, or to all of its thread
    /// groups.
    pub fn signal_container(
        &self,
        container_id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<(), KernelError> {
        if all {
            let mut delivered = false;
            for tg in self.thread_groups() {
                if tg.container_id == container_id {
                    tg.deliver_signal(signal);
                    delivered = true;
                }
            }
            if !delivered {
                return Err(KernelError::NoSuchProcess(0));
            }
            Ok(())
        } else {
            let init = self
                .container_init(container_id)
                .ok_or(KernelError::NoSuchProcess(0))?;
            init.deliver_signal(signal);
            Ok(())
        }
    }

    /// Waits for `pid` to exit, reaps it, and removes it from the pid
    /// table.
    pub fn wait_pid(&self, pid: Pid, ctx: &Context) -> Result<WaitStatus, KernelError> {
        let tg = self.thread_group(pid)?;
        let status = tg.wait(ctx)?;
        self.remove_thread_group(pid);
        Ok(status)
    }

    /// Drops a thread group from the pid table, releasing its FD table and
    /// namespace reference.
    pub fn remove_thread_group(&self, pid: Pid) {
        let removed = self.pids.lock().groups.remove(&pid);
        if let Some(tg) = removed {
            tg.release();
        }
    }

    /// Process list, optionally filtered by container.
    pub fn processes(&self, container_id: Option<&str>) -> Vec<ProcessInfo> {
        self.thread_groups()
            .iter()
            .filter(|tg| container_id.map(|id| tg.container_id == id).unwrap_or(true))
            .filter(|tg| tg.is_started())
            .map(|tg| tg.process_info())
            .collect()
    }

    /// Creates a timerfd on the requested clock and installs it in `tg`'s
    /// descriptor table.
    pub fn new_timerfd(
        &self,
        tg: &ThreadGroup,
        clock: ClockId,
    ) -> (i32, Arc<TimerFile>) {
        let (fd, timer) = TimerFile::new(self.clock(clock).clone());
        let n = tg.fd_table.new_fd(fd, FdFlags::default());
        (n, timer)
    }

    /// Creates an eventfd and installs it in `tg`'s descriptor table.
    pub fn new_eventfd(
        &self,
        tg: &ThreadGroup,
        initval: u64,
        semaphore: bool,
    ) -> (i32, Arc<EventFile>) {
        let (fd, event) = EventFile::new(initval, semaphore);
        let n = tg.fd_table.new_fd(fd, FdFlags::default());
        (n, event)
    }

    /// Installs an externally created description (e.g. a payload fd
    /// passed over the control socket).
    pub fn install_fd(&self, tg: &ThreadGroup, file: Arc<FileDescription>) -> i32 {
        tg.fd_table.new_fd(file, FdFlags::default())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("processes", &self.pids.lock().groups.len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Resolves the executable path the way execvpe would: an explicit
/// filename wins; a bare name is searched along PATH from the environment.
/// Existence checks are delegated to the mount source serving the rootfs.
fn resolve_executable(args: &CreateProcessArgs) -> Result<String, KernelError> {
    let name = if !args.filename.is_empty() {
        args.filename.clone()
    } else {
        args.argv[0].clone()
    };
    if name.contains('/') {
        if name.starts_with('/') {
            return Ok(name);
        }
        let mut path = std::path::PathBuf::from(&args.working_directory);
        path.push(&name);
        return Ok(path.to_string_lossy().into_owned());
    }
    let path_env = args
        .envv
        .iter()
        .find_map(|entry| entry.strip_prefix("PATH="))
        .unwrap_or(DEFAULT_PATH);
    match path_env.split(':').find(|dir| !dir.is_empty()) {
        Some(dir) => {
            let mut path = std::path::PathBuf::from(dir);
            path.push(&name);
            Ok(path.to_string_lossy().into_owned())
        }
        None => Err(KernelError::ExecutableNotFound(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Setting;
    use crate::waiter::{EventMask, Waitable};

    const MS: i64 = 1_000_000;

    fn kernel() -> Arc<Kernel> {
        Kernel::new(64 * 1024 * 1024).unwrap()
    }

    fn sleep_args(container_id: &str) -> CreateProcessArgs {
        CreateProcessArgs {
            argv: vec!["sleep".to_string(), "1000".to_string()],
            envv: vec!["PATH=/bin".to_string()],
            working_directory: "/".to_string(),
            container_id: container_id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn create_assigns_sequential_pids() {
        let k = kernel();
        let (tg1, pid1) = k.create_process(sleep_args("c1")).unwrap();
        let (_, pid2) = k.create_process(sleep_args("c1")).unwrap();
        assert_eq!(pid1, 1);
        assert_eq!(pid2, 2);
        assert_eq!(tg1.filename, "/bin/sleep");
        assert!(!tg1.is_started());
    }

    #[test]
    fn processes_lists_only_started_groups() {
        let k = kernel();
        let (tg, _) = k.create_process(sleep_args("c1")).unwrap();
        assert!(k.processes(Some("c1")).is_empty());
        k.start_process(&tg);
        let list = k.processes(Some("c1"));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].cmd, "sleep");
        assert!(k.processes(Some("other")).is_empty());
    }

    #[test]
    fn signal_and_wait_reap() {
        let k = kernel();
        let (tg, pid) = k.create_process(sleep_args("c1")).unwrap();
        k.start_process(&tg);
        k.signal_container("c1", Signal::SIGTERM, false).unwrap();
        let status = k.wait_pid(pid, &k.background_context()).unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM));
        assert!(k.thread_group(pid).is_err());
    }

    #[test]
    fn pause_halts_tasks_and_timers() {
        let k = kernel();
        let (tg, _) = k.create_process(sleep_args("c1")).unwrap();
        k.start_process(&tg);
        let (_, timer) = k.new_timerfd(&tg, ClockId::Monotonic);
        timer
            .set_time(Setting {
                enabled: true,
                initial: 5 * MS,
                interval: 5 * MS,
            })
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        k.pause();
        assert!(k.is_paused());
        assert!(tg
            .tasks()
            .iter()
            .all(|task| task.state == TaskState::Stopped));
        let (_, paused_setting) = timer.get_time();
        std::thread::sleep(std::time::Duration::from_millis(30));
        let (_, later_setting) = timer.get_time();
        assert_eq!(paused_setting.initial, later_setting.initial);

        k.unpause();
        assert!(!k.is_paused());
        assert!(tg
            .tasks()
            .iter()
            .all(|task| task.state == TaskState::Runnable));
    }

    #[test]
    fn pause_is_idempotent() {
        let k = kernel();
        k.pause();
        k.pause();
        k.unpause();
        k.unpause();
        assert!(!k.is_paused());
    }

    #[test]
    fn eventfd_through_fd_table() {
        let k = kernel();
        let (tg, _) = k.create_process(sleep_args("c1")).unwrap();
        k.start_process(&tg);
        let (n, _) = k.new_eventfd(&tg, 0, false);
        let file = tg.fd_table.get(n).unwrap();
        file.write(&7u64.to_le_bytes()).unwrap();
        assert_eq!(
            file.readiness(EventMask::READABLE),
            EventMask::READABLE
        );
        file.dec_ref();
    }

    #[test]
    fn executable_resolution() {
        let mut args = sleep_args("c1");
        args.argv = vec!["./run.sh".to_string()];
        args.working_directory = "/srv".to_string();
        let k = kernel();
        let (tg, _) = k.create_process(args).unwrap();
        assert_eq!(tg.filename, "/srv/./run.sh");

        let mut args = sleep_args("c2");
        args.filename = "/opt/app".to_string();
        let (tg, _) = k.create_process(args).unwrap();
        assert_eq!(tg.filename, "/opt/app");
    }

    #[test]
    fn mount_namespace_registry() {
        let k = kernel();
        let ns = MountNamespace::new_gofer_root(
            "c1",
            "9p",
            &crate::vfs::GoferConf { rfdno: 3, wfdno: 3 },
        );
        k.register_mount_namespace(ns);
        assert!(k.mount_namespace("c1").is_some());
        assert!(k.mount_namespace("c2").is_none());
        k.remove_mount_namespace("c1").unwrap().dec_ref();
    }
}
