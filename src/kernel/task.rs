//! Thread groups, task state machines, signals, and wait status

use crate::{
    context::{Context, WaitCell},
    errors::KernelError,
    kernel::{auth::Credentials, fdtable::FdTable, LimitSet},
    vfs::MountNamespace,
    sync::{ClassMutex, CLASS_THREAD_GROUP},
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub type Pid = i32;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    Runnable,
    Interruptible,
    Uninterruptible,
    Stopped,
    Zombie,
}

/// A signal number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(pub i32);

impl Signal {
    pub const SIGHUP: Signal = Signal(libc::SIGHUP);
    pub const SIGINT: Signal = Signal(libc::SIGINT);
    pub const SIGKILL: Signal = Signal(libc::SIGKILL);
    pub const SIGTERM: Signal = Signal(libc::SIGTERM);
    pub const SIGSTOP: Signal = Signal(libc::SIGSTOP);
    pub const SIGCONT: Signal = Signal(libc::SIGCONT);
    pub const SIGCHLD: Signal = Signal(libc::SIGCHLD);
}

enum SignalAction {
    Terminate,
    Stop,
    Continue,
    Ignore,
}

fn default_action(signal: Signal) -> SignalAction {
    match signal.0 {
        libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU => SignalAction::Stop,
        libc::SIGCONT => SignalAction::Continue,
        libc::SIGCHLD | libc::SIGURG | libc::SIGWINCH => SignalAction::Ignore,
        _ => SignalAction::Terminate,
    }
}

/// Linux wait status encoding: exit code in bits 8..16, termination signal
/// in bits 0..7.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitStatus(pub u32);

impl WaitStatus {
    pub fn exited(code: i32) -> WaitStatus {
        WaitStatus(((code as u32) & 0xff) << 8)
    }

    pub fn signaled(signal: Signal) -> WaitStatus {
        WaitStatus((signal.0 as u32) & 0x7f)
    }

    pub fn code(&self) -> Option<i32> {
        if self.0 & 0x7f == 0 {
            Some(((self.0 >> 8) & 0xff) as i32)
        } else {
            None
        }
    }

    pub fn signal(&self) -> Option<Signal> {
        match self.0 & 0x7f {
            0 => None,
            sig => Some(Signal(sig as i32)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub tid: Pid,
    pub state: TaskState,
}

struct TgInner {
    tasks: Vec<Task>,
    exit_status: Option<WaitStatus>,
    reaped: bool,
    next_tid: Pid,
}

/// Summary of one thread group, as reported by the process-list RPC.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub cmd: String,
    pub container_id: String,
    pub threads: usize,
    pub zombie: bool,
}

/// A group of tasks sharing an address space, FD table, credentials, and
/// namespaces.
pub struct ThreadGroup {
    pub pid: Pid,
    pub container_id: String,
    pub filename: String,
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    pub working_directory: String,
    pub umask: u32,
    pub credentials: Credentials,
    pub limits: LimitSet,
    pub fd_table: Arc<FdTable>,
    mount_ns: Mutex<Option<MountNamespace>>,
    inner: ClassMutex<TgInner>,
    exited: Arc<WaitCell>,
}

impl ThreadGroup {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: Pid,
        container_id: String,
        filename: String,
        argv: Vec<String>,
        envv: Vec<String>,
        working_directory: String,
        umask: u32,
        credentials: Credentials,
        limits: LimitSet,
        fd_table: Arc<FdTable>,
        mount_ns: Option<MountNamespace>,
    ) -> Arc<ThreadGroup> {
        Arc::new(ThreadGroup {
            pid,
            container_id,
            filename,
            argv,
            envv,
            working_directory,
            umask,
            credentials,
            limits,
            fd_table,
            mount_ns: Mutex::new(mount_ns),
            inner: ClassMutex::new(
                &CLASS_THREAD_GROUP,
                TgInner {
                    tasks: Vec::new(),
                    exit_status: None,
                    reaped: false,
                    next_tid: pid,
                },
            ),
            exited: WaitCell::new(),
        })
    }

    /// Starts the group leader. Idempotent for an already-started group.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.tasks.is_empty() {
            let tid = self.pid;
            inner.tasks.push(Task {
                tid,
                state: TaskState::Runnable,
            });
            log::debug!("started pid {} ({:?})", self.pid, self.argv.first());
        }
    }

    /// Adds a task to the group, as clone-with-CLONE_THREAD would.
    pub fn add_task(&self) -> Result<Pid, KernelError> {
        let mut inner = self.inner.lock();
        if inner.exit_status.is_some() {
            return Err(KernelError::NoSuchProcess(self.pid));
        }
        inner.next_tid += 1;
        let tid = inner.next_tid;
        inner.tasks.push(Task {
            tid,
            state: TaskState::Runnable,
        });
        Ok(tid)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.lock().tasks.clone()
    }

    pub fn is_started(&self) -> bool {
        !self.inner.lock().tasks.is_empty()
    }

    pub fn is_zombie(&self) -> bool {
        self.inner.lock().exit_status.is_some()
    }

    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.inner.lock().exit_status
    }

    /// Voluntary group exit, as exit_group(2).
    pub fn exit_group(&self, code: i32) {
        self.terminate(WaitStatus::exited(code));
    }

    fn terminate(&self, status: WaitStatus) {
        {
            let mut inner = self.inner.lock();
            if inner.exit_status.is_some() {
                return;
            }
            for task in &mut inner.tasks {
                task.state = TaskState::Zombie;
            }
            inner.exit_status = Some(status);
        }
        log::info!("pid {} exited with {:?}", self.pid, status);
        self.exited.fire();
    }

    /// Delivers `signal` with default dispositions. Stopped tasks only
    /// react to SIGKILL and SIGCONT.
    pub fn deliver_signal(&self, signal: Signal) {
        match default_action(signal) {
            SignalAction::Terminate => {
                let stopped = {
                    let inner = self.inner.lock();
                    inner.exit_status.is_none()
                        && !inner.tasks.is_empty()
                        && inner
                            .tasks
                            .iter()
                            .all(|task| task.state == TaskState::Stopped)
                };
                if stopped && signal != Signal::SIGKILL {
                    log::trace!("pid {} stopped, holding signal {:?}", self.pid, signal);
                    return;
                }
                self.terminate(WaitStatus::signaled(signal));
            }
            SignalAction::Stop => {
                let mut inner = self.inner.lock();
                for task in &mut inner.tasks {
                    if matches!(
                        task.state,
                        TaskState::Runnable | TaskState::Interruptible
                    ) {
                        task.state = TaskState::Stopped;
                    }
                }
            }
            SignalAction::Continue => {
                let mut inner = self.inner.lock();
                for task in &mut inner.tasks {
                    if task.state == TaskState::Stopped {
                        task.state = TaskState::Runnable;
                    }
                }
            }
            SignalAction::Ignore => {
                log::trace!("pid {} ignoring signal {:?}", self.pid, signal);
            }
        }
    }

    /// Quiesces every task. Interruptible sleeps are forced into the stop;
    /// an uninterruptible task holds the pause until it leaves that state.
    pub fn pause_tasks(&self) {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner
                    .tasks
                    .iter()
                    .all(|task| task.state != TaskState::Uninterruptible)
                {
                    for task in &mut inner.tasks {
                        if matches!(
                            task.state,
                            TaskState::Runnable | TaskState::Interruptible
                        ) {
                            task.state = TaskState::Stopped;
                        }
                    }
                    return;
                }
            }
            std::thread::yield_now();
        }
    }

    pub fn resume_tasks(&self) {
        let mut inner = self.inner.lock();
        for task in &mut inner.tasks {
            if task.state == TaskState::Stopped {
                task.state = TaskState::Runnable;
            }
        }
    }

    /// Marks a single task's scheduling state, for workloads driving the
    /// state machine directly.
    pub fn set_task_state(&self, tid: Pid, state: TaskState) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .iter_mut()
            .find(|task| task.tid == tid)
            .ok_or(KernelError::NoSuchProcess(tid))?;
        task.state = state;
        Ok(())
    }

    /// Blocks until the group becomes reapable, then reaps it exactly once.
    /// Later waiters observe the retained status without re-reaping.
    pub fn wait(&self, ctx: &Context) -> Result<WaitStatus, KernelError> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(status) = inner.exit_status {
                    inner.reaped = true;
                    return Ok(status);
                }
            }
            ctx.block_on(&self.exited)?;
        }
    }

    pub fn is_reaped(&self) -> bool {
        self.inner.lock().reaped
    }

    pub fn process_info(&self) -> ProcessInfo {
        let inner = self.inner.lock();
        let cmd = self
            .argv
            .first()
            .map(|arg| {
                arg.rsplit('/')
                    .next()
                    .unwrap_or(arg.as_str())
                    .to_string()
            })
            .unwrap_or_default();
        ProcessInfo {
            pid: self.pid,
            cmd,
            container_id: self.container_id.clone(),
            threads: inner.tasks.len(),
            zombie: inner.exit_status.is_some(),
        }
    }

    pub fn mount_namespace(&self) -> Option<MountNamespace> {
        self.mount_ns.lock().unwrap().clone()
    }

    /// Releases the group's namespace reference and FD table. Called when
    /// the group is removed from the pid table.
    pub fn release(&self) {
        self.fd_table.clear();
        if let Some(ns) = self.mount_ns.lock().unwrap().take() {
            ns.dec_ref();
        }
    }

    pub(crate) fn restore_tasks(
        &self,
        tasks: Vec<Task>,
        exit_status: Option<WaitStatus>,
        reaped: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.next_tid = tasks.iter().map(|task| task.tid).max().unwrap_or(self.pid);
        inner.tasks = tasks;
        inner.exit_status = exit_status;
        inner.reaped = reaped;
    }

    pub(crate) fn saved_tasks(&self) -> (Vec<Task>, Option<WaitStatus>, bool) {
        let inner = self.inner.lock();
        (inner.tasks.clone(), inner.exit_status, inner.reaped)
    }
}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("pid", &self.pid)
            .field("container", &self.container_id)
            .field("argv", &self.argv)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MonotonicClock;

    fn group(argv: &[&str]) -> Arc<ThreadGroup> {
        ThreadGroup::new(
            1,
            "test".to_string(),
            argv[0].to_string(),
            argv.iter().map(|s| s.to_string()).collect(),
            Vec::new(),
            "/".to_string(),
            0o22,
            Credentials::root(),
            LimitSet::default(),
            FdTable::new(),
            None,
        )
    }

    fn ctx() -> Context {
        Context::background(Arc::new(MonotonicClock::new()))
    }

    #[test]
    fn wait_status_encoding() {
        let exited = WaitStatus::exited(123);
        assert_eq!(exited.code(), Some(123));
        assert_eq!(exited.signal(), None);

        let killed = WaitStatus::signaled(Signal::SIGTERM);
        assert_eq!(killed.code(), None);
        assert_eq!(killed.signal(), Some(Signal::SIGTERM));
    }

    #[test]
    fn sigterm_makes_zombies_that_retain_status() {
        let tg = group(&["/bin/sleep", "1000"]);
        tg.start();
        tg.deliver_signal(Signal::SIGTERM);
        assert!(tg.is_zombie());
        assert!(tg
            .tasks()
            .iter()
            .all(|task| task.state == TaskState::Zombie));

        let status = tg.wait(&ctx()).unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM));
        // zombies retain their status for later observers
        assert_eq!(tg.exit_status(), Some(status));
        assert!(tg.is_reaped());
    }

    #[test]
    fn wait_blocks_until_exit() {
        let tg = group(&["/bin/true"]);
        tg.start();
        let waiter = tg.clone();
        let t = std::thread::spawn(move || waiter.wait(&ctx()).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(20));
        tg.exit_group(123);
        assert_eq!(t.join().unwrap().code(), Some(123));
    }

    #[test]
    fn stop_and_continue() {
        let tg = group(&["/bin/cat"]);
        tg.start();
        tg.deliver_signal(Signal::SIGSTOP);
        assert!(tg
            .tasks()
            .iter()
            .all(|task| task.state == TaskState::Stopped));

        // ordinary fatal signals are held while stopped
        tg.deliver_signal(Signal::SIGTERM);
        assert!(!tg.is_zombie());

        tg.deliver_signal(Signal::SIGCONT);
        assert!(tg
            .tasks()
            .iter()
            .all(|task| task.state == TaskState::Runnable));

        // SIGKILL is never held
        tg.deliver_signal(Signal::SIGSTOP);
        tg.deliver_signal(Signal::SIGKILL);
        assert!(tg.is_zombie());
    }

    #[test]
    fn ignored_signals_do_nothing() {
        let tg = group(&["/bin/sleep", "5"]);
        tg.start();
        tg.deliver_signal(Signal::SIGCHLD);
        assert!(!tg.is_zombie());
    }

    #[test]
    fn pause_stops_runnable_and_interruptible() {
        let tg = group(&["/bin/sleep", "5"]);
        tg.start();
        let tid = tg.add_task().unwrap();
        tg.set_task_state(tid, TaskState::Interruptible).unwrap();

        tg.pause_tasks();
        assert!(tg
            .tasks()
            .iter()
            .all(|task| task.state == TaskState::Stopped));

        tg.resume_tasks();
        assert!(tg
            .tasks()
            .iter()
            .all(|task| task.state == TaskState::Runnable));
    }

    #[test]
    fn process_info_reports_basename() {
        let tg = group(&["/usr/bin/sleep", "1000"]);
        tg.start();
        let info = tg.process_info();
        assert_eq!(info.cmd, "sleep");
        assert_eq!(info.pid, 1);
        assert_eq!(info.threads, 1);
        assert!(!info.zombie);
    }
}
