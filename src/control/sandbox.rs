//! A sandbox: one kernel instance hosting N containers

use crate::{
    errors::ControlError,
    kernel::{Kernel, Signal},
    state::SavedContainerMeta,
};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

struct StartState {
    started: i32,
    tx: Option<mpsc::Sender<()>>,
}

pub struct Sandbox {
    pub id: String,
    /// Host pid of the supervisor serving this sandbox.
    pub sandbox_pid: u32,
    num_containers: i32,
    kernel: Mutex<Arc<Kernel>>,
    start_state: Mutex<StartState>,
    metas: Mutex<Vec<SavedContainerMeta>>,
    /// Serializes state-file writes against state-file removal, so a
    /// racing start and destroy cannot leave a resurrected file on disk.
    state_mu: Mutex<()>,
}

impl Sandbox {
    /// Creates a sandbox expecting `num_containers` containers. The
    /// returned channel fires exactly once, when the last one has started.
    pub fn new(
        id: &str,
        total_memory: u64,
        num_containers: i32,
    ) -> Result<(Arc<Sandbox>, mpsc::Receiver<()>), ControlError> {
        let (tx, rx) = mpsc::channel();
        let sandbox = Arc::new(Sandbox {
            id: id.to_string(),
            sandbox_pid: std::process::id(),
            num_containers,
            kernel: Mutex::new(Kernel::new(total_memory)?),
            start_state: Mutex::new(StartState {
                started: 0,
                tx: Some(tx),
            }),
            metas: Mutex::new(Vec::new()),
            state_mu: Mutex::new(()),
        });
        log::debug!("sandbox {:?} created for {} containers", id, num_containers);
        Ok((sandbox, rx))
    }

    pub fn kernel(&self) -> Arc<Kernel> {
        self.kernel.lock().unwrap().clone()
    }

    /// Swaps in a kernel rebuilt from a checkpoint image.
    pub(crate) fn replace_kernel(&self, kernel: Arc<Kernel>) {
        *self.kernel.lock().unwrap() = kernel;
    }

    /// Taken around every state-file write and removal. Handles racing
    /// over one container share this lock through the shared sandbox.
    pub(crate) fn state_lock(&self) -> MutexGuard<'_, ()> {
        self.state_mu.lock().unwrap()
    }

    /// Counts a started container; the Nth fires the started channel.
    pub fn note_container_started(&self) {
        let mut state = self.start_state.lock().unwrap();
        state.started += 1;
        log::info!(
            "container started in sandbox {:?} ({}/{})",
            self.id,
            state.started,
            self.num_containers
        );
        if state.started == self.num_containers {
            if let Some(tx) = state.tx.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn register_container_meta(&self, meta: SavedContainerMeta) {
        let mut metas = self.metas.lock().unwrap();
        metas.retain(|existing| existing.id != meta.id);
        metas.push(meta);
    }

    pub fn remove_container_meta(&self, id: &str) {
        self.metas.lock().unwrap().retain(|meta| meta.id != id);
    }

    pub fn container_metas(&self) -> Vec<SavedContainerMeta> {
        self.metas.lock().unwrap().clone()
    }

    /// Kills every remaining thread group and drops kernel-held container
    /// state for `container_id`.
    pub fn tear_down_container(&self, container_id: &str) {
        let kernel = self.kernel();
        for tg in kernel.thread_groups() {
            if tg.container_id == container_id {
                tg.deliver_signal(Signal::SIGKILL);
                kernel.remove_thread_group(tg.pid);
            }
        }
        if let Some(ns) = kernel.remove_mount_namespace(container_id) {
            ns.dec_ref();
        }
        self.remove_container_meta(container_id);
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("pid", &self.sandbox_pid)
            .finish()
    }
}
