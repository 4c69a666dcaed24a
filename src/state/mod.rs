//! Checkpoint/restore engine
//!
//! Checkpoint quiesces the kernel (tasks and timers paused, async page
//! loads settled), serializes the object graph into a versioned serde tree,
//! frames it through [`statefile`], and commits it under the target
//! directory. Restore validates the restoring spec, rebuilds the graph
//! (waiter queues re-attached, timers re-armed from their captured
//! remaining, pages re-mapped), and leaves the kernel paused for the caller
//! to resume.

pub mod statefile;
pub mod validate;

pub use statefile::CompressionLevel;
pub use validate::{validate_restore_spec, ValidationPolicy};

use crate::{
    errors::StateError,
    kernel::{
        auth::Credentials, fdtable::FdFlags, task::Task, Kernel, LimitSet, Pid, ThreadGroup,
        WaitStatus,
    },
    memory::{MemoryFile, SavedMemory},
    spec::RuntimeSpec,
    vfs::{mount::SavedMountNamespace, restore_description, MountNamespace, SavedDescription},
};
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc};

pub const CHECKPOINT_FILENAME: &str = "checkpoint.img";

#[derive(Copy, Clone, Debug, Default)]
pub struct CheckpointOpts {
    pub compression: CompressionLevel,
    /// Unpause the sandbox once the image is committed.
    pub resume: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedFd {
    pub fd: i32,
    pub description: SavedDescription,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedThreadGroup {
    pub pid: Pid,
    pub container_id: String,
    pub filename: String,
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    pub working_directory: String,
    pub umask: u32,
    pub credentials: Credentials,
    pub limits: LimitSet,
    pub tasks: Vec<Task>,
    pub exit_status: Option<WaitStatus>,
    pub reaped: bool,
    pub fds: Vec<SavedFd>,
    pub mount_ns_owner: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedKernel {
    pub memory: SavedMemory,
    pub namespaces: Vec<SavedMountNamespace>,
    pub thread_groups: Vec<SavedThreadGroup>,
}

/// Per-container metadata embedded in the image for restore-time spec
/// validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedContainerMeta {
    pub id: String,
    pub spec: RuntimeSpec,
}

/// The complete checkpoint image payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedImage {
    pub kernel: SavedKernel,
    pub containers: Vec<SavedContainerMeta>,
}

/// Serializes the full sentry state into `dir`. The kernel is left paused
/// unless `opts.resume` asks for it back.
pub fn checkpoint(
    kernel: &Arc<Kernel>,
    containers: Vec<SavedContainerMeta>,
    dir: &Path,
    opts: &CheckpointOpts,
) -> Result<(), StateError> {
    kernel.pause();
    kernel.memory_file().wait_for_loads();

    let image = SavedImage {
        kernel: save_kernel(kernel)?,
        containers,
    };
    let payload = serde_json::to_vec(&image)?;
    statefile::write(&dir.join(CHECKPOINT_FILENAME), opts.compression, &payload)?;
    log::info!(
        "checkpoint committed to {:?} ({} thread groups, resume={})",
        dir,
        image.kernel.thread_groups.len(),
        opts.resume
    );

    if opts.resume {
        kernel.unpause();
    }
    Ok(())
}

/// Reads and decodes a checkpoint image from `dir`.
pub fn load_image(dir: &Path) -> Result<SavedImage, StateError> {
    let payload = statefile::read(&dir.join(CHECKPOINT_FILENAME))?;
    Ok(serde_json::from_slice(&payload)?)
}

fn save_kernel(kernel: &Arc<Kernel>) -> Result<SavedKernel, StateError> {
    let memory = kernel.memory_file().save()?;
    let namespaces = kernel
        .mount_namespaces_snapshot()
        .iter()
        .map(MountNamespace::save)
        .collect();
    let mut thread_groups = Vec::new();
    for tg in kernel.thread_groups() {
        let (tasks, exit_status, reaped) = tg.saved_tasks();
        let mut fds = Vec::new();
        tg.fd_table.for_each(|fd, file| match file.save() {
            Some(description) => fds.push(SavedFd { fd, description }),
            None => log::warn!("fd {} of pid {} does not support checkpoint", fd, tg.pid),
        });
        thread_groups.push(SavedThreadGroup {
            pid: tg.pid,
            container_id: tg.container_id.clone(),
            filename: tg.filename.clone(),
            argv: tg.argv.clone(),
            envv: tg.envv.clone(),
            working_directory: tg.working_directory.clone(),
            umask: tg.umask,
            credentials: tg.credentials.clone(),
            limits: tg.limits.clone(),
            tasks,
            exit_status,
            reaped,
            fds,
            mount_ns_owner: tg.mount_namespace().map(|ns| ns.owner().to_string()),
        });
    }
    Ok(SavedKernel {
        memory,
        namespaces,
        thread_groups,
    })
}

/// Deterministically reconstructs a kernel from its image. When `remap`
/// is given, state owned by the old container id is re-homed under the new
/// one (restoring into a fresh container). The kernel comes back paused;
/// the caller resumes it.
pub fn rebuild_kernel(
    saved: &SavedKernel,
    remap: Option<(&str, &str)>,
) -> Result<Arc<Kernel>, StateError> {
    let rename = |id: &str| -> String {
        match remap {
            Some((old, new)) if id == old => new.to_string(),
            _ => id.to_string(),
        }
    };

    let memory = MemoryFile::restore(&saved.memory)?;
    let kernel = Kernel::from_parts(memory);
    kernel.mark_paused();

    for ns in &saved.namespaces {
        let mut ns = ns.clone();
        ns.owner = rename(&ns.owner);
        kernel.register_mount_namespace(MountNamespace::restore(&ns).map_err(crate::errors::KernelError::Vfs)?);
    }

    for stg in &saved.thread_groups {
        let container_id = rename(&stg.container_id);
        let mount_ns = match &stg.mount_ns_owner {
            Some(owner) => {
                let ns = kernel.mount_namespace(&rename(owner));
                if let Some(ns) = &ns {
                    ns.inc_ref().map_err(crate::errors::KernelError::Vfs)?;
                }
                ns
            }
            None => None,
        };
        let tg = ThreadGroup::new(
            stg.pid,
            container_id,
            stg.filename.clone(),
            stg.argv.clone(),
            stg.envv.clone(),
            stg.working_directory.clone(),
            stg.umask,
            stg.credentials.clone(),
            stg.limits.clone(),
            crate::kernel::FdTable::new(),
            mount_ns,
        );
        for saved_fd in &stg.fds {
            let file = restore_description(
                &saved_fd.description,
                kernel.monotonic_clock(),
                kernel.realtime_clock(),
            );
            tg.fd_table.set_fd(saved_fd.fd, file, FdFlags::default());
        }
        tg.restore_tasks(stg.tasks.clone(), stg.exit_status, stg.reaped);
        kernel.insert_restored_group(tg);
    }

    log::info!(
        "kernel rebuilt from image ({} thread groups, {} namespaces)",
        saved.thread_groups.len(),
        saved.namespaces.len()
    );
    Ok(kernel)
}
