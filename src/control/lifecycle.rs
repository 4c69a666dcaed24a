//! Lifecycle RPCs: starting containers inside a sandbox
//!
//! `StartContainer` wires a container's credentials, limits, and mount
//! namespace into a fresh init process. The namespace is looked up by
//! container id and reference-incremented before it becomes visible; when a
//! container arrives without one (pure RPC path), it is created from the
//! mount root configuration in the request.

use crate::{
    control::sandbox::Sandbox,
    errors::ControlError,
    kernel::{CreateProcessArgs, Credentials, Kgid, Kuid, LimitSet, Pid},
    spec::Capabilities,
    vfs::{GoferConf, MountNamespace, MountOptions, Propagation},
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, sync::Arc};

/// Mount configuration carried by a start request.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SentryMount {
    pub target: String,
    pub fs_type: String,
}

/// The set of arguments to start a container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartContainerArgs {
    /// Executable to load. Guessed from `argv[0]` when empty.
    pub filename: String,
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    #[serde(rename = "wd")]
    pub working_directory: String,
    /// UID in the root user namespace; root if unset.
    #[serde(rename = "KUID")]
    pub kuid: u32,
    /// GID in the root user namespace; the root group if unset.
    #[serde(rename = "KGID")]
    pub kgid: u32,
    #[serde(rename = "extraKGID")]
    pub extra_kgids: Vec<u32>,
    pub capabilities: Option<Capabilities>,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub limits: Option<LimitSet>,
    #[serde(rename = "mountRootConf")]
    pub mount_root_conf: Option<SentryMount>,
    #[serde(rename = "subMountConf")]
    pub sub_mounts: Vec<SentryMount>,
    /// Descriptor the mount root's gofer connection rides on.
    #[serde(rename = "mountFd")]
    pub mount_fd: i32,
    #[serde(rename = "containerName")]
    pub container_name: String,
}

impl fmt::Display for StartContainerArgs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.argv.is_empty() {
            return write!(f, "{}", self.filename);
        }
        let mut argv = self.argv.clone();
        if !self.filename.is_empty() {
            argv[0] = self.filename.clone();
        }
        write!(f, "{}", argv.join(" "))
    }
}

/// Functions related to starting and stopping tasks.
pub struct Lifecycle {
    sandbox: Arc<Sandbox>,
}

impl Lifecycle {
    pub fn new(sandbox: Arc<Sandbox>) -> Lifecycle {
        Lifecycle { sandbox }
    }

    fn create_mount_namespace(
        &self,
        args: &StartContainerArgs,
        root: &SentryMount,
    ) -> Result<MountNamespace, ControlError> {
        let gofer = GoferConf {
            rfdno: args.mount_fd,
            wfdno: args.mount_fd,
        };
        let ns = MountNamespace::new_gofer_root(&args.container_id, &root.fs_type, &gofer);
        for sub in &args.sub_mounts {
            ns.mount(
                Path::new(&sub.target),
                &sub.fs_type,
                "",
                MountOptions::default(),
                Propagation::Private,
            )
            .map_err(crate::errors::KernelError::Vfs)?;
        }
        Ok(ns)
    }

    /// Starts a new container in the sandbox.
    pub fn start_container(&self, args: &StartContainerArgs) -> Result<Pid, ControlError> {
        let kernel = self.sandbox.kernel();
        let credentials = Credentials::user(
            Kuid(args.kuid),
            Kgid(args.kgid),
            args.extra_kgids.iter().copied().map(Kgid).collect(),
            args.capabilities.clone(),
        );
        let limits = args.limits.clone().unwrap_or_default();

        let mount_namespace = match kernel.mount_namespace(&args.container_id) {
            Some(ns) => ns,
            None => {
                let root = args.mount_root_conf.clone().ok_or_else(|| {
                    ControlError::InvalidSpec(format!(
                        "no mount namespace registered for {:?} and no mount root config",
                        args.container_id
                    ))
                })?;
                let ns = self.create_mount_namespace(args, &root)?;
                kernel.register_mount_namespace(ns.clone());
                ns
            }
        };
        mount_namespace.inc_ref().map_err(crate::errors::KernelError::Vfs)?;

        let (tg, pid) = kernel.create_process(CreateProcessArgs {
            filename: args.filename.clone(),
            argv: args.argv.clone(),
            envv: args.envv.clone(),
            working_directory: args.working_directory.clone(),
            credentials,
            umask: 0o22,
            limits,
            container_id: args.container_id.clone(),
            mount_namespace: Some(mount_namespace),
        })?;
        kernel.start_process(&tg);
        log::info!("started container {:?}: {}", args.container_id, args);
        self.sandbox.note_container_started();
        Ok(pid)
    }

    /// Pauses all tasks, blocking until they are stopped.
    pub fn pause(&self) {
        self.sandbox.kernel().pause();
    }

    /// Resumes all tasks.
    pub fn resume(&self) {
        self.sandbox.kernel().unpause();
    }
}
