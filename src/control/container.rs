//! Container objects and their on-disk state
//!
//! A container is the unit the manager drives: created from a bundle,
//! started into a sandbox, paused/resumed, checkpointed, restored,
//! destroyed. Its durable state is a JSON file named
//! `<sandbox>.<container>.state` under the root directory, committed with a
//! temp-file rename so no partial state is ever visible on disk.

use crate::{
    context::Context,
    control::{
        lifecycle::{Lifecycle, StartContainerArgs},
        sandbox::Sandbox,
        Config, SandboxRegistry,
    },
    errors::ControlError,
    kernel::{CreateProcessArgs, Credentials, Kgid, Kuid, Pid, ProcessInfo, Signal, WaitStatus},
    spec::RuntimeSpec,
    state::{
        self, validate_restore_spec, CheckpointOpts, SavedContainerMeta,
    },
    vfs::{GoferConf, MountNamespace, MountOptions, Propagation},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Container status.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Status {
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
}

/// A container id qualified by the sandbox hosting it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullId {
    pub sandbox_id: String,
    pub container_id: String,
}

/// Arguments to create a container.
#[derive(Clone, Debug)]
pub struct ContainerArgs {
    pub id: String,
    pub spec: RuntimeSpec,
    pub bundle_dir: PathBuf,
    /// Gofer serving the rootfs; a private tmpfs root is used when absent.
    pub gofer: Option<GoferConf>,
}

/// Arguments to execute an additional process in a running container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecArgs {
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    #[serde(rename = "wd")]
    pub working_directory: String,
    #[serde(rename = "KUID")]
    pub kuid: u32,
    #[serde(rename = "KGID")]
    pub kgid: u32,
}

#[derive(Serialize, Deserialize)]
pub struct Container {
    pub id: FullId,
    pub status: Status,
    pub spec: RuntimeSpec,
    pub bundle_dir: PathBuf,
    pub root_dir: PathBuf,
    /// Pid of the container's init process inside the sandbox.
    pub init_pid: Pid,
    /// Host pid of the supervisor; recorded for the manager.
    pub sandbox_pid: u32,
    /// Host pid of the gofer collaborator, when one serves the rootfs.
    pub gofer_pid: u32,
    pub checkpointed: bool,
    pub restored: bool,
    #[serde(skip)]
    sandbox: Option<Arc<Sandbox>>,
}

lazy_static! {
    static ref ID_RE: Regex = Regex::new(r"^[\w+\-\.]+$").unwrap();
}

fn validate_id(id: &str) -> Result<(), ControlError> {
    if ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(ControlError::InvalidId(id.to_string()))
    }
}

fn state_file_path(root_dir: &Path, id: &FullId) -> PathBuf {
    root_dir.join(format!("{}.{}.state", id.sandbox_id, id.container_id))
}

impl Container {
    /// Creates a container in `Created`: allocates its sandbox, registers
    /// its mount namespace, writes the spec to the bundle, and persists the
    /// container state.
    pub fn new(
        conf: &Config,
        registry: &SandboxRegistry,
        args: ContainerArgs,
    ) -> Result<Container, ControlError> {
        validate_id(&args.id)?;
        args.spec.validate().map_err(ControlError::InvalidSpec)?;
        fs::create_dir_all(&conf.root_dir)?;

        let id = FullId {
            sandbox_id: args.id.clone(),
            container_id: args.id.clone(),
        };
        if state_file_path(&conf.root_dir, &id).exists() {
            return Err(ControlError::Exists(args.id));
        }

        let mut container = Container {
            id,
            status: Status::Creating,
            spec: args.spec,
            bundle_dir: args.bundle_dir,
            root_dir: conf.root_dir.clone(),
            init_pid: 0,
            sandbox_pid: 0,
            gofer_pid: 0,
            checkpointed: false,
            restored: false,
            sandbox: None,
        };

        let (sandbox, _started) =
            Sandbox::new(&container.id.sandbox_id, conf.total_memory, 1)?;
        container.sandbox_pid = sandbox.sandbox_pid;
        sandbox.register_container_meta(SavedContainerMeta {
            id: container.id.container_id.clone(),
            spec: container.spec.clone(),
        });

        let ns = match &args.gofer {
            Some(gofer) => {
                MountNamespace::new_gofer_root(&container.id.container_id, "9p", gofer)
            }
            None => {
                let ns = MountNamespace::new(&container.id.container_id);
                // no gofer collaborator: a private writable root
                ns.mount(
                    Path::new("/"),
                    "tmpfs",
                    "rootfs",
                    MountOptions::default(),
                    Propagation::Private,
                )
                .map_err(crate::errors::KernelError::Vfs)?;
                ns
            }
        };
        for mount in &container.spec.mounts {
            ns.mount(
                Path::new(&mount.destination),
                &mount.mount_type,
                &mount.source,
                MountOptions::default(),
                Propagation::Private,
            )
            .map_err(crate::errors::KernelError::Vfs)?;
        }
        sandbox.kernel().register_mount_namespace(ns);
        registry.insert(sandbox.clone());
        container.sandbox = Some(sandbox);

        if !container.bundle_dir.as_os_str().is_empty() {
            fs::create_dir_all(&container.bundle_dir)?;
            let config = serde_json::to_vec_pretty(&container.spec)?;
            fs::write(container.bundle_dir.join("config.json"), config)?;
        }

        container.status = Status::Created;
        container.save_new()?;
        log::info!("created container {:?}", container.id.container_id);
        Ok(container)
    }

    /// Transitions `Created → Running` by starting the init process.
    pub fn start(&mut self, _conf: &Config) -> Result<(), ControlError> {
        if self.status != Status::Created {
            return Err(ControlError::AlreadyStarted);
        }
        let sandbox = self.require_sandbox()?.clone();
        let lifecycle = Lifecycle::new(sandbox.clone());
        let user = &self.spec.process.user;
        let pid = lifecycle.start_container(&StartContainerArgs {
            argv: self.spec.process.args.clone(),
            envv: self.spec.process.env.clone(),
            working_directory: self.spec.process.cwd.clone(),
            kuid: user.uid,
            kgid: user.gid,
            extra_kgids: user.additional_gids.clone(),
            capabilities: self.spec.process.capabilities.clone(),
            container_id: self.id.container_id.clone(),
            container_name: self.id.container_id.clone(),
            ..Default::default()
        })?;
        self.init_pid = pid;
        self.status = Status::Running;
        if let Err(err) = self.save_existing() {
            // a racing destroy removed our state; undo the start
            log::warn!("start of {:?} lost the race: {}", self.id.container_id, err);
            sandbox.tear_down_container(&self.id.container_id);
            self.status = Status::Stopped;
            return Err(err);
        }
        Ok(())
    }

    /// Creates a process inside an already-running container, inheriting
    /// its namespaces.
    pub fn execute(&self, args: &ExecArgs) -> Result<Pid, ControlError> {
        if self.status != Status::Running {
            return Err(ControlError::NotRunning);
        }
        let kernel = self.require_sandbox()?.kernel();
        let mount_namespace = kernel.mount_namespace(&self.id.container_id);
        if let Some(ns) = &mount_namespace {
            ns.inc_ref().map_err(crate::errors::KernelError::Vfs)?;
        }
        let (tg, pid) = kernel.create_process(CreateProcessArgs {
            argv: args.argv.clone(),
            envv: args.envv.clone(),
            working_directory: if args.working_directory.is_empty() {
                self.spec.process.cwd.clone()
            } else {
                args.working_directory.clone()
            },
            credentials: Credentials::user(
                Kuid(args.kuid),
                Kgid(args.kgid),
                Vec::new(),
                None,
            ),
            umask: 0o22,
            container_id: self.id.container_id.clone(),
            mount_namespace,
            ..Default::default()
        })?;
        kernel.start_process(&tg);
        log::debug!("executed {:?} in {:?}", args.argv, self.id.container_id);
        Ok(pid)
    }

    /// Quiesces all tasks and timers: `Running → Paused`.
    pub fn pause(&mut self) -> Result<(), ControlError> {
        if self.status != Status::Running {
            return Err(ControlError::NotRunning);
        }
        self.require_sandbox()?.kernel().pause();
        self.status = Status::Paused;
        self.save_existing()
    }

    /// Reverses a pause: `Paused → Running`.
    pub fn resume(&mut self) -> Result<(), ControlError> {
        if self.status != Status::Paused {
            return Err(ControlError::NotPaused);
        }
        self.require_sandbox()?.kernel().unpause();
        self.status = Status::Running;
        self.save_existing()
    }

    /// Delivers a signal to init, or to every process in the container.
    pub fn signal_container(&self, signal: Signal, all: bool) -> Result<(), ControlError> {
        if self.status != Status::Running && self.status != Status::Paused {
            return Err(ControlError::NotRunning);
        }
        self.require_sandbox()?
            .kernel()
            .signal_container(&self.id.container_id, signal, all)?;
        Ok(())
    }

    /// Blocks until init exits, reaps it, and records `Stopped`.
    pub fn wait(&mut self) -> Result<WaitStatus, ControlError> {
        let kernel = self.require_sandbox()?.kernel();
        let ctx = kernel.background_context();
        let status = kernel.wait_pid(self.init_pid, &ctx)?;
        self.status = Status::Stopped;
        self.save_existing()?;
        Ok(status)
    }

    /// Blocks until an exec'd process exits and returns its status.
    pub fn wait_pid(&self, pid: Pid, ctx: &Context) -> Result<WaitStatus, ControlError> {
        let kernel = self.require_sandbox()?.kernel();
        Ok(kernel.wait_pid(pid, ctx)?)
    }

    /// The container's process list.
    pub fn processes(&self) -> Result<Vec<ProcessInfo>, ControlError> {
        let kernel = self.require_sandbox()?.kernel();
        Ok(kernel.processes(Some(&self.id.container_id)))
    }

    /// Serializes the sandbox into `dir`. Without `resume` the container
    /// is left paused.
    pub fn checkpoint(&mut self, dir: &Path, opts: &CheckpointOpts) -> Result<(), ControlError> {
        if self.status != Status::Running && self.status != Status::Paused {
            return Err(ControlError::NotRunning);
        }
        let sandbox = self.require_sandbox()?;
        state::checkpoint(&sandbox.kernel(), sandbox.container_metas(), dir, opts)?;
        self.checkpointed = true;
        self.status = if opts.resume {
            Status::Running
        } else {
            Status::Paused
        };
        self.save_existing()
    }

    /// Restores the image in `dir` into this freshly created container.
    /// Validation failures and decode errors leave the checkpoint on disk
    /// untouched and this container unusable.
    pub fn restore(
        &mut self,
        conf: &Config,
        dir: &Path,
        _direct: bool,
        background: bool,
    ) -> Result<(), ControlError> {
        if self.status != Status::Created {
            return Err(ControlError::AlreadyStarted);
        }
        let sandbox = self.require_sandbox()?;
        let image = state::load_image(dir)?;
        let meta = image.containers.first().ok_or_else(|| {
            crate::errors::StateError::Corruption("image has no container metadata".to_string())
        })?;
        validate_restore_spec(&meta.spec, &self.spec, conf.restore_spec_validation)?;

        let kernel = state::rebuild_kernel(
            &image.kernel,
            Some((meta.id.as_str(), self.id.container_id.as_str())),
        )?;
        let init_pid = kernel
            .container_init(&self.id.container_id)
            .map(|tg| tg.pid)
            .ok_or_else(|| {
                crate::errors::StateError::Corruption(
                    "image has no init process for the restored container".to_string(),
                )
            })?;
        sandbox.replace_kernel(kernel.clone());
        if !background {
            kernel.unpause();
        }
        self.init_pid = init_pid;
        self.status = Status::Running;
        self.restored = true;
        self.checkpointed = false;
        self.save_existing()?;
        log::info!(
            "restored container {:?} from {:?} (init pid {})",
            self.id.container_id,
            dir,
            init_pid
        );
        Ok(())
    }

    /// Tears the container down and removes its durable state. Idempotent,
    /// including for containers that never started.
    pub fn destroy(&mut self, registry: &SandboxRegistry) -> Result<(), ControlError> {
        let sandbox = self.sandbox.take();
        if let Some(sandbox) = &sandbox {
            sandbox.tear_down_container(&self.id.container_id);
            registry.remove(&sandbox.id);
        }
        let path = state_file_path(&self.root_dir, &self.id);
        // hold the state lock across the removal; a racing save observes
        // either the file before removal or its absence, never a window
        // it could write back into
        let _state = sandbox.as_ref().map(|sandbox| sandbox.state_lock());
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.status = Status::Stopped;
        log::info!("destroyed container {:?}", self.id.container_id);
        Ok(())
    }

    /// Loads a container from its state file, accepting unique id
    /// prefixes, and re-attaches its sandbox from the registry.
    pub fn load(
        root_dir: &Path,
        registry: &SandboxRegistry,
        id: &str,
    ) -> Result<Container, ControlError> {
        validate_id(id)?;
        let ids = Container::list(root_dir)?;
        let mut matched: Vec<&FullId> = ids
            .iter()
            .filter(|full| full.container_id.starts_with(id))
            .collect();
        if let Some(exact) = matched
            .iter()
            .find(|full| full.container_id == id)
            .copied()
        {
            matched = vec![exact];
        }
        let full = match matched.len() {
            0 => return Err(ControlError::NotFound(id.to_string())),
            1 => matched[0].clone(),
            _ => return Err(ControlError::AmbiguousId(id.to_string())),
        };
        let path = state_file_path(root_dir, &full);
        let data = fs::read(&path)?;
        let mut container: Container =
            serde_json::from_slice(&data).map_err(|source| ControlError::CorruptedStateFile {
                path: path.clone(),
                source,
            })?;
        container.sandbox = registry.get(&full.sandbox_id);
        Ok(container)
    }

    /// Ids of every container persisted under `root_dir`.
    pub fn list(root_dir: &Path) -> Result<Vec<FullId>, ControlError> {
        #[derive(Deserialize)]
        struct IdOnly {
            id: FullId,
        }
        let mut out = Vec::new();
        let entries = match fs::read_dir(root_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "state").unwrap_or(false) {
                let data = fs::read(&path)?;
                let decoded: IdOnly = serde_json::from_slice(&data).map_err(|source| {
                    ControlError::CorruptedStateFile {
                        path: path.clone(),
                        source,
                    }
                })?;
                out.push(decoded.id);
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn sandbox(&self) -> Option<&Arc<Sandbox>> {
        self.sandbox.as_ref()
    }

    fn require_sandbox(&self) -> Result<&Arc<Sandbox>, ControlError> {
        self.sandbox
            .as_ref()
            .ok_or_else(|| ControlError::NotFound(self.id.container_id.clone()))
    }

    fn save_new(&self) -> Result<(), ControlError> {
        self.persist()
    }

    /// Saves over an existing state file. Fails if the file is gone, which
    /// means a concurrent destroy won and this operation must back out.
    /// The sandbox's state lock makes the check and the write one step
    /// with respect to destroy's removal.
    fn save_existing(&self) -> Result<(), ControlError> {
        let sandbox = self.require_sandbox()?;
        let _state = sandbox.state_lock();
        let path = state_file_path(&self.root_dir, &self.id);
        if !path.exists() {
            return Err(ControlError::NotFound(self.id.container_id.clone()));
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), ControlError> {
        let path = state_file_path(&self.root_dir, &self.id);
        let temp = path.with_extension("state.tmp");
        fs::write(&temp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&temp, &path)?;
        log::trace!("saved state of {:?} ({:?})", self.id.container_id, self.status);
        Ok(())
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id.container_id)
            .field("status", &self.status)
            .field("init_pid", &self.init_pid)
            .finish()
    }
}
