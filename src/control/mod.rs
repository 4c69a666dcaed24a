//! The control plane: container objects and the RPC surface
//!
//! Each sandbox serves length-prefixed JSON frames over a Unix domain
//! socket whose path derives from the sandbox id. One task runs per
//! connection; handlers call into multi-threaded kernel code, with blocking
//! waits pushed onto the blocking pool.

pub mod container;
pub mod lifecycle;
pub mod sandbox;

pub use container::{Container, ContainerArgs, ExecArgs, FullId, Status};
pub use lifecycle::{Lifecycle, SentryMount, StartContainerArgs};
pub use sandbox::Sandbox;

use crate::{
    errors::ControlError,
    kernel::{ProcessInfo, Signal, WaitStatus},
    memory::UsageStats,
    state::{self, CheckpointOpts, CompressionLevel, ValidationPolicy},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};

/// Manager configuration shared by all control-plane entry points.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding per-container state files and control sockets.
    pub root_dir: PathBuf,
    /// Upper bound for each sandbox's memory file.
    pub total_memory: u64,
    pub restore_spec_validation: ValidationPolicy,
}

impl Config {
    pub fn new(root_dir: PathBuf) -> Config {
        Config {
            root_dir,
            total_memory: 2 << 30,
            restore_spec_validation: ValidationPolicy::Enforce,
        }
    }
}

/// Explicit registry of live sandboxes; passed through every entry point
/// instead of living in a process-wide global.
#[derive(Clone, Default)]
pub struct SandboxRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<Sandbox>>>>,
}

impl SandboxRegistry {
    pub fn new() -> SandboxRegistry {
        SandboxRegistry::default()
    }

    pub fn insert(&self, sandbox: Arc<Sandbox>) {
        self.inner
            .lock()
            .unwrap()
            .insert(sandbox.id.clone(), sandbox);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.inner.lock().unwrap().remove(id)
    }
}

/// A control request, one frame per call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    StartContainer(StartContainerArgs),
    Pause,
    Resume,
    Checkpoint {
        dir: PathBuf,
        compression: CompressionLevel,
        resume: bool,
    },
    Restore {
        dir: PathBuf,
    },
    Usage {
        full: bool,
    },
    Signal {
        pid: i32,
        signum: i32,
        all: bool,
    },
    Wait {
        pid: i32,
    },
    Processes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "result", content = "value")]
pub enum Response {
    Ok,
    Error(String),
    Started(i32),
    Usage(UsageStats),
    Wait(WaitStatus),
    Processes(Vec<ProcessInfo>),
}

/// Control socket path for a sandbox id.
pub fn socket_path(root_dir: &Path, sandbox_id: &str) -> PathBuf {
    root_dir.join(format!("{}.sock", sandbox_id))
}

async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>, ControlError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > (16 << 20) {
        return Err(ControlError::Protocol(format!("oversized frame: {}", len)));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<(), ControlError> {
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Serves control RPCs for one sandbox.
pub struct ControlServer {
    sandbox: Arc<Sandbox>,
}

impl ControlServer {
    pub fn new(sandbox: Arc<Sandbox>) -> ControlServer {
        ControlServer { sandbox }
    }

    /// Binds the sandbox's socket under `root_dir` and returns the
    /// listener alongside its path.
    pub fn bind(&self, root_dir: &Path) -> Result<(UnixListener, PathBuf), ControlError> {
        let path = socket_path(root_dir, &self.sandbox.id);
        // a previous supervisor's socket may linger
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(&path)?;
        log::info!("control server for {:?} on {:?}", self.sandbox.id, path);
        Ok((listener, path))
    }

    /// Accept loop; one task per connection.
    pub async fn serve(self, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let sandbox = self.sandbox.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(sandbox, stream).await {
                            log::warn!("control connection error: {}", err);
                        }
                    });
                }
                Err(err) => {
                    log::warn!("control accept error: {}", err);
                    break;
                }
            }
        }
    }
}

async fn serve_connection(
    sandbox: Arc<Sandbox>,
    mut stream: UnixStream,
) -> Result<(), ControlError> {
    while let Some(frame) = read_frame(&mut stream).await? {
        let request: Request =
            serde_json::from_slice(&frame).map_err(|e| ControlError::Protocol(e.to_string()))?;
        log::debug!("control request: {:?}", request);
        let response = dispatch(&sandbox, request).await;
        write_frame(&mut stream, &serde_json::to_vec(&response)?).await?;
    }
    Ok(())
}

async fn dispatch(sandbox: &Arc<Sandbox>, request: Request) -> Response {
    let result = match request {
        Request::StartContainer(args) => {
            let lifecycle = Lifecycle::new(sandbox.clone());
            lifecycle.start_container(&args).map(Response::Started)
        }
        Request::Pause => {
            sandbox.kernel().pause();
            Ok(Response::Ok)
        }
        Request::Resume => {
            sandbox.kernel().unpause();
            Ok(Response::Ok)
        }
        Request::Checkpoint {
            dir,
            compression,
            resume,
        } => {
            let kernel = sandbox.kernel();
            let metas = sandbox.container_metas();
            let opts = CheckpointOpts {
                compression,
                resume,
            };
            tokio::task::spawn_blocking(move || state::checkpoint(&kernel, metas, &dir, &opts))
                .await
                .map_err(|e| ControlError::Remote(e.to_string()))
                .and_then(|r| r.map_err(ControlError::from))
                .map(|_| Response::Ok)
        }
        Request::Restore { dir } => {
            let sandbox = sandbox.clone();
            tokio::task::spawn_blocking(move || -> Result<(), ControlError> {
                let image = state::load_image(&dir)?;
                let kernel = state::rebuild_kernel(&image.kernel, None)?;
                kernel.unpause();
                sandbox.replace_kernel(kernel);
                Ok(())
            })
            .await
            .map_err(|e| ControlError::Remote(e.to_string()))
            .and_then(|r| r)
            .map(|_| Response::Ok)
        }
        Request::Usage { full } => Ok(Response::Usage(sandbox.kernel().memory_file().usage(full))),
        Request::Signal { pid, signum, all } => {
            let kernel = sandbox.kernel();
            let result = if pid > 0 {
                kernel.signal_process(pid, Signal(signum))
            } else if all {
                // pid 0 with all: every container in the sandbox
                let groups = kernel.thread_groups();
                for tg in groups {
                    tg.deliver_signal(Signal(signum));
                }
                Ok(())
            } else {
                Err(crate::errors::KernelError::NoSuchProcess(pid))
            };
            result.map(|_| Response::Ok).map_err(ControlError::from)
        }
        Request::Wait { pid } => {
            let kernel = sandbox.kernel();
            tokio::task::spawn_blocking(move || {
                let ctx = kernel.background_context();
                kernel.wait_pid(pid, &ctx)
            })
            .await
            .map_err(|e| ControlError::Remote(e.to_string()))
            .and_then(|r| r.map_err(ControlError::from))
            .map(Response::Wait)
        }
        Request::Processes => Ok(Response::Processes(sandbox.kernel().processes(None))),
    };
    result.unwrap_or_else(|err| Response::Error(err.to_string()))
}

/// Client side of the control socket, for managers and tests.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> Result<ControlClient, ControlError> {
        Ok(ControlClient {
            stream: UnixStream::connect(path).await?,
        })
    }

    pub async fn call(&mut self, request: &Request) -> Result<Response, ControlError> {
        write_frame(&mut self.stream, &serde_json::to_vec(request)?).await?;
        match read_frame(&mut self.stream).await? {
            Some(frame) => Ok(serde_json::from_slice(&frame)
                .map_err(|e| ControlError::Protocol(e.to_string()))?),
            None => Err(ControlError::Protocol("connection closed".to_string())),
        }
    }

    /// Like `call`, but unwraps error responses into `ControlError`.
    pub async fn expect_ok(&mut self, request: &Request) -> Result<Response, ControlError> {
        match self.call(request).await? {
            Response::Error(message) => Err(ControlError::Remote(message)),
            response => Ok(response),
        }
    }
}
