//! Lifecycle of one isolated instance backing one agent.
//!
//! A [`Sandbox`] goes `Unstarted -> Running -> Terminated` and never comes back. Commands
//! only run while `Running`. The container runtime itself sits behind [`SandboxBackend`];
//! [`apptainer::ApptainerBackend`] is the production one.
//!
//! Teardown is explicit ([`Sandbox::destroy`], or scoped through [`with_sandbox`]). `Drop`
//! is only a backup for paths that skipped it, and never panics.

pub mod apptainer;
mod naming;

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cgroup_manager::CPU_PERIOD_US;
use crate::error::MatchError;
use crate::timeout::Deadline;

pub use crate::cgroup_manager::{Completion, ProcessLimits, ProcessOutput, MAX_OUTPUT};
pub use naming::{instance_name, is_managed, INSTANCE_PREFIX};

/// Lifecycle state of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxState {
    /// Name allocated, nothing started yet.
    Unstarted,
    /// Started and verified.
    Running,
    /// Stopped (or never started). Final.
    Terminated,
}

impl Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxState::Unstarted => write!(f, "unstarted"),
            SandboxState::Running => write!(f, "running"),
            SandboxState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Whether the instance may reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkAccess {
    /// No network at all.
    #[default]
    Disabled,
    /// Runtime default networking.
    Enabled,
}

/// Filesystem mode of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilesystemMode {
    /// The image is mounted read-only.
    #[default]
    ReadOnly,
    /// Development variant: writable image, fully contained filesystem, private PID and IPC
    /// namespaces, clean environment.
    Writable,
}

/// Resource and isolation settings of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOptions {
    /// Memory ceiling in bytes.
    pub memory_limit: u64,
    /// CPU share, in CPUs (`0.5` is half a CPU).
    pub cpu_quota: f64,
    /// Network access.
    pub network: NetworkAccess,
    /// Filesystem mode.
    pub filesystem: FilesystemMode,
    /// Numeric user commands run as. Never `0`.
    pub user_id: u32,
    /// Maximum processes per command.
    pub max_pids: i64,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            memory_limit: 512 * 1024 * 1024,
            cpu_quota: 0.5,
            network: NetworkAccess::Disabled,
            filesystem: FilesystemMode::ReadOnly,
            user_id: 100,
            max_pids: 100,
        }
    }
}

impl SandboxOptions {
    /// Settings for iterating on an agent locally (writable, contained).
    pub fn development() -> Self {
        Self {
            filesystem: FilesystemMode::Writable,
            ..Self::default()
        }
    }

    /// Cgroup limits for one command run in the instance.
    pub fn process_limits(&self) -> ProcessLimits {
        ProcessLimits {
            max_memory: i64::try_from(self.memory_limit).unwrap_or(i64::MAX),
            max_pids: self.max_pids,
            cpu_quota: (self.cpu_quota * CPU_PERIOD_US as f64) as i64,
        }
    }
}

/// The container runtime, as seen by a [`Sandbox`].
///
/// `stop` must be safe to call on an instance that is already gone.
pub trait SandboxBackend: Send + Sync {
    /// Start a named instance from `artifact`.
    fn start(&self, name: &str, artifact: &Path, options: &SandboxOptions) -> anyhow::Result<()>;

    /// Names of the running instances.
    fn list(&self) -> anyhow::Result<Vec<String>>;

    /// Run `command` in the instance, killing it when `deadline` passes.
    ///
    /// `Err` is a transport failure: the command could not be run at all.
    fn exec(
        &self,
        name: &str,
        command: &[String],
        options: &SandboxOptions,
        deadline: Deadline,
    ) -> anyhow::Result<Completion>;

    /// Stop the instance.
    fn stop(&self, name: &str) -> anyhow::Result<()>;
}

/// One isolated instance, exclusively owned by the scope that created it.
///
/// `exec` takes `&mut self`: a handle never has two commands in flight.
#[derive(Debug)]
pub struct Sandbox<B: SandboxBackend> {
    name: String,
    artifact: PathBuf,
    options: SandboxOptions,
    state: SandboxState,
    backend: Arc<B>,
}

impl<B: SandboxBackend> Sandbox<B> {
    /// An unstarted sandbox with a fresh, unique instance name.
    pub fn new(backend: Arc<B>, artifact: impl Into<PathBuf>, options: SandboxOptions) -> Self {
        let artifact = artifact.into();
        Sandbox {
            name: instance_name(&artifact),
            artifact,
            options,
            state: SandboxState::Unstarted,
            backend,
        }
    }

    /// Allocate and start a sandbox.
    ///
    /// # Errors
    /// `SandboxStart` if the runtime failed, or the instance is not listed once started.
    pub fn create(
        backend: Arc<B>,
        artifact: impl Into<PathBuf>,
        options: SandboxOptions,
    ) -> Result<Self, MatchError> {
        let mut sandbox = Sandbox::new(backend, artifact, options);
        sandbox.start()?;
        Ok(sandbox)
    }

    /// Start the instance and verify it is running.
    ///
    /// On failure the instance is torn down and the sandbox is `Terminated`.
    #[instrument(skip(self), fields(name = %self.name, artifact = ?self.artifact))]
    pub fn start(&mut self) -> Result<(), MatchError> {
        if self.state != SandboxState::Unstarted {
            return Err(self.invalid_state());
        }

        let started = self
            .backend
            .start(&self.name, &self.artifact, &self.options)
            .and_then(|()| self.backend.list())
            .and_then(|running| {
                if running.iter().any(|n| *n == self.name) {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("instance not listed after start"))
                }
            });

        match started {
            Ok(()) => {
                self.state = SandboxState::Running;
                info!("sandbox started");
                Ok(())
            }
            Err(e) => {
                warn!("sandbox start failed: {e:#}");
                // a half-started instance must not outlive us
                if let Err(stop) = self.backend.stop(&self.name) {
                    debug!("stop after failed start: {stop:#}");
                }
                self.state = SandboxState::Terminated;
                Err(MatchError::SandboxStart {
                    name: self.name.clone(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Run `command` in the instance under `deadline`.
    ///
    /// Stderr is returned for diagnosis; on its own it is not a failure.
    ///
    /// # Errors
    /// - `InvalidSandboxState` if the sandbox is not running
    /// - `MoveTimeoutExceeded` if the deadline passed (the command has been killed)
    /// - `AgentProtocol` if the command wrote more than the captured limit
    /// - `CommandExecution` on a non-zero exit status or transport failure
    pub fn exec(
        &mut self,
        command: &[String],
        deadline: Deadline,
    ) -> Result<ProcessOutput, MatchError> {
        if self.state != SandboxState::Running {
            return Err(self.invalid_state());
        }

        let completion = self
            .backend
            .exec(&self.name, command, &self.options, deadline)
            .map_err(|e| MatchError::CommandExecution {
                name: self.name.clone(),
                status: None,
                detail: format!("{e:#}"),
            })?;

        match completion {
            Completion::TimedOut => {
                debug!(name = %self.name, "command killed at deadline");
                Err(deadline.exceeded())
            }
            Completion::Exited(output) if output.truncated => Err(MatchError::AgentProtocol {
                reason: format!("output over {MAX_OUTPUT} bytes"),
                raw: output.stdout,
            }),
            Completion::Exited(output) if output.status == Some(0) => Ok(output),
            Completion::Exited(output) => Err(MatchError::CommandExecution {
                name: self.name.clone(),
                status: output.status,
                detail: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Run a Python snippet in the instance and return its trimmed stdout.
    pub fn exec_command(&mut self, code: &str, deadline: Deadline) -> Result<String, MatchError> {
        let command = ["python3".to_string(), "-c".to_string(), code.to_string()];
        self.exec(&command, deadline)
            .map(|output| output.stdout.trim().to_string())
    }

    /// Stop the instance. Idempotent, never fails: errors are logged and swallowed.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn destroy(&mut self) {
        if self.state == SandboxState::Running {
            match self.backend.stop(&self.name) {
                Ok(()) => info!("sandbox stopped"),
                Err(e) => warn!("could not stop sandbox, instance may be left running: {e:#}"),
            }
        }
        self.state = SandboxState::Terminated;
    }

    /// Unique instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image or directory the instance runs.
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Instance settings.
    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    fn invalid_state(&self) -> MatchError {
        MatchError::InvalidSandboxState {
            name: self.name.clone(),
            state: self.state,
        }
    }
}

impl<B: SandboxBackend> Drop for Sandbox<B> {
    fn drop(&mut self) {
        if self.state == SandboxState::Running {
            warn!(name = %self.name, "sandbox dropped while running, stopping it");
            self.destroy();
        }
    }
}

/// Create a sandbox, run `body` with it, and destroy it on every exit path.
///
/// # Errors
/// `SandboxStart` if the sandbox could not be created; `body` is not run then.
pub fn with_sandbox<B, T, F>(
    backend: Arc<B>,
    artifact: &Path,
    options: SandboxOptions,
    body: F,
) -> Result<T, MatchError>
where
    B: SandboxBackend,
    F: FnOnce(&mut Sandbox<B>) -> T,
{
    let mut sandbox = Sandbox::create(backend, artifact, options)?;
    let result = body(&mut sandbox);
    sandbox.destroy();
    Ok(result)
}

/// Stop every running instance created by this crate. Returns how many were stopped.
///
/// Meant for operational cleanup after a crash of the orchestrator: it must not run while
/// matches are in progress on the same runtime.
pub fn reap_orphans<B: SandboxBackend + ?Sized>(backend: &B) -> usize {
    let running = match backend.list() {
        Ok(running) => running,
        Err(e) => {
            warn!("could not list instances: {e:#}");
            return 0;
        }
    };
    running
        .iter()
        .filter(|name| is_managed(name))
        .filter(|name| match backend.stop(name) {
            Ok(()) => {
                info!(name = %name, "orphan instance stopped");
                true
            }
            Err(e) => {
                warn!(name = %name, "could not stop orphan instance: {e:#}");
                false
            }
        })
        .count()
}
