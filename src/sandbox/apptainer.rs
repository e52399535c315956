//! [`SandboxBackend`] driving the `apptainer` command line.
//!
//! Instances are started with `apptainer instance start`, verified with
//! `apptainer instance list --json`, commands run through `apptainer exec instance://NAME`
//! and instances are stopped with `apptainer instance stop`.
//!
//! Each `exec` runs as a limited process: in its own cgroup, so that hitting the deadline
//! kills the whole command tree and not only the `apptainer` client.

use std::path::Path;
use std::process::Output;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::{debug, instrument, trace, warn};

use crate::cgroup_manager::{get_current_user_id, Completion, LimitedProcess};
use crate::configuration::Configuration;
use crate::sandbox::{FilesystemMode, NetworkAccess, SandboxBackend, SandboxOptions};
use crate::timeout::Deadline;

/// The Apptainer runtime.
#[derive(Debug)]
pub struct ApptainerBackend {
    binary: String,
    allow_uncontained: bool,
    debug_agent_stderr: bool,
    running_as_root: OnceLock<bool>,
    warned_uncontained: AtomicBool,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Deserialize)]
struct InstanceEntry {
    instance: String,
}

impl ApptainerBackend {
    /// Backend calling `binary` (usually `apptainer`).
    pub fn new(binary: impl Into<String>) -> Self {
        ApptainerBackend {
            binary: binary.into(),
            allow_uncontained: false,
            debug_agent_stderr: false,
            running_as_root: OnceLock::new(),
            warned_uncontained: AtomicBool::new(false),
        }
    }

    /// Backend set up from the evaluator configuration.
    pub fn from_configuration(config: &Configuration) -> Self {
        ApptainerBackend {
            allow_uncontained: config.allow_uncontained,
            debug_agent_stderr: config.debug_agent_stderr,
            ..Self::new(config.runtime.clone())
        }
    }

    fn run(&self, args: &[String]) -> anyhow::Result<Output> {
        trace!(binary = %self.binary, ?args);
        std::process::Command::new(&self.binary)
            .args(args)
            .output()
            .with_context(|| format!("could not run '{}'", self.binary))
    }

    fn running_as_root(&self) -> bool {
        *self.running_as_root.get_or_init(|| {
            get_current_user_id()
                .map(|id| id == "0")
                .unwrap_or(false)
        })
    }

    fn launch(&self, args: &[String], options: &SandboxOptions) -> anyhow::Result<LimitedProcess> {
        match LimitedProcess::launch(&self.binary, args, &options.process_limits()) {
            Ok(process) => Ok(process),
            Err(e) if self.allow_uncontained => {
                if !self.warned_uncontained.swap(true, Ordering::Relaxed) {
                    warn!("running commands without cgroup, only the deadline is enforced: {e:#}");
                }
                LimitedProcess::launch_without_container(&self.binary, args)
            }
            Err(e) => Err(e.context("could not contain command (see `allow_uncontained`)")),
        }
    }
}

/// Arguments of `apptainer instance start`.
pub(crate) fn start_args(name: &str, artifact: &Path, options: &SandboxOptions) -> Vec<String> {
    let mut args = vec!["instance".to_string(), "start".to_string()];
    if options.filesystem == FilesystemMode::Writable {
        args.extend(
            ["--writable", "--containall", "--pid", "--ipc", "--cleanenv"].map(String::from),
        );
    }
    if options.network == NetworkAccess::Disabled {
        args.extend(["--net", "--network", "none"].map(String::from));
    }
    args.push("--memory".to_string());
    args.push(options.memory_limit.to_string());
    args.push("--cpus".to_string());
    args.push(format!("{:.2}", options.cpu_quota));
    args.push(artifact.display().to_string());
    args.push(name.to_string());
    args
}

/// Arguments of `apptainer exec`. Only root may switch user; otherwise commands already run
/// as the unprivileged caller.
pub(crate) fn exec_args(
    name: &str,
    command: &[String],
    options: &SandboxOptions,
    as_root: bool,
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if as_root {
        args.push("--security".to_string());
        args.push(format!("uid:{0},gid:{0}", options.user_id));
    }
    args.push(format!("instance://{name}"));
    args.extend(command.iter().cloned());
    args
}

fn parse_instance_list(json: &str) -> anyhow::Result<Vec<String>> {
    if json.trim().is_empty() {
        return Ok(vec![]);
    }
    let list: InstanceList =
        serde_json::from_str(json).context("unexpected 'instance list' output")?;
    Ok(list.instances.into_iter().map(|i| i.instance).collect())
}

impl SandboxBackend for ApptainerBackend {
    #[instrument(skip(self, options))]
    fn start(&self, name: &str, artifact: &Path, options: &SandboxOptions) -> anyhow::Result<()> {
        let output = self.run(&start_args(name, artifact, options))?;
        if !output.status.success() {
            bail!(
                "'instance start' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<String>> {
        let args = ["instance", "list", "--json"].map(String::from);
        let output = self.run(&args)?;
        if !output.status.success() {
            bail!(
                "'instance list' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_instance_list(&String::from_utf8_lossy(&output.stdout))
    }

    fn exec(
        &self,
        name: &str,
        command: &[String],
        options: &SandboxOptions,
        deadline: Deadline,
    ) -> anyhow::Result<Completion> {
        let args = exec_args(name, command, options, self.running_as_root());
        let mut process = self.launch(&args, options)?;
        let completion = process.wait_with_deadline(deadline)?;
        if let Completion::Exited(output) = &completion {
            if !output.stderr.is_empty() {
                debug!(instance = name, stderr = %output.stderr.trim(), "agent stderr");
                if self.debug_agent_stderr {
                    eprintln!("[{name}] {}", output.stderr.trim_end());
                }
            }
        }
        Ok(completion)
    }

    #[instrument(skip(self))]
    fn stop(&self, name: &str) -> anyhow::Result<()> {
        let args = ["instance", "stop", name].map(String::from);
        let output = self.run(&args)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("no instance found") {
            debug!("instance already gone");
            return Ok(());
        }
        bail!("'instance stop' exited with {}: {}", output.status, stderr.trim())
    }
}
