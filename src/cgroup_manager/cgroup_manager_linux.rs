use std::{
    process::Child,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{self, Context};
use cgroups_rs::Cgroup;
use tracing::{trace, warn};

use super::{
    create_process, wait_child, Completion, OutputCollector, ProcessLimits, ProcessOutput,
    CPU_PERIOD_US,
};
use crate::timeout::Deadline;

pub fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimed_id.trim().to_string())
}

pub fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path` with the given limits.
///
/// # Errors
///
/// Fails if the limits are rejected or cgroup v2 is not available/delegated to this user.
pub fn create_cgroup(path: &str, limits: &ProcessLimits) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if limits.max_memory > 0 {
        builder = builder.memory().memory_hard_limit(limits.max_memory).done();
    }
    if limits.max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(limits.max_pids))
            .done();
    }
    if limits.cpu_quota > 0 {
        builder = builder
            .cpu()
            .quota(limits.cpu_quota)
            .period(CPU_PERIOD_US)
            .done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

#[derive(Debug)]
pub struct TimeoutError {}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timeout Error")
    }
}

impl std::error::Error for TimeoutError {}

pub fn wait_for_process_cleanup(
    cgroup: &Cgroup,
    pid: u64,
    max_duration: Duration,
) -> Result<(), TimeoutError> {
    let deadline = Instant::now() + max_duration;
    while cgroup.tasks().iter().any(|cpid| cpid.pid == pid) {
        if Instant::now() > deadline {
            return Err(TimeoutError {});
        }

        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

pub fn create_process_in_cgroup(
    command: &str,
    args: &[String],
    group: &Cgroup,
) -> anyhow::Result<Child> {
    let mut child = create_process(command, args)?;

    let pid = child.id() as u64;
    let addition = group.add_task_by_tgid(cgroups_rs::CgroupPid { pid });
    if addition.is_err() {
        let kill = child.kill();
        let _ = child.wait();

        addition.with_context(|| {
            if let Err(err) = kill {
                format!(
                    "could not add process to cgroup, and process could not be killed either ({err})"
                )
            } else {
                "could not add process to cgroup".to_string()
            }
        })?;
    }
    Ok(child)
}

/// A child process, optionally confined to its own cgroup, with captured output.
///
/// Killing goes through the cgroup when there is one, so every descendant of the child dies
/// with it. The process is killed and reaped on drop if nobody did it before.
#[derive(Debug)]
pub struct LimitedProcess {
    child: Child,
    cgroup: Option<Cgroup>,
    output: Option<OutputCollector>,
    cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(
        command: &str,
        args: &[String],
        limits: &ProcessLimits,
    ) -> anyhow::Result<LimitedProcess> {
        // pid in the name: several arenas may run side by side under the same user
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        let group_name = format!(
            "c4arena_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let group = create_cgroup(&path, limits).context("could not create cgroup")?;
        let mut child = create_process_in_cgroup(command, args, &group).with_context(|| {
            let _ = group.delete();
            "could not create process in cgroup"
        })?;
        trace!(pid = child.id(), cgroup = %group_name, "process launched");

        Ok(LimitedProcess {
            output: Some(OutputCollector::spawn(&mut child)),
            child,
            cgroup: Some(group),
            cleaned_up: false,
        })
    }

    pub fn launch_without_container(
        command: &str,
        args: &[String],
    ) -> anyhow::Result<LimitedProcess> {
        let mut child = create_process(command, args).context("could not create process")?;

        Ok(LimitedProcess {
            output: Some(OutputCollector::spawn(&mut child)),
            child,
            cgroup: None,
            cleaned_up: false,
        })
    }

    /// Wait for the process to exit, killing it once `deadline` passes.
    ///
    /// The process tree is killed in every case, including after a normal exit.
    pub fn wait_with_deadline(&mut self, deadline: Deadline) -> anyhow::Result<Completion> {
        let status = wait_child(&mut self.child, deadline);
        // stragglers (and the cgroup itself) go away in every case
        if let Err(e) = self.try_kill(Duration::from_secs(1)) {
            warn!("could not clean up process {}: {e:#}", self.child.id());
        }

        let Some(status) = status? else {
            return Ok(Completion::TimedOut);
        };
        let (stdout, stderr, truncated) = self
            .output
            .take()
            .map(OutputCollector::collect)
            .unwrap_or_default();
        Ok(Completion::Exited(ProcessOutput {
            stdout,
            stderr,
            status: status.code(),
            truncated,
        }))
    }

    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        match &mut self.cgroup {
            Some(cgroup) => {
                cgroup.kill().context("could not kill process")?;
                wait_for_process_cleanup(cgroup, self.child.id() as u64, max_duration)
                    .context("process cleanup timed out")?;
                // at this point, the process is killed. Even so the cgroup cleanup fail, it is
                // 'safe' (probably) to continue
                self.cleaned_up = true;
                let _ = self.child.wait();
                if let Err(e) = cgroup.delete() {
                    warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
                }
                Ok(())
            }
            None => {
                if self.child.try_wait().ok().flatten().is_none() {
                    self.child.kill().context("could not kill process")?;
                }
                let _ = self.child.wait();
                self.cleaned_up = true;
                Ok(())
            }
        }
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_millis(100);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!(
                    "could not kill process {} on LimitedProcess::drop: {e:#}",
                    self.child.id()
                );
            }
        }
    }
}
