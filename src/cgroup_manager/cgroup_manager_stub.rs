use std::{process::Child, time::Duration};

use anyhow::{self, bail, Context};
use tracing::warn;

use super::{create_process, wait_child, Completion, OutputCollector, ProcessLimits, ProcessOutput};
use crate::timeout::Deadline;

pub fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let id = std::str::from_utf8(&output.stdout).context("id is not a valid string")?;
    Ok(id.trim().to_string())
}

#[derive(Debug)]
pub struct LimitedProcess {
    child: Child,
    output: Option<OutputCollector>,
    cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(
        _command: &str,
        _args: &[String],
        _limits: &ProcessLimits,
    ) -> anyhow::Result<LimitedProcess> {
        bail!("cgroups only available on linux")
    }

    pub fn launch_without_container(
        command: &str,
        args: &[String],
    ) -> anyhow::Result<LimitedProcess> {
        let mut child = create_process(command, args).context("could not create process")?;

        Ok(LimitedProcess {
            output: Some(OutputCollector::spawn(&mut child)),
            child,
            cleaned_up: false,
        })
    }

    pub fn wait_with_deadline(&mut self, deadline: Deadline) -> anyhow::Result<Completion> {
        let status = wait_child(&mut self.child, deadline);
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

    pub fn try_kill(&mut self, _max_duration: Duration) -> anyhow::Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        if self.child.try_wait().ok().flatten().is_none() {
            self.child.kill().context("could not kill process")?;
        }
        let _ = self.child.wait();
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_secs(1);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!("could not kill process {} on LimitedProcess::drop: {e:#}", self.child.id());
            }
        }
    }
}
