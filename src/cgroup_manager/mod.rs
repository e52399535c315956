#[cfg(target_os = "linux")]
mod cgroup_manager_linux;

#[cfg(target_os = "linux")]
pub use cgroup_manager_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_manager_stub;

#[cfg(not(target_os = "linux"))]
pub use cgroup_manager_stub::*;

use std::io::Read;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use anyhow::Context;

use crate::timeout::Deadline;

/// Limits applied to the cgroup of one command. Non-positive values mean no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    /// Maximum memory in bytes.
    pub max_memory: i64,
    /// Maximum number of processes alive at the same time.
    pub max_pids: i64,
    /// CPU time allowed per [`CPU_PERIOD_US`], in microseconds.
    pub cpu_quota: i64,
}

/// CFS period the CPU quota is expressed against.
pub const CPU_PERIOD_US: u64 = 100_000;

/// What a finished process wrote, and how it exited.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    /// Captured stdout (lossy UTF-8).
    pub stdout: String,
    /// Captured stderr (lossy UTF-8).
    pub stderr: String,
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
    /// A stream went over [`MAX_OUTPUT`]; the rest of it was discarded.
    pub truncated: bool,
}

/// Bytes kept per stream. Anything beyond is read and dropped so the child never blocks.
pub const MAX_OUTPUT: u64 = 1024 * 1024;

/// Result of waiting on a process under a deadline.
#[derive(Debug)]
pub enum Completion {
    /// The process exited on its own.
    Exited(ProcessOutput),
    /// The deadline passed; the process has been killed.
    TimedOut,
}

fn create_process(command: &str, args: &[String]) -> anyhow::Result<Child> {
    let mut cmd = std::process::Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.spawn()
        .with_context(|| format!("command '{command}' not found"))
}

enum Stream {
    Stdout,
    Stderr,
}

/// Drains stdout and stderr on their own threads so a chatty child never blocks on a full
/// pipe while we poll it.
struct OutputCollector {
    rx: Receiver<(Stream, Vec<u8>, bool)>,
}

impl std::fmt::Debug for OutputCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutputCollector")
    }
}

impl OutputCollector {
    const GRACE: Duration = Duration::from_millis(200);

    fn spawn(child: &mut Child) -> OutputCollector {
        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let (buf, truncated) = read_capped(stdout);
                let _ = tx.send((Stream::Stdout, buf, truncated));
            });
        }
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                let (buf, truncated) = read_capped(stderr);
                let _ = tx.send((Stream::Stderr, buf, truncated));
            });
        }
        OutputCollector { rx }
    }

    /// Both streams, waiting a short grace period for each: a grandchild that survived its
    /// parent may still hold the pipe open.
    fn collect(self) -> (String, String, bool) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut truncated = false;
        while let Ok((stream, bytes, cut)) = self.rx.recv_timeout(Self::GRACE) {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            truncated |= cut;
            match stream {
                Stream::Stdout => stdout = text,
                Stream::Stderr => stderr = text,
            }
        }
        (stdout, stderr, truncated)
    }
}

/// The first [`MAX_OUTPUT`] bytes of `stream`, and whether more followed.
fn read_capped(stream: impl Read) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut limited = stream.take(MAX_OUTPUT);
    let _ = limited.read_to_end(&mut buf);
    let mut rest = limited.into_inner();
    let dropped = std::io::copy(&mut rest, &mut std::io::sink()).unwrap_or(0);
    (buf, dropped > 0)
}

/// Poll `child` until it exits or `deadline` passes. `None` means the deadline passed.
fn wait_child(child: &mut Child, deadline: Deadline) -> anyhow::Result<Option<ExitStatus>> {
    let interval = deadline.poll_interval();
    loop {
        if let Some(status) = child.try_wait().context("could not poll child process")? {
            return Ok(Some(status));
        }
        if deadline.is_expired() {
            return Ok(None);
        }
        std::thread::sleep(interval.min(deadline.remaining()));
    }
}
