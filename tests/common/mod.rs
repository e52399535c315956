#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use c4_arena::sandbox::{Completion, ProcessOutput, SandboxBackend, SandboxOptions};
use c4_arena::timeout::Deadline;
use tracing::{Level, Metadata};
use tracing_subscriber::{
    fmt,
    layer::{Context, Filter, SubscriberExt},
    Layer, Registry,
};

type ExecHandler = Box<dyn Fn(&str, &[String]) -> Completion + Send + Sync>;

/// In-memory container runtime: records every instance it starts and stops, and answers
/// commands through a scripted handler.
pub struct FakeBackend {
    running: Mutex<HashSet<String>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    fail_start: bool,
    hide_from_list: bool,
    exec: ExecHandler,
}

impl std::fmt::Debug for FakeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeBackend")
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl FakeBackend {
    pub fn new(exec: impl Fn(&str, &[String]) -> Completion + Send + Sync + 'static) -> Self {
        FakeBackend {
            running: Mutex::new(HashSet::new()),
            started: Mutex::new(vec![]),
            stopped: Mutex::new(vec![]),
            fail_start: false,
            hide_from_list: false,
            exec: Box::new(exec),
        }
    }

    /// Every agent plays the leftmost open column.
    pub fn leftmost_agents() -> Self {
        FakeBackend::new(|_, command| leftmost_column(command))
    }

    /// `instance start` fails.
    pub fn failing_start() -> Self {
        FakeBackend {
            fail_start: true,
            ..FakeBackend::leftmost_agents()
        }
    }

    /// `instance start` succeeds but the instance never shows up in `list`.
    pub fn unlisted() -> Self {
        FakeBackend {
            hide_from_list: true,
            ..FakeBackend::leftmost_agents()
        }
    }

    /// Pretend an instance survived a previous run.
    pub fn leak(&self, name: &str) {
        self.running.lock().unwrap().insert(name.to_string());
    }

    pub fn running(&self) -> HashSet<String> {
        self.running.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

impl SandboxBackend for FakeBackend {
    fn start(&self, name: &str, _artifact: &Path, _options: &SandboxOptions) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("FATAL: could not open image");
        }
        self.started.lock().unwrap().push(name.to_string());
        self.running.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<String>> {
        if self.hide_from_list {
            return Ok(vec![]);
        }
        Ok(self.running.lock().unwrap().iter().cloned().collect())
    }

    fn exec(
        &self,
        name: &str,
        command: &[String],
        _options: &SandboxOptions,
        deadline: Deadline,
    ) -> anyhow::Result<Completion> {
        if !self.running.lock().unwrap().contains(name) {
            anyhow::bail!("no instance found with name {name}");
        }
        let completion = (self.exec)(name, command);
        if deadline.is_expired() {
            return Ok(Completion::TimedOut);
        }
        Ok(completion)
    }

    fn stop(&self, name: &str) -> anyhow::Result<()> {
        self.stopped.lock().unwrap().push(name.to_string());
        self.running.lock().unwrap().remove(name);
        Ok(())
    }
}

/// A successful command printing `stdout`.
pub fn printed(stdout: &str) -> Completion {
    Completion::Exited(ProcessOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        status: Some(0),
        truncated: false,
    })
}

/// Board embedded in a move command, bottom row first.
pub fn board_of(command: &[String]) -> Vec<Vec<u8>> {
    let script = command.last().expect("empty command");
    let start = script.find("np.array(").expect("no board in command") + "np.array(".len();
    let end = script[start..].find(", dtype").expect("no dtype in command") + start;
    serde_json::from_str(&script[start..end]).expect("board is not json")
}

/// Answer of an agent playing the leftmost open column (latency commands get a fixed time).
pub fn leftmost_column(command: &[String]) -> Completion {
    if command.last().is_some_and(|s| s.contains("perf_counter")) {
        return printed(r#"{"status": "success", "elapsed": 0.001953125}"#);
    }
    let board = board_of(command);
    let top = board.last().expect("empty board");
    let column = top.iter().position(|c| *c == 0).unwrap_or(0);
    printed(&format!(r#"{{"status": "success", "move": {column}}}"#))
}

struct CustomLevelFilter;
impl<S> Filter<S> for CustomLevelFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        meta.level() <= &Level::DEBUG
    }
}

pub fn init_debug_logger() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_ansi(true)
        .with_level(true)
        .with_thread_names(true)
        .with_target(false);

    let reg = Registry::default().with(
        fmt::layer()
            .event_format(format)
            .with_test_writer()
            .with_filter(CustomLevelFilter),
    );

    let _ = tracing::subscriber::set_global_default(reg);
}
