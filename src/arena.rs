//! Orchestration of sandboxed agents: validation, matches, latency checks and cleanup.
//!
//! This module defines the [`Arena`] type. Its responsibilities include:
//!
//! - Starting one sandbox per agent and per match, and always tearing it down
//! - Enforcing resource limits via [`Constraints`]
//! - Running matches one at a time ([`Arena::play`]) or concurrently ([`Arena::play_all`])
//! - Validating agents and measuring their latency before they enter matches
//!
//! # Behavior & Configuration
//!
//! Behavior is controlled by a [`Configuration`] object. Agents are artifacts the container
//! runtime can start (an Apptainer SIF image or sandbox directory) providing an importable
//! `agent` module with a `generate_move(board, player, timeout)` function.
//!
//! ## Uncontained Mode
//!
//! If `config.allow_uncontained = true`, agent commands run even when cgroups are not
//! available. In this case, only the deadline kills runaway commands; the container runtime
//! still limits memory and CPU of the instance.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use c4_arena::arena::Arena;
//! use c4_arena::configuration::Configuration;
//! use c4_arena::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::from_env().build().unwrap();
//! let arena = Arena::new(Configuration::from_env(), constraints);
//! let record = arena
//!     .play(Path::new("agents/alice.sif"), Path::new("agents/bob.sif"), None)
//!     .unwrap();
//! println!("{}", record.to_json());
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use tracing::{info, instrument, trace, warn};

use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::error::MatchError;
use crate::game::Board;
use crate::logger::init_logger;
use crate::match_runner::{MatchDriver, MatchRecord};
use crate::protocol::MoveProtocol;
use crate::sandbox::apptainer::ApptainerBackend;
use crate::sandbox::{self, with_sandbox, SandboxBackend};
use crate::sandboxed_agent::{LatencyReport, SandboxedAgent};
use crate::validator::{AgentValidator, ValidationReport};

/// Two agents to pit against each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    /// Artifact playing `PLAYER_1`.
    pub first: PathBuf,
    /// Artifact playing `PLAYER_2`.
    pub second: PathBuf,
    /// Starting position, empty board if `None`.
    pub initial: Option<Board>,
}

impl Pairing {
    /// A match from the empty board.
    pub fn new(first: impl Into<PathBuf>, second: impl Into<PathBuf>) -> Self {
        Pairing {
            first: first.into(),
            second: second.into(),
            initial: None,
        }
    }
}

impl Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = |p: &Path| {
            p.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string())
        };
        write!(f, "{} vs {}", short(&self.first), short(&self.second))
    }
}

/// Shared by every match the arena runs.
#[derive(Debug)]
struct Context<B: SandboxBackend> {
    backend: Arc<B>,
    constraints: Constraints,
    protocol: MoveProtocol,
}

impl<B: SandboxBackend> Context<B> {
    fn play(
        &self,
        first: &Path,
        second: &Path,
        initial: Option<Board>,
    ) -> Result<MatchRecord, MatchError> {
        let options = self.constraints.sandbox_options();
        let driver = MatchDriver::connect_four(self.constraints.action_timeout());
        with_sandbox(self.backend.clone(), first, options.clone(), |one| {
            with_sandbox(self.backend.clone(), second, options, |two| {
                let mut one = SandboxedAgent::new(one, self.protocol.clone());
                let mut two = SandboxedAgent::new(two, self.protocol.clone());
                driver.play(&mut one, &mut two, initial)
            })
        })?
    }
}

enum Finished {
    Done(usize, Result<MatchRecord, MatchError>),
    Panicked(Box<dyn Any + Send>),
}

/// Runs agents in sandboxes.
///
/// # Type Parameters
/// - `B`: the container runtime, [`ApptainerBackend`] by default
#[derive(Debug)]
pub struct Arena<B: SandboxBackend = ApptainerBackend> {
    context: Arc<Context<B>>,
    config: Configuration,
}

impl Arena<ApptainerBackend> {
    /// Create an [`Arena`] using the container runtime named in `config`.
    #[instrument(skip_all)]
    pub fn new(config: Configuration, constraints: Constraints) -> Self {
        let backend = Arc::new(ApptainerBackend::from_configuration(&config));
        Arena::with_backend(backend, config, constraints)
    }
}

impl<B: SandboxBackend + 'static> Arena<B> {
    /// Create an [`Arena`] on another container runtime.
    pub fn with_backend(backend: Arc<B>, config: Configuration, constraints: Constraints) -> Self {
        if config.log {
            if let Err(e) = init_logger() {
                warn!("logging to file disabled: {e:#}");
            }
        }

        trace!(?config, ?constraints);

        Arena {
            context: Arc::new(Context {
                backend,
                constraints,
                protocol: MoveProtocol::new(),
            }),
            config,
        }
    }

    /// Reach agents through another entry point or interpreter.
    pub fn with_protocol(self, protocol: MoveProtocol) -> Self {
        let context = Context {
            backend: self.context.backend.clone(),
            constraints: self.context.constraints.clone(),
            protocol,
        };
        Arena {
            context: Arc::new(context),
            config: self.config,
        }
    }

    /// Limits applied to agents.
    pub fn constraints(&self) -> &Constraints {
        &self.context.constraints
    }

    /// Run the validation probes against the agent in `artifact`.
    ///
    /// # Errors
    /// `SandboxStart` if the agent could not be started. A failing agent is reported in the
    /// [`ValidationReport`], not as an error.
    #[instrument(skip(self))]
    pub fn validate(&self, artifact: &Path) -> Result<ValidationReport, MatchError> {
        let validator = AgentValidator::new(self.context.constraints.validation_timeout());
        let report = with_sandbox(
            self.context.backend.clone(),
            artifact,
            self.context.constraints.sandbox_options(),
            |sandbox| {
                let mut agent = SandboxedAgent::new(sandbox, self.context.protocol.clone());
                validator.validate(&mut agent)
            },
        )?;
        if self.config.verbose {
            print_validation(artifact, &report);
        }
        Ok(report)
    }

    /// Play one match, `first` as `PLAYER_1`.
    ///
    /// Both sandboxes are torn down before returning, whatever happened in the match.
    ///
    /// # Errors
    /// `SandboxStart` if either agent could not be started; no match is played then.
    #[instrument(skip(self, initial))]
    pub fn play(
        &self,
        first: &Path,
        second: &Path,
        initial: Option<Board>,
    ) -> Result<MatchRecord, MatchError> {
        let result = self.context.play(first, second, initial);
        if self.config.verbose {
            let pairing = Pairing::new(first, second);
            print_match_result(&pairing, &result);
        }
        result
    }

    /// Play every pairing, at most `max_concurrent_matches` at a time.
    ///
    /// Each match runs on its own thread with its own two sandboxes. Results come back in the
    /// order of `pairings`.
    pub fn play_all(&self, pairings: &[Pairing]) -> Vec<Result<MatchRecord, MatchError>> {
        let max_running = self.context.constraints.max_concurrent_matches().max(1);
        info!(matches = pairings.len(), max_running, "starting matches");
        if self.config.verbose {
            disable_line_wrap();
        }

        let (tx, rx) = mpsc::channel();
        let mut pending = pairings.iter().cloned().enumerate().collect::<VecDeque<_>>();
        let mut running: Vec<(usize, String)> = vec![];
        let mut results = pairings.iter().map(|_| None).collect::<Vec<_>>();

        loop {
            while running.len() < max_running {
                let Some((index, pairing)) = pending.pop_front() else {
                    break;
                };
                running.push((index, pairing.to_string()));
                if self.config.verbose {
                    print_running_matches(&running);
                }
                self.launch_match(index, pairing, tx.clone());
            }
            if running.is_empty() {
                break;
            }

            // not empty <=> match running <=> result to receive (we hold a sender)
            let Ok(finished) = rx.recv() else { break };
            let (index, result) = match finished {
                Finished::Done(index, result) => (index, result),
                Finished::Panicked(payload) => {
                    if self.config.verbose {
                        enable_line_wrap();
                    }
                    std::panic::resume_unwind(payload);
                }
            };
            running.retain(|(i, _)| *i != index);
            if self.config.verbose {
                print_match_result(&pairings[index], &result);
                print_running_matches(&running);
            }
            results[index] = Some(result);
        }

        if self.config.verbose {
            enable_line_wrap();
            println!();
        }
        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(MatchError::CommandExecution {
                        name: String::new(),
                        status: None,
                        detail: "match result lost".to_string(),
                    })
                })
            })
            .collect()
    }

    fn launch_match(&self, index: usize, pairing: Pairing, tx: mpsc::Sender<Finished>) {
        let context = Arc::clone(&self.context);
        std::thread::spawn(move || {
            // sandboxes are torn down while unwinding; the panic is resumed by the caller
            let finished = match catch_unwind(AssertUnwindSafe(|| {
                context.play(&pairing.first, &pairing.second, pairing.initial.clone())
            })) {
                Ok(result) => Finished::Done(index, result),
                Err(payload) => Finished::Panicked(payload),
            };
            let _ = tx.send(finished);
        });
    }

    /// Time `iterations` moves of the agent in `artifact` on the empty board.
    ///
    /// # Errors
    /// `SandboxStart`, or the first failure of a timed call.
    #[instrument(skip(self))]
    pub fn measure_latency(
        &self,
        artifact: &Path,
        iterations: usize,
    ) -> Result<LatencyReport, MatchError> {
        let timeout = self.context.constraints.action_timeout();
        with_sandbox(
            self.context.backend.clone(),
            artifact,
            self.context.constraints.sandbox_options(),
            |sandbox| {
                SandboxedAgent::new(sandbox, self.context.protocol.clone())
                    .measure_latency(iterations, timeout)
            },
        )?
    }

    /// True if every one of `iterations` timed moves stays within the latency ceiling of the
    /// constraints. Always true without a ceiling.
    pub fn check_latency(&self, artifact: &Path, iterations: usize) -> Result<bool, MatchError> {
        let Some(ceiling) = self.context.constraints.max_latency() else {
            info!("no latency ceiling configured");
            return Ok(true);
        };
        let report = self.measure_latency(artifact, iterations)?;
        let accepted = report.max() <= ceiling;
        if self.config.verbose {
            print_latency(artifact, &report, ceiling, accepted);
        }
        Ok(accepted)
    }

    /// Stop instances left behind by a previous run. Returns how many were stopped.
    ///
    /// Must not run while matches are in progress on the same runtime.
    pub fn reap_orphans(&self) -> usize {
        sandbox::reap_orphans(self.context.backend.as_ref())
    }
}

fn print_match_result(pairing: &Pairing, result: &Result<MatchRecord, MatchError>) {
    // clear line, green match, outcome, red errors, start of line
    match result {
        Ok(record) => {
            let failure = record
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default();
            println!(
                "\x1b[2K\x1b[32m{pairing}: \x1b[39m{} in {} moves \x1b[31m{failure}\x1b[39m\x1b[0G",
                record.outcome,
                record.moves.len(),
            );
        }
        Err(e) => println!("\x1b[2K\x1b[32m{pairing}: \x1b[31m{e}\x1b[39m\x1b[0G"),
    }
}

fn print_running_matches(running: &[(usize, String)]) {
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(|(_, name)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn print_validation(artifact: &Path, report: &ValidationReport) {
    match (&report.failed_probe, &report.failure) {
        (_, None) => println!("\x1b[32m{}: \x1b[39mvalid", artifact.display()),
        (probe, Some(e)) => println!(
            "\x1b[32m{}: \x1b[31minvalid on {}: {e}\x1b[39m",
            artifact.display(),
            probe.unwrap_or("probe")
        ),
    }
}

fn print_latency(artifact: &Path, report: &LatencyReport, ceiling: std::time::Duration, ok: bool) {
    let color = if ok { 32 } else { 31 };
    println!(
        "\x1b[32m{}: \x1b[{color}mmean {:?}, max {:?} (ceiling {ceiling:?})\x1b[39m",
        artifact.display(),
        report.mean(),
        report.max(),
    );
}

fn disable_line_wrap() {
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    print!("\x1b[?7h");
}
