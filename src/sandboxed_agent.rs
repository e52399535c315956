//! An agent running inside a [`Sandbox`], seen as a [`MoveSource`].

use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::MatchError;
use crate::game::{Board, Move, Player};
use crate::move_source::MoveSource;
use crate::protocol::{MoveProtocol, MoveRequest};
use crate::sandbox::{Sandbox, SandboxBackend};
use crate::timeout::Deadline;

/// Asks the agent in `sandbox` for moves, one command per request.
///
/// Borrows the sandbox: its lifetime stays with the scope that created it.
#[derive(Debug)]
pub struct SandboxedAgent<'s, B: SandboxBackend> {
    sandbox: &'s mut Sandbox<B>,
    protocol: MoveProtocol,
}

/// Latencies measured inside the sandbox, one per iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyReport {
    /// Time spent in the entry point, per call.
    pub samples: Vec<Duration>,
}

impl LatencyReport {
    /// Mean latency, zero without samples.
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.samples.len()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.samples.iter().sum::<Duration>() / n,
        }
    }

    /// Slowest call, zero without samples.
    pub fn max(&self) -> Duration {
        self.samples.iter().copied().max().unwrap_or_default()
    }
}

impl<'s, B: SandboxBackend> SandboxedAgent<'s, B> {
    /// Agent reached through `protocol`.
    pub fn new(sandbox: &'s mut Sandbox<B>, protocol: MoveProtocol) -> Self {
        SandboxedAgent { sandbox, protocol }
    }

    /// Sandbox the agent runs in.
    pub fn sandbox(&self) -> &Sandbox<B> {
        self.sandbox
    }

    /// Time `iterations` calls of the entry point on the empty board, `timeout` each.
    ///
    /// Time is measured inside the sandbox, so start-up of the interpreter is not counted.
    #[instrument(skip(self), fields(name = %self.sandbox.name()))]
    pub fn measure_latency(
        &mut self,
        iterations: usize,
        timeout: Duration,
    ) -> Result<LatencyReport, MatchError> {
        let board = Board::standard();
        let request = MoveRequest {
            board: &board,
            player: Player::One,
            timeout,
        };
        let command = self.protocol.latency_command(&request);
        let mut samples = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            let output = self.sandbox.exec(&command, Deadline::after(timeout))?;
            let elapsed = self.protocol.decode_latency(&output.stdout)?;
            let elapsed = Duration::try_from_secs_f64(elapsed).map_err(|e| {
                MatchError::AgentProtocol {
                    reason: format!("bad elapsed time: {e}"),
                    raw: output.stdout.clone(),
                }
            })?;
            debug!(?elapsed);
            samples.push(elapsed);
        }
        Ok(LatencyReport { samples })
    }
}

impl<B: SandboxBackend> MoveSource for SandboxedAgent<'_, B> {
    fn next_move(
        &mut self,
        board: &Board,
        player: Player,
        deadline: Deadline,
    ) -> Result<Move, MatchError> {
        let request = MoveRequest {
            board,
            player,
            timeout: deadline.budget(),
        };
        let command = self.protocol.move_command(&request);
        let output = self.sandbox.exec(&command, deadline)?;
        let mv = self.protocol.decode_move(&output.stdout)?;
        debug!(name = %self.sandbox.name(), %player, %mv, elapsed = ?deadline.elapsed());
        Ok(mv)
    }
}
