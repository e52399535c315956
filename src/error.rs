//! Failures that can end a match or abort a sandbox operation.

use std::time::Duration;

use thiserror::Error;

use crate::game::{Move, MoveRejection, Player};
use crate::sandbox::SandboxState;

/// Every way a move request, a sandbox operation or a move application can fail.
///
/// Nothing here is retried: a failing agent forfeits the match on the spot.
#[derive(Debug, Clone, Error)]
pub enum MatchError {
    /// The instance could not be started, or did not show up in the runtime's instance list.
    #[error("sandbox '{name}' failed to start: {reason}")]
    SandboxStart {
        /// Instance name.
        name: String,
        /// Runtime output or verification failure.
        reason: String,
    },

    /// Operation on an instance that is not running. Always an orchestration bug.
    #[error("sandbox '{name}' is {state}, expected running")]
    InvalidSandboxState {
        /// Instance name.
        name: String,
        /// State the instance was found in.
        state: SandboxState,
    },

    /// The runtime reported a failed execution (non-zero exit or transport failure).
    #[error("command failed in sandbox '{name}' (exit status {status:?}): {detail}")]
    CommandExecution {
        /// Instance name.
        name: String,
        /// Exit status, `None` if the process could not be run or was killed by a signal.
        status: Option<i32>,
        /// Stderr or transport error.
        detail: String,
    },

    /// The agent's output was not a response envelope.
    #[error("agent did not answer with a response envelope: {reason}")]
    AgentProtocol {
        /// What did not parse.
        reason: String,
        /// Raw stdout, kept for diagnosis.
        raw: String,
    },

    /// The agent's own code raised while generating a move.
    #[error("agent raised during move generation: {error}")]
    AgentRuntime {
        /// Message reported by the agent.
        error: String,
        /// Traceback reported by the agent.
        traceback: String,
    },

    /// The request did not complete within its budget.
    #[error("no move within {budget:?}")]
    MoveTimeoutExceeded {
        /// Budget that was exceeded.
        budget: Duration,
    },

    /// The response was well-formed but the rules refused the move.
    #[error("invalid move '{mv}' by {player}: {reason}")]
    InvalidMove {
        /// Move as answered by the agent.
        mv: Move,
        /// Player the move was attributed to.
        player: Player,
        /// Rule that was broken.
        reason: MoveRejection,
    },
}

impl MatchError {
    /// Stable name of the failure kind, for match records and audit logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MatchError::SandboxStart { .. } => "SandboxStartError",
            MatchError::InvalidSandboxState { .. } => "InvalidSandboxState",
            MatchError::CommandExecution { .. } => "CommandExecutionError",
            MatchError::AgentProtocol { .. } => "AgentProtocolError",
            MatchError::AgentRuntime { .. } => "AgentRuntimeError",
            MatchError::MoveTimeoutExceeded { .. } => "MoveTimeoutExceeded",
            MatchError::InvalidMove { .. } => "InvalidMoveError",
        }
    }

    /// True for a deadline overrun.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MatchError::MoveTimeoutExceeded { .. })
    }

    /// False for failures caused by the orchestrator rather than by the agent.
    pub fn is_agent_fault(&self) -> bool {
        !matches!(
            self,
            MatchError::SandboxStart { .. } | MatchError::InvalidSandboxState { .. }
        )
    }
}
