//! # C4 Arena
//!
//! Runs untrusted Connect Four agents in isolated sandboxes and plays them against each other
//! under strict per-move time limits.
//!
//! It provides:
//! - Connect Four rules and game state ([`game`])
//! - A per-match sandbox lifecycle on top of a container runtime ([`sandbox`]), with
//!   Apptainer as the production runtime
//! - The request/response protocol used to ask a sandboxed agent for a move ([`protocol`])
//! - A turn-by-turn match driver turning every agent failure into a forfeit
//!   ([`match_runner`])
//! - Agent validation and latency checks before agents enter matches ([`validator`],
//!   [`arena`])
//!
//! Each agent of a match runs in its own sandbox, created for the match and torn down when it
//! ends. Every move request runs as a separate command in the sandbox, inside its own cgroup:
//! when the deadline passes, the whole command tree is killed.
//!
//! # Documentation Overview
//!
//! - For running validations and matches, see the [`arena`] module.
//! - For configuring arena behavior, resource limits, and execution environment,
//! see [`Configuration`](crate::configuration::Configuration) and [`constraints`].
//! - To drive matches between in-process move sources, see
//! [`MatchDriver`](crate::match_runner::MatchDriver) and the [`MoveSource`](crate::move_source::MoveSource) trait.
//! - To plug another container runtime, implement
//! [`SandboxBackend`](crate::sandbox::SandboxBackend).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use c4_arena::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     // Define per-agent constraints
//!     let constraints = ConstraintsBuilder::new()
//!         .with_ram_per_agent(512) // in MB
//!         .with_action_timeout(Duration::from_secs(1))
//!         .build()?;
//!
//!     // Allow uncontained execution if cgroup v2 is not available
//!     let config = Configuration::new().with_allow_uncontained(true);
//!     let arena = Arena::new(config, constraints);
//!
//!     let alice = Path::new("agents/alice.sif");
//!     let bob = Path::new("agents/bob.sif");
//!     for agent in [alice, bob] {
//!         if !arena.validate(agent)?.is_valid() {
//!             anyhow::bail!("{} is not a valid agent", agent.display());
//!         }
//!     }
//!
//!     let record = arena.play(alice, bob, None)?;
//!     println!("{}", record.to_json());
//!     Ok(())
//! }
//! ```
//!
//! # Example Agent
//!
//! An agent is an artifact (SIF image or sandbox directory) in which `python3` can import
//! `generate_move` from the `agent` module:
//!
//! ```python
//! import numpy as np
//!
//! def generate_move(board: np.ndarray, player: int, timeout: float) -> int:
//!     # board[0] is the bottom row; 0 is empty, 1 and 2 are the players
//!     return int(np.where(board[-1] == 0)[0][0])
//! ```
//!
//! ## Agent Requirements
//!
//! - The function must return a column index in `[0, 7)` of a column that is not full
//! - It must answer within the configured timeout
//! - Anything printed before the answer is ignored
#![warn(missing_docs)]

mod cgroup_manager;
pub use anyhow;
pub mod arena;
pub mod configuration;
pub mod constraints;
pub mod error;
pub mod game;
mod logger;
pub mod match_runner;
pub mod move_source;
pub mod protocol;
pub mod sandbox;
pub mod sandboxed_agent;
pub mod timeout;
pub mod validator;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use c4_arena::prelude::*;
/// ```
///
/// Includes:
/// - [`Arena`](crate::arena::Arena) and [`Pairing`](crate::arena::Pairing)
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`ConstraintsBuilder`](crate::constraints::ConstraintsBuilder)
/// - the game types, the match driver and [`MoveSource`](crate::move_source::MoveSource)
pub mod prelude {
    pub use crate::arena::{Arena, Pairing};
    pub use crate::configuration::Configuration;
    pub use crate::constraints::ConstraintsBuilder;
    pub use crate::error::MatchError;
    pub use crate::game::{Board, ConnectFour, Move, Outcome, Player, Rules};
    pub use crate::match_runner::{MatchDriver, MatchRecord};
    pub use crate::move_source::{from_fn, MoveSource};
}
