//! Connect Four data model and rules.
//!
//! The match driver only talks to the game through the [`Rules`] trait; [`ConnectFour`] is
//! the implementation used by the arena.

mod board;
mod rules;
mod state;

pub use board::{Board, Move, Outcome, Player, COLUMNS, ROWS};
pub use rules::{ConnectFour, MoveRejection, Rules};
pub use state::GameState;
