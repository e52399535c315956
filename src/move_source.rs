//! Anything that can be asked for a move.
//!
//! The match driver and the validator only see [`MoveSource`]. The sandboxed agent is one
//! implementation; closures wrapped with [`from_fn`] are another, used to drive matches
//! between in-process stubs.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::MatchError;
use crate::game::{Board, Move, Player};
use crate::timeout::{run_with_timeout, Deadline};

/// Produces a move for a board and a player within a deadline.
pub trait MoveSource {
    /// Ask for `player`'s move on `board`.
    ///
    /// The move is returned as answered: legality is checked by the caller. Implementations
    /// that can be preempted should stop waiting once `deadline` passes; the caller checks
    /// the deadline again in any case.
    fn next_move(
        &mut self,
        board: &Board,
        player: Player,
        deadline: Deadline,
    ) -> Result<Move, MatchError>;
}

impl<S: MoveSource + ?Sized> MoveSource for &mut S {
    fn next_move(
        &mut self,
        board: &Board,
        player: Player,
        deadline: Deadline,
    ) -> Result<Move, MatchError> {
        (**self).next_move(board, player, deadline)
    }
}

impl<S: MoveSource + ?Sized> MoveSource for Box<S> {
    fn next_move(
        &mut self,
        board: &Board,
        player: Player,
        deadline: Deadline,
    ) -> Result<Move, MatchError> {
        (**self).next_move(board, player, deadline)
    }
}

/// Ask `source` for a move, turning a panic of the source into `AgentRuntime`.
pub(crate) fn request_move(
    source: &mut dyn MoveSource,
    board: &Board,
    player: Player,
    deadline: Deadline,
) -> Result<Move, MatchError> {
    catch_unwind(AssertUnwindSafe(|| source.next_move(board, player, deadline))).unwrap_or_else(
        |panic| {
            Err(MatchError::AgentRuntime {
                error: panic_message(panic.as_ref()),
                traceback: String::new(),
            })
        },
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// [`MoveSource`] calling a closure with `(board, player, timeout)`.
#[derive(Debug, Clone)]
pub struct FnSource<F>(F);

/// Wrap a closure as a [`MoveSource`]. The closure receives the full budget of the request.
pub fn from_fn<F>(f: F) -> FnSource<F>
where
    F: FnMut(&Board, Player, Duration) -> Result<Move, MatchError>,
{
    FnSource(f)
}

impl<F> MoveSource for FnSource<F>
where
    F: FnMut(&Board, Player, Duration) -> Result<Move, MatchError>,
{
    fn next_move(
        &mut self,
        board: &Board,
        player: Player,
        deadline: Deadline,
    ) -> Result<Move, MatchError> {
        (self.0)(board, player, deadline.budget())
    }
}

/// Runs an in-process source on a helper thread so the caller stops waiting at the deadline.
///
/// The call itself cannot be interrupted: it keeps its thread until it returns, and the next
/// request waits for it (and likely times out too).
#[derive(Debug)]
pub struct Threaded<S> {
    inner: Arc<Mutex<S>>,
}

impl<S: MoveSource + Send + 'static> Threaded<S> {
    /// Wrap `source`.
    pub fn new(source: S) -> Self {
        Threaded {
            inner: Arc::new(Mutex::new(source)),
        }
    }
}

impl<S: MoveSource + Send + 'static> MoveSource for Threaded<S> {
    fn next_move(
        &mut self,
        board: &Board,
        player: Player,
        deadline: Deadline,
    ) -> Result<Move, MatchError> {
        let inner = Arc::clone(&self.inner);
        let board = board.clone();
        run_with_timeout(deadline.remaining(), move || {
            let mut source = inner.lock().map_err(|_| MatchError::AgentRuntime {
                error: "a previous call panicked".to_string(),
                traceback: String::new(),
            })?;
            source.next_move(&board, player, deadline)
        })?
    }
}
