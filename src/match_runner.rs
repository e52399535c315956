//! Drives one match between two move sources.
//!
//! A match is played synchronously, turn by turn: move N+1 is only requested once move N has
//! been validated and applied. Any failure of the player on turn ends the match and the
//! opponent is declared the outcome. Nothing is retried.

use std::fmt::{self, Display};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::MatchError;
use crate::game::{Board, ConnectFour, GameState, Outcome, Player, Rules};
use crate::move_source::{request_move, MoveSource};
use crate::timeout::Deadline;

/// A match-ending failure attributed to one player.
#[derive(Debug, Clone)]
pub struct Forfeit {
    /// Player whose request failed.
    pub offender: Player,
    /// What went wrong.
    pub error: MatchError,
}

impl Display for Forfeit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} forfeits: {}", self.offender, self.error)
    }
}

/// Externally visible result of one match.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    /// Winner, or draw.
    pub outcome: Outcome,
    /// Accepted moves in order, as landing columns.
    pub moves: Vec<usize>,
    /// Board when the match ended.
    pub board: Board,
    /// Set when the match ended on a forfeit rather than on the board.
    pub failure: Option<Forfeit>,
}

impl MatchRecord {
    /// Winning player, `None` on a draw.
    pub fn winner(&self) -> Option<Player> {
        self.outcome.winner()
    }

    /// JSON rendering for the scheduler consuming match results.
    ///
    /// ```json
    /// {"outcome": 2, "moves": [3, 3], "failure": {"player": 1, "kind": "MoveTimeoutExceeded", "message": "..."}}
    /// ```
    ///
    /// `outcome` is `0` on a draw; `failure` is `null` when the match ended on the board.
    pub fn to_json(&self) -> Value {
        json!({
            "outcome": self.outcome.as_u8(),
            "moves": self.moves,
            "board": self.board.to_rows(),
            "failure": self.failure.as_ref().map(|f| json!({
                "player": f.offender.as_u8(),
                "kind": f.error.kind(),
                "message": f.error.to_string(),
            })),
        })
    }
}

/// Plays matches under a set of rules and a per-move budget.
#[derive(Debug, Clone)]
pub struct MatchDriver<R: Rules = ConnectFour> {
    rules: R,
    move_timeout: Duration,
}

impl MatchDriver<ConnectFour> {
    /// Standard Connect Four.
    pub fn connect_four(move_timeout: Duration) -> Self {
        MatchDriver::new(ConnectFour::new(), move_timeout)
    }
}

impl<R: Rules> MatchDriver<R> {
    /// Driver for `rules`, giving each move at most `move_timeout`.
    pub fn new(rules: R, move_timeout: Duration) -> Self {
        MatchDriver {
            rules,
            move_timeout,
        }
    }

    /// The rules in use.
    pub fn rules(&self) -> &R {
        &self.rules
    }

    /// Budget of one move.
    pub fn move_timeout(&self) -> Duration {
        self.move_timeout
    }

    /// Play a match, `first` as `PLAYER_1` and `second` as `PLAYER_2`.
    ///
    /// Starts from `initial` if given (possibly mid-game, possibly already decided), otherwise
    /// from the rules' empty board. Never fails: agent failures become forfeits.
    pub fn play(
        &self,
        first: &mut dyn MoveSource,
        second: &mut dyn MoveSource,
        initial: Option<Board>,
    ) -> MatchRecord {
        let mut state = match initial {
            Some(board) => GameState::from_board(&self.rules, board),
            None => GameState::new(&self.rules),
        };
        let mut moves = vec![];

        loop {
            if let Some(outcome) = state.winner() {
                info!(%outcome, moves = moves.len(), "match over");
                return MatchRecord {
                    outcome,
                    moves,
                    board: state.board().clone(),
                    failure: None,
                };
            }

            let player = state.current_player();
            let turn = match player {
                Player::One => self.turn(&mut state, &mut *first, player),
                Player::Two => self.turn(&mut state, &mut *second, player),
            };

            match turn {
                Ok(column) => {
                    debug!(%player, column, "move accepted");
                    moves.push(column);
                }
                Err(error) => {
                    warn!(%player, kind = error.kind(), "forfeit: {error}");
                    return MatchRecord {
                        outcome: Outcome::Winner(player.opponent()),
                        moves,
                        board: state.board().clone(),
                        failure: Some(Forfeit {
                            offender: player,
                            error,
                        }),
                    };
                }
            }
        }
    }

    fn turn(
        &self,
        state: &mut GameState,
        source: &mut dyn MoveSource,
        player: Player,
    ) -> Result<usize, MatchError> {
        let deadline = Deadline::after(self.move_timeout);
        let mv = request_move(source, state.board(), player, deadline)?;
        // sources that cannot be preempted may still answer late
        if deadline.is_expired() {
            return Err(deadline.exceeded());
        }
        state.update(&self.rules, &mv)
    }
}
