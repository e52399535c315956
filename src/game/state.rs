use crate::error::MatchError;
use crate::game::board::{Board, Move, Outcome, Player};
use crate::game::rules::{MoveRejection, Rules};

/// Board of a running match plus its derived outcome.
///
/// `winner` is recomputed every time the board changes and cannot be set directly. Once it
/// is `Some`, the state is terminal and refuses further moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameState {
    board: Board,
    winner: Option<Outcome>,
}

impl GameState {
    /// State on the rules' empty board.
    pub fn new<R: Rules + ?Sized>(rules: &R) -> GameState {
        GameState::from_board(rules, rules.empty_board())
    }

    /// State on a supplied position. The position may already be terminal.
    pub fn from_board<R: Rules + ?Sized>(rules: &R, board: Board) -> GameState {
        let winner = rules.winner(&board);
        GameState { board, winner }
    }

    /// Current board.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// `Some` once the game is over.
    pub fn winner(&self) -> Option<Outcome> {
        self.winner
    }

    /// True once the game is over.
    pub fn is_terminal(&self) -> bool {
        self.winner.is_some()
    }

    /// Player on turn, derived from the piece counts.
    pub fn current_player(&self) -> Player {
        self.board.current_player()
    }

    /// Validate `mv` for the player on turn and apply it.
    ///
    /// Returns the column the piece landed in. The state is left untouched on error.
    pub fn update<R: Rules + ?Sized>(&mut self, rules: &R, mv: &Move) -> Result<usize, MatchError> {
        let player = self.current_player();
        let invalid = |reason| MatchError::InvalidMove {
            mv: mv.clone(),
            player,
            reason,
        };
        if let Some(outcome) = self.winner {
            return Err(invalid(MoveRejection::GameOver(outcome)));
        }
        let column = rules
            .validate_move(&self.board, mv, player)
            .map_err(invalid)?;
        self.board = rules.apply(&self.board, mv, player)?;
        self.winner = rules.winner(&self.board);
        Ok(column)
    }
}
