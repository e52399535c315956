//! The rules capability consumed by the match driver, and its Connect Four implementation.

use thiserror::Error;

use crate::error::MatchError;
use crate::game::board::{Board, Move, Outcome, Player, COLUMNS, ROWS};

/// Why a move was refused by the rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveRejection {
    /// The agent answered with something that is not an integer.
    #[error("move is not an integer column")]
    Malformed,
    /// The column does not exist.
    #[error("column {column} is outside [0, {columns})")]
    OutOfBounds {
        /// Requested column.
        column: i64,
        /// Number of columns of the board.
        columns: usize,
    },
    /// No piece can be dropped in this column anymore.
    #[error("column {0} is full")]
    ColumnFull(usize),
    /// The move was attributed to the player that is not on turn.
    #[error("it is {expected}'s turn, not {got}'s")]
    NotYourTurn {
        /// Player derived from the piece counts.
        expected: Player,
        /// Player the move was attributed to.
        got: Player,
    },
    /// The game already has an outcome.
    #[error("game is already over ({0})")]
    GameOver(Outcome),
}

/// What the match driver needs from a game.
///
/// Implementations must be pure: the same board always yields the same answers.
pub trait Rules {
    /// Board a match starts from when no initial position is given.
    fn empty_board(&self) -> Board;

    /// Check a move: type, bounds, column openness, and whose turn it is.
    ///
    /// Returns the column the piece lands in.
    fn validate_move(&self, board: &Board, mv: &Move, player: Player)
        -> Result<usize, MoveRejection>;

    /// `validate_move` as a boolean gate.
    fn is_valid_move(&self, board: &Board, mv: &Move, player: Player) -> bool {
        self.validate_move(board, mv, player).is_ok()
    }

    /// Drop `player`'s piece for `mv`, producing a new board.
    ///
    /// # Errors
    /// `InvalidMove` if the move is malformed, out of bounds, or targets a full column.
    fn apply(&self, board: &Board, mv: &Move, player: Player) -> Result<Board, MatchError>;

    /// `Some(Winner)` when a player connected, `Some(Draw)` on a full board, `None` otherwise.
    fn winner(&self, board: &Board) -> Option<Outcome>;
}

/// Connect Four on a `rows` x `columns` grid, `connect` pieces in a line to win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFour {
    rows: usize,
    columns: usize,
    connect: usize,
}

impl ConnectFour {
    /// Standard 6x7 board, four in a row.
    pub fn new() -> ConnectFour {
        ConnectFour {
            rows: ROWS,
            columns: COLUMNS,
            connect: 4,
        }
    }

    /// Custom board size.
    pub fn with_size(rows: usize, columns: usize) -> ConnectFour {
        ConnectFour {
            rows,
            columns,
            ..ConnectFour::new()
        }
    }

    fn column_of(&self, board: &Board, mv: &Move) -> Result<usize, MoveRejection> {
        let raw = match mv {
            Move::Column(c) => *c,
            Move::Malformed(_) => return Err(MoveRejection::Malformed),
        };
        let column = mv.column(board.columns()).ok_or(MoveRejection::OutOfBounds {
            column: raw,
            columns: board.columns(),
        })?;
        if board.is_column_full(column) {
            return Err(MoveRejection::ColumnFull(column));
        }
        Ok(column)
    }

    fn connects(&self, board: &Board, player: Player) -> bool {
        const DIRECTIONS: [(isize, isize); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];
        let n = self.connect as isize;
        for r in 0..board.rows() as isize {
            for c in 0..board.columns() as isize {
                for (dr, dc) in DIRECTIONS {
                    let end_r = r + dr * (n - 1);
                    let end_c = c + dc * (n - 1);
                    if end_r < 0
                        || end_c < 0
                        || end_r >= board.rows() as isize
                        || end_c >= board.columns() as isize
                    {
                        continue;
                    }
                    if (0..n).all(|i| {
                        board.get((r + dr * i) as usize, (c + dc * i) as usize) == Some(player)
                    }) {
                        return true;
                    }
                }
            }
        }
        false
    }
}

impl Default for ConnectFour {
    fn default() -> Self {
        Self::new()
    }
}

impl Rules for ConnectFour {
    fn empty_board(&self) -> Board {
        Board::new(self.rows, self.columns)
    }

    fn validate_move(
        &self,
        board: &Board,
        mv: &Move,
        player: Player,
    ) -> Result<usize, MoveRejection> {
        let column = self.column_of(board, mv)?;
        let expected = board.current_player();
        if player != expected {
            return Err(MoveRejection::NotYourTurn {
                expected,
                got: player,
            });
        }
        Ok(column)
    }

    fn apply(&self, board: &Board, mv: &Move, player: Player) -> Result<Board, MatchError> {
        let invalid = |reason| MatchError::InvalidMove {
            mv: mv.clone(),
            player,
            reason,
        };
        let column = self.column_of(board, mv).map_err(invalid)?;
        board
            .with_piece(column, player)
            .ok_or_else(|| invalid(MoveRejection::ColumnFull(column)))
    }

    fn winner(&self, board: &Board) -> Option<Outcome> {
        if self.connects(board, Player::One) {
            Some(Outcome::Winner(Player::One))
        } else if self.connects(board, Player::Two) {
            Some(Outcome::Winner(Player::Two))
        } else if board.is_full() {
            Some(Outcome::Draw)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod rules_tests {
    use super::*;

    fn board(rows: &[[u8; 7]]) -> Board {
        Board::from_rows(&rows.iter().map(|r| r.to_vec()).collect::<Vec<_>>()).unwrap()
    }

    fn padded(bottom: &[[u8; 7]]) -> Board {
        let mut rows = bottom.to_vec();
        rows.resize(6, [0; 7]);
        board(&rows)
    }

    #[test]
    fn horizontal_vertical_and_diagonal_wins() {
        let rules = ConnectFour::new();
        let horizontal = padded(&[[1, 1, 1, 1, 2, 2, 2]]);
        assert_eq!(rules.winner(&horizontal), Some(Outcome::Winner(Player::One)));

        let vertical = padded(&[
            [2, 1, 0, 0, 0, 0, 0],
            [2, 1, 0, 0, 0, 0, 0],
            [2, 1, 0, 0, 0, 0, 0],
            [2, 0, 0, 0, 0, 0, 0],
        ]);
        assert_eq!(rules.winner(&vertical), Some(Outcome::Winner(Player::Two)));

        let diagonal = padded(&[
            [1, 2, 1, 2, 0, 0, 0],
            [0, 1, 2, 2, 0, 0, 0],
            [0, 0, 1, 1, 0, 0, 0],
            [0, 0, 0, 1, 0, 0, 0],
        ]);
        assert_eq!(rules.winner(&diagonal), Some(Outcome::Winner(Player::One)));
    }

    #[test]
    fn anti_diagonal_win() {
        let rules = ConnectFour::new();
        let b = padded(&[
            [1, 1, 1, 2, 0, 0, 0],
            [1, 1, 2, 0, 0, 0, 0],
            [2, 2, 0, 0, 0, 0, 0],
            [2, 0, 0, 0, 0, 0, 0],
        ]);
        assert_eq!(rules.winner(&b), Some(Outcome::Winner(Player::Two)));
    }

    #[test]
    fn drawn_board() {
        let rules = ConnectFour::new();
        let b = board(&[
            [1, 1, 1, 2, 1, 1, 1],
            [2, 2, 2, 1, 2, 2, 2],
            [1, 1, 1, 2, 1, 1, 1],
            [2, 2, 2, 1, 2, 2, 2],
            [1, 1, 1, 2, 1, 1, 1],
            [2, 2, 2, 1, 2, 2, 2],
        ]);
        assert_eq!(rules.winner(&b), Some(Outcome::Draw));
    }

    #[test]
    fn ongoing_game_has_no_winner() {
        let rules = ConnectFour::new();
        assert_eq!(rules.winner(&rules.empty_board()), None);
        let b = padded(&[[1, 1, 1, 0, 2, 2, 2]]);
        assert_eq!(rules.winner(&b), None);
    }

    #[test]
    fn move_validation() {
        let rules = ConnectFour::new();
        let empty = rules.empty_board();
        assert_eq!(rules.validate_move(&empty, &Move::Column(0), Player::One), Ok(0));
        assert_eq!(
            rules.validate_move(&empty, &Move::Column(0), Player::Two),
            Err(MoveRejection::NotYourTurn {
                expected: Player::One,
                got: Player::Two
            })
        );
        assert_eq!(
            rules.validate_move(&empty, &Move::Column(7), Player::One),
            Err(MoveRejection::OutOfBounds {
                column: 7,
                columns: 7
            })
        );
        assert_eq!(
            rules.validate_move(&empty, &Move::Malformed("2.3".into()), Player::One),
            Err(MoveRejection::Malformed)
        );

        let full_first = board(&[
            [1, 0, 0, 0, 0, 0, 0],
            [2, 0, 0, 0, 0, 0, 0],
            [1, 0, 0, 0, 0, 0, 0],
            [2, 0, 0, 0, 0, 0, 0],
            [1, 0, 0, 0, 0, 0, 0],
            [2, 0, 0, 0, 0, 0, 0],
        ]);
        assert!(!rules.is_valid_move(&full_first, &Move::Column(0), Player::One));
        assert!(rules.is_valid_move(&full_first, &Move::Column(1), Player::One));
    }

    #[test]
    fn apply_does_not_touch_the_input() {
        let rules = ConnectFour::new();
        let empty = rules.empty_board();
        let next = rules.apply(&empty, &Move::Column(2), Player::One).unwrap();
        assert_eq!(empty.pieces(), 0);
        assert_eq!(next.get(0, 2), Some(Player::One));
        assert!(matches!(
            rules.apply(&empty, &Move::Malformed("\"a\"".into()), Player::One),
            Err(MatchError::InvalidMove {
                reason: MoveRejection::Malformed,
                ..
            })
        ));
    }
}
