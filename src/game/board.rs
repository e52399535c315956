use std::fmt::{self, Display};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Number of rows of a standard Connect Four board.
pub const ROWS: usize = 6;
/// Number of columns of a standard Connect Four board.
pub const COLUMNS: usize = 7;

/// One of the two players of a match.
///
/// Encoded as `1` and `2` on the wire; `0` is reserved for empty cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Player {
    /// Always opens the match.
    One = 1,
    /// Second to move.
    Two = 2,
}

impl Player {
    /// The other player.
    pub fn opponent(self) -> Player {
        match self {
            Player::One => Player::Two,
            Player::Two => Player::One,
        }
    }

    /// Wire value of the player (`1` or `2`).
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<Player> for u8 {
    fn from(player: Player) -> u8 {
        player.as_u8()
    }
}

impl TryFrom<u8> for Player {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> anyhow::Result<Player> {
        match value {
            1 => Ok(Player::One),
            2 => Ok(Player::Two),
            other => bail!("{other} is not a player number"),
        }
    }
}

impl Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Player::One => write!(f, "PLAYER_1"),
            Player::Two => write!(f, "PLAYER_2"),
        }
    }
}

/// Final result of a game: a winner, or a draw (`NO_PLAYER`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The player won the game (by connecting pieces or by forfeit of the opponent).
    Winner(Player),
    /// The board is full and nobody won.
    Draw,
}

impl Outcome {
    /// The winning player, `None` on a draw.
    pub fn winner(self) -> Option<Player> {
        match self {
            Outcome::Winner(player) => Some(player),
            Outcome::Draw => None,
        }
    }

    /// Wire value (`0` for a draw).
    pub fn as_u8(self) -> u8 {
        self.winner().map_or(0, Player::as_u8)
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Winner(player) => write!(f, "{player}"),
            Outcome::Draw => write!(f, "NO_PLAYER"),
        }
    }
}

/// A move as returned by an agent.
///
/// Agents are untrusted: anything that is not a JSON integer is kept as `Malformed` so that
/// the rules, not the protocol decoder, reject it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Move {
    /// An integer column index. Not necessarily inside the board.
    Column(i64),
    /// A value of the wrong type, kept as its raw JSON text.
    Malformed(String),
}

impl Move {
    /// The column index, if this move is an integer inside `[0, columns)`.
    pub fn column(&self, columns: usize) -> Option<usize> {
        match self {
            Move::Column(c) => usize::try_from(*c).ok().filter(|c| *c < columns),
            Move::Malformed(_) => None,
        }
    }
}

impl From<usize> for Move {
    fn from(column: usize) -> Move {
        Move::Column(column as i64)
    }
}

impl Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Move::Column(c) => write!(f, "{c}"),
            Move::Malformed(raw) => write!(f, "{raw}"),
        }
    }
}

/// Fixed-size grid of cells. Row `0` is the bottom row; pieces stack upwards.
///
/// A `Board` is never mutated in place by the rules: placing a piece yields a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Board {
    rows: usize,
    columns: usize,
    cells: Vec<Option<Player>>,
}

impl Board {
    /// An empty board of the given size.
    pub fn new(rows: usize, columns: usize) -> Board {
        Board {
            rows,
            columns,
            cells: vec![None; rows * columns],
        }
    }

    /// An empty 6x7 board.
    pub fn standard() -> Board {
        Board::new(ROWS, COLUMNS)
    }

    /// Build a board from wire rows (bottom row first), `0` meaning empty.
    ///
    /// # Errors
    /// Fails on ragged rows, unknown cell values or floating pieces.
    pub fn from_rows(rows: &[Vec<u8>]) -> anyhow::Result<Board> {
        let columns = rows.first().map_or(0, Vec::len);
        let mut board = Board::new(rows.len(), columns);
        for (r, row) in rows.iter().enumerate() {
            if row.len() != columns {
                bail!("row {r} has {} cells instead of {columns}", row.len());
            }
            for (c, value) in row.iter().enumerate() {
                let cell = match value {
                    0 => None,
                    v => Some(
                        Player::try_from(*v).with_context(|| format!("cell ({r}, {c})"))?,
                    ),
                };
                board.cells[r * columns + c] = cell;
            }
        }
        for c in 0..columns {
            let height = board.height(c);
            if (height..board.rows).any(|r| board.get(r, c).is_some()) {
                bail!("column {c} has a floating piece");
            }
        }
        Ok(board)
    }

    /// Wire rows (bottom row first), as sent to agents.
    pub fn to_rows(&self) -> Vec<Vec<u8>> {
        self.cells
            .chunks(self.columns.max(1))
            .take(self.rows)
            .map(|row| row.iter().map(|c| c.map_or(0, Player::as_u8)).collect())
            .collect()
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Content of a cell. Out of range coordinates read as empty.
    pub fn get(&self, row: usize, column: usize) -> Option<Player> {
        if row >= self.rows || column >= self.columns {
            return None;
        }
        self.cells[row * self.columns + column]
    }

    /// Number of pieces stacked in `column`.
    pub fn height(&self, column: usize) -> usize {
        (0..self.rows)
            .take_while(|r| self.get(*r, column).is_some())
            .count()
    }

    /// True when no piece can be dropped in `column`.
    pub fn is_column_full(&self, column: usize) -> bool {
        self.height(column) >= self.rows
    }

    /// True when every cell is occupied.
    pub fn is_full(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    /// Number of pieces owned by `player`.
    pub fn count(&self, player: Player) -> usize {
        self.cells.iter().filter(|c| **c == Some(player)).count()
    }

    /// Total number of pieces on the board.
    pub fn pieces(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// The player to move: the one with strictly fewer pieces, `Player::One` on ties.
    ///
    /// Always derived from the board, never stored.
    pub fn current_player(&self) -> Player {
        if self.count(Player::Two) < self.count(Player::One) {
            Player::Two
        } else {
            Player::One
        }
    }

    /// A copy of this board with `player`'s piece dropped in `column`.
    ///
    /// Returns `None` if the column does not exist or is full.
    pub(crate) fn with_piece(&self, column: usize, player: Player) -> Option<Board> {
        if column >= self.columns || self.is_column_full(column) {
            return None;
        }
        let row = self.height(column);
        let mut board = self.clone();
        board.cells[row * self.columns + column] = Some(player);
        Some(board)
    }
}

impl Default for Board {
    fn default() -> Self {
        Board::standard()
    }
}

impl Display for Board {
    /// Top row first, `.` for empty cells.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in (0..self.rows).rev() {
            let line = (0..self.columns)
                .map(|c| match self.get(r, c) {
                    None => '.',
                    Some(Player::One) => 'X',
                    Some(Player::Two) => 'O',
                })
                .collect::<String>();
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_board_opens_with_player_one() {
        let board = Board::standard();
        assert_eq!(board.pieces(), 0);
        assert_eq!(board.current_player(), Player::One);
    }

    #[test]
    fn pieces_stack_bottom_up() {
        let board = Board::standard()
            .with_piece(3, Player::One)
            .and_then(|b| b.with_piece(3, Player::Two))
            .unwrap();
        assert_eq!(board.get(0, 3), Some(Player::One));
        assert_eq!(board.get(1, 3), Some(Player::Two));
        assert_eq!(board.height(3), 2);
        assert_eq!(board.current_player(), Player::One);
    }

    #[test]
    fn full_column_rejects_pieces() {
        let mut board = Board::new(2, 1);
        board = board.with_piece(0, Player::One).unwrap();
        board = board.with_piece(0, Player::Two).unwrap();
        assert!(board.is_column_full(0));
        assert!(board.with_piece(0, Player::One).is_none());
        assert!(board.with_piece(1, Player::One).is_none());
    }

    #[test]
    fn rows_round_trip_and_validation() {
        let rows = vec![vec![1, 2, 0], vec![1, 0, 0]];
        let board = Board::from_rows(&rows).unwrap();
        assert_eq!(board.to_rows(), rows);
        assert_eq!(board.current_player(), Player::Two);

        assert!(Board::from_rows(&[vec![0, 0], vec![1, 0]]).is_err());
        assert!(Board::from_rows(&[vec![3, 0]]).is_err());
        assert!(Board::from_rows(&[vec![0, 0], vec![0]]).is_err());
    }

    #[test]
    fn move_column_bounds() {
        assert_eq!(Move::Column(6).column(7), Some(6));
        assert_eq!(Move::Column(7).column(7), None);
        assert_eq!(Move::Column(-1).column(7), None);
        assert_eq!(Move::Malformed("\"0\"".into()).column(7), None);
    }
}
