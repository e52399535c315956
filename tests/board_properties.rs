use c4_arena::game::{Board, ConnectFour, GameState, Move, Player, Rules};
use proptest::prelude::*;

fn bottom_aligned(board: &Board) -> bool {
    (0..board.columns()).all(|c| (board.height(c)..board.rows()).all(|r| board.get(r, c).is_none()))
}

#[test]
fn turn_order_starts_with_player_one() {
    let rules = ConnectFour::new();
    let mut state = GameState::new(&rules);
    assert_eq!(state.current_player(), Player::One);
    state.update(&rules, &Move::Column(3)).unwrap();
    assert_eq!(state.current_player(), Player::Two);
}

proptest! {
    #[test]
    fn pieces_count_accepted_moves(columns in prop::collection::vec(-1i64..8, 0..80)) {
        let rules = ConnectFour::new();
        let mut state = GameState::new(&rules);
        let mut accepted = 0;
        for column in columns {
            let before = state.clone();
            match state.update(&rules, &Move::Column(column)) {
                Ok(landed) => {
                    accepted += 1;
                    prop_assert_eq!(landed as i64, column);
                    prop_assert_ne!(before.current_player(), state.current_player());
                }
                Err(_) => prop_assert_eq!(&before, &state),
            }
            prop_assert_eq!(state.board().pieces(), accepted);
            prop_assert!(bottom_aligned(state.board()));
        }
        // wire rows always describe a valid board again
        prop_assert_eq!(&Board::from_rows(&state.board().to_rows()).unwrap(), state.board());
    }

    #[test]
    fn apply_never_touches_its_input(columns in prop::collection::vec(0usize..7, 1..30)) {
        let rules = ConnectFour::new();
        let mut board = rules.empty_board();
        for column in columns {
            let player = board.current_player();
            let snapshot = board.clone();
            if let Ok(next) = rules.apply(&board, &Move::from(column), player) {
                prop_assert_eq!(&board, &snapshot);
                prop_assert_eq!(next.pieces(), board.pieces() + 1);
                prop_assert!(bottom_aligned(&next));
                board = next;
            }
        }
    }
}
