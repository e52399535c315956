//! Pre-flight check of an agent before it enters matches.
//!
//! The agent must answer a legal move on two canonical positions: the empty board with
//! `PLAYER_1` to move, and a mid-game board with `PLAYER_2` to move. Any failure, including
//! a panic of the move source, makes the check fail; it never propagates.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::error::MatchError;
use crate::game::{Board, ConnectFour, Rules};
use crate::move_source::{request_move, MoveSource};
use crate::timeout::Deadline;

/// Result of a validation.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Name of the first probe that failed.
    pub failed_probe: Option<&'static str>,
    /// Why it failed.
    pub failure: Option<MatchError>,
}

impl ValidationReport {
    /// True when every probe got a legal move in time.
    pub fn is_valid(&self) -> bool {
        self.failure.is_none()
    }
}

/// A named probe position.
#[derive(Debug, Clone)]
pub struct Probe {
    /// Name used in reports.
    pub name: &'static str,
    /// Position submitted to the agent. The player to move is derived from it.
    pub board: Board,
}

/// The two canonical probes on a 6x7 board.
pub fn standard_probes() -> Vec<Probe> {
    // bottom row: P1 P2 P1 . P1 . . / second row: . P2 . . . . .
    let later = [
        vec![1, 2, 1, 0, 1, 0, 0],
        vec![0, 2, 0, 0, 0, 0, 0],
        vec![0; 7],
        vec![0; 7],
        vec![0; 7],
        vec![0; 7],
    ];
    vec![
        Probe {
            name: "first move",
            board: Board::standard(),
        },
        Probe {
            name: "later move",
            board: Board::from_rows(&later).unwrap_or_default(),
        },
    ]
}

/// Runs probes against a move source.
#[derive(Debug, Clone)]
pub struct AgentValidator<R: Rules = ConnectFour> {
    rules: R,
    timeout: Duration,
    probes: Vec<Probe>,
}

impl AgentValidator<ConnectFour> {
    /// Standard probes under Connect Four rules, `timeout` per probe.
    pub fn new(timeout: Duration) -> Self {
        AgentValidator::with_rules(ConnectFour::new(), timeout, standard_probes())
    }
}

impl<R: Rules> AgentValidator<R> {
    /// Custom rules and probes.
    pub fn with_rules(rules: R, timeout: Duration, probes: Vec<Probe>) -> Self {
        AgentValidator {
            rules,
            timeout,
            probes,
        }
    }

    /// Budget of one probe.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every probe, stopping at the first failure.
    #[instrument(skip_all)]
    pub fn validate(&self, source: &mut dyn MoveSource) -> ValidationReport {
        for probe in &self.probes {
            if let Err(failure) = self.run_probe(probe, &mut *source) {
                warn!(probe = probe.name, "validation failed: {failure}");
                return ValidationReport {
                    failed_probe: Some(probe.name),
                    failure: Some(failure),
                };
            }
        }
        info!("agent is valid");
        ValidationReport {
            failed_probe: None,
            failure: None,
        }
    }

    fn run_probe(&self, probe: &Probe, source: &mut dyn MoveSource) -> Result<(), MatchError> {
        let player = probe.board.current_player();
        let deadline = Deadline::after(self.timeout);
        let mv = request_move(source, &probe.board, player, deadline)?;
        if deadline.is_expired() {
            return Err(deadline.exceeded());
        }
        self.rules
            .validate_move(&probe.board, &mv, player)
            .map_err(|reason| MatchError::InvalidMove { mv, player, reason })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Move, Player};
    use crate::move_source::from_fn;

    #[test]
    fn probes_ask_both_players() {
        let probes = standard_probes();
        assert_eq!(probes[0].board.current_player(), Player::One);
        assert_eq!(probes[1].board.current_player(), Player::Two);
        assert_eq!(probes[1].board.pieces(), 5);
        assert_eq!(probes[1].board.height(1), 2);
    }

    #[test]
    fn legal_answers_pass() {
        let validator = AgentValidator::new(Duration::from_secs(1));
        let mut seen = vec![];
        let report = validator.validate(&mut from_fn(|board: &Board, player, timeout| {
            seen.push((player, timeout));
            let column = (0..board.columns()).find(|c| !board.is_column_full(*c));
            Ok(column.map(Move::from).unwrap_or(Move::Column(0)))
        }));
        assert!(report.is_valid());
        assert_eq!(
            seen,
            [
                (Player::One, Duration::from_secs(1)),
                (Player::Two, Duration::from_secs(1))
            ]
        );
    }

    #[test]
    fn out_of_range_answer_fails() {
        let validator = AgentValidator::new(Duration::from_secs(1));
        let report = validator.validate(&mut from_fn(|_: &Board, _, _| Ok(Move::Column(7))));
        assert!(!report.is_valid());
        assert_eq!(report.failed_probe, Some("first move"));
        assert!(matches!(report.failure, Some(MatchError::InvalidMove { .. })));
    }

    #[test]
    fn panicking_source_fails_closed() {
        let validator = AgentValidator::new(Duration::from_secs(1));
        let report = validator.validate(&mut from_fn(|_: &Board, _, _| -> Result<Move, MatchError> {
            panic!("agent exploded")
        }));
        match report.failure {
            Some(MatchError::AgentRuntime { error, .. }) => assert!(error.contains("agent exploded")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn late_answer_fails() {
        let validator = AgentValidator::new(Duration::from_millis(20));
        let report = validator.validate(&mut from_fn(|_: &Board, _, _| {
            std::thread::sleep(Duration::from_millis(40));
            Ok(Move::Column(3))
        }));
        assert!(report.failure.unwrap().is_timeout());
    }
}
