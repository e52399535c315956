//! Request/response protocol between the arena and an agent running in a sandbox.
//!
//! A request is turned into a `python3 -c` command that imports the agent's entry point,
//! calls it with the board (nested list, bottom row first), the player number and the
//! timeout in seconds, and prints one JSON envelope on the last line of stdout:
//!
//! ```text
//! {"status": "success", "move": 3}
//! {"status": "error", "error": "ZeroDivisionError('division by zero')", "traceback": "..."}
//! ```
//!
//! Decoding stops at the envelope: a move of the wrong type or outside the board is passed
//! on as is, the rules reject it.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::MatchError;
use crate::game::{Board, Move, Player};

/// One move request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest<'a> {
    /// Position to play on.
    pub board: &'a Board,
    /// Player to move.
    pub player: Player,
    /// Budget announced to the agent.
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum MoveEnvelope {
    Success {
        #[serde(rename = "move")]
        mv: Value,
    },
    Error {
        error: String,
        #[serde(default)]
        traceback: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum LatencyEnvelope {
    Success {
        elapsed: f64,
    },
    Error {
        error: String,
        #[serde(default)]
        traceback: String,
    },
}

/// How to reach the agent's entry point inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveProtocol {
    interpreter: String,
    module: String,
    entry_point: String,
}

impl Default for MoveProtocol {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            module: "agent".to_string(),
            entry_point: "generate_move".to_string(),
        }
    }
}

impl MoveProtocol {
    /// `from agent import generate_move`, run with `python3`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Import the entry point from another module.
    pub fn with_entry_point(self, module: &str, entry_point: &str) -> Self {
        Self {
            module: module.to_string(),
            entry_point: entry_point.to_string(),
            ..self
        }
    }

    /// Use another Python interpreter.
    pub fn with_interpreter(self, interpreter: &str) -> Self {
        Self {
            interpreter: interpreter.to_string(),
            ..self
        }
    }

    /// Command asking for a move.
    pub fn move_command(&self, request: &MoveRequest<'_>) -> Vec<String> {
        let body = format!(
            "move = {entry}(board, {player}, {timeout:?})\n\
             if hasattr(move, 'item'):\n    move = move.item()\n\
             envelope = {{'status': 'success', 'move': move}}",
            entry = self.entry_point,
            player = request.player.as_u8(),
            timeout = request.timeout.as_secs_f64(),
        );
        self.command(request.board, &body, &[])
    }

    /// Command measuring, inside the sandbox, how long the entry point takes.
    pub fn latency_command(&self, request: &MoveRequest<'_>) -> Vec<String> {
        let body = format!(
            "start = time.perf_counter()\n\
             {entry}(board, {player}, {timeout:?})\n\
             elapsed = time.perf_counter() - start\n\
             envelope = {{'status': 'success', 'elapsed': elapsed}}",
            entry = self.entry_point,
            player = request.player.as_u8(),
            timeout = request.timeout.as_secs_f64(),
        );
        self.command(request.board, &body, &["time"])
    }

    /// Agent code runs with stdout sent to stderr; the envelope gets a line of its own.
    fn command(&self, board: &Board, body: &str, imports: &[&str]) -> Vec<String> {
        let rows = serde_json::to_string(&board.to_rows()).unwrap_or_else(|_| "[]".to_string());
        let mut script = String::from("import contextlib, json, sys, traceback\n");
        for import in imports {
            script += &format!("import {import}\n");
        }
        script += "try:\n";
        script += "    with contextlib.redirect_stdout(sys.stderr):\n";
        let inner = format!(
            "import numpy as np\n\
             from {module} import {entry}\n\
             board = np.array({rows}, dtype=np.int8)\n\
             {body}",
            module = self.module,
            entry = self.entry_point,
        );
        for line in inner.lines() {
            script += "        ";
            script += line;
            script += "\n";
        }
        script += "    out = json.dumps(envelope)\n";
        script += "except BaseException as exc:\n";
        script += "    out = json.dumps({'status': 'error', 'error': repr(exc), \
                   'traceback': traceback.format_exc()})\n";
        script += "sys.stdout.write('\\n' + out + '\\n')\n";
        vec![self.interpreter.clone(), "-c".to_string(), script]
    }

    /// Decode the answer to [`move_command`](Self::move_command).
    ///
    /// # Errors
    /// - `AgentRuntime` for an error envelope
    /// - `AgentProtocol` when stdout does not end with an envelope
    pub fn decode_move(&self, stdout: &str) -> Result<Move, MatchError> {
        match parse_envelope::<MoveEnvelope>(stdout)? {
            MoveEnvelope::Success { mv } => Ok(match mv.as_i64() {
                Some(column) => Move::Column(column),
                None => Move::Malformed(mv.to_string()),
            }),
            MoveEnvelope::Error { error, traceback } => {
                Err(MatchError::AgentRuntime { error, traceback })
            }
        }
    }

    /// Decode the answer to [`latency_command`](Self::latency_command), in seconds.
    pub fn decode_latency(&self, stdout: &str) -> Result<f64, MatchError> {
        match parse_envelope::<LatencyEnvelope>(stdout)? {
            LatencyEnvelope::Success { elapsed } => Ok(elapsed),
            LatencyEnvelope::Error { error, traceback } => {
                Err(MatchError::AgentRuntime { error, traceback })
            }
        }
    }
}

/// The envelope is the last non-empty line: anything the agent printed before is ignored.
fn parse_envelope<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<T, MatchError> {
    let protocol_error = |reason: String| MatchError::AgentProtocol {
        reason,
        raw: stdout.to_string(),
    };
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| protocol_error("empty output".to_string()))?;
    serde_json::from_str(line).map_err(|e| protocol_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(board: &Board) -> MoveRequest<'_> {
        MoveRequest {
            board,
            player: Player::Two,
            timeout: Duration::from_millis(1500),
        }
    }

    #[test]
    fn move_command_embeds_the_request() {
        let board = Board::from_rows(&[vec![1, 0, 0], vec![0, 0, 0]]).unwrap();
        let command = MoveProtocol::new().move_command(&request(&board));
        assert_eq!(command[0], "python3");
        assert_eq!(command[1], "-c");
        let script = &command[2];
        assert!(script.contains("from agent import generate_move"));
        assert!(script.contains("np.array([[1,0,0],[0,0,0]], dtype=np.int8)"));
        assert!(script.contains("generate_move(board, 2, 1.5)"));
        assert!(script.contains("'status': 'error'"));
    }

    #[test]
    fn whole_seconds_stay_floats() {
        let board = Board::standard();
        let req = MoveRequest {
            timeout: Duration::from_secs(1),
            ..request(&board)
        };
        let script = &MoveProtocol::new().move_command(&req)[2];
        assert!(script.contains("generate_move(board, 2, 1.0)"));
    }

    #[test]
    fn custom_entry_point() {
        let board = Board::standard();
        let protocol = MoveProtocol::new()
            .with_entry_point("submission", "play")
            .with_interpreter("/usr/bin/python3.12");
        let command = protocol.latency_command(&request(&board));
        assert_eq!(command[0], "/usr/bin/python3.12");
        assert!(command[2].contains("from submission import play"));
        assert!(command[2].contains("import time"));
        assert!(command[2].contains("'elapsed': elapsed"));
    }

    #[test]
    fn success_envelope() {
        let protocol = MoveProtocol::new();
        assert_eq!(
            protocol.decode_move(r#"{"status": "success", "move": 3}"#).unwrap(),
            Move::Column(3)
        );
        // zero is a real move, not an absence of answer
        assert_eq!(
            protocol.decode_move("{\"status\":\"success\",\"move\":0}\n").unwrap(),
            Move::Column(0)
        );
    }

    #[test]
    fn out_of_range_and_wrong_types_pass_through() {
        let protocol = MoveProtocol::new();
        assert_eq!(
            protocol.decode_move(r#"{"status":"success","move":42}"#).unwrap(),
            Move::Column(42)
        );
        assert_eq!(
            protocol.decode_move(r#"{"status":"success","move":2.3}"#).unwrap(),
            Move::Malformed("2.3".to_string())
        );
        assert_eq!(
            protocol.decode_move(r#"{"status":"success","move":"0"}"#).unwrap(),
            Move::Malformed("\"0\"".to_string())
        );
    }

    #[test]
    fn error_envelope_is_a_runtime_error() {
        let err = MoveProtocol::new()
            .decode_move(
                r#"{"status":"error","error":"ZeroDivisionError('division by zero')","traceback":"Traceback..."}"#,
            )
            .unwrap_err();
        match err {
            MatchError::AgentRuntime { error, traceback } => {
                assert!(error.contains("ZeroDivisionError"));
                assert_eq!(traceback, "Traceback...");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bare_integer_is_a_protocol_error() {
        for raw in ["3", "", "garbage", r#"{"status":"maybe"}"#, r#"{"move":1}"#] {
            match MoveProtocol::new().decode_move(raw) {
                Err(MatchError::AgentProtocol { raw: kept, .. }) => assert_eq!(kept, raw),
                other => panic!("{raw:?} decoded as {other:?}"),
            }
        }
    }

    #[test]
    fn agent_prints_before_the_envelope() {
        let stdout = "thinking...\n{\"status\":\"success\",\"move\":5}\n\n";
        assert_eq!(MoveProtocol::new().decode_move(stdout).unwrap(), Move::Column(5));
    }

    /// Run `command` from a directory holding a stub `numpy` and `agent_source` as `agent.py`.
    /// `None` when no Python interpreter is installed.
    fn run_with_agent(command: &[String], agent_source: &str) -> Option<String> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("numpy.py"),
            "int8 = 'int8'\ndef array(rows, dtype=None):\n    return rows\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("agent.py"), agent_source).unwrap();
        let output = std::process::Command::new(&command[0])
            .args(&command[1..])
            .current_dir(dir.path())
            .output()
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    #[test]
    fn agent_output_never_breaks_the_envelope() {
        let board = Board::standard();
        let protocol = MoveProtocol::new();
        let command = protocol.move_command(&request(&board));
        let chatty = "import sys\n\
                      def generate_move(board, player, timeout):\n    \
                      print('thinking', end='')\n    \
                      sys.stdout.write('still thinking')\n    \
                      return 3\n";
        let Some(stdout) = run_with_agent(&command, chatty) else {
            eprintln!("python3 not available, skipped");
            return;
        };
        assert!(!stdout.contains("thinking"));
        assert_eq!(protocol.decode_move(&stdout).unwrap(), Move::Column(3));

        let raising = "def generate_move(board, player, timeout):\n    \
                       print('about to fail', end='')\n    \
                       return 1 // 0\n";
        let stdout = run_with_agent(&command, raising).unwrap();
        match protocol.decode_move(&stdout) {
            Err(MatchError::AgentRuntime { error, traceback }) => {
                assert!(error.contains("ZeroDivisionError"));
                assert!(traceback.contains("generate_move"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn latency_envelope() {
        let protocol = MoveProtocol::new();
        let elapsed = protocol
            .decode_latency(r#"{"status":"success","elapsed":0.0123}"#)
            .unwrap();
        assert!((elapsed - 0.0123).abs() < 1e-9);
        assert!(protocol
            .decode_latency(r#"{"status":"error","error":"boom"}"#)
            .is_err());
    }
}
