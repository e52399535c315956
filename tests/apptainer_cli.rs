//! The Apptainer backend against a scripted stand-in for the `apptainer` binary.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use c4_arena::prelude::*;
use c4_arena::sandbox::apptainer::ApptainerBackend;
use c4_arena::sandbox::SandboxBackend;

// Keeps started instances in a file next to the script. PLAYER_1 always answers column 3,
// any other command hangs.
const FAKE_APPTAINER: &str = r#"#!/bin/sh
state="$(dirname "$0")/instances"
touch "$state"
case "$1 $2" in
"instance start")
    for last; do :; done
    echo "$last" >> "$state"
    ;;
"instance list")
    printf '{"instances":['
    sep=''
    while read -r name; do
        printf '%s{"instance":"%s","pid":1,"img":"agent.sif"}' "$sep" "$name"
        sep=','
    done < "$state"
    printf ']}\n'
    ;;
"instance stop")
    if ! grep -q -x "$3" "$state"; then
        echo "FATAL: no instance found with name $3" >&2
        exit 255
    fi
    grep -v -x "$3" "$state" > "$state.tmp"
    mv "$state.tmp" "$state"
    ;;
*)
    case "$*" in
    *"generate_move(board, 1,"*) echo '{"status": "success", "move": 3}' ;;
    *) exec sleep 5 ;;
    esac
    ;;
esac
"#;

fn install(dir: &Path) -> String {
    let script = dir.join("apptainer");
    fs::write(&script, FAKE_APPTAINER).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script.display().to_string()
}

#[test]
fn fake_runtime_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration::new()
        .with_verbose(false)
        .with_allow_uncontained(true)
        .with_runtime(install(dir.path()));
    let backend = Arc::new(ApptainerBackend::from_configuration(&config));

    // stopping an unknown instance is not an error
    backend.stop("c4arena_unknown").unwrap();
    assert!(backend.list().unwrap().is_empty());

    let constraints = ConstraintsBuilder::new()
        .with_max_total_ram(8_192)
        .with_action_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let arena = Arena::with_backend(backend.clone(), config, constraints);

    // PLAYER_1 answers, PLAYER_2 hangs until killed
    let start = Instant::now();
    let record = arena
        .play(Path::new("alice.sif"), Path::new("bob.sif"), None)
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(record.outcome, Outcome::Winner(Player::One));
    assert_eq!(record.moves, [3]);
    let failure = record.failure.unwrap();
    assert_eq!(failure.offender, Player::Two);
    assert!(failure.error.is_timeout());

    // both instances were stopped, nothing left to reap
    assert!(backend.list().unwrap().is_empty());
    assert_eq!(arena.reap_orphans(), 0);
}
