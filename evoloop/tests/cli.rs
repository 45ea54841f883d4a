//! CLI tests for `evoloop` commands.
//!
//! Spawns the binary against a temporary state directory and verifies output
//! and exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use evoloop::exit_codes;

fn evoloop(state_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_evoloop"))
        .arg("--state-dir")
        .arg(state_dir)
        .args(args)
        .output()
        .expect("spawn evoloop")
}

#[test]
fn init_twice_reports_already_valid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");

    let first = evoloop(&state, &["init", "--baseline-score", "480"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&first.stdout).contains("seeded champion"));
    assert_eq!(
        fs::read_to_string(state.join("champion_score")).expect("scalar"),
        "480\n"
    );

    let second = evoloop(&state, &["init", "--baseline-score", "480"]);
    assert_eq!(second.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&second.stdout).contains("already valid"));
}

#[test]
fn init_writes_config_at_the_given_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    let config = temp.path().join("shared.toml");
    let config_arg = config.to_string_lossy().into_owned();

    let out = evoloop(&state, &["--config", &config_arg, "init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(config.is_file());
    assert!(!state.join("config.toml").exists());

    let select = evoloop(&state, &["--config", &config_arg, "select"]);
    assert_eq!(select.status.code(), Some(exit_codes::OK));
    let validate = evoloop(&state, &["--config", &config_arg, "validate"]);
    assert_eq!(validate.status.code(), Some(exit_codes::OK));
}

#[test]
fn validate_exit_code_tracks_consistency() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    evoloop(&state, &["init", "--baseline-score", "480"]);

    let ok = evoloop(&state, &["validate"]);
    assert_eq!(ok.status.code(), Some(exit_codes::OK));

    fs::write(state.join("champion_score"), "999\n").expect("tamper");
    let bad = evoloop(&state, &["validate"]);
    assert_eq!(bad.status.code(), Some(exit_codes::FAILURE));
    assert!(String::from_utf8_lossy(&bad.stdout).contains("disagrees"));
}

#[test]
fn select_prints_plan_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    evoloop(&state, &["init"]);

    let out = evoloop(&state, &["select"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(report["iteration"], 1);
    assert_eq!(report["plan"]["execute_this_iteration"], false);
}

#[test]
fn run_without_collaborators_is_a_startup_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    evoloop(&state, &["init"]);
    let config = state.join("config.toml");
    let contents = fs::read_to_string(&config).expect("config");
    fs::write(
        &config,
        contents.replace("\"evoloop-generate\"", "\"/nonexistent/generator\""),
    )
    .expect("write config");

    let out = evoloop(&state, &["run", "--max-iterations", "1"]);
    assert_eq!(out.status.code(), Some(exit_codes::FAILURE));
    assert!(String::from_utf8_lossy(&out.stderr).contains("not found"));
}

#[cfg(unix)]
mod unix {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    /// Verifies a full run against real subprocess collaborators.
    #[test]
    fn run_drives_subprocess_collaborators_to_the_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = temp.path().join("state");
        let generator = script(
            temp.path(),
            "gen.sh",
            r#"cat > /dev/null
echo '{"type":"message","text":"working"}'
printf '{"name":"const","source":"fn fee() -> u32 { 42 }"}' > "$EVOLOOP_ARTIFACT_PATH""#,
        );
        let evaluator = script(
            temp.path(),
            "eval.sh",
            r#"echo '{"screening_score": 490.0, "authoritative_score": 490.0}'"#,
        );
        evoloop(&state, &["init", "--baseline-score", "480"]);
        let config = state.join("config.toml");
        let contents = fs::read_to_string(&config).expect("config");
        let contents = contents
            .replace("\"evoloop-generate\"", &format!("{generator:?}"))
            .replace("\"evoloop-evaluate\"", &format!("{evaluator:?}"));
        fs::write(&config, contents).expect("write config");

        let out = evoloop(
            &state,
            &["run", "--max-iterations", "2", "--min-delay-secs", "0"],
        );
        assert_eq!(
            out.status.code(),
            Some(exit_codes::OK),
            "stderr: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        let log = fs::read_to_string(state.join("iterations.jsonl")).expect("log");
        assert_eq!(log.lines().count(), 2);
        assert_eq!(
            fs::read_to_string(state.join("champion_score")).expect("scalar"),
            "490\n"
        );
        assert!(state.join("iterations/1/transcript.jsonl").exists());
    }
}
