//! CLI conformance tests for the `mastercontrol` binary.

use std::process::Command;

/// Run the binary with `args`, returning stdout, stderr and the exit code.
fn run_mastercontrol(args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_mastercontrol"))
        .args(args)
        .output()
        .expect("Failed to execute mastercontrol");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

// ── Help Output Tests ───────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let (stdout, _, code) = run_mastercontrol(&["--help"]);
    assert_eq!(code, 0, "Help should exit with code 0");
    assert!(stdout.contains("Usage:"));
    for cmd in ["run", "when"] {
        assert!(stdout.contains(cmd), "Help should list '{}' subcommand", cmd);
    }
}

#[test]
fn test_run_help_lists_options() {
    let (stdout, _, code) = run_mastercontrol(&["run", "--help"]);
    assert_eq!(code, 0);
    for flag in ["--config", "--workers", "--verbose"] {
        assert!(stdout.contains(flag), "run help should list {}", flag);
    }
}

#[test]
fn test_unknown_subcommand_fails() {
    let (_, stderr, code) = run_mastercontrol(&["frobnicate"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("frobnicate"));
}

// ── when ────────────────────────────────────────────────────────────────────

#[test]
fn test_when_relative() {
    let (stdout, _, code) = run_mastercontrol(&["when", "--minutes", "2"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Seconds from now: 120"), "got: {}", stdout);
    assert!(stdout.contains("In: 2 minutes"));
}

#[test]
fn test_when_wildcard() {
    let (stdout, _, code) = run_mastercontrol(&["when", "--monthnames", "march", "april", "--hourlist", "20"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Target:"), "got: {}", stdout);
    assert!(stdout.contains("Mar") || stdout.contains("Apr"));
}

#[test]
fn test_when_impossible() {
    let (stdout, _, code) = run_mastercontrol(&["when", "--monthlist", "2", "--daylist", "30"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Pattern never occurs"));
}

#[test]
fn test_when_beyond_calendar_range() {
    let (stdout, _, code) = run_mastercontrol(&["when", "--years", "100000000000"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Pattern never occurs"), "got: {}", stdout);
}
