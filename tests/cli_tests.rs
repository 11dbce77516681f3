// ABOUTME: Command-line tests for `init` and `run` through the library and the built binary
// ABOUTME: Exit status must be 0 on success and 1 on any usage or runtime failure

use luabot::BackendKind;
use std::process::Command;

fn luabot_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_luabot"))
}

#[test]
fn test_init_refuses_to_overwrite_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("luabot.lua");

    luabot::init(&path, BackendKind::Irc, false).unwrap();
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains(r#"luabot.newbot("IRC""#));

    std::fs::write(&path, "-- edited").unwrap();
    let err = luabot::init(&path, BackendKind::Null, false).unwrap_err();
    assert!(err.to_string().contains("already exists"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "-- edited");

    luabot::init(&path, BackendKind::Null, true).unwrap();
    assert!(std::fs::read_to_string(&path)
        .unwrap()
        .contains(r#"luabot.newbot("Null""#));
}

#[tokio::test]
async fn test_run_without_script_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = luabot::run(dir.path().join("missing.lua")).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_binary_init_generates_script() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bot.lua");

    let output = luabot_bin()
        .args(["-c", path.to_str().unwrap(), "init", "null"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("has been generated"));
    assert!(path.exists());
}

#[test]
fn test_binary_rejects_unknown_kind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bot.lua");

    let output = luabot_bin()
        .args(["-c", path.to_str().unwrap(), "init", "telex"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!path.exists());
}

#[test]
fn test_binary_without_command_exits_one() {
    let output = luabot_bin().output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_binary_run_with_missing_script_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let output = luabot_bin()
        .args(["-c", dir.path().join("nope.lua").to_str().unwrap(), "run"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}
