//! Integration tests for core CLI contract behavior.
//!
//! None of these need a wallet or a server: every device-facing command is
//! driven into a failure that happens before any traffic.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::{TempDir, tempdir},
};

/// Command isolated from the user's environment and config files.
fn cli_cmd(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("hwauth");
    cmd.current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env_remove("HWAUTH_PORT")
        .env_remove("HWAUTH_BAUD")
        .env_remove("HWAUTH_SERVER")
        .env_remove("HWAUTH_NON_INTERACTIVE")
        .env_remove("RUST_LOG");
    cmd
}

fn sandbox() -> TempDir {
    tempdir().expect("tempdir should be created")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let dir = sandbox();
    for flag in ["--help", "-h"] {
        cli_cmd(dir.path())
            .arg(flag)
            .assert()
            .success()
            .code(0)
            .stdout(predicate::str::contains("hwauth"))
            .stdout(predicate::str::contains("Usage"))
            .stderr(predicate::str::is_empty());
    }
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let dir = sandbox();
    for flag in ["--version", "-V"] {
        cli_cmd(dir.path())
            .arg(flag)
            .assert()
            .success()
            .stdout(predicate::str::contains("hwauth"))
            .stderr(predicate::str::is_empty());
    }
}

#[test]
fn help_lists_every_command() {
    let dir = sandbox();
    let assert = cli_cmd(dir.path()).arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for command in ["list-ports", "device-auth", "card-auth", "update", "completions"] {
        assert!(stdout.contains(command), "help should mention {command}");
    }
}

#[test]
fn colors_disabled_when_not_tty() {
    let dir = sandbox();
    let output = cli_cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    assert!(!stdout.contains("\x1b["), "no ANSI codes outside a TTY");
}

// ============================================================================
// list-ports
// ============================================================================

#[test]
fn list_ports_json_is_an_array_with_clean_stderr() {
    let dir = sandbox();
    let output = cli_cmd(dir.path())
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("list-ports --json should print JSON");
    assert!(parsed.is_array(), "list-ports --json should return an array");
    assert!(
        output.stderr.is_empty(),
        "JSON output should not come with stderr noise"
    );
}

#[test]
fn list_ports_human_output_goes_to_stderr() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .arg("list-ports")
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("serial ports"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn invalid_local_config_warns_but_is_not_fatal() {
    let dir = sandbox();
    fs::write(dir.path().join("hwauth.toml"), "invalid toml [[[").expect("write config");

    let output = cli_cmd(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "invalid config must not be fatal");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn invalid_explicit_config_warns_but_is_not_fatal() {
    let dir = sandbox();
    let config = dir.path().join("custom.toml");
    fs::write(&config, "[server\nurl = ").expect("write config");

    cli_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("list-ports")
        .assert()
        .success()
        .stderr(predicate::str::contains("TOML"));
}

/// Exit code 3: configuration error
#[test]
fn exit_code_three_without_server_url() {
    let dir = sandbox();
    for command in [&["device-auth"][..], &["card-auth"], &["update", "--check"]] {
        cli_cmd(dir.path())
            .arg("--non-interactive")
            .args(command)
            .assert()
            .failure()
            .code(3)
            .stdout(predicate::str::is_empty())
            .stderr(predicate::str::contains("server"));
    }
}

#[test]
fn exit_code_three_for_unusable_chunk_size() {
    let dir = sandbox();
    fs::write(
        dir.path().join("hwauth.toml"),
        "[server]\nurl = \"http://127.0.0.1:1\"\n\n[update]\nchunk_size = 0\n",
    )
    .expect("write config");

    // Rejected before the wallet is looked up, which would exit with 4.
    cli_cmd(dir.path())
        .args(["--non-interactive", "update"])
        .assert()
        .failure()
        .code(3)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("chunk size"));
}

#[test]
fn server_url_from_local_config_is_used() {
    let dir = sandbox();
    fs::write(
        dir.path().join("hwauth.toml"),
        "[server]\nurl = \"http://127.0.0.1:1\"\n",
    )
    .expect("write config");

    // Past the config check, the command fails on the missing wallet instead.
    cli_cmd(dir.path())
        .args(["--non-interactive", "device-auth"])
        .assert()
        .failure()
        .code(predicate::ne(3));
}

// ============================================================================
// Device-facing commands without a wallet
// ============================================================================

/// Exit code 4: device not found
#[test]
fn exit_code_four_when_no_wallet_is_connected() {
    let dir = sandbox();
    for command in ["device-auth", "card-auth"] {
        cli_cmd(dir.path())
            .args(["--non-interactive", "--server", "http://127.0.0.1:1", command])
            .assert()
            .failure()
            .code(4)
            .stdout(predicate::str::is_empty())
            .stderr(predicate::str::contains("Error"));
    }
}

#[test]
fn non_interactive_environment_variable_works() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .env("HWAUTH_NON_INTERACTIVE", "true")
        .env("HWAUTH_SERVER", "http://127.0.0.1:1")
        .arg("device-auth")
        .assert()
        .failure()
        .code(4);
}

#[test]
fn explicit_missing_port_fails_without_stdout() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .args([
            "--server",
            "http://127.0.0.1:1",
            "--port",
            "/dev/hwauth-no-such-port",
            "device-auth",
        ])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

// ============================================================================
// Usage errors
// ============================================================================

/// Exit code 2: usage error (unknown command, invalid arguments)
#[test]
fn exit_code_two_for_unknown_command() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unrecognized").or(predicate::str::contains("unknown")));
}

#[test]
fn exit_code_two_for_invalid_flag() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_completions_without_shell() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .arg("completions")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn unknown_command_suggests_similar() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .arg("card-aut")
        .assert()
        .failure()
        .stderr(predicate::str::contains("card-auth"));
}

#[test]
fn unknown_flag_suggests_similar() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .args(["list-ports", "--jason"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("json"));
}

// ============================================================================
// Completions
// ============================================================================

#[test]
fn completions_command_writes_to_stdout() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_hwauth()"));
}

#[test]
fn completions_install_writes_into_home() {
    let dir = sandbox();
    cli_cmd(dir.path())
        .env("XDG_DATA_HOME", dir.path().join(".local/share"))
        .args(["completions", "--install", "bash"])
        .assert()
        .success();
    let script = dir
        .path()
        .join(".local/share/bash-completion/completions/hwauth");
    if cfg!(target_os = "linux") {
        assert!(script.exists(), "bash completion should be installed");
    }
}
