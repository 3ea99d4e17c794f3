//! End-to-end runs of the `remora` binary.

use std::process::Command;

fn remora() -> Command {
	let mut command = Command::new(env!("CARGO_BIN_EXE_remora"));
	command.env_remove("REMORA_ENGINE").env_remove("REMORA_WS_ENDPOINT").env_remove("RUST_LOG");
	command
}

#[test]
fn missing_engine_exits_with_error() {
	let output = remora().args(["call", "initialize"]).output().unwrap();

	assert_eq!(output.status.code(), Some(1));
	let stderr = String::from_utf8_lossy(&output.stderr);
	assert!(stderr.contains("no engine configured"), "stderr: {stderr}");
}

#[test]
fn unspawnable_engine_exits_with_error() {
	let output = remora()
		.args(["--engine", "/nonexistent/remora-engine", "call", "initialize"])
		.output()
		.unwrap();

	assert_eq!(output.status.code(), Some(1));
	let stderr = String::from_utf8_lossy(&output.stderr);
	assert!(stderr.contains("failed to start engine"), "stderr: {stderr}");
}

// `cat` answers every request with the request itself, which parses as an
// empty response.
#[cfg(unix)]
#[test]
fn call_against_echo_engine_prints_null() {
	let output = remora().args(["--engine", "cat", "call", "echo"]).output().unwrap();

	assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
	assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "null");
}

#[cfg(unix)]
#[test]
fn wait_without_event_times_out() {
	let output = remora()
		.args(["--engine", "cat", "--timeout", "200", "wait", "load", "--reject-on", "close"])
		.output()
		.unwrap();

	assert_eq!(output.status.code(), Some(1));
	let stderr = String::from_utf8_lossy(&output.stderr);
	assert!(stderr.contains("Timeout 200ms exceeded."), "stderr: {stderr}");
}

#[cfg(unix)]
#[test]
fn invalid_params_are_rejected_before_calling() {
	let output = remora()
		.args(["--engine", "cat", "call", "goto", "--params", "[1]"])
		.output()
		.unwrap();

	assert_eq!(output.status.code(), Some(1));
	let stderr = String::from_utf8_lossy(&output.stderr);
	assert!(stderr.contains("--params must be a JSON object"), "stderr: {stderr}");
}
