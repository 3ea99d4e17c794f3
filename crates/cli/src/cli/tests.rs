use clap::Parser;

use super::*;

#[test]
fn parse_call_with_defaults() {
	let cli = Cli::try_parse_from(["remora", "--engine", "remora-engine", "call", "initialize"]).unwrap();

	assert_eq!(cli.engine.as_deref(), Some("remora-engine"));
	assert_eq!(cli.timeout, DEFAULT_TIMEOUT_MS);
	assert!(!cli.lenient);
	match cli.command {
		Commands::Call(args) => {
			assert_eq!(args.method, "initialize");
			assert_eq!(args.target, "");
			assert_eq!(args.params, None);
		}
		_ => panic!("Expected Call command"),
	}
}

#[test]
fn parse_call_with_target_and_params() {
	let cli = Cli::try_parse_from([
		"remora",
		"call",
		"goto",
		"--target",
		"page@1",
		"--params",
		r#"{"url":"about:blank"}"#,
		"--engine",
		"remora-engine",
		"--engine-arg",
		"--headless",
		"--engine-arg",
		"run-driver",
	])
	.unwrap();

	assert_eq!(cli.engine_args, vec!["--headless".to_string(), "run-driver".to_string()]);
	match cli.command {
		Commands::Call(args) => {
			assert_eq!(args.target, "page@1");
			assert_eq!(args.params.as_deref(), Some(r#"{"url":"about:blank"}"#));
		}
		_ => panic!("Expected Call command"),
	}
}

#[test]
fn parse_wait_with_rejections_and_action() {
	let cli = Cli::try_parse_from([
		"remora",
		"--ws-endpoint",
		"ws://127.0.0.1:9000/",
		"--timeout",
		"500",
		"-vv",
		"wait",
		"load",
		"--target",
		"page@1",
		"--reject-on",
		"close",
		"--reject-on",
		"crash",
		"--call",
		"reload",
		"--params",
		"{}",
	])
	.unwrap();

	assert_eq!(cli.ws_endpoint.as_deref(), Some("ws://127.0.0.1:9000/"));
	assert_eq!(cli.timeout, 500);
	assert_eq!(cli.verbose, 2);
	match cli.command {
		Commands::Wait(args) => {
			assert_eq!(args.event, "load");
			assert_eq!(args.reject_on, vec!["close".to_string(), "crash".to_string()]);
			assert_eq!(args.call.as_deref(), Some("reload"));
			assert_eq!(args.params.as_deref(), Some("{}"));
		}
		_ => panic!("Expected Wait command"),
	}
}

#[test]
fn engine_and_ws_endpoint_conflict() {
	let result = Cli::try_parse_from([
		"remora",
		"--engine",
		"remora-engine",
		"--ws-endpoint",
		"ws://127.0.0.1:9000/",
		"call",
		"initialize",
	]);
	assert!(result.is_err());
}

#[test]
fn wait_params_require_call() {
	let result = Cli::try_parse_from(["remora", "wait", "load", "--params", "{}"]);
	assert!(result.is_err());
}
