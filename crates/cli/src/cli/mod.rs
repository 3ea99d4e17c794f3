#[cfg(test)]
mod tests;

use clap::{Args, Parser, Subcommand};

use crate::styles::cli_styles;

/// Default bound on waits and calls, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Parser, Debug)]
#[command(name = "remora")]
#[command(about = "Drive a remora engine from the command line")]
#[command(version)]
#[command(styles = cli_styles())]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Engine program to launch, speaking the protocol over stdio
	#[arg(long, global = true, env = "REMORA_ENGINE", value_name = "PROGRAM")]
	pub engine: Option<String>,

	/// Argument passed to the engine program (repeatable)
	#[arg(long = "engine-arg", global = true, value_name = "ARG", allow_hyphen_values = true)]
	pub engine_args: Vec<String>,

	/// Connect to a running engine over WebSocket instead of launching one
	#[arg(
		long,
		global = true,
		env = "REMORA_WS_ENDPOINT",
		value_name = "URL",
		conflicts_with = "engine"
	)]
	pub ws_endpoint: Option<String>,

	/// Timeout in milliseconds for waits and calls
	#[arg(long, global = true, value_name = "MS", default_value_t = DEFAULT_TIMEOUT_MS)]
	pub timeout: u64,

	/// Accept unknown object types as generic proxies instead of failing
	#[arg(long, global = true)]
	pub lenient: bool,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Call a method on a remote object and print the result
	Call(CallArgs),

	/// Wait for an event on a remote object and print its payload
	Wait(WaitArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CallArgs {
	/// Method name
	pub method: String,

	/// Guid of the object to call (default: the root object)
	#[arg(long, default_value = "")]
	pub target: String,

	/// Call parameters as a JSON object
	#[arg(long, value_name = "JSON")]
	pub params: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
	/// Event name to wait for
	pub event: String,

	/// Guid of the object whose events are watched (default: the root object)
	#[arg(long, default_value = "")]
	pub target: String,

	/// Fail if this event fires first (repeatable)
	#[arg(long = "reject-on", value_name = "EVENT")]
	pub reject_on: Vec<String>,

	/// Method to call on the target once the wait is armed
	#[arg(long, value_name = "METHOD")]
	pub call: Option<String>,

	/// Parameters for --call as a JSON object
	#[arg(long, value_name = "JSON", requires = "call")]
	pub params: Option<String>,
}
