//! Command dispatch.
//!
//! Every command runs inside one [`Session`]; the session is closed (and a
//! launched engine stopped) whether the command succeeds or not.

mod call;
mod wait;

use anyhow::Result;
use remora_runtime::ProtocolValue;

use crate::cli::{Cli, Commands};
use crate::session::Session;

pub use call::call;
pub use wait::wait;

pub async fn dispatch(cli: Cli) -> Result<()> {
	let session = Session::open(&cli).await?;

	let outcome = match &cli.command {
		Commands::Call(args) => call(&session, args).await,
		Commands::Wait(args) => wait(&session, args).await,
	};

	let closed = session.close().await;
	let value = outcome?;
	closed?;

	print_value(&value)
}

/// Prints a result as pretty JSON; live objects appear as `{"guid": ...}`.
fn print_value(value: &ProtocolValue) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(&value.to_json())?);
	Ok(())
}
