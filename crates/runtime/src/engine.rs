//! Engine process management
//!
//! Spawns the engine with piped stdio, wires its pipes into a
//! [`PipeTransport`], and hands the [`Connection`] a shutdown callback that
//! kills the process when the connection is stopped.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::object_factory::ObjectFactory;
use crate::transport::PipeTransport;

/// How long a freshly spawned engine must stay alive to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a killed engine to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Program, arguments and extra environment for the engine process.
#[derive(Debug, Clone)]
pub struct EngineCommand {
	pub program: OsString,
	pub args: Vec<OsString>,
	pub env: Vec<(OsString, OsString)>,
}

impl EngineCommand {
	pub fn new(program: impl Into<OsString>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			env: Vec::new(),
		}
	}

	pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<OsString>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
		self.env.push((key.into(), value.into()));
		self
	}
}

/// A running engine process.
#[derive(Debug)]
pub struct EngineProcess {
	process: Child,
}

impl EngineProcess {
	/// Launch the engine process
	///
	/// stdin and stdout are piped for the transport; stderr is inherited so
	/// engine diagnostics stay visible.
	///
	/// # Errors
	///
	/// Returns `Error::LaunchFailed` if the process cannot be spawned or exits
	/// right away.
	pub async fn launch(command: &EngineCommand) -> Result<Self> {
		let mut cmd = Command::new(&command.program);
		cmd.args(&command.args)
			.envs(command.env.iter().map(|(k, v)| (k, v)))
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::inherit())
			.kill_on_drop(true);

		let mut child = cmd.spawn().map_err(|e| {
			Error::LaunchFailed(format!("Failed to spawn {}: {e}", command.program.to_string_lossy()))
		})?;

		tokio::time::sleep(STARTUP_GRACE).await;

		match child.try_wait() {
			Ok(Some(status)) => {
				return Err(Error::LaunchFailed(format!(
					"Engine process exited immediately with status: {status}"
				)));
			}
			Ok(None) => {}
			Err(e) => {
				return Err(Error::LaunchFailed(format!("Failed to check process status: {e}")));
			}
		}

		tracing::debug!(pid = child.id(), program = %command.program.to_string_lossy(), "Engine launched");
		Ok(Self { process: child })
	}

	pub fn id(&self) -> Option<u32> {
		self.process.id()
	}

	/// Takes the process pipes as a transport. Succeeds once.
	pub fn take_transport(&mut self) -> Result<(PipeTransport<ChildStdin, ChildStdout>, mpsc::UnboundedReceiver<Value>)> {
		let stdin = self
			.process
			.stdin
			.take()
			.ok_or_else(|| Error::LaunchFailed("engine stdin already taken".to_string()))?;
		let stdout = self
			.process
			.stdout
			.take()
			.ok_or_else(|| Error::LaunchFailed("engine stdout already taken".to_string()))?;
		Ok(PipeTransport::new(stdin, stdout))
	}

	/// Kills the engine and waits (bounded) for it to exit.
	pub async fn shutdown(mut self) -> Result<()> {
		// Closing stdio first avoids hangs where the child blocks on a full pipe.
		drop(self.process.stdin.take());
		drop(self.process.stdout.take());

		if let Err(e) = self.process.start_kill() {
			// Already exited is fine.
			if self.process.try_wait().ok().flatten().is_none() {
				return Err(Error::LaunchFailed(format!("Failed to kill engine: {e}")));
			}
		}

		match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.process.wait()).await {
			Ok(Ok(status)) => {
				tracing::debug!(%status, "Engine exited");
				Ok(())
			}
			Ok(Err(e)) => Err(Error::LaunchFailed(format!("Failed to wait for engine: {e}"))),
			Err(_) => Err(Error::LaunchFailed(format!(
				"Engine shutdown timeout after {}s",
				SHUTDOWN_TIMEOUT.as_secs()
			))),
		}
	}
}

/// Launches the engine, starts a connection over its pipes and spawns the
/// connection's run loop. [`Connection::stop`] kills the process.
///
/// `factory` is installed before the first frame is read, so the engine's
/// initial `__create__` messages already go through it.
pub async fn launch_connection(command: &EngineCommand, factory: Arc<dyn ObjectFactory>) -> Result<Arc<Connection>> {
	let mut engine = EngineProcess::launch(command).await?;
	let (transport, message_rx) = engine.take_transport()?;
	let connection = Connection::new(transport.into_transport_parts(message_rx));
	connection.set_factory(factory);
	connection.set_on_close(move || engine.shutdown());

	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });
	Ok(connection)
}
