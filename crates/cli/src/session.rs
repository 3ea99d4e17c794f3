//! One engine connection for the lifetime of a command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use remora_runtime::{
	ChannelOwner, Connection, ConnectionLike, EngineCommand, FactoryRegistry, ObjectFactory, ProtocolValue,
	WebSocketTransport, launch_connection,
};
use tracing::{debug, info};

use crate::cli::Cli;

/// Where the engine lives.
#[derive(Debug, Clone)]
pub enum EngineTarget {
	Launch(EngineCommand),
	WebSocket(String),
}

impl EngineTarget {
	pub fn from_cli(cli: &Cli) -> Result<Self> {
		match (&cli.engine, &cli.ws_endpoint) {
			(_, Some(url)) => Ok(Self::WebSocket(url.clone())),
			(Some(program), None) => Ok(Self::Launch(EngineCommand::new(program).args(&cli.engine_args))),
			(None, None) => bail!("no engine configured: pass --engine or --ws-endpoint (or set REMORA_ENGINE)"),
		}
	}
}

pub struct Session {
	connection: Arc<Connection>,
	timeout: Duration,
}

impl Session {
	pub async fn open(cli: &Cli) -> Result<Self> {
		let target = EngineTarget::from_cli(cli)?;
		let mut registry = FactoryRegistry::new();
		registry.lenient(cli.lenient);
		let factory: Arc<dyn ObjectFactory> = Arc::new(registry);

		let connection = match target {
			EngineTarget::Launch(command) => {
				info!(program = %command.program.to_string_lossy(), "Launching engine");
				launch_connection(&command, factory)
					.await
					.with_context(|| format!("failed to start engine {}", command.program.to_string_lossy()))?
			}
			EngineTarget::WebSocket(url) => {
				info!(%url, "Connecting to engine");
				let (transport, message_rx) = WebSocketTransport::connect(&url)
					.await
					.with_context(|| format!("failed to connect to {url}"))?;
				let connection = Connection::new(transport.into_transport_parts(message_rx));
				connection.set_factory(factory);
				let runner = Arc::clone(&connection);
				tokio::spawn(async move { runner.run().await });
				connection
			}
		};

		Ok(Self {
			connection,
			timeout: Duration::from_millis(cli.timeout),
		})
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Resolves a guid to its proxy, waiting up to the timeout for the engine
	/// to create it. The empty guid is the root object.
	pub async fn object(&self, guid: &str) -> Result<Arc<dyn ChannelOwner>> {
		if guid.is_empty() {
			return Ok(self.connection.root()?);
		}
		self.connection
			.wait_for_object(guid, self.timeout)
			.await
			.with_context(|| format!("object {guid} not available"))
	}

	/// Stops the connection and the engine behind it.
	pub async fn close(self) -> Result<()> {
		debug!("Closing session");
		self.connection.stop().await.context("engine shutdown failed")
	}
}

/// Parses a `--params` argument. Absent means no parameters.
pub fn parse_params(params: Option<&str>) -> Result<ProtocolValue> {
	match params {
		None => Ok(ProtocolValue::empty_map()),
		Some(raw) => {
			let value: serde_json::Value =
				serde_json::from_str(raw).with_context(|| format!("--params is not valid JSON: {raw}"))?;
			if !value.is_object() {
				bail!("--params must be a JSON object");
			}
			Ok(ProtocolValue::from(value))
		}
	}
}
