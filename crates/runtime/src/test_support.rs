//! Helpers shared by unit tests: a scripted engine on the far side of a duplex pipe.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::connection::Connection;
use crate::object_factory::FactoryRegistry;
use crate::transport::PipeTransport;

/// Connection whose transport is never driven.
pub(crate) fn idle_connection() -> Arc<Connection> {
	let (_stdin_read, stdin_write) = tokio::io::duplex(1024);
	let (stdout_read, _stdout_write) = tokio::io::duplex(1024);
	let (transport, message_rx) = PipeTransport::new(stdin_write, stdout_read);
	Connection::new(transport.into_transport_parts(message_rx))
}

/// The engine end of a running connection.
pub(crate) struct FakeEngine {
	from_client: DuplexStream,
	to_client: DuplexStream,
}

impl FakeEngine {
	/// Reads the next frame the client wrote.
	pub(crate) async fn recv(&mut self) -> Value {
		let mut len_buf = [0u8; 4];
		self.from_client.read_exact(&mut len_buf).await.unwrap();
		let mut body = vec![0u8; u32::from_le_bytes(len_buf) as usize];
		self.from_client.read_exact(&mut body).await.unwrap();
		serde_json::from_slice(&body).unwrap()
	}

	pub(crate) async fn send(&mut self, message: Value) {
		let body = serde_json::to_vec(&message).unwrap();
		self.to_client.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
		self.to_client.write_all(&body).await.unwrap();
		self.to_client.flush().await.unwrap();
	}

	/// Closes the engine's stdout, ending the client's reader.
	pub(crate) fn hang_up(self) -> DuplexStream {
		drop(self.to_client);
		self.from_client
	}
}

/// Running connection with generic proxies registered for `types`.
pub(crate) fn running_connection(types: &[&str]) -> (Arc<Connection>, FakeEngine) {
	let (from_client, stdin_write) = tokio::io::duplex(64 * 1024);
	let (stdout_read, to_client) = tokio::io::duplex(64 * 1024);
	let (transport, message_rx) = PipeTransport::new(stdin_write, stdout_read);
	let connection = Connection::new(transport.into_transport_parts(message_rx));

	let mut registry = FactoryRegistry::new();
	for type_name in types {
		registry.register_generic(type_name);
	}
	connection.set_factory(Arc::new(registry));

	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	(connection, FakeEngine { from_client, to_client })
}
