// Scripted engine for integration tests.
//
// Runs a real `Connection` over in-memory pipes; the test plays the engine by
// reading request frames and writing responses and events.

#![allow(dead_code)]

use std::sync::Arc;

use remora_runtime::{Connection, FactoryRegistry, PipeTransport};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub struct FakeEngine {
	from_client: DuplexStream,
	to_client: DuplexStream,
}

impl FakeEngine {
	pub async fn recv(&mut self) -> Value {
		let mut len_buf = [0u8; 4];
		self.from_client.read_exact(&mut len_buf).await.unwrap();
		let mut body = vec![0u8; u32::from_le_bytes(len_buf) as usize];
		self.from_client.read_exact(&mut body).await.unwrap();
		serde_json::from_slice(&body).unwrap()
	}

	pub async fn send(&mut self, message: Value) {
		let body = serde_json::to_vec(&message).unwrap();
		self.to_client.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
		self.to_client.write_all(&body).await.unwrap();
		self.to_client.flush().await.unwrap();
	}

	pub async fn create(&mut self, parent: &str, type_name: &str, guid: &str, initializer: Value) {
		self.send(json!({
			"guid": parent,
			"method": "__create__",
			"params": {"type": type_name, "guid": guid, "initializer": initializer},
		}))
		.await;
	}

	pub async fn dispose(&mut self, guid: &str, reason: Option<&str>) {
		let params = match reason {
			Some(reason) => json!({"reason": reason}),
			None => json!({}),
		};
		self.send(json!({"guid": guid, "method": "__dispose__", "params": params})).await;
	}

	pub async fn event(&mut self, guid: &str, method: &str, params: Value) {
		self.send(json!({"guid": guid, "method": method, "params": params})).await;
	}

	/// Answers the next request with `result` and returns that request.
	pub async fn reply(&mut self, result: Value) -> Value {
		let request = self.recv().await;
		self.send(json!({"id": request["id"], "result": result})).await;
		request
	}
}

pub fn start(registry: FactoryRegistry) -> (Arc<Connection>, FakeEngine) {
	let (from_client, stdin_write) = tokio::io::duplex(64 * 1024);
	let (stdout_read, to_client) = tokio::io::duplex(64 * 1024);
	let (transport, message_rx) = PipeTransport::new(stdin_write, stdout_read);
	let connection = Connection::new(transport.into_transport_parts(message_rx));
	connection.set_factory(Arc::new(registry));

	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	(connection, FakeEngine { from_client, to_client })
}

pub fn start_generic(types: &[&str]) -> (Arc<Connection>, FakeEngine) {
	let mut registry = FactoryRegistry::new();
	for type_name in types {
		registry.register_generic(type_name);
	}
	start(registry)
}

/// Round-trips a no-op call so every frame sent before it has been dispatched.
pub async fn sync(connection: &Arc<Connection>, engine: &mut FakeEngine) {
	let call = tokio::spawn({
		let connection = Arc::clone(connection);
		async move { connection.send_call("", "ping", remora_runtime::ProtocolValue::Null).await }
	});
	engine.reply(json!({})).await;
	call.await.unwrap().unwrap();
}
