//! Remote JSON pipe objects.
//!
//! A `JsonPipe` tunnels protocol messages for a second, nested connection
//! (for example one the engine proxies to a remote browser). Its events carry
//! those messages as opaque payloads, so it opts out of reference resolution
//! and receives raw params. Incoming `message` events are queued; `closed`
//! ends the queue.
//!
//! [`JsonPipe::into_transport_parts`] turns a pipe into a transport so a new
//! [`Connection`](crate::Connection) can run on top of it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::channel_owner::{ChannelOwner, ChannelOwnerImpl, DisposeReason, ParentOrConnection, private};
use crate::error::{Error, Result};
use crate::transport::{
	CloseHandle, CloseSignal, Transport, TransportFuture, TransportParts, TransportReceiver, forward_frames,
};
use crate::value::ProtocolValue;

/// Engine type name of pipe objects.
pub const JSON_PIPE_TYPE: &str = "JsonPipe";

/// Proxy for a remote `JsonPipe`.
pub struct JsonPipe {
	base: ChannelOwnerImpl,
	queue_tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
	queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl JsonPipe {
	pub fn new(parent: Arc<dyn ChannelOwner>, type_name: &str, guid: Arc<str>, initializer: ProtocolValue) -> Self {
		let (queue_tx, queue_rx) = mpsc::unbounded_channel();
		Self {
			base: ChannelOwnerImpl::new(ParentOrConnection::Parent(parent), type_name.to_string(), guid, initializer),
			queue_tx: Mutex::new(Some(queue_tx)),
			queue_rx: tokio::sync::Mutex::new(queue_rx),
		}
	}

	/// Sends one message through the pipe.
	pub async fn send(&self, message: Value) -> Result<()> {
		self.channel().send_no_result("send", json!({ "message": message })).await
	}

	/// Asks the engine to close the pipe.
	pub async fn close(&self) -> Result<()> {
		self.channel().send_no_result("close", Value::Null).await
	}

	/// Waits for the next queued message. Fails once the pipe has closed and
	/// the queue is drained.
	pub async fn poll(&self) -> Result<Value> {
		self.queue_rx.lock().await.recv().await.ok_or(Error::TransportClosed)
	}

	/// True once the engine reported the pipe closed or it was disposed.
	pub fn is_closed(&self) -> bool {
		self.queue_tx.lock().is_none()
	}

	fn close_queue(&self) {
		if self.queue_tx.lock().take().is_some() {
			tracing::debug!(guid = self.guid(), "JsonPipe closed");
		}
	}

	/// Wraps the pipe as a transport for a nested connection.
	pub fn into_transport_parts(self: Arc<Self>) -> TransportParts {
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let close = CloseHandle::new();
		TransportParts {
			sender: Box::new(JsonPipeSender {
				pipe: Arc::clone(&self),
				closed: false,
			}),
			receiver: Box::new(JsonPipeReceiver {
				pipe: self,
				message_tx,
				close: close.signal(),
			}),
			message_rx,
			close,
		}
	}
}

impl private::Sealed for JsonPipe {}

impl ChannelOwner for JsonPipe {
	fn base(&self) -> &ChannelOwnerImpl {
		&self.base
	}

	fn wants_raw_events(&self) -> bool {
		true
	}

	fn on_raw_event(&self, method: &str, params: Value) {
		match method {
			"message" => {
				let message = match &params {
					Value::Object(map) => map.get("message").cloned(),
					_ => None,
				};
				match (message, self.queue_tx.lock().as_ref()) {
					(Some(message), Some(tx)) => {
						let _ = tx.send(message);
					}
					(None, _) => tracing::debug!(guid = self.guid(), "JsonPipe message event without payload"),
					(_, None) => tracing::debug!(guid = self.guid(), "JsonPipe message after close (dropped)"),
				}
			}
			"closed" => self.close_queue(),
			_ => {}
		}
		self.emitter().emit(method, ProtocolValue::from(params));
	}

	fn dispose(&self, reason: DisposeReason) {
		self.base.dispose(reason);
		self.close_queue();
	}
}

struct JsonPipeSender {
	pipe: Arc<JsonPipe>,
	closed: bool,
}

impl Transport for JsonPipeSender {
	fn send(&mut self, message: Value) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			if self.closed {
				return Err(Error::TransportClosed);
			}
			self.pipe.send(message).await
		})
	}

	fn close(&mut self) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			if std::mem::replace(&mut self.closed, true) || self.pipe.is_closed() {
				return Ok(());
			}
			self.pipe.close().await
		})
	}
}

struct JsonPipeReceiver {
	pipe: Arc<JsonPipe>,
	message_tx: mpsc::UnboundedSender<Value>,
	close: CloseSignal,
}

impl TransportReceiver for JsonPipeReceiver {
	fn poll(&mut self) -> TransportFuture<'_, Value> {
		Box::pin(async move {
			tokio::select! {
				biased;
				_ = self.close.closed() => Err(Error::TransportClosed),
				message = self.pipe.poll() => message,
			}
		})
	}

	fn run(mut self: Box<Self>) -> TransportFuture<'static, ()> {
		Box::pin(async move {
			let message_tx = self.message_tx.clone();
			forward_frames(self.as_mut(), &message_tx).await
		})
	}
}
