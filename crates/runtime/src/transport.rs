//! Frame transports.
//!
//! A transport moves whole JSON messages over a byte stream and knows nothing
//! about ids, guids or methods. It is split into two halves so the connection
//! can drive them from separate tasks:
//!
//! - [`Transport`]: the writing half. Each `send` writes one complete frame.
//! - [`TransportReceiver`]: the reading half. [`TransportReceiver::poll`]
//!   yields the next frame; [`TransportReceiver::run`] forwards frames to the
//!   connection until the stream ends.
//!
//! Closing goes through a shared [`CloseHandle`]. It is idempotent and wakes a
//! reader blocked in `poll` with [`Error::TransportClosed`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::Result;

mod pipe;
mod websocket;


pub use pipe::{PipeTransport, PipeTransportReceiver, PipeTransportSender};
pub use websocket::{WebSocketTransport, WebSocketTransportReceiver, WebSocketTransportSender};

/// Boxed future returned by the object-safe transport traits.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Writing half of a transport.
pub trait Transport: Send {
	/// Encodes `message` and writes it as one frame.
	fn send(&mut self, message: Value) -> TransportFuture<'_, ()>;

	/// Flushes and closes the underlying stream. Safe to call more than once.
	fn close(&mut self) -> TransportFuture<'_, ()>;
}

/// Reading half of a transport.
pub trait TransportReceiver: Send {
	/// Waits for the next complete frame.
	///
	/// Fails on a truncated prefix, an undecodable body, end of stream, or
	/// when the transport's [`CloseHandle`] fires.
	fn poll(&mut self) -> TransportFuture<'_, Value>;

	/// Forwards frames until the stream fails or the message receiver is dropped.
	///
	/// Returns `Ok(())` only when the consumer went away first.
	fn run(self: Box<Self>) -> TransportFuture<'static, ()>;
}

/// Drives `receiver` and pushes each frame into `message_tx`.
pub(crate) async fn forward_frames<R>(receiver: &mut R, message_tx: &mpsc::UnboundedSender<Value>) -> Result<()>
where
	R: TransportReceiver + ?Sized,
{
	loop {
		let message = receiver.poll().await?;
		if message_tx.send(message).is_err() {
			tracing::debug!("Message receiver dropped, stopping transport reader");
			return Ok(());
		}
	}
}

/// Shared, idempotent close signal for one transport.
#[derive(Clone, Debug)]
pub struct CloseHandle {
	tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseHandle {
	fn default() -> Self {
		Self::new()
	}
}

impl CloseHandle {
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(false);
		Self { tx: Arc::new(tx) }
	}

	/// Marks the transport closed and wakes every blocked reader.
	pub fn close(&self) {
		self.tx.send_replace(true);
	}

	pub fn is_closed(&self) -> bool {
		*self.tx.borrow()
	}

	/// Returns a listener that completes once [`close`](Self::close) is called.
	pub fn signal(&self) -> CloseSignal {
		CloseSignal { rx: self.tx.subscribe() }
	}
}

/// Receiving side of a [`CloseHandle`].
#[derive(Debug)]
pub struct CloseSignal {
	rx: watch::Receiver<bool>,
}

impl CloseSignal {
	/// Completes when the transport is closed. Never completes if every
	/// handle was dropped without closing.
	pub async fn closed(&mut self) {
		if self.rx.wait_for(|closed| *closed).await.is_err() {
			std::future::pending::<()>().await;
		}
	}
}

/// A transport split into the pieces a [`Connection`](crate::Connection) drives.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
	pub message_rx: mpsc::UnboundedReceiver<Value>,
	pub close: CloseHandle,
}

impl std::fmt::Debug for TransportParts {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TransportParts")
			.field("closed", &self.close.is_closed())
			.finish_non_exhaustive()
	}
}
