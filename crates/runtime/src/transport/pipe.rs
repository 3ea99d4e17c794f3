//! Length-prefixed JSON frames over a pair of byte streams.
//!
//! Frame layout: `u32` little-endian body length, then exactly that many bytes
//! of UTF-8 JSON. The prefix and body go out in a single write so concurrent
//! senders can never interleave partial frames.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{CloseHandle, CloseSignal, Transport, TransportFuture, TransportParts, TransportReceiver, forward_frames};
use crate::error::{Error, Result};

const WIRE_TARGET: &str = "remora::wire";

/// Buffer reserved before a frame body starts arriving.
const INITIAL_BODY_CAPACITY: usize = 64 * 1024;

/// Transport over an engine's stdin (`W`) and stdout (`R`).
pub struct PipeTransport<W, R> {
	sender: PipeTransportSender<W>,
	receiver: PipeTransportReceiver<R>,
	close: CloseHandle,
}

impl<W, R> PipeTransport<W, R>
where
	W: AsyncWrite + Unpin + Send + 'static,
	R: AsyncRead + Unpin + Send + 'static,
{
	/// Creates the transport and the channel its reader forwards frames into.
	pub fn new(stdin: W, stdout: R) -> (Self, mpsc::UnboundedReceiver<Value>) {
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let close = CloseHandle::new();
		let transport = Self {
			sender: PipeTransportSender {
				writer: stdin,
				closed: false,
			},
			receiver: PipeTransportReceiver {
				reader: stdout,
				message_tx,
				close: close.signal(),
			},
			close,
		};
		(transport, message_rx)
	}

	pub fn close_handle(&self) -> CloseHandle {
		self.close.clone()
	}

	/// Writes one frame.
	pub async fn send(&mut self, message: Value) -> Result<()> {
		self.sender.send(message).await
	}

	/// Reads frames into the message channel until the stream ends.
	pub async fn run(&mut self) -> Result<()> {
		let message_tx = self.receiver.message_tx.clone();
		forward_frames(&mut self.receiver, &message_tx).await
	}

	/// Splits into independently owned halves.
	pub fn into_parts(self) -> (Box<dyn Transport>, Box<dyn TransportReceiver>) {
		(Box::new(self.sender), Box::new(self.receiver))
	}

	/// Packages the halves with `message_rx` for [`Connection::new`](crate::Connection::new).
	pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
		let close = self.close.clone();
		let (sender, receiver) = self.into_parts();
		TransportParts {
			sender,
			receiver,
			message_rx,
			close,
		}
	}
}

/// Writing half of a [`PipeTransport`].
pub struct PipeTransportSender<W> {
	writer: W,
	closed: bool,
}

impl<W> Transport for PipeTransportSender<W>
where
	W: AsyncWrite + Unpin + Send,
{
	fn send(&mut self, message: Value) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			if self.closed {
				return Err(Error::TransportClosed);
			}
			let frame = encode_frame(&message)?;
			tracing::trace!(target: WIRE_TARGET, direction = "send", body = %message);
			self.writer
				.write_all(&frame)
				.await
				.map_err(|e| Error::TransportError(format!("Failed to write frame: {e}")))?;
			self.writer
				.flush()
				.await
				.map_err(|e| Error::TransportError(format!("Failed to flush frame: {e}")))?;
			Ok(())
		})
	}

	fn close(&mut self) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			if std::mem::replace(&mut self.closed, true) {
				return Ok(());
			}
			self.writer.shutdown().await.map_err(Error::from)
		})
	}
}

/// Reading half of a [`PipeTransport`].
pub struct PipeTransportReceiver<R> {
	reader: R,
	message_tx: mpsc::UnboundedSender<Value>,
	close: CloseSignal,
}

impl<R> TransportReceiver for PipeTransportReceiver<R>
where
	R: AsyncRead + Unpin + Send + 'static,
{
	fn poll(&mut self) -> TransportFuture<'_, Value> {
		Box::pin(async move {
			tokio::select! {
				biased;
				_ = self.close.closed() => Err(Error::TransportClosed),
				frame = read_frame(&mut self.reader) => frame,
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

pub(crate) fn encode_frame(message: &Value) -> Result<Vec<u8>> {
	let body = serde_json::to_vec(message)?;
	let length = u32::try_from(body.len())
		.map_err(|_| Error::TransportError(format!("Frame too large: {} bytes", body.len())))?;
	let mut frame = Vec::with_capacity(4 + body.len());
	frame.extend_from_slice(&length.to_le_bytes());
	frame.extend_from_slice(&body);
	Ok(frame)
}

async fn read_frame<R>(reader: &mut R) -> Result<Value>
where
	R: AsyncRead + Unpin,
{
	let mut len_buf = [0u8; 4];
	reader
		.read_exact(&mut len_buf)
		.await
		.map_err(|e| Error::TransportError(format!("Failed to read length prefix: {e}")))?;
	let length = u32::from_le_bytes(len_buf);

	// The prefix is untrusted: grow the buffer as bytes arrive instead of
	// reserving the claimed size up front.
	let mut body = Vec::with_capacity((length as usize).min(INITIAL_BODY_CAPACITY));
	reader
		.take(u64::from(length))
		.read_to_end(&mut body)
		.await
		.map_err(|e| Error::TransportError(format!("Failed to read frame body ({length} bytes): {e}")))?;
	if body.len() != length as usize {
		return Err(Error::TransportError(format!(
			"Frame body truncated: expected {length} bytes, got {}",
			body.len()
		)));
	}

	tracing::trace!(target: WIRE_TARGET, direction = "recv", body = %String::from_utf8_lossy(&body));
	serde_json::from_slice(&body).map_err(Error::from)
}
