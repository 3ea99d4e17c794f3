//! JSON frames over a WebSocket.
//!
//! Each text or binary WebSocket message carries exactly one JSON frame, so no
//! length prefix is needed. Used when the engine is already running and
//! listening, instead of being spawned with piped stdio.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{CloseHandle, CloseSignal, Transport, TransportFuture, TransportParts, TransportReceiver, forward_frames};
use crate::error::{Error, Result};

const WIRE_TARGET: &str = "remora::wire";

/// Transport over an established WebSocket stream.
pub struct WebSocketTransport<S = MaybeTlsStream<TcpStream>> {
	sender: WebSocketTransportSender<S>,
	receiver: WebSocketTransportReceiver<S>,
	close: CloseHandle,
}

impl WebSocketTransport {
	/// Connects to `url` (`ws://` or `wss://`).
	pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<Value>)> {
		tracing::debug!(url, "Connecting WebSocket transport");
		let (stream, _response) = tokio_tungstenite::connect_async(url)
			.await
			.map_err(|e| Error::TransportError(format!("WebSocket connect to {url} failed: {e}")))?;
		Ok(Self::from_stream(stream))
	}
}

impl<S> WebSocketTransport<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	/// Wraps an already-handshaken stream.
	pub fn from_stream(stream: WebSocketStream<S>) -> (Self, mpsc::UnboundedReceiver<Value>) {
		let (sink, stream) = stream.split();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let close = CloseHandle::new();
		let transport = Self {
			sender: WebSocketTransportSender { sink, closed: false },
			receiver: WebSocketTransportReceiver {
				stream,
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

	pub fn into_parts(self) -> (Box<dyn Transport>, Box<dyn TransportReceiver>) {
		(Box::new(self.sender), Box::new(self.receiver))
	}

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

/// Writing half of a [`WebSocketTransport`].
pub struct WebSocketTransportSender<S> {
	sink: SplitSink<WebSocketStream<S>, WsMessage>,
	closed: bool,
}

impl<S> Transport for WebSocketTransportSender<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	fn send(&mut self, message: Value) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			if self.closed {
				return Err(Error::TransportClosed);
			}
			let text = serde_json::to_string(&message)?;
			tracing::trace!(target: WIRE_TARGET, direction = "send", body = %text);
			self.sink
				.send(WsMessage::Text(text))
				.await
				.map_err(|e| Error::TransportError(format!("WebSocket send failed: {e}")))
		})
	}

	fn close(&mut self) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			if std::mem::replace(&mut self.closed, true) {
				return Ok(());
			}
			self.sink
				.close()
				.await
				.map_err(|e| Error::TransportError(format!("WebSocket close failed: {e}")))
		})
	}
}

/// Reading half of a [`WebSocketTransport`].
pub struct WebSocketTransportReceiver<S> {
	stream: SplitStream<WebSocketStream<S>>,
	message_tx: mpsc::UnboundedSender<Value>,
	close: CloseSignal,
}

async fn next_frame<S>(stream: &mut SplitStream<WebSocketStream<S>>) -> Result<Value>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	loop {
		match stream.next().await {
			Some(Ok(WsMessage::Text(text))) => {
				tracing::trace!(target: WIRE_TARGET, direction = "recv", body = %text);
				return serde_json::from_str(&text).map_err(Error::from);
			}
			Some(Ok(WsMessage::Binary(data))) => {
				tracing::trace!(target: WIRE_TARGET, direction = "recv", body = %String::from_utf8_lossy(&data));
				return serde_json::from_slice(&data).map_err(Error::from);
			}
			Some(Ok(WsMessage::Close(frame))) => {
				tracing::debug!(?frame, "WebSocket closed by peer");
				return Err(Error::TransportClosed);
			}
			// Pings are answered by tungstenite on the next write.
			Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
			Some(Err(e)) => return Err(Error::TransportError(format!("WebSocket receive failed: {e}"))),
			None => return Err(Error::TransportError("WebSocket stream ended".to_string())),
		}
	}
}

impl<S> TransportReceiver for WebSocketTransportReceiver<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	fn poll(&mut self) -> TransportFuture<'_, Value> {
		Box::pin(async move {
			tokio::select! {
				biased;
				_ = self.close.closed() => Err(Error::TransportClosed),
				frame = next_frame(&mut self.stream) => frame,
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
