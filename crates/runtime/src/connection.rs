//! Call correlation, object registry and event routing.
//!
//! A [`Connection`] owns one transport and every proxy created on it. It
//! handles:
//! - Generating call ids (starting at 1, never reused while pending)
//! - Correlating responses with pending calls
//! - Building proxies for `__create__`, tearing them down for `__dispose__`,
//!   re-parenting them for `__adopt__`
//! - Routing every other event to the addressed object's emitter
//!
//! # Message Flow
//!
//! 1. A caller invokes [`Channel::send_value`](crate::Channel::send_value)
//! 2. The connection allocates an id, parks a oneshot sender in the call table
//!    and queues the encoded frame for the writer task
//! 3. The reader task hands each inbound frame to [`Connection::dispatch`]
//! 4. `dispatch` removes the pending call for the response id, resolves object
//!    references in the result and fires the oneshot
//! 5. The caller wakes with its own result, whatever order responses arrived in
//!
//! When the transport fails or [`Connection::stop`] is called, every pending
//! call is failed with [`Error::ConnectionClosed`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use remora_protocol::{
	ADOPT_METHOD, CREATE_METHOD, DISPOSE_METHOD, ErrorPayload, Event, GUID_KEY, Message, Metadata, Request, Response,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::channel_owner::{ChannelOwner, DisposeReason, ROOT_GUID, RootObject, adopt};
use crate::error::{Error, Result};
use crate::object_factory::{FactoryRegistry, ObjectFactory};
use crate::transport::{CloseHandle, CloseSignal, Transport, TransportParts, TransportReceiver};
use crate::value::ProtocolValue;

mod object_store;

#[cfg(test)]
mod tests;

pub use object_store::ObjectStore;

/// Interface a [`ChannelOwner`] needs from its connection.
pub trait ConnectionLike: Send + Sync {
	/// Sends a call and awaits the raw (not unwrapped) resolved result.
	fn send_message(
		&self,
		guid: &str,
		method: &str,
		params: ProtocolValue,
	) -> Pin<Box<dyn Future<Output = Result<ProtocolValue>> + Send + '_>>;

	/// Sends a call without waiting for, or registering interest in, a reply.
	fn send_no_reply(&self, guid: &str, method: &str, params: ProtocolValue);

	fn is_closed(&self) -> bool;

	/// Register an object in the connection's registry
	fn register_object(&self, guid: Arc<str>, object: Arc<dyn ChannelOwner>);

	/// Unregister an object from the connection's registry (synchronous)
	///
	/// Synchronous so it can run from `dispose()` without a runtime.
	fn unregister_object(&self, guid: &str);

	fn get_object(&self, guid: &str) -> Option<Arc<dyn ChannelOwner>>;

	/// Waits until a `__create__` registers `guid`, or `timeout` elapses.
	fn wait_for_object(&self, guid: &str, timeout: Duration) -> AsyncChannelOwnerResult<'_>;
}

/// Type alias for complex async return type
pub type AsyncChannelOwnerResult<'a> = Pin<Box<dyn Future<Output = Result<Arc<dyn ChannelOwner>>> + Send + 'a>>;

/// Future returned by a shutdown callback.
pub type ShutdownFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type ShutdownFn = Box<dyn FnOnce() -> ShutdownFuture + Send>;

/// Pending call slots keyed by call id.
type CallbackMap = Arc<DashMap<u32, oneshot::Sender<Result<ProtocolValue>>>>;

/// RAII guard removing a call's slot if its future is dropped before delivery.
struct CancelGuard {
	id: u32,
	callbacks: CallbackMap,
	completed: bool,
}

impl CancelGuard {
	fn new(id: u32, callbacks: CallbackMap) -> Self {
		Self {
			id,
			callbacks,
			completed: false,
		}
	}

	fn complete(&mut self) {
		self.completed = true;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}
		if self.callbacks.remove(&self.id).is_some() {
			tracing::debug!(id = self.id, "Removed orphaned call slot");
		}
	}
}

/// Future returned by [`Connection::send_message`] with automatic cancellation cleanup.
struct ResponseFuture {
	rx: oneshot::Receiver<Result<ProtocolValue>>,
	guard: CancelGuard,
}

impl Future for ResponseFuture {
	type Output = Result<ProtocolValue>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.complete();
				Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Connection to one engine over one transport.
pub struct Connection {
	/// Last issued call id; the first call gets 1
	last_id: AtomicU32,
	callbacks: CallbackMap,
	/// Frames queued for the writer task
	outbound_tx: mpsc::UnboundedSender<Value>,
	// Taken once by run()
	transport_sender: Mutex<Option<Box<dyn Transport>>>,
	transport_receiver: Mutex<Option<Box<dyn TransportReceiver>>>,
	message_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
	outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
	close: CloseHandle,
	objects: ObjectStore,
	factory: RwLock<Arc<dyn ObjectFactory>>,
	closed: AtomicBool,
	close_reason: Mutex<Option<String>>,
	on_close: Mutex<Option<ShutdownFn>>,
}

impl Connection {
	/// Creates a connection over `parts` with the root object registered.
	///
	/// Nothing is read or written until [`run`](Self::run) is spawned.
	pub fn new(parts: TransportParts) -> Arc<Self> {
		let TransportParts {
			sender,
			receiver,
			message_rx,
			close,
		} = parts;

		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

		let connection = Arc::new(Self {
			last_id: AtomicU32::new(0),
			callbacks: Arc::new(DashMap::new()),
			outbound_tx,
			transport_sender: Mutex::new(Some(sender)),
			transport_receiver: Mutex::new(Some(receiver)),
			message_rx: Mutex::new(Some(message_rx)),
			outbound_rx: Mutex::new(Some(outbound_rx)),
			close,
			objects: ObjectStore::new(),
			factory: RwLock::new(Arc::new(FactoryRegistry::new())),
			closed: AtomicBool::new(false),
			close_reason: Mutex::new(None),
			on_close: Mutex::new(None),
		});

		let root: Arc<dyn ChannelOwner> = Arc::new(RootObject::new(Arc::clone(&connection) as Arc<dyn ConnectionLike>));
		connection.objects.insert(Arc::from(ROOT_GUID), root);
		connection
	}

	/// Replaces the factory used for `__create__`.
	pub fn set_factory(&self, factory: Arc<dyn ObjectFactory>) {
		*self.factory.write() = factory;
	}

	/// Installs the callback [`stop`](Self::stop) runs to shut the engine down.
	pub fn set_on_close<F, Fut>(&self, shutdown: F)
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		*self.on_close.lock() = Some(Box::new(move || Box::pin(shutdown()) as ShutdownFuture));
	}

	/// The synthetic root node (identifier `""`).
	pub fn root(&self) -> Result<Arc<dyn ChannelOwner>> {
		self.objects.try_get(ROOT_GUID).ok_or_else(|| {
			Error::ConnectionClosed(self.close_reason().unwrap_or_else(|| "root object released".to_string()))
		})
	}

	pub fn objects(&self) -> &ObjectStore {
		&self.objects
	}

	pub fn close_reason(&self) -> Option<String> {
		self.close_reason.lock().clone()
	}

	fn closed_error(&self) -> Error {
		Error::ConnectionClosed(self.close_reason().unwrap_or_else(|| "connection closed".to_string()))
	}

	fn next_id(&self) -> u32 {
		self.last_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
	}

	fn encode_request(&self, id: u32, guid: &str, method: &str, params: &ProtocolValue) -> Result<Value> {
		let params = match params {
			ProtocolValue::Null => Value::Object(serde_json::Map::new()),
			other => other.to_json(),
		};
		let request = Request {
			id,
			guid: Arc::from(guid),
			method: method.to_string(),
			params,
			metadata: Metadata::now(),
		};
		serde_json::to_value(&request).map_err(Error::from)
	}

	/// Sends a call and awaits its raw result, references resolved.
	pub async fn send_message(&self, guid: &str, method: &str, params: ProtocolValue) -> Result<ProtocolValue> {
		if self.is_closed() {
			return Err(self.closed_error());
		}

		let id = self.next_id();
		let (tx, rx) = oneshot::channel();
		self.callbacks.insert(id, tx);
		let guard = CancelGuard::new(id, Arc::clone(&self.callbacks));

		// cleanup() sets the flag before draining; re-check after inserting.
		if self.is_closed() {
			return Err(self.closed_error());
		}

		let request = self.encode_request(id, guid, method, &params)?;
		tracing::debug!(id, guid, method, "Sending call");

		if self.outbound_tx.send(request).is_err() {
			tracing::error!(id, "Failed to queue call: writer stopped");
			return Err(self.closed_error());
		}

		ResponseFuture { rx, guard }.await
	}

	/// Sends a call and applies the single-entry result unwrapping.
	pub async fn send_call(&self, guid: &str, method: &str, params: ProtocolValue) -> Result<ProtocolValue> {
		self.send_message(guid, method, params).await.map(ProtocolValue::unwrap_single)
	}

	/// Sends a call nobody waits for. Failures are logged.
	pub fn send_call_no_reply(&self, guid: &str, method: &str, params: ProtocolValue) {
		if self.is_closed() {
			tracing::warn!(guid, method, "Dropped no-reply call: connection closed");
			return;
		}
		let id = self.next_id();
		let request = match self.encode_request(id, guid, method, &params) {
			Ok(request) => request,
			Err(err) => {
				tracing::warn!(id, guid, method, error = %err, "Dropped no-reply call");
				return;
			}
		};
		tracing::debug!(id, guid, method, "Sending no-reply call");
		if self.outbound_tx.send(request).is_err() {
			tracing::warn!(id, guid, method, "Dropped no-reply call: writer stopped");
		}
	}

	/// Runs the reader and writer until the transport ends, then fails every
	/// pending call. Spawn it once per connection.
	pub async fn run(self: &Arc<Self>) {
		let (Some(receiver), Some(sender), Some(outbound_rx), Some(mut message_rx)) = (
			self.transport_receiver.lock().take(),
			self.transport_sender.lock().take(),
			self.outbound_rx.lock().take(),
			self.message_rx.lock().take(),
		) else {
			tracing::error!("Connection::run() called more than once");
			return;
		};

		let reader_handle = tokio::spawn(receiver.run());
		let writer_handle = tokio::spawn(write_loop(
			sender,
			outbound_rx,
			self.close.signal(),
			Arc::downgrade(self),
		));

		while let Some(message_value) = message_rx.recv().await {
			let message = match serde_json::from_value::<Message>(message_value) {
				Ok(message) => message,
				Err(e) => {
					tracing::error!(error = %e, "Failed to parse message");
					continue;
				}
			};
			match self.dispatch(message) {
				Ok(()) => {}
				Err(err @ Error::UnknownObjectType(_)) => {
					tracing::error!(error = %err, "Protocol contract violated, closing connection");
					self.cleanup(err.to_string());
					break;
				}
				Err(err) => tracing::error!(error = %err, "Error dispatching message"),
			}
		}
		drop(message_rx);

		let cause = match reader_handle.await {
			Ok(Ok(())) => "transport reader stopped".to_string(),
			Ok(Err(err)) => err.to_string(),
			Err(join) => format!("transport reader panicked: {join}"),
		};
		tracing::debug!(%cause, "Transport reader finished");
		self.cleanup(cause);
		let _ = writer_handle.await;
	}

	/// The single demultiplexing point for inbound frames.
	///
	/// [`run`](Self::run) calls this serially, in wire order.
	pub fn dispatch(&self, message: Message) -> Result<()> {
		match message {
			Message::Response(response) => {
				self.handle_response(response);
				Ok(())
			}
			Message::Event(event) => match event.method.as_str() {
				CREATE_METHOD => self.handle_create(event),
				DISPOSE_METHOD => {
					self.handle_dispose(&event);
					Ok(())
				}
				ADOPT_METHOD => {
					self.handle_adopt(&event);
					Ok(())
				}
				_ => {
					self.handle_event(event);
					Ok(())
				}
			},
			Message::Unknown(value) => {
				tracing::debug!(message = %value, "Unknown message type (forward-compatible, ignored)");
				Ok(())
			}
		}
	}

	fn resolve(&self, value: Value) -> ProtocolValue {
		ProtocolValue::resolve(value, &|guid: &str| self.objects.try_get(guid))
	}

	fn handle_response(&self, response: Response) {
		let Some((_, callback)) = self.callbacks.remove(&response.id) else {
			tracing::debug!(id = response.id, "Response for unknown call id (ignored)");
			return;
		};

		let result = match response.error {
			Some(wrapper) => Err(parse_protocol_error(wrapper.error)),
			None => Ok(self.resolve(response.result.unwrap_or(Value::Null))),
		};
		tracing::debug!(id = response.id, ok = result.is_ok(), "Delivering response");

		if callback.send(result).is_err() {
			tracing::debug!(id = response.id, "Caller went away before its response arrived");
		}
	}

	fn handle_create(&self, event: Event) -> Result<()> {
		let parent = self.objects.try_get(&event.guid).ok_or_else(|| {
			Error::ProtocolError(format!("__create__ under unknown parent: {}", event.guid))
		})?;

		let mut params = match event.params {
			Value::Object(map) => map,
			_ => return Err(Error::ProtocolError("__create__ params must be an object".to_string())),
		};
		let type_name = match params.remove("type") {
			Some(Value::String(t)) => t,
			_ => return Err(Error::ProtocolError("__create__ missing 'type'".to_string())),
		};
		let guid: Arc<str> = match params.get(GUID_KEY).and_then(Value::as_str) {
			Some(g) => Arc::from(g),
			None => return Err(Error::ProtocolError("__create__ missing 'guid'".to_string())),
		};
		if self.objects.contains(&guid) {
			return Err(Error::ProtocolError(format!("__create__ for duplicate guid: {guid}")));
		}

		let initializer = self.resolve(params.remove("initializer").unwrap_or(Value::Null));
		let factory = Arc::clone(&*self.factory.read());

		match factory.create_object(Arc::clone(&parent), &type_name, Arc::clone(&guid), initializer)? {
			Some(object) => {
				self.objects.insert(Arc::clone(&guid), Arc::clone(&object));
				parent.base().add_child(object);
				tracing::debug!(%guid, %type_name, parent = %event.guid, "Created object");
			}
			None => {
				tracing::debug!(%guid, %type_name, "Ignored object type, no proxy created");
			}
		}
		Ok(())
	}

	fn handle_dispose(&self, event: &Event) {
		let reason = DisposeReason::from_wire(event.params.get("reason").and_then(Value::as_str));
		match self.objects.try_get(&event.guid) {
			Some(object) => object.dispose(reason),
			None => tracing::debug!(guid = %event.guid, "Dispose for unknown object (ignored)"),
		}
	}

	fn handle_adopt(&self, event: &Event) {
		let Some(child_guid) = event.params.get(GUID_KEY).and_then(Value::as_str) else {
			tracing::debug!(guid = %event.guid, "__adopt__ without child guid (ignored)");
			return;
		};
		match (self.objects.try_get(&event.guid), self.objects.try_get(child_guid)) {
			(Some(parent), Some(child)) => {
				adopt(&parent, &child);
				tracing::debug!(child = child_guid, new_parent = %event.guid, "Adopted object");
			}
			_ => tracing::debug!(child = child_guid, new_parent = %event.guid, "Adopt for unknown object (ignored)"),
		}
	}

	fn handle_event(&self, event: Event) {
		let Some(object) = self.objects.try_get(&event.guid) else {
			tracing::debug!(guid = %event.guid, method = %event.method, "Event for unknown object (ignored)");
			return;
		};
		tracing::debug!(guid = %event.guid, method = %event.method, "Routing event");
		if object.wants_raw_events() {
			object.on_raw_event(&event.method, event.params);
		} else {
			let params = self.resolve(event.params);
			object.on_event(&event.method, params);
		}
	}

	/// Marks the connection closed and fails every pending call. Idempotent;
	/// the first reason wins.
	fn cleanup(&self, reason: String) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		tracing::debug!(%reason, pending = self.callbacks.len(), "Cleaning up connection");
		*self.close_reason.lock() = Some(reason.clone());

		let ids: Vec<u32> = self.callbacks.iter().map(|entry| *entry.key()).collect();
		for id in ids {
			if let Some((_, callback)) = self.callbacks.remove(&id) {
				let _ = callback.send(Err(Error::ConnectionClosed(reason.clone())));
			}
		}

		self.close.close();
		// Proxies hold the connection; releasing them breaks the cycle.
		self.objects.clear();
	}

	/// Fails pending calls, closes the transport and runs the shutdown callback.
	pub async fn stop(&self) -> Result<()> {
		self.cleanup("Connection stopped".to_string());
		let shutdown = self.on_close.lock().take();
		match shutdown {
			Some(shutdown) => shutdown().await,
			None => Ok(()),
		}
	}
}

async fn write_loop(
	mut sender: Box<dyn Transport>,
	mut outbound_rx: mpsc::UnboundedReceiver<Value>,
	mut close: CloseSignal,
	connection: Weak<Connection>,
) {
	loop {
		tokio::select! {
			biased;
			message = outbound_rx.recv() => {
				let Some(message) = message else { break };
				if let Err(err) = sender.send(message).await {
					tracing::error!(error = %err, "Transport write error");
					if let Some(connection) = connection.upgrade() {
						connection.cleanup(err.to_string());
					}
					break;
				}
			}
			_ = close.closed() => break,
		}
	}
	if let Err(err) = sender.close().await {
		tracing::debug!(error = %err, "Transport close failed");
	}
}

/// Converts an engine [`ErrorPayload`] into [`Error::Remote`].
fn parse_protocol_error(error: ErrorPayload) -> Error {
	Error::Remote {
		name: error.name.unwrap_or_else(|| "Error".to_string()),
		message: error.message,
		stack: error.stack,
	}
}

impl ConnectionLike for Connection {
	fn send_message(
		&self,
		guid: &str,
		method: &str,
		params: ProtocolValue,
	) -> Pin<Box<dyn Future<Output = Result<ProtocolValue>> + Send + '_>> {
		let guid = guid.to_string();
		let method = method.to_string();
		Box::pin(async move { Connection::send_message(self, &guid, &method, params).await })
	}

	fn send_no_reply(&self, guid: &str, method: &str, params: ProtocolValue) {
		self.send_call_no_reply(guid, method, params)
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	fn register_object(&self, guid: Arc<str>, object: Arc<dyn ChannelOwner>) {
		self.objects.insert(guid, object);
	}

	fn unregister_object(&self, guid: &str) {
		self.objects.remove(guid);
	}

	fn get_object(&self, guid: &str) -> Option<Arc<dyn ChannelOwner>> {
		self.objects.try_get(guid)
	}

	fn wait_for_object(&self, guid: &str, timeout: Duration) -> AsyncChannelOwnerResult<'_> {
		let guid = guid.to_string();
		Box::pin(async move { self.objects.wait_for(&guid, timeout).await })
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("objects", &self.objects.len())
			.field("pending_calls", &self.callbacks.len())
			.field("closed", &self.closed.load(Ordering::SeqCst))
			.finish()
	}
}
