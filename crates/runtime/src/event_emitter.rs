//! Named-event publish/subscribe attached to every remote object.
//!
//! Listeners are stored per event name in an [`IndexMap`] keyed by
//! [`ListenerId`], which gives O(1) removal with stable insertion order.
//! [`EventEmitter::emit`] snapshots the listeners for a name under the lock,
//! drops `once` listeners in the same critical section, then queues the
//! emission on the emitter's delivery task.
//!
//! The delivery task takes emissions in order. Each listener of an emission
//! runs as its own tokio task, and all of them finish before the next emission
//! starts. A slow listener therefore never stalls the connection's read loop
//! or its siblings, and listeners always observe emissions in emit order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::value::ProtocolValue;

/// Unique identifier for a registered listener.
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
	NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst)
}

/// Listener function receiving the event payload.
pub type ListenerFn<E> = Arc<dyn Fn(E) + Send + Sync>;

struct ListenerEntry<E> {
	once: bool,
	handler: ListenerFn<E>,
}

type ListenerMap<E> = HashMap<String, IndexMap<ListenerId, ListenerEntry<E>>>;

/// One `emit` call waiting for delivery.
struct Emission<E> {
	handlers: Vec<ListenerFn<E>>,
	payload: E,
}

type DeliveryQueue<E> = Option<mpsc::UnboundedSender<Emission<E>>>;

/// Publish/subscribe hub for named events.
///
/// Cloning is cheap and yields a handle to the same listener set and the same
/// delivery order.
pub struct EventEmitter<E = ProtocolValue> {
	listeners: Arc<Mutex<ListenerMap<E>>>,
	queue: Arc<Mutex<DeliveryQueue<E>>>,
}

impl<E> Clone for EventEmitter<E> {
	fn clone(&self) -> Self {
		Self {
			listeners: Arc::clone(&self.listeners),
			queue: Arc::clone(&self.queue),
		}
	}
}

impl<E: Clone + Send + 'static> Default for EventEmitter<E> {
	fn default() -> Self {
		Self::new()
	}
}

impl<E: Clone + Send + 'static> EventEmitter<E> {
	pub fn new() -> Self {
		Self {
			listeners: Arc::new(Mutex::new(HashMap::new())),
			queue: Arc::new(Mutex::new(None)),
		}
	}

	/// Registers a listener invoked on every emission of `name`.
	pub fn on<F>(&self, name: &str, handler: F) -> ListenerId
	where
		F: Fn(E) + Send + Sync + 'static,
	{
		self.add(name, Arc::new(handler), false)
	}

	/// Registers a listener that is removed after its first invocation.
	pub fn once<F>(&self, name: &str, handler: F) -> ListenerId
	where
		F: Fn(E) + Send + Sync + 'static,
	{
		self.add(name, Arc::new(handler), true)
	}

	/// Like [`on`](Self::on), returning a guard that removes the listener when dropped.
	pub fn subscribe<F>(&self, name: &str, handler: F) -> Subscription
	where
		F: Fn(E) + Send + Sync + 'static,
	{
		let id = self.on(name, handler);
		Subscription::new(self, name, id)
	}

	fn add(&self, name: &str, handler: ListenerFn<E>, once: bool) -> ListenerId {
		let id = next_listener_id();
		self.listeners
			.lock()
			.entry(name.to_string())
			.or_default()
			.insert(id, ListenerEntry { once, handler });
		id
	}

	/// Removes one listener. Returns false if it was not registered.
	pub fn remove_listener(&self, name: &str, id: ListenerId) -> bool {
		remove_from(&mut self.listeners.lock(), name, id)
	}

	/// Removes every listener for `name`.
	pub fn remove_all_listeners(&self, name: &str) {
		self.listeners.lock().remove(name);
	}

	/// Number of listeners currently registered for `name`.
	pub fn listener_count(&self, name: &str) -> usize {
		self.listeners.lock().get(name).map_or(0, IndexMap::len)
	}

	/// Delivers `payload` to every listener registered for `name`.
	///
	/// Returns the number of listeners scheduled. Outside a tokio runtime the
	/// listeners run inline, in registration order.
	///
	/// Emissions are delivered in call order: every listener of one emission
	/// has returned before any listener sees the next.
	pub fn emit(&self, name: &str, payload: E) -> usize {
		let handlers: Vec<ListenerFn<E>> = {
			let mut listeners = self.listeners.lock();
			let Some(named) = listeners.get_mut(name) else {
				return 0;
			};
			let handlers = named.values().map(|entry| Arc::clone(&entry.handler)).collect();
			named.retain(|_, entry| !entry.once);
			if named.is_empty() {
				listeners.remove(name);
			}
			handlers
		};

		let count = handlers.len();
		match Handle::try_current() {
			Ok(runtime) => self.enqueue(&runtime, Emission { handlers, payload }),
			Err(_) => {
				for handler in handlers {
					handler(payload.clone());
				}
			}
		}
		count
	}

	/// Hands `emission` to the delivery task, starting one if none is running
	/// (first emit, or the runtime that owned the previous task shut down).
	fn enqueue(&self, runtime: &Handle, emission: Emission<E>) {
		let mut queue = self.queue.lock();
		let emission = match queue.as_ref() {
			Some(tx) => match tx.send(emission) {
				Ok(()) => return,
				Err(mpsc::error::SendError(emission)) => emission,
			},
			None => emission,
		};

		let (tx, rx) = mpsc::unbounded_channel();
		runtime.spawn(deliver(rx));
		let _ = tx.send(emission);
		*queue = Some(tx);
	}

	fn downgrade(&self) -> Weak<Mutex<ListenerMap<E>>> {
		Arc::downgrade(&self.listeners)
	}
}

/// Runs queued emissions one after another until every emitter handle is gone.
async fn deliver<E: Clone + Send + 'static>(mut rx: mpsc::UnboundedReceiver<Emission<E>>) {
	while let Some(Emission { handlers, payload }) = rx.recv().await {
		let mut listeners = JoinSet::new();
		for handler in handlers {
			let payload = payload.clone();
			listeners.spawn(async move { handler(payload) });
		}
		while let Some(result) = listeners.join_next().await {
			if let Err(err) = result {
				tracing::warn!(error = %err, "Event listener panicked");
			}
		}
	}
}

impl<E> std::fmt::Debug for EventEmitter<E> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let listeners = self.listeners.lock();
		f.debug_struct("EventEmitter")
			.field("events", &listeners.keys().collect::<Vec<_>>())
			.finish()
	}
}

fn remove_from<E>(listeners: &mut ListenerMap<E>, name: &str, id: ListenerId) -> bool {
	let Some(named) = listeners.get_mut(name) else {
		return false;
	};
	let removed = named.shift_remove(&id).is_some();
	if named.is_empty() {
		listeners.remove(name);
	}
	removed
}

/// RAII handle that removes a listener on drop.
///
/// Holds a weak reference to the emitter, so dropping it after the owning
/// object is gone is a no-op.
pub struct Subscription {
	id: ListenerId,
	dropper: Option<Box<dyn FnOnce(ListenerId) + Send + Sync>>,
}

impl Subscription {
	fn new<E: Clone + Send + 'static>(emitter: &EventEmitter<E>, name: &str, id: ListenerId) -> Self {
		let weak = emitter.downgrade();
		let name = name.to_string();
		let dropper = Box::new(move |id: ListenerId| {
			if let Some(listeners) = weak.upgrade() {
				remove_from(&mut listeners.lock(), &name, id);
			}
		});
		Self {
			id,
			dropper: Some(dropper),
		}
	}

	pub fn id(&self) -> ListenerId {
		self.id
	}

	/// Explicitly unsubscribes. Equivalent to dropping.
	pub fn unsubscribe(mut self) {
		self.release();
	}

	fn release(&mut self) {
		if let Some(dropper) = self.dropper.take() {
			dropper(self.id);
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.release();
	}
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("id", &self.id)
			.field("active", &self.dropper.is_some())
			.finish()
	}
}
