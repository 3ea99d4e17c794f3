//! Local proxies for remote objects.
//!
//! Every object the engine announces with `__create__` is mirrored by one
//! [`ChannelOwner`]. Nodes form a tree for ownership: a parent holds its
//! children strongly, a child holds its parent weakly, and disposal cascades
//! from a node down through its subtree. Cross references between nodes that
//! are not parent/child (a page pointing at its context, say) live in the
//! initializer as [`ProtocolValue::Remote`] values and never take part in
//! disposal.
//!
//! Concrete node types embed a [`ChannelOwnerImpl`] and return it from
//! [`ChannelOwner::base`]; everything else has a default implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use downcast_rs::{DowncastSync, impl_downcast};
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::connection::ConnectionLike;
use crate::event_emitter::EventEmitter;
use crate::value::ProtocolValue;

/// Identifier of the synthetic root node.
pub const ROOT_GUID: &str = "";

/// Type name reported by the synthetic root node.
pub const ROOT_TYPE: &str = "Root";

/// Private module for the sealed trait pattern.
pub mod private {
	/// Marker trait that seals `ChannelOwner`.
	pub trait Sealed {}
}

type ChildrenRegistry = IndexMap<Arc<str>, Arc<dyn ChannelOwner>>;

/// Reason why an object was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
	/// The engine released the object normally.
	Closed,
	/// The engine garbage-collected the object (`reason: "gc"`).
	GarbageCollected,
}

impl DisposeReason {
	/// Parses the optional `reason` field of a `__dispose__` message.
	pub fn from_wire(reason: Option<&str>) -> Self {
		match reason {
			Some("gc") => DisposeReason::GarbageCollected,
			_ => DisposeReason::Closed,
		}
	}
}

/// Parent can be either another ChannelOwner or the root Connection.
pub enum ParentOrConnection {
	Parent(Arc<dyn ChannelOwner>),
	Connection(Arc<dyn ConnectionLike>),
}

/// Base trait for all remote object proxies.
pub trait ChannelOwner: private::Sealed + DowncastSync {
	/// The embedded node state.
	fn base(&self) -> &ChannelOwnerImpl;

	fn guid(&self) -> &str {
		self.base().guid()
	}

	fn type_name(&self) -> &str {
		self.base().type_name()
	}

	fn parent(&self) -> Option<Arc<dyn ChannelOwner>> {
		self.base().parent()
	}

	fn connection(&self) -> Arc<dyn ConnectionLike> {
		self.base().connection()
	}

	/// Initializer snapshot taken at creation, with references resolved.
	fn initializer(&self) -> &ProtocolValue {
		self.base().initializer()
	}

	fn channel(&self) -> &Channel {
		self.base().channel()
	}

	fn emitter(&self) -> &EventEmitter {
		self.base().emitter()
	}

	fn children(&self) -> Vec<Arc<dyn ChannelOwner>> {
		self.base().children()
	}

	/// Disposes this node and its whole subtree. Idempotent.
	fn dispose(&self, reason: DisposeReason) {
		self.base().dispose(reason)
	}

	/// Handles an event addressed to this node. Emits it on the node's emitter
	/// by default.
	fn on_event(&self, method: &str, params: ProtocolValue) {
		let delivered = self.emitter().emit(method, params);
		tracing::trace!(guid = self.guid(), method, delivered, "Event emitted");
	}

	/// Nodes that return true receive event params as raw JSON through
	/// [`on_raw_event`](Self::on_raw_event); identifiers in them are payload,
	/// not references.
	fn wants_raw_events(&self) -> bool {
		false
	}

	/// Raw-event hook for passthrough nodes. Defaults to treating the params
	/// as plain data.
	fn on_raw_event(&self, method: &str, params: serde_json::Value) {
		self.on_event(method, ProtocolValue::from(params));
	}

	fn is_disposed(&self) -> bool {
		self.base().is_disposed()
	}

	fn was_collected(&self) -> bool {
		self.base().was_collected()
	}
}

impl_downcast!(sync ChannelOwner);

/// Shared state of one node, embedded in every [`ChannelOwner`] implementation.
pub struct ChannelOwnerImpl {
	guid: Arc<str>,
	type_name: String,
	parent: Mutex<Option<Weak<dyn ChannelOwner>>>,
	connection: Arc<dyn ConnectionLike>,
	children: Mutex<ChildrenRegistry>,
	channel: Channel,
	emitter: EventEmitter,
	initializer: ProtocolValue,
	collected: Arc<AtomicBool>,
	disposed: AtomicBool,
}

impl ChannelOwnerImpl {
	pub fn new(parent: ParentOrConnection, type_name: String, guid: Arc<str>, initializer: ProtocolValue) -> Self {
		let (connection, parent) = match parent {
			ParentOrConnection::Parent(p) => (p.connection(), Some(Arc::downgrade(&p))),
			ParentOrConnection::Connection(c) => (c, None),
		};

		let collected = Arc::new(AtomicBool::new(false));
		let channel = Channel::new(Arc::clone(&guid), Arc::clone(&connection), Arc::clone(&collected));

		Self {
			guid,
			type_name,
			parent: Mutex::new(parent),
			connection,
			children: Mutex::new(IndexMap::new()),
			channel,
			emitter: EventEmitter::new(),
			initializer,
			collected,
			disposed: AtomicBool::new(false),
		}
	}

	pub fn guid(&self) -> &str {
		&self.guid
	}

	pub fn guid_arc(&self) -> Arc<str> {
		Arc::clone(&self.guid)
	}

	pub fn type_name(&self) -> &str {
		&self.type_name
	}

	pub fn parent(&self) -> Option<Arc<dyn ChannelOwner>> {
		self.parent.lock().as_ref().and_then(Weak::upgrade)
	}

	pub fn connection(&self) -> Arc<dyn ConnectionLike> {
		Arc::clone(&self.connection)
	}

	pub fn initializer(&self) -> &ProtocolValue {
		&self.initializer
	}

	pub fn channel(&self) -> &Channel {
		&self.channel
	}

	pub fn emitter(&self) -> &EventEmitter {
		&self.emitter
	}

	pub fn children(&self) -> Vec<Arc<dyn ChannelOwner>> {
		self.children.lock().values().cloned().collect()
	}

	pub fn child(&self, guid: &str) -> Option<Arc<dyn ChannelOwner>> {
		self.children.lock().get(guid).cloned()
	}

	pub fn add_child(&self, child: Arc<dyn ChannelOwner>) {
		let guid: Arc<str> = Arc::from(child.guid());
		self.children.lock().insert(guid, child);
	}

	pub fn remove_child(&self, guid: &str) -> Option<Arc<dyn ChannelOwner>> {
		self.children.lock().shift_remove(guid)
	}

	fn set_parent(&self, parent: &Arc<dyn ChannelOwner>) {
		*self.parent.lock() = Some(Arc::downgrade(parent));
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::Acquire)
	}

	pub fn was_collected(&self) -> bool {
		self.collected.load(Ordering::Acquire)
	}

	/// Children first, then this node leaves the registry and its parent,
	/// then its own child set is cleared.
	pub fn dispose(&self, reason: DisposeReason) {
		if self.disposed.swap(true, Ordering::AcqRel) {
			return;
		}
		if reason == DisposeReason::GarbageCollected {
			self.collected.store(true, Ordering::Release);
		}

		for child in self.children() {
			child.dispose(reason);
		}

		self.connection.unregister_object(&self.guid);
		if let Some(parent) = self.parent() {
			parent.base().remove_child(&self.guid);
		}
		self.children.lock().clear();

		tracing::debug!(guid = %self.guid, type_name = %self.type_name, ?reason, "Disposed object");
	}
}

impl std::fmt::Debug for ChannelOwnerImpl {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChannelOwnerImpl")
			.field("guid", &self.guid)
			.field("type_name", &self.type_name)
			.field("children", &self.children.lock().len())
			.field("disposed", &self.is_disposed())
			.finish()
	}
}

/// Moves `child` under `new_parent`, keeping both sides of the link consistent.
pub fn adopt(new_parent: &Arc<dyn ChannelOwner>, child: &Arc<dyn ChannelOwner>) {
	if let Some(old_parent) = child.parent() {
		old_parent.base().remove_child(child.guid());
	}
	child.base().set_parent(new_parent);
	new_parent.base().add_child(Arc::clone(child));
}

/// The synthetic node with identifier `""` every other node descends from.
pub struct RootObject {
	base: ChannelOwnerImpl,
}

impl RootObject {
	pub fn new(connection: Arc<dyn ConnectionLike>) -> Self {
		Self {
			base: ChannelOwnerImpl::new(
				ParentOrConnection::Connection(connection),
				ROOT_TYPE.to_string(),
				Arc::from(ROOT_GUID),
				ProtocolValue::Null,
			),
		}
	}
}

impl private::Sealed for RootObject {}

impl ChannelOwner for RootObject {
	fn base(&self) -> &ChannelOwnerImpl {
		&self.base
	}
}
