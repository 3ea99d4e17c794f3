//! Maps engine type names to proxy constructors.
//!
//! When the engine sends `__create__`, the connection asks its
//! [`ObjectFactory`] to build the proxy. [`FactoryRegistry`] is the stock
//! implementation: a table of constructors, a set of acknowledged-but-ignored
//! types, and an optional lenient fallback that builds a [`GenericObject`] for
//! anything else. Without the fallback an unknown type is a protocol contract
//! violation and the connection shuts down.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel_owner::{ChannelOwner, ChannelOwnerImpl, ParentOrConnection, private};
use crate::error::{Error, Result};
use crate::json_pipe::{JSON_PIPE_TYPE, JsonPipe};
use crate::value::ProtocolValue;

/// Factory trait for creating remote object proxies.
///
/// Decouples the [`Connection`](crate::Connection) from concrete proxy types.
pub trait ObjectFactory: Send + Sync {
	/// Builds the proxy for one `__create__` message.
	///
	/// Returns `Ok(None)` for types that are acknowledged but get no proxy.
	fn create_object(
		&self,
		parent: Arc<dyn ChannelOwner>,
		type_name: &str,
		guid: Arc<str>,
		initializer: ProtocolValue,
	) -> Result<Option<Arc<dyn ChannelOwner>>>;
}

/// Constructor for one proxy type: `(parent, type, guid, initializer)`.
pub type Constructor =
	Arc<dyn Fn(Arc<dyn ChannelOwner>, &str, Arc<str>, ProtocolValue) -> Result<Arc<dyn ChannelOwner>> + Send + Sync>;

#[derive(Clone)]
enum Entry {
	Construct(Constructor),
	Ignore,
}

/// Table-driven [`ObjectFactory`].
#[derive(Clone)]
pub struct FactoryRegistry {
	entries: HashMap<String, Entry>,
	lenient: bool,
}

impl Default for FactoryRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl FactoryRegistry {
	/// A registry that knows only the built-in `JsonPipe` type.
	pub fn new() -> Self {
		let mut registry = Self::empty();
		registry.register(JSON_PIPE_TYPE, |parent, type_name, guid, initializer| {
			Ok(Arc::new(JsonPipe::new(parent, type_name, guid, initializer)) as Arc<dyn ChannelOwner>)
		});
		registry
	}

	/// A registry with no types at all.
	pub fn empty() -> Self {
		Self {
			entries: HashMap::new(),
			lenient: false,
		}
	}

	pub fn register<F>(&mut self, type_name: &str, constructor: F) -> &mut Self
	where
		F: Fn(Arc<dyn ChannelOwner>, &str, Arc<str>, ProtocolValue) -> Result<Arc<dyn ChannelOwner>> + Send + Sync + 'static,
	{
		self.entries.insert(type_name.to_string(), Entry::Construct(Arc::new(constructor)));
		self
	}

	/// Registers `type_name` with the inert [`GenericObject`] proxy.
	pub fn register_generic(&mut self, type_name: &str) -> &mut Self {
		self.register(type_name, generic_constructor)
	}

	/// Acknowledges `type_name` without creating a proxy for it.
	pub fn ignore(&mut self, type_name: &str) -> &mut Self {
		self.entries.insert(type_name.to_string(), Entry::Ignore);
		self
	}

	/// Builds a [`GenericObject`] for unregistered types instead of failing.
	pub fn lenient(&mut self, lenient: bool) -> &mut Self {
		self.lenient = lenient;
		self
	}

	pub fn is_known(&self, type_name: &str) -> bool {
		self.lenient || self.entries.contains_key(type_name)
	}
}

fn generic_constructor(
	parent: Arc<dyn ChannelOwner>,
	type_name: &str,
	guid: Arc<str>,
	initializer: ProtocolValue,
) -> Result<Arc<dyn ChannelOwner>> {
	Ok(Arc::new(GenericObject::new(parent, type_name, guid, initializer)))
}

impl ObjectFactory for FactoryRegistry {
	fn create_object(
		&self,
		parent: Arc<dyn ChannelOwner>,
		type_name: &str,
		guid: Arc<str>,
		initializer: ProtocolValue,
	) -> Result<Option<Arc<dyn ChannelOwner>>> {
		match self.entries.get(type_name) {
			Some(Entry::Construct(constructor)) => constructor(parent, type_name, guid, initializer).map(Some),
			Some(Entry::Ignore) => Ok(None),
			None if self.lenient => {
				tracing::debug!(type_name, %guid, "Unknown protocol type (lenient), using generic proxy");
				generic_constructor(parent, type_name, guid, initializer).map(Some)
			}
			None => Err(Error::UnknownObjectType(type_name.to_string())),
		}
	}
}

impl std::fmt::Debug for FactoryRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut types: Vec<_> = self.entries.keys().collect();
		types.sort();
		f.debug_struct("FactoryRegistry")
			.field("types", &types)
			.field("lenient", &self.lenient)
			.finish()
	}
}

/// Proxy with no behavior beyond the node basics; events go to its emitter.
pub struct GenericObject {
	base: ChannelOwnerImpl,
}

impl GenericObject {
	pub fn new(parent: Arc<dyn ChannelOwner>, type_name: &str, guid: Arc<str>, initializer: ProtocolValue) -> Self {
		Self {
			base: ChannelOwnerImpl::new(ParentOrConnection::Parent(parent), type_name.to_string(), guid, initializer),
		}
	}
}

impl private::Sealed for GenericObject {}

impl ChannelOwner for GenericObject {
	fn base(&self) -> &ChannelOwnerImpl {
		&self.base
	}
}
