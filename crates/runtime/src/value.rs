//! Protocol values that may hold live references to remote objects.
//!
//! [`ProtocolValue`] mirrors [`serde_json::Value`] with one extra variant,
//! [`ProtocolValue::Remote`], holding a local proxy. The two walkers in this
//! module are the only place identifiers and proxies are swapped:
//!
//! - [`ProtocolValue::to_json`] (outbound): every proxy becomes `{"guid": <id>}`
//! - [`ProtocolValue::resolve`] (inbound): every mapping carrying a `guid` that
//!   names a registered object becomes that object; unknown identifiers are
//!   left as plain data so forward references survive until `__create__`

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use remora_protocol::GUID_KEY;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::channel_owner::ChannelOwner;

/// Ordered mapping used for protocol objects.
pub type ValueMap = IndexMap<String, ProtocolValue>;

/// A JSON-compatible value that may reference live remote objects.
#[derive(Clone, Default)]
pub enum ProtocolValue {
	#[default]
	Null,
	Bool(bool),
	Number(Number),
	String(String),
	Array(Vec<ProtocolValue>),
	Map(ValueMap),
	/// Live proxy for a registered remote object.
	Remote(Arc<dyn ChannelOwner>),
}

impl ProtocolValue {
	/// Builds a mapping from key/value pairs.
	pub fn map<K, V, I>(entries: I) -> Self
	where
		K: Into<String>,
		V: Into<ProtocolValue>,
		I: IntoIterator<Item = (K, V)>,
	{
		ProtocolValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
	}

	/// Empty mapping, the canonical "no parameters" value.
	pub fn empty_map() -> Self {
		ProtocolValue::Map(ValueMap::new())
	}

	/// Walks an inbound JSON tree and swaps identifier references for live proxies.
	///
	/// `lookup` is consulted for every mapping whose `guid` entry is a string.
	/// A hit replaces the whole mapping; a miss keeps the mapping as data.
	pub fn resolve<F>(value: Value, lookup: &F) -> Self
	where
		F: Fn(&str) -> Option<Arc<dyn ChannelOwner>>,
	{
		match value {
			Value::Array(items) => {
				ProtocolValue::Array(items.into_iter().map(|v| Self::resolve(v, lookup)).collect())
			}
			Value::Object(map) => {
				if let Some(object) = map.get(GUID_KEY).and_then(Value::as_str).and_then(lookup) {
					return ProtocolValue::Remote(object);
				}
				ProtocolValue::Map(map.into_iter().map(|(k, v)| (k, Self::resolve(v, lookup))).collect())
			}
			scalar => Self::from(scalar),
		}
	}

	/// Walks the tree and replaces every live proxy with `{"guid": <id>}`.
	pub fn to_json(&self) -> Value {
		match self {
			ProtocolValue::Null => Value::Null,
			ProtocolValue::Bool(b) => Value::Bool(*b),
			ProtocolValue::Number(n) => Value::Number(n.clone()),
			ProtocolValue::String(s) => Value::String(s.clone()),
			ProtocolValue::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
			ProtocolValue::Map(map) => {
				Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>())
			}
			ProtocolValue::Remote(object) => guid_reference(object.guid()),
		}
	}

	/// Applies the engine's single-field result convention.
	///
	/// This is a quirk of the wire protocol rather than a general RPC rule:
	/// a result mapping with exactly one entry is returned as that entry's
	/// bare value, and an empty mapping as `Null`. Anything else is unchanged.
	pub fn unwrap_single(self) -> Self {
		match self {
			ProtocolValue::Map(map) if map.is_empty() => ProtocolValue::Null,
			ProtocolValue::Map(mut map) if map.len() == 1 => match map.pop() {
				Some((_, value)) => value,
				None => ProtocolValue::Null,
			},
			other => other,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, ProtocolValue::Null)
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			ProtocolValue::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			ProtocolValue::Bool(b) => Some(*b),
			_ => None,
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			ProtocolValue::Number(n) => n.as_i64(),
			_ => None,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			ProtocolValue::Number(n) => n.as_f64(),
			_ => None,
		}
	}

	pub fn as_array(&self) -> Option<&[ProtocolValue]> {
		match self {
			ProtocolValue::Array(items) => Some(items),
			_ => None,
		}
	}

	pub fn as_map(&self) -> Option<&ValueMap> {
		match self {
			ProtocolValue::Map(map) => Some(map),
			_ => None,
		}
	}

	/// Looks up a key if this value is a mapping.
	pub fn get(&self, key: &str) -> Option<&ProtocolValue> {
		self.as_map().and_then(|m| m.get(key))
	}

	pub fn as_remote(&self) -> Option<&Arc<dyn ChannelOwner>> {
		match self {
			ProtocolValue::Remote(object) => Some(object),
			_ => None,
		}
	}

	/// Returns the proxy downcast to its concrete type.
	pub fn remote_as<T: ChannelOwner>(&self) -> Option<Arc<T>> {
		self.as_remote().and_then(|o| Arc::clone(o).downcast_arc::<T>().ok())
	}
}

fn guid_reference(guid: &str) -> Value {
	let mut map = Map::new();
	map.insert(GUID_KEY.to_string(), Value::String(guid.to_string()));
	Value::Object(map)
}

impl PartialEq for ProtocolValue {
	/// Proxies compare by identity, everything else structurally.
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(ProtocolValue::Null, ProtocolValue::Null) => true,
			(ProtocolValue::Bool(a), ProtocolValue::Bool(b)) => a == b,
			(ProtocolValue::Number(a), ProtocolValue::Number(b)) => a == b,
			(ProtocolValue::String(a), ProtocolValue::String(b)) => a == b,
			(ProtocolValue::Array(a), ProtocolValue::Array(b)) => a == b,
			(ProtocolValue::Map(a), ProtocolValue::Map(b)) => a == b,
			(ProtocolValue::Remote(a), ProtocolValue::Remote(b)) => {
				std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
			}
			_ => false,
		}
	}
}

impl fmt::Debug for ProtocolValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolValue::Null => f.write_str("Null"),
			ProtocolValue::Bool(b) => write!(f, "Bool({b})"),
			ProtocolValue::Number(n) => write!(f, "Number({n})"),
			ProtocolValue::String(s) => write!(f, "String({s:?})"),
			ProtocolValue::Array(items) => f.debug_list().entries(items).finish(),
			ProtocolValue::Map(map) => f.debug_map().entries(map.iter()).finish(),
			ProtocolValue::Remote(object) => write!(f, "Remote({}@{:?})", object.type_name(), object.guid()),
		}
	}
}

impl fmt::Display for ProtocolValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_json())
	}
}

impl Serialize for ProtocolValue {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		match self {
			ProtocolValue::Null => serializer.serialize_unit(),
			ProtocolValue::Bool(b) => serializer.serialize_bool(*b),
			ProtocolValue::Number(n) => n.serialize(serializer),
			ProtocolValue::String(s) => serializer.serialize_str(s),
			ProtocolValue::Array(items) => {
				let mut seq = serializer.serialize_seq(Some(items.len()))?;
				for item in items {
					seq.serialize_element(item)?;
				}
				seq.end()
			}
			ProtocolValue::Map(map) => {
				let mut out = serializer.serialize_map(Some(map.len()))?;
				for (k, v) in map {
					out.serialize_entry(k, v)?;
				}
				out.end()
			}
			ProtocolValue::Remote(object) => {
				let mut out = serializer.serialize_map(Some(1))?;
				out.serialize_entry(GUID_KEY, object.guid())?;
				out.end()
			}
		}
	}
}

impl From<Value> for ProtocolValue {
	/// Converts without resolving identifiers.
	fn from(value: Value) -> Self {
		match value {
			Value::Null => ProtocolValue::Null,
			Value::Bool(b) => ProtocolValue::Bool(b),
			Value::Number(n) => ProtocolValue::Number(n),
			Value::String(s) => ProtocolValue::String(s),
			Value::Array(items) => ProtocolValue::Array(items.into_iter().map(Self::from).collect()),
			Value::Object(map) => ProtocolValue::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
		}
	}
}

impl From<Arc<dyn ChannelOwner>> for ProtocolValue {
	fn from(object: Arc<dyn ChannelOwner>) -> Self {
		ProtocolValue::Remote(object)
	}
}

impl From<&str> for ProtocolValue {
	fn from(s: &str) -> Self {
		ProtocolValue::String(s.to_string())
	}
}

impl From<String> for ProtocolValue {
	fn from(s: String) -> Self {
		ProtocolValue::String(s)
	}
}

impl From<bool> for ProtocolValue {
	fn from(b: bool) -> Self {
		ProtocolValue::Bool(b)
	}
}

impl From<i64> for ProtocolValue {
	fn from(n: i64) -> Self {
		ProtocolValue::Number(n.into())
	}
}

impl From<u64> for ProtocolValue {
	fn from(n: u64) -> Self {
		ProtocolValue::Number(n.into())
	}
}

impl From<f64> for ProtocolValue {
	/// Non-finite floats have no JSON form and become `Null`.
	fn from(n: f64) -> Self {
		Number::from_f64(n).map(ProtocolValue::Number).unwrap_or(ProtocolValue::Null)
	}
}

impl From<Vec<ProtocolValue>> for ProtocolValue {
	fn from(items: Vec<ProtocolValue>) -> Self {
		ProtocolValue::Array(items)
	}
}

impl From<ValueMap> for ProtocolValue {
	fn from(map: ValueMap) -> Self {
		ProtocolValue::Map(map)
	}
}

impl<T: Into<ProtocolValue>> From<Option<T>> for ProtocolValue {
	fn from(value: Option<T>) -> Self {
		value.map(Into::into).unwrap_or(ProtocolValue::Null)
	}
}
