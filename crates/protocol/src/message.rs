//! Frame-level message shapes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved mapping key that marks a value as a reference to a remote object.
pub const GUID_KEY: &str = "guid";

/// Control method announcing a new remote object.
pub const CREATE_METHOD: &str = "__create__";

/// Control method announcing that a remote object (and its subtree) is gone.
pub const DISPOSE_METHOD: &str = "__dispose__";

/// Control method moving an existing object under a new parent.
pub const ADOPT_METHOD: &str = "__adopt__";

/// Metadata attached to every outgoing call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
	/// Unix timestamp in milliseconds
	#[serde(rename = "wallTime")]
	pub wall_time: i64,
	/// Whether this is an internal call (not user-facing API)
	#[serde(skip_serializing_if = "Option::is_none")]
	pub internal: Option<bool>,
}

impl Metadata {
	/// Minimal metadata stamped with the current wall clock.
	pub fn now() -> Self {
		let wall_time = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_millis() as i64)
			.unwrap_or_default();
		Self {
			wall_time,
			internal: Some(false),
		}
	}

	/// Marks the call as issued by library internals rather than user code.
	pub fn internal(mut self, internal: bool) -> Self {
		self.internal = Some(internal);
		self
	}
}

/// Call sent to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	/// Correlation id, never 0
	pub id: u32,
	/// Identifier of the target object
	#[serde(serialize_with = "serialize_arc_str", deserialize_with = "deserialize_arc_str")]
	pub guid: Arc<str>,
	pub method: String,
	/// Parameters with object references already replaced by `{"guid": ...}`
	pub params: Value,
	pub metadata: Metadata,
}

/// Serde helpers for `Arc<str>` serialization
pub fn serialize_arc_str<S>(arc: &Arc<str>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
	S: serde::Serializer,
{
	serializer.serialize_str(arc)
}

pub fn deserialize_arc_str<'de, D>(deserializer: D) -> std::result::Result<Arc<str>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let s: String = serde::Deserialize::deserialize(deserializer)?;
	Ok(Arc::from(s.as_str()))
}

/// Response to a previously issued [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	/// Id of the request this answers
	pub id: u32,
	/// Success result (mutually exclusive with error)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	/// Error result (mutually exclusive with result)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorWrapper>,
}

/// Wrapper for the error payload, as the engine nests it one level deep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorWrapper {
	pub error: ErrorPayload,
}

/// Engine-reported error details
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
	#[serde(default)]
	pub message: String,
	/// Error class name (e.g., "TimeoutError")
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stack: Option<String>,
}

/// Event or control message pushed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	/// Identifier of the addressed object (`""` is the root)
	#[serde(serialize_with = "serialize_arc_str", deserialize_with = "deserialize_arc_str")]
	pub guid: Arc<str>,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

impl Event {
	/// Returns true for `__create__`, `__dispose__` and `__adopt__`.
	pub fn is_control(&self) -> bool {
		matches!(self.method.as_str(), CREATE_METHOD | DISPOSE_METHOD | ADOPT_METHOD)
	}
}

/// Any inbound frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
	/// Response message (has `id` field)
	Response(Response),
	/// Event message (no `id` field)
	Event(Event),
	/// Unknown message type (forward-compatible catch-all)
	Unknown(Value),
}
