//! Error types for the remora runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the remora runtime.
#[derive(Debug, Error)]
pub enum Error {
	/// Failed to launch the engine process.
	#[error("Failed to launch engine: {0}")]
	LaunchFailed(String),

	/// Framing or stream failure below the protocol layer.
	#[error("Transport error: {0}")]
	TransportError(String),

	/// The transport was closed while a read or write was pending.
	#[error("Transport closed")]
	TransportClosed,

	/// Malformed control message or protocol contract violation.
	#[error("Protocol error: {0}")]
	ProtocolError(String),

	/// Error reported by the engine for one specific call.
	#[error("{name}: {message}")]
	Remote {
		/// Error class name (e.g., "TimeoutError", "Error")
		name: String,
		message: String,
		/// Stack trace from the engine (if available)
		stack: Option<String>,
	},

	/// The connection is shutting down or has shut down.
	#[error("Connection closed: {0}")]
	ConnectionClosed(String),

	/// A response slot was dropped before delivery.
	#[error("Channel closed unexpectedly")]
	ChannelClosed,

	/// The engine garbage-collected the target object.
	#[error("The object has been collected to prevent unbounded heap growth.")]
	ObjectCollected,

	/// A local wait ran out of time.
	#[error("{0}")]
	Timeout(String),

	/// The engine announced a type no constructor is registered for.
	#[error("Unknown protocol object type: {0}")]
	UnknownObjectType(String),

	/// Programmer error: an API was used out of order or twice.
	#[error("Usage error: {0}")]
	Usage(String),

	/// Failure raised by user-supplied code racing inside a waiter.
	#[error("{0}")]
	Custom(String),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns the error name if this is a Remote error.
	pub fn error_name(&self) -> Option<&str> {
		match self {
			Error::Remote { name, .. } => Some(name),
			_ => None,
		}
	}

	/// Returns the stack trace if this is a Remote error with a stack.
	pub fn stack_trace(&self) -> Option<&str> {
		match self {
			Error::Remote { stack, .. } => stack.as_deref(),
			_ => None,
		}
	}

	/// Returns true for local timeouts and engine-reported `TimeoutError`s.
	pub fn is_timeout(&self) -> bool {
		match self {
			Error::Timeout(_) => true,
			Error::Remote { name, .. } => name == "TimeoutError",
			_ => false,
		}
	}

	/// Returns true if the failure is fatal to the whole connection.
	pub fn is_transport(&self) -> bool {
		matches!(
			self,
			Error::TransportError(_) | Error::TransportClosed | Error::Io(_) | Error::ConnectionClosed(_)
		)
	}

	/// Rebuilds an error so it can be delivered to more than one waiter.
	///
	/// `Io` and `Json` sources are not `Clone`; their message survives as a
	/// [`Error::TransportError`].
	pub(crate) fn duplicate(&self) -> Error {
		match self {
			Error::LaunchFailed(m) => Error::LaunchFailed(m.clone()),
			Error::TransportError(m) => Error::TransportError(m.clone()),
			Error::TransportClosed => Error::TransportClosed,
			Error::ProtocolError(m) => Error::ProtocolError(m.clone()),
			Error::Remote { name, message, stack } => Error::Remote {
				name: name.clone(),
				message: message.clone(),
				stack: stack.clone(),
			},
			Error::ConnectionClosed(m) => Error::ConnectionClosed(m.clone()),
			Error::ChannelClosed => Error::ChannelClosed,
			Error::ObjectCollected => Error::ObjectCollected,
			Error::Timeout(m) => Error::Timeout(m.clone()),
			Error::UnknownObjectType(t) => Error::UnknownObjectType(t.clone()),
			Error::Usage(m) => Error::Usage(m.clone()),
			Error::Custom(m) => Error::Custom(m.clone()),
			Error::Io(e) => Error::TransportError(e.to_string()),
			Error::Json(e) => Error::TransportError(e.to_string()),
		}
	}
}
