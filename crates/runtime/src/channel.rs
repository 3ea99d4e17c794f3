//! Channel - call facade for one remote object.
//!
//! Call sites never handle identifiers or frames: they name a method and pass
//! parameters, and the channel routes the call through the connection to the
//! object it belongs to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::connection::ConnectionLike;
use crate::error::{Error, Result};
use crate::value::{ProtocolValue, ValueMap};

/// Channel provides RPC communication for a ChannelOwner.
#[derive(Clone)]
pub struct Channel {
	guid: Arc<str>,
	connection: Arc<dyn ConnectionLike>,
	collected: Arc<AtomicBool>,
}

impl Channel {
	pub fn new(guid: Arc<str>, connection: Arc<dyn ConnectionLike>, collected: Arc<AtomicBool>) -> Self {
		Self {
			guid,
			connection,
			collected,
		}
	}

	fn ensure_callable(&self) -> Result<()> {
		if self.collected.load(Ordering::Acquire) {
			return Err(Error::ObjectCollected);
		}
		if self.connection.is_closed() {
			return Err(Error::ConnectionClosed(format!(
				"cannot call on {} after the connection closed",
				self.guid
			)));
		}
		Ok(())
	}

	async fn call(&self, method: &str, params: ProtocolValue) -> Result<ProtocolValue> {
		self.ensure_callable()?;
		self.connection.send_message(&self.guid, method, params).await
	}

	/// Calls `method` keeping live object references in both directions.
	///
	/// A single-entry result mapping is returned as its bare value.
	pub async fn send_value(&self, method: &str, params: impl Into<ProtocolValue>) -> Result<ProtocolValue> {
		self.call(method, params.into()).await.map(ProtocolValue::unwrap_single)
	}

	/// Calls `method` and returns the whole result mapping, without unwrapping.
	pub async fn send_return_as_map(&self, method: &str, params: impl Into<ProtocolValue>) -> Result<ValueMap> {
		match self.call(method, params.into()).await? {
			ProtocolValue::Map(map) => Ok(map),
			ProtocolValue::Null => Ok(ValueMap::new()),
			other => Err(Error::ProtocolError(format!(
				"{method} returned a non-mapping result: {other}"
			))),
		}
	}

	/// Sends a method call and deserializes the unwrapped result into `R`.
	///
	/// Object references in the result arrive as `{"guid": ...}` mappings.
	pub async fn send<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
		let params = ProtocolValue::from(serde_json::to_value(params)?);
		let result = self.send_value(method, params).await?;
		serde_json::from_value(result.to_json()).map_err(Into::into)
	}

	/// Sends a method call with no parameters.
	pub async fn send_no_params<R: DeserializeOwned>(&self, method: &str) -> Result<R> {
		self.send(method, Value::Null).await
	}

	/// Sends a method call that returns no result (void).
	pub async fn send_no_result<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
		let _: Value = self.send(method, params).await?;
		Ok(())
	}

	/// Fire-and-forget call. Failures go to the log, since nobody awaits them.
	pub fn send_no_reply(&self, method: &str, params: impl Into<ProtocolValue>) {
		if let Err(err) = self.ensure_callable() {
			tracing::warn!(guid = %self.guid, method, error = %err, "Dropped no-reply call");
			return;
		}
		self.connection.send_no_reply(&self.guid, method, params.into());
	}

	/// Returns the GUID this channel represents.
	pub fn guid(&self) -> &str {
		&self.guid
	}
}

impl std::fmt::Debug for Channel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Channel").field("guid", &self.guid).finish()
	}
}
