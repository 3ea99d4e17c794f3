//! Thread-safe object registry with per-GUID notification.
//!
//! Uses [`DashMap`] for sharded concurrent access. Per-GUID [`Notify`]
//! ensures only relevant waiters wake up, and [`ObjectStore::wait_for`]
//! registers waiters before checking to prevent lost wakeups.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::channel_owner::ChannelOwner;
use crate::error::{Error, Result};

/// Thread-safe registry of remote object proxies by GUID.
pub struct ObjectStore {
	objects: DashMap<Arc<str>, Arc<dyn ChannelOwner>>,
	waiters: DashMap<Arc<str>, Arc<Notify>>,
}

impl Default for ObjectStore {
	fn default() -> Self {
		Self::new()
	}
}

impl ObjectStore {
	pub fn new() -> Self {
		Self {
			objects: DashMap::new(),
			waiters: DashMap::new(),
		}
	}

	/// Inserts an object and wakes any waiters for this GUID.
	pub fn insert(&self, guid: Arc<str>, obj: Arc<dyn ChannelOwner>) {
		self.objects.insert(Arc::clone(&guid), obj);
		if let Some((_, notify)) = self.waiters.remove(&guid) {
			notify.notify_waiters();
		}
	}

	pub fn remove(&self, guid: &str) -> Option<Arc<dyn ChannelOwner>> {
		self.objects.remove(guid).map(|(_, obj)| obj)
	}

	pub fn contains(&self, guid: &str) -> bool {
		self.objects.contains_key(guid)
	}

	/// Synchronous lookup.
	pub fn try_get(&self, guid: &str) -> Option<Arc<dyn ChannelOwner>> {
		self.objects.get(guid).map(|r| Arc::clone(r.value()))
	}

	pub fn len(&self) -> usize {
		self.objects.len()
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	pub fn guids(&self) -> Vec<Arc<str>> {
		self.objects.iter().map(|entry| Arc::clone(entry.key())).collect()
	}

	/// Drops every registered object.
	pub fn clear(&self) {
		self.objects.clear();
	}

	/// Waits for an object to be registered, with timeout.
	///
	/// Registers waiter before checking to prevent lost wakeups.
	pub async fn wait_for(&self, guid: &str, timeout: Duration) -> Result<Arc<dyn ChannelOwner>> {
		let g: Arc<str> = Arc::from(guid);
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			let notify = self
				.waiters
				.entry(Arc::clone(&g))
				.or_insert_with(|| Arc::new(Notify::new()))
				.clone();
			let notified = notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(obj) = self.try_get(&g) {
				return Ok(obj);
			}

			let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return Err(Self::timeout_error(&g, timeout));
			}

			tokio::select! {
				biased;
				_ = &mut notified => {}
				_ = tokio::time::sleep(remaining) => {
					return Err(Self::timeout_error(&g, timeout));
				}
			}
		}
	}

	fn timeout_error(guid: &str, timeout: Duration) -> Error {
		Error::Timeout(format!(
			"Timeout {}ms exceeded waiting for object: {guid}",
			timeout.as_millis()
		))
	}
}
