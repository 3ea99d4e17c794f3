//! Single-shot wait for an event, racing rejection events and a timeout.
//!
//! A [`Waiter`] resolves exactly once. Every source that can resolve it (the
//! awaited event, a rejecting event, the timer, a failed action) goes through
//! [`WaiterState::resolve`], which wins only if it flips the `fulfilled` flag
//! from false to true. The winner removes every subscription the waiter holds
//! and aborts the timer before delivering its outcome, so late events are
//! ignored and no timeout can fire after success.
//!
//! # Example
//!
//! ```ignore
//! let mut waiter = Waiter::new();
//! waiter
//!     .reject_on_event(page.emitter(), "close", Error::Custom("page closed".into()))?
//!     .reject_on_timeout(Duration::from_secs(5))?
//!     .wait_for_event_if(page.emitter(), "console", |msg| msg.get("type").and_then(|t| t.as_str()) == Some("error"))?;
//! let message = waiter.run_and_wait(page.channel().send_no_result("reload", ProtocolValue::Null)).await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event_emitter::{EventEmitter, Subscription};
use crate::value::ProtocolValue;

struct WaiterState<E> {
	fulfilled: AtomicBool,
	armed: AtomicBool,
	result_tx: Mutex<Option<oneshot::Sender<Result<E>>>>,
	subscriptions: Mutex<Vec<Subscription>>,
	timeout: Mutex<Option<Duration>>,
	timer: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> WaiterState<E> {
	/// Delivers `outcome` if nothing else has. Returns whether this call won.
	fn resolve(&self, outcome: Result<E>) -> bool {
		if self
			.fulfilled
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return false;
		}
		self.release();
		if let Some(tx) = self.result_tx.lock().take() {
			let _ = tx.send(outcome);
		}
		true
	}

	/// Drops every subscription and disarms the timer.
	fn release(&self) {
		let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
		drop(subscriptions);
		if let Some(timer) = self.timer.lock().take() {
			timer.abort();
		}
	}

	fn is_fulfilled(&self) -> bool {
		self.fulfilled.load(Ordering::Acquire)
	}

	fn start_timer(self: &Arc<Self>, duration: Duration) -> Result<()> {
		let runtime = tokio::runtime::Handle::try_current()
			.map_err(|_| Error::Usage("reject_on_timeout requires a tokio runtime".to_string()))?;
		let weak = Arc::downgrade(self);
		let handle = runtime.spawn(async move {
			tokio::time::sleep(duration).await;
			if let Some(state) = weak.upgrade() {
				let message = format!("Timeout {}ms exceeded.", duration.as_millis());
				if state.resolve(Err(Error::Timeout(message))) {
					tracing::debug!(timeout_ms = duration.as_millis() as u64, "Waiter timed out");
				}
			}
		});
		*self.timer.lock() = Some(handle);
		// Resolution may have raced the spawn; make sure the timer does not outlive it.
		if self.is_fulfilled() {
			self.release();
		}
		Ok(())
	}
}

/// One-shot future resolved by the first of: a matching event, a rejecting
/// event, the timeout, or a failed action passed to [`run_and_wait`](Self::run_and_wait).
pub struct Waiter<E = ProtocolValue> {
	state: Arc<WaiterState<E>>,
	result_rx: Option<oneshot::Receiver<Result<E>>>,
}

impl<E: Clone + Send + 'static> Default for Waiter<E> {
	fn default() -> Self {
		Self::new()
	}
}

impl<E: Clone + Send + 'static> Waiter<E> {
	pub fn new() -> Self {
		let (tx, rx) = oneshot::channel();
		Self {
			state: Arc::new(WaiterState {
				fulfilled: AtomicBool::new(false),
				armed: AtomicBool::new(false),
				result_tx: Mutex::new(Some(tx)),
				subscriptions: Mutex::new(Vec::new()),
				timeout: Mutex::new(None),
				timer: Mutex::new(None),
			}),
			result_rx: Some(rx),
		}
	}

	/// Fails the waiter with `error` the first time `event` fires on `emitter`.
	///
	/// Must be configured before [`wait_for_event`](Self::wait_for_event).
	pub fn reject_on_event(&mut self, emitter: &EventEmitter<E>, event: &str, error: Error) -> Result<&mut Self> {
		self.reject_on_event_if(emitter, event, error, |_| true)
	}

	/// Fails the waiter with `error` when `event` fires with a payload matching `predicate`.
	pub fn reject_on_event_if<P>(
		&mut self,
		emitter: &EventEmitter<E>,
		event: &str,
		error: Error,
		predicate: P,
	) -> Result<&mut Self>
	where
		P: Fn(&E) -> bool + Send + Sync + 'static,
	{
		if self.state.armed.load(Ordering::Acquire) {
			return Err(Error::Usage(
				"reject_on_event must be called before wait_for_event".to_string(),
			));
		}
		let weak = Arc::downgrade(&self.state);
		let subscription = emitter.subscribe(event, move |payload: E| {
			let Some(state) = weak.upgrade() else {
				return;
			};
			if state.is_fulfilled() || !predicate(&payload) {
				return;
			}
			state.resolve(Err(error.duplicate()));
		});
		self.hold(subscription);
		Ok(self)
	}

	/// Fails the waiter with [`Error::Timeout`] if nothing resolves it within `duration`.
	///
	/// The timer starts once the resolving subscription exists; configured
	/// earlier, it is held until [`wait_for_event`](Self::wait_for_event).
	pub fn reject_on_timeout(&mut self, duration: Duration) -> Result<&mut Self> {
		if self.state.armed.load(Ordering::Acquire) {
			if self.state.timer.lock().is_some() {
				return Err(Error::Usage("reject_on_timeout can only be set once".to_string()));
			}
			self.state.start_timer(duration)?;
		} else {
			*self.state.timeout.lock() = Some(duration);
		}
		Ok(self)
	}

	/// Resolves the waiter with the payload of the next `event` on `emitter`.
	pub fn wait_for_event(&mut self, emitter: &EventEmitter<E>, event: &str) -> Result<&mut Self> {
		self.wait_for_event_if(emitter, event, |_| true)
	}

	/// Resolves the waiter with the next `event` payload matching `predicate`.
	///
	/// Only one resolving subscription is allowed per waiter.
	pub fn wait_for_event_if<P>(&mut self, emitter: &EventEmitter<E>, event: &str, predicate: P) -> Result<&mut Self>
	where
		P: Fn(&E) -> bool + Send + Sync + 'static,
	{
		if self.state.armed.swap(true, Ordering::AcqRel) {
			return Err(Error::Usage("wait_for_event can only be called once".to_string()));
		}
		let weak: Weak<WaiterState<E>> = Arc::downgrade(&self.state);
		let subscription = emitter.subscribe(event, move |payload: E| {
			let Some(state) = weak.upgrade() else {
				return;
			};
			if state.is_fulfilled() || !predicate(&payload) {
				return;
			}
			state.resolve(Ok(payload));
		});
		self.hold(subscription);

		let pending_timeout = self.state.timeout.lock().take();
		if let Some(duration) = pending_timeout {
			self.state.start_timer(duration)?;
		}
		Ok(self)
	}

	fn hold(&self, subscription: Subscription) {
		if self.state.is_fulfilled() {
			return;
		}
		self.state.subscriptions.lock().push(subscription);
		// A racing resolution may have already released the list.
		if self.state.is_fulfilled() {
			self.state.release();
		}
	}

	/// Returns true once any source has resolved the waiter.
	pub fn is_fulfilled(&self) -> bool {
		self.state.is_fulfilled()
	}

	/// Suspends until the waiter resolves.
	pub async fn wait(mut self) -> Result<E> {
		if !self.state.armed.load(Ordering::Acquire) {
			return Err(Error::Usage("call wait_for_event before wait".to_string()));
		}
		let rx = self
			.result_rx
			.take()
			.ok_or_else(|| Error::Usage("waiter already awaited".to_string()))?;
		rx.await.unwrap_or(Err(Error::ChannelClosed))
	}

	/// Runs `action` with the waiter armed, then waits.
	///
	/// A failed action competes for the single resolution like any other
	/// rejection; if the awaited event already won, the action's error is dropped.
	pub async fn run_and_wait<F, T>(self, action: F) -> Result<E>
	where
		F: Future<Output = Result<T>>,
	{
		if !self.state.armed.load(Ordering::Acquire) {
			return Err(Error::Usage("call wait_for_event before run_and_wait".to_string()));
		}
		if let Err(err) = action.await {
			if !self.state.resolve(Err(err)) {
				tracing::debug!("Waiter already resolved; discarding action error");
			}
		}
		self.wait().await
	}
}

impl<E> Drop for Waiter<E> {
	fn drop(&mut self) {
		// Abandoned or finished: either way no listener or timer may outlive us.
		self.state.fulfilled.store(true, Ordering::Release);
		let subscriptions = std::mem::take(&mut *self.state.subscriptions.lock());
		drop(subscriptions);
		if let Some(timer) = self.state.timer.lock().take() {
			timer.abort();
		}
	}
}

impl<E> std::fmt::Debug for Waiter<E> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Waiter")
			.field("fulfilled", &self.state.fulfilled.load(Ordering::Acquire))
			.field("armed", &self.state.armed.load(Ordering::Acquire))
			.field("subscriptions", &self.state.subscriptions.lock().len())
			.finish()
	}
}
