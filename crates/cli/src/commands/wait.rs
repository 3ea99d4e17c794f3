use anyhow::{Context, Result};
use remora_runtime::{ChannelOwner, Error, ProtocolValue, Waiter};
use tracing::info;

use crate::cli::WaitArgs;
use crate::session::{Session, parse_params};

/// Waits for `args.event` on the target, racing the rejecting events and the
/// session timeout. With `--call`, the call is issued once the wait is armed.
pub async fn wait(session: &Session, args: &WaitArgs) -> Result<ProtocolValue> {
	let target = session.object(&args.target).await?;
	let emitter = target.emitter();

	let mut waiter = Waiter::new();
	for event in &args.reject_on {
		waiter.reject_on_event(
			emitter,
			event,
			Error::Custom(format!("{event} fired while waiting for {}", args.event)),
		)?;
	}
	waiter.reject_on_timeout(session.timeout())?;
	waiter.wait_for_event(emitter, &args.event)?;

	info!(target = %args.target, event = %args.event, "Waiting");
	let payload = match &args.call {
		Some(method) => {
			let params = parse_params(args.params.as_deref())?;
			waiter.run_and_wait(target.channel().send_value(method, params)).await
		}
		None => waiter.wait().await,
	};
	payload.with_context(|| format!("waiting for {} failed", args.event))
}
