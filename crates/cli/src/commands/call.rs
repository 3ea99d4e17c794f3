use anyhow::{Context, Result};
use remora_runtime::{ChannelOwner, Error, ProtocolValue};
use tracing::info;

use crate::cli::CallArgs;
use crate::session::{Session, parse_params};

/// Performs one call on the target object and returns its result.
pub async fn call(session: &Session, args: &CallArgs) -> Result<ProtocolValue> {
	let params = parse_params(args.params.as_deref())?;
	let target = session.object(&args.target).await?;

	info!(target = %args.target, method = %args.method, "Calling");
	let call = target.channel().send_value(&args.method, params);
	let result = match tokio::time::timeout(session.timeout(), call).await {
		Ok(result) => result,
		Err(_) => Err(Error::Timeout(format!("Timeout {}ms exceeded.", session.timeout().as_millis()))),
	};
	result.with_context(|| format!("{} failed", args.method))
}
