// A second connection layered over a remote JsonPipe.

mod fake_engine;

use std::sync::Arc;
use std::time::Duration;

use remora_runtime::{ChannelOwner, Connection, ConnectionLike, Error, FactoryRegistry, JsonPipe, ProtocolValue};
use serde_json::json;

#[tokio::test]
async fn nested_connection_speaks_through_the_pipe() {
	let (outer, mut engine) = fake_engine::start(FactoryRegistry::new());
	engine.create("", "JsonPipe", "jsonPipe@1", json!({})).await;

	let pipe = outer
		.wait_for_object("jsonPipe@1", Duration::from_secs(1))
		.await
		.unwrap()
		.downcast_arc::<JsonPipe>()
		.ok()
		.unwrap();

	let inner = Connection::new(Arc::clone(&pipe).into_transport_parts());
	let mut registry = FactoryRegistry::new();
	registry.register_generic("Browser");
	inner.set_factory(Arc::new(registry));
	let inner_run = tokio::spawn({
		let inner = Arc::clone(&inner);
		async move { inner.run().await }
	});

	// Inner calls travel as the `message` param of an outer `send` call.
	let call = tokio::spawn({
		let inner = Arc::clone(&inner);
		async move { inner.send_call("", "hello", ProtocolValue::Null).await }
	});
	let outer_request = engine.reply(json!({})).await;
	assert_eq!(outer_request["guid"], "jsonPipe@1");
	assert_eq!(outer_request["method"], "send");
	let tunneled = &outer_request["params"]["message"];
	assert_eq!(tunneled["id"], 1);
	assert_eq!(tunneled["method"], "hello");

	// Inner traffic is opaque to the outer connection: this guid means nothing there.
	engine
		.event(
			"jsonPipe@1",
			"message",
			json!({"message": {"guid": "", "method": "__create__", "params": {"type": "Browser", "guid": "browser@1", "initializer": {}}}}),
		)
		.await;
	engine
		.event("jsonPipe@1", "message", json!({"message": {"id": 1, "result": {"value": "world"}}}))
		.await;

	assert_eq!(call.await.unwrap().unwrap().as_str(), Some("world"));
	let browser = inner.wait_for_object("browser@1", Duration::from_secs(1)).await.unwrap();
	assert_eq!(browser.type_name(), "Browser");
	assert!(outer.get_object("browser@1").is_none());

	engine.event("jsonPipe@1", "closed", json!({})).await;
	inner_run.await.unwrap();

	let err = inner.send_call("", "late", ProtocolValue::Null).await.unwrap_err();
	assert!(matches!(err, Error::ConnectionClosed(_)), "{err:?}");
	assert!(!outer.is_closed());
}
