use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use remora_protocol::{ErrorWrapper, Event, Message, Response};
use serde_json::json;

use super::*;
use crate::test_support::{idle_connection, running_connection};

fn create_event(parent: &str, type_name: &str, guid: &str, initializer: Value) -> Message {
	Message::Event(Event {
		guid: Arc::from(parent),
		method: CREATE_METHOD.to_string(),
		params: json!({"type": type_name, "guid": guid, "initializer": initializer}),
	})
}

fn dispose_event(guid: &str, params: Value) -> Message {
	Message::Event(Event {
		guid: Arc::from(guid),
		method: DISPOSE_METHOD.to_string(),
		params,
	})
}

fn generic_connection(types: &[&str]) -> Arc<Connection> {
	let connection = idle_connection();
	let mut registry = FactoryRegistry::new();
	for type_name in types {
		registry.register_generic(type_name);
	}
	connection.set_factory(Arc::new(registry));
	connection
}

#[test]
fn test_request_ids_start_at_one() {
	let connection = idle_connection();

	assert_eq!(connection.next_id(), 1);
	assert_eq!(connection.next_id(), 2);
	assert_eq!(connection.next_id(), 3);
	assert_eq!(connection.last_id.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_request_format() {
	let (connection, mut engine) = running_connection(&[]);

	let call = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "initialize", ProtocolValue::Null).await }
	});

	let request = engine.recv().await;
	assert_eq!(request["id"], 1);
	assert_eq!(request["guid"], "");
	assert_eq!(request["method"], "initialize");
	assert_eq!(request["params"], json!({}));
	assert!(request["metadata"]["wallTime"].as_i64().unwrap() > 0);

	engine.send(json!({"id": 1, "result": {}})).await;
	assert!(call.await.unwrap().unwrap().is_null());
}

#[tokio::test]
async fn test_dispatch_response_success() {
	let connection = idle_connection();

	let id = connection.next_id();
	let (tx, rx) = tokio::sync::oneshot::channel();
	connection.callbacks.insert(id, tx);

	let response = Message::Response(Response {
		id,
		result: Some(json!({"status": "ok", "count": 2})),
		error: None,
	});
	connection.dispatch(response).unwrap();

	let result = rx.await.unwrap().unwrap();
	assert_eq!(result.get("status").and_then(ProtocolValue::as_str), Some("ok"));
	assert!(connection.callbacks.is_empty());
}

#[tokio::test]
async fn test_dispatch_response_error() {
	let connection = idle_connection();

	let id = connection.next_id();
	let (tx, rx) = tokio::sync::oneshot::channel();
	connection.callbacks.insert(id, tx);

	let response = Message::Response(Response {
		id,
		result: None,
		error: Some(ErrorWrapper {
			error: ErrorPayload {
				message: "Navigation timeout".to_string(),
				name: Some("TimeoutError".to_string()),
				stack: None,
			},
		}),
	});
	connection.dispatch(response).unwrap();

	let err = rx.await.unwrap().unwrap_err();
	assert!(err.is_timeout(), "Expected timeout error, got: {err:?}");
}

#[test]
fn test_response_for_unknown_id_is_ignored() {
	let connection = idle_connection();
	let response = Message::Response(Response {
		id: 99,
		result: None,
		error: None,
	});
	assert!(connection.dispatch(response).is_ok());
}

#[test]
fn test_error_type_parsing() {
	let error = parse_protocol_error(ErrorPayload {
		message: "timeout".to_string(),
		name: Some("TimeoutError".to_string()),
		stack: Some("stack trace".to_string()),
	});
	assert!(error.is_timeout());
	match &error {
		Error::Remote { name, message, stack } => {
			assert_eq!(name, "TimeoutError");
			assert_eq!(message, "timeout");
			assert_eq!(stack.as_deref(), Some("stack trace"));
		}
		_ => panic!("Expected Remote error"),
	}

	let unnamed = parse_protocol_error(ErrorPayload {
		message: "boom".to_string(),
		..Default::default()
	});
	assert_eq!(unnamed.error_name(), Some("Error"));
	assert!(!unnamed.is_timeout());
}

#[tokio::test]
async fn test_create_registers_under_parent_and_dispose_removes() {
	let connection = generic_connection(&["X"]);
	let root = connection.root().unwrap();

	connection.dispatch(create_event("", "X", "x1", json!({"name": "first"}))).unwrap();

	let x1 = connection.get_object("x1").unwrap();
	assert_eq!(x1.type_name(), "X");
	assert_eq!(x1.parent().unwrap().guid(), "");
	assert_eq!(x1.initializer().get("name").and_then(ProtocolValue::as_str), Some("first"));
	assert!(root.base().child("x1").is_some());

	connection.dispatch(dispose_event("x1", json!({}))).unwrap();

	assert!(connection.get_object("x1").is_none());
	assert!(root.base().child("x1").is_none());
	assert!(x1.is_disposed());
	assert!(!x1.was_collected());
}

#[tokio::test]
async fn test_initializer_references_resolve_to_registered_objects() {
	let connection = generic_connection(&["Context", "Page"]);

	connection.dispatch(create_event("", "Context", "context@1", json!({}))).unwrap();
	connection
		.dispatch(create_event(
			"context@1",
			"Page",
			"page@1",
			json!({"opener": {"guid": "context@1"}, "later": {"guid": "page@404"}}),
		))
		.unwrap();

	let page = connection.get_object("page@1").unwrap();
	let context = connection.get_object("context@1").unwrap();
	let opener = page.initializer().get("opener").and_then(ProtocolValue::as_remote).unwrap();
	assert!(std::ptr::addr_eq(Arc::as_ptr(opener), Arc::as_ptr(&context)));

	// Unknown ids stay plain data.
	let later = page.initializer().get("later").unwrap();
	assert_eq!(later.get("guid").and_then(ProtocolValue::as_str), Some("page@404"));
}

#[test]
fn test_create_under_unknown_parent_is_a_protocol_error() {
	let connection = generic_connection(&["X"]);
	let err = connection.dispatch(create_event("ghost@1", "X", "x1", json!({}))).unwrap_err();
	assert!(matches!(err, Error::ProtocolError(_)));
	assert!(connection.get_object("x1").is_none());
}

#[test]
fn test_create_with_duplicate_guid_is_rejected() {
	let connection = generic_connection(&["X"]);
	connection.dispatch(create_event("", "X", "x1", json!({}))).unwrap();
	let err = connection.dispatch(create_event("", "X", "x1", json!({}))).unwrap_err();
	assert!(matches!(err, Error::ProtocolError(_)));
}

#[test]
fn test_ignored_type_creates_no_proxy() {
	let connection = idle_connection();
	let mut registry = FactoryRegistry::new();
	registry.ignore("Selectors");
	connection.set_factory(Arc::new(registry));

	connection.dispatch(create_event("", "Selectors", "selectors@1", json!({}))).unwrap();
	assert!(connection.get_object("selectors@1").is_none());
}

#[test]
fn test_dispose_and_adopt_on_unknown_guid_are_no_ops() {
	let connection = idle_connection();
	assert!(connection.dispatch(dispose_event("gone@1", json!({}))).is_ok());
	let adopt = Message::Event(Event {
		guid: Arc::from("gone@1"),
		method: ADOPT_METHOD.to_string(),
		params: json!({"guid": "gone@2"}),
	});
	assert!(connection.dispatch(adopt).is_ok());
	let event = Message::Event(Event {
		guid: Arc::from("gone@1"),
		method: "console".to_string(),
		params: json!({}),
	});
	assert!(connection.dispatch(event).is_ok());
}

#[tokio::test]
async fn test_adopt_moves_child_between_parents() {
	let connection = generic_connection(&["Context", "Page"]);
	connection.dispatch(create_event("", "Context", "context@1", json!({}))).unwrap();
	connection.dispatch(create_event("", "Context", "context@2", json!({}))).unwrap();
	connection.dispatch(create_event("context@1", "Page", "page@1", json!({}))).unwrap();

	let adopt = Message::Event(Event {
		guid: Arc::from("context@2"),
		method: ADOPT_METHOD.to_string(),
		params: json!({"guid": "page@1"}),
	});
	connection.dispatch(adopt).unwrap();

	let first = connection.get_object("context@1").unwrap();
	let second = connection.get_object("context@2").unwrap();
	let page = connection.get_object("page@1").unwrap();
	assert!(first.base().child("page@1").is_none());
	assert!(second.base().child("page@1").is_some());
	assert_eq!(page.parent().unwrap().guid(), "context@2");

	// Disposal now follows the new owner.
	connection.dispatch(dispose_event("context@2", json!({}))).unwrap();
	assert!(connection.get_object("page@1").is_none());
	assert!(connection.get_object("context@1").is_some());
}

#[tokio::test]
async fn test_events_reach_the_addressed_emitter_with_references_resolved() {
	let connection = generic_connection(&["Page", "Frame"]);
	connection.dispatch(create_event("", "Page", "page@1", json!({}))).unwrap();
	connection.dispatch(create_event("page@1", "Frame", "frame@1", json!({}))).unwrap();

	let page = connection.get_object("page@1").unwrap();
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	page.emitter().on("frameattached", move |params| {
		let _ = tx.send(params);
	});

	let event = Message::Event(Event {
		guid: Arc::from("page@1"),
		method: "frameattached".to_string(),
		params: json!({"frame": {"guid": "frame@1"}}),
	});
	connection.dispatch(event).unwrap();

	let params = rx.recv().await.unwrap();
	let frame = params.get("frame").and_then(ProtocolValue::as_remote).unwrap();
	assert_eq!(frame.guid(), "frame@1");
	assert_eq!(frame.type_name(), "Frame");
}

#[tokio::test]
async fn test_concurrent_calls_receive_their_own_responses() {
	let (connection, mut engine) = running_connection(&[]);

	let foo = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "foo", ProtocolValue::Null).await }
	});
	let first = engine.recv().await;
	let bar = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "bar", ProtocolValue::Null).await }
	});
	let second = engine.recv().await;
	assert_eq!((first["id"].as_u64(), first["method"].as_str()), (Some(1), Some("foo")));
	assert_eq!((second["id"].as_u64(), second["method"].as_str()), (Some(2), Some("bar")));

	engine.send(json!({"id": 2, "result": {"value": "bar-result"}})).await;
	engine.send(json!({"id": 1, "result": {"value": "foo-result"}})).await;

	assert_eq!(bar.await.unwrap().unwrap().as_str(), Some("bar-result"));
	assert_eq!(foo.await.unwrap().unwrap().as_str(), Some("foo-result"));
	assert!(connection.callbacks.is_empty());
}

#[tokio::test]
async fn test_multi_key_results_are_returned_as_maps() {
	let (connection, mut engine) = running_connection(&[]);

	let call = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "info", ProtocolValue::Null).await }
	});
	let request = engine.recv().await;
	engine
		.send(json!({"id": request["id"], "result": {"a": 1, "b": 2}}))
		.await;

	let result = call.await.unwrap().unwrap();
	assert_eq!(result.as_map().map(|m| m.len()), Some(2));
	assert_eq!(result.get("b").and_then(ProtocolValue::as_i64), Some(2));
}

#[tokio::test]
async fn test_dropped_call_releases_its_slot() {
	let (connection, mut engine) = running_connection(&[]);

	let pending = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "slow", ProtocolValue::Null).await }
	});
	let _request = engine.recv().await;
	assert_eq!(connection.callbacks.len(), 1);

	pending.abort();
	let _ = pending.await;
	assert!(connection.callbacks.is_empty());
}

#[tokio::test]
async fn test_transport_close_fails_outstanding_calls() {
	let (connection, mut engine) = running_connection(&[]);

	let pending = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "never", ProtocolValue::Null).await }
	});
	let _request = engine.recv().await;
	let _stdin = engine.hang_up();

	let err = pending.await.unwrap().unwrap_err();
	assert!(matches!(err, Error::ConnectionClosed(_)), "{err:?}");
	assert!(connection.is_closed());

	let late = connection.send_call("", "after", ProtocolValue::Null).await.unwrap_err();
	assert!(matches!(late, Error::ConnectionClosed(_)));
}

#[tokio::test]
async fn test_unknown_type_shuts_the_connection_down() {
	let (connection, mut engine) = running_connection(&[]);

	let pending = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "pending", ProtocolValue::Null).await }
	});
	let _request = engine.recv().await;
	engine
		.send(json!({"guid": "", "method": "__create__", "params": {"type": "Mystery", "guid": "m@1", "initializer": {}}}))
		.await;

	let err = pending.await.unwrap().unwrap_err();
	assert!(err.to_string().contains("Unknown protocol object type: Mystery"), "{err}");
	assert!(connection.close_reason().unwrap().contains("Mystery"));
}

#[tokio::test]
async fn test_stop_runs_shutdown_callback_and_fails_pending() {
	let (connection, mut engine) = running_connection(&[]);
	let (tx, rx) = tokio::sync::oneshot::channel();
	connection.set_on_close(move || async move {
		let _ = tx.send(());
		Ok(())
	});

	let pending = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "pending", ProtocolValue::Null).await }
	});
	let _request = engine.recv().await;

	connection.stop().await.unwrap();
	rx.await.unwrap();

	let err = pending.await.unwrap().unwrap_err();
	assert!(err.to_string().contains("Connection stopped"), "{err}");
	assert!(connection.stop().await.is_ok());
}

#[tokio::test]
async fn test_wait_for_object_sees_later_create() {
	let (connection, mut engine) = running_connection(&["Page"]);

	let waiter = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move {
			connection
				.wait_for_object("page@7", Duration::from_secs(5))
				.await
				.map(|o| o.type_name().to_string())
		}
	});
	tokio::task::yield_now().await;

	engine
		.send(json!({"guid": "", "method": "__create__", "params": {"type": "Page", "guid": "page@7", "initializer": {}}}))
		.await;

	assert_eq!(waiter.await.unwrap().unwrap(), "Page");
}

#[tokio::test]
async fn test_no_reply_calls_do_not_register_slots() {
	let (connection, mut engine) = running_connection(&[]);

	connection.send_call_no_reply("", "ping", ProtocolValue::map([("n", 1i64)]));
	let request = engine.recv().await;
	assert_eq!(request["method"], "ping");
	assert_eq!(request["params"], json!({"n": 1}));
	assert!(connection.callbacks.is_empty());

	// A stray response for it is ignored.
	engine.send(json!({"id": request["id"], "result": {}})).await;
	let next = tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.send_call("", "next", ProtocolValue::Null).await }
	});
	let request = engine.recv().await;
	engine.send(json!({"id": request["id"], "result": {"ok": true}})).await;
	assert_eq!(next.await.unwrap().unwrap().as_bool(), Some(true));
}

#[tokio::test]
async fn test_send_return_as_map_keeps_the_whole_result() {
	let (connection, mut engine) = running_connection(&[]);
	let root = connection.root().unwrap();

	let call = tokio::spawn({
		let root = Arc::clone(&root);
		async move { root.channel().send_return_as_map("info", ProtocolValue::Null).await }
	});
	let request = engine.recv().await;
	engine.send(json!({"id": request["id"], "result": {"value": "bare"}})).await;

	let map = call.await.unwrap().unwrap();
	assert_eq!(map.len(), 1);
	assert_eq!(map.get("value").and_then(ProtocolValue::as_str), Some("bare"));

	let call = tokio::spawn({
		let root = Arc::clone(&root);
		async move { root.channel().send_return_as_map("info", ProtocolValue::Null).await }
	});
	let request = engine.recv().await;
	engine.send(json!({"id": request["id"]})).await;
	assert!(call.await.unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn test_send_return_as_map_rejects_scalar_results() {
	let (connection, mut engine) = running_connection(&[]);
	let root = connection.root().unwrap();

	let call = tokio::spawn({
		let root = Arc::clone(&root);
		async move { root.channel().send_return_as_map("count", ProtocolValue::Null).await }
	});
	let request = engine.recv().await;
	engine.send(json!({"id": request["id"], "result": 5})).await;

	let err = call.await.unwrap().unwrap_err();
	assert!(matches!(err, Error::ProtocolError(ref m) if m.contains("count")), "{err:?}");
}
