//! Remora runtime - connection, object registry and waiting primitives
//!
//! Client side of an object-oriented RPC protocol spoken with an engine
//! process:
//!
//! - **Transport**: length-prefixed JSON frames over stdio pipes, or one frame
//!   per WebSocket message
//! - **Connection**: call correlation, `__create__`/`__dispose__`/`__adopt__`
//!   handling and event routing
//! - **Object registry**: the tree of remote object proxies, keyed by guid
//! - **Events**: per-object emitters and the [`Waiter`] for "first of"
//!   event/timeout races
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ typed proxies│  implement ChannelOwner, built by an ObjectFactory
//! └──────┬───────┘
//! ┌──────▼───────┐
//! │ remora-      │
//! │ runtime      │
//! │  ┌────────┐  │
//! │  │ Conn   │  │  id correlation, registry, dispatch
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Trans  │  │  pipe / WebSocket / JsonPipe
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Engine │  │  process management
//! │  └────────┘  │
//! └──────────────┘
//! ```
//!
//! The `Connection` builds proxies through the [`ObjectFactory`] trait, so the
//! runtime does not depend on any concrete proxy types.

pub mod channel;
pub mod channel_owner;
pub mod connection;
pub mod engine;
pub mod error;
pub mod event_emitter;
pub mod json_pipe;
pub mod object_factory;
pub mod transport;
pub mod value;
pub mod waiter;

#[cfg(test)]
mod test_support;

pub use channel::Channel;
pub use channel_owner::{
	ChannelOwner, ChannelOwnerImpl, DisposeReason, ParentOrConnection, ROOT_GUID, RootObject, adopt,
};
pub use connection::{AsyncChannelOwnerResult, Connection, ConnectionLike, ObjectStore};
pub use engine::{EngineCommand, EngineProcess, launch_connection};
pub use error::{Error, Result};
pub use event_emitter::{EventEmitter, ListenerId, Subscription};
pub use json_pipe::{JSON_PIPE_TYPE, JsonPipe};
pub use object_factory::{Constructor, FactoryRegistry, GenericObject, ObjectFactory};
pub use remora_protocol::{ErrorPayload, Event, Message, Metadata, Request, Response};
pub use transport::{
	CloseHandle, PipeTransport, PipeTransportReceiver, PipeTransportSender, Transport, TransportParts,
	TransportReceiver, WebSocketTransport, WebSocketTransportReceiver, WebSocketTransportSender,
};
pub use value::{ProtocolValue, ValueMap};
pub use waiter::Waiter;
