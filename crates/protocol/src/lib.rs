//! Wire types for the remora engine protocol.
//!
//! This crate contains the serde-serializable shapes exchanged with the
//! automation engine. Each frame on the wire is exactly one [`Message`]:
//! a call going out, a response coming back, or an event/control message
//! pushed by the engine.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **Identifier-agnostic**: object references stay raw `{"guid": ...}` maps here;
//!   resolving them into live proxies is the runtime's job
//! - **Stable**: Changes only when the wire protocol changes

pub mod message;

pub use message::*;
