//! Command line driver for remora engines.
//!
//! Starts (or connects to) an engine, performs one call or waits for one
//! event on a remote object, prints the result as JSON and shuts the engine
//! down again.

pub mod cli;
pub mod commands;
pub mod logging;
pub mod session;
pub mod styles;
