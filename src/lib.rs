//! Transfergate - A connection broker that starts per-identifier backends on demand
//!
//! This library provides a broker that:
//! - Parses the address a client connected with into a fixed route or an identifier
//! - Starts the backend for an identifier the first time a client asks for it
//! - Serializes starts per identifier so concurrent clients share one start
//! - Redirects the client to the backend's host and port
//! - Stops backends that have seen no clients for a configurable window
//! - Runs backends as Docker containers or native processes

pub mod activity;
pub mod address;
pub mod admin;
pub mod artifacts;
pub mod config;
pub mod docker;
pub mod driver;
pub mod error;
pub mod listener;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod session;
