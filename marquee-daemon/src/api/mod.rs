//! JSON-RPC API module for the marquee-daemon.
//!
//! This module exposes extension management and catalog queries to clients
//! over a JSON-RPC interface via TCP.

pub mod handlers;
pub mod server;

pub use handlers::{ApiImpl, MarqueeApiServer};
pub use server::start_server;
