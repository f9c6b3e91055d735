//! Shared building blocks for the Hearth command server.
//!
//! This crate carries everything both sides of the wire agree on: the framed
//! channel protocol, the structured message encoding, the config/mtime hash
//! state that decides server staleness, socket addressing, configuration
//! loading and logging setup. The daemon (`hearthd`), the session worker
//! (`hearth-wkr`) and the fast client (`hearth`) all build on these types.

pub mod address;
pub mod client;
pub mod config;
pub mod errors;
pub mod hashstate;
pub mod logging;
pub mod message;
pub mod protocol;

pub use address::{default_base_address, hash_address};
pub use config::{Config, ConfigError, LoadOptions};
pub use errors::ProtocolError;
pub use hashstate::{HashState, Instruction, ServerHandoff, HANDOFF_ENV};
pub use logging::{init_logging, LogConfig, LogGuards};
pub use protocol::channel;
