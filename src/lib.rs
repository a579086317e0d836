//! labflash - Device Firmware Lifecycle Orchestrator
//!
//! Discovers serial ports and candidate devices, resolves a device x firmware
//! x env x patch build matrix into a single target, runs time-bounded builds
//! with an optional chained flash, and performs backup, restore and flash
//! transfers over exclusively owned serial ports. Also provides the decoder
//! for the newline-delimited `data: {json}` streaming protocol.

pub mod cli;
pub mod config;
pub mod errors;
pub mod models;
pub mod remote;
pub mod server;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use errors::*;
pub use models::*;

/// labflash version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// labflash application name
pub const APP_NAME: &str = "labflash";
