//! Error types shared across labflash

pub mod types;

pub use types::*;
