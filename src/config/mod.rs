//! Configuration management for labflash

pub mod app_config;
pub mod catalog;

pub use app_config::*;
pub use catalog::*;
