//! Utility functions and helpers used throughout labflash

pub mod esptool_utils;
pub mod logging;
