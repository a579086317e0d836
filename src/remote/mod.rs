//! Client side of the labflash server API

pub mod client;

pub use client::*;
