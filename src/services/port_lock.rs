//! Single-owner discipline for serial ports

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::port_registry::alternate_port;
use crate::errors::{LabError, Result};

/// Registry of ports currently owned by a flash, backup, restore or probe
#[derive(Debug, Clone, Default)]
pub struct PortLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PortLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive ownership of `port`; fails immediately with `PortBusy`
    /// if it (or its cu/tty sibling) is already owned
    pub fn acquire(&self, port: &str) -> Result<PortLease> {
        let key = lock_key(port);
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            log::warn!("🔒 Port {} is already in use", port);
            return Err(LabError::PortBusy {
                port: port.to_string(),
            });
        }
        log::debug!("🔓 Acquired port {}", port);
        Ok(PortLease {
            held: self.held.clone(),
            key,
        })
    }

    pub fn is_held(&self, port: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(&lock_key(port))
    }
}

/// Ownership of one port, released on drop
#[derive(Debug)]
pub struct PortLease {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl PortLease {
    pub fn port(&self) -> &str {
        &self.key
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
        log::debug!("Released port {}", self.key);
    }
}

/// macOS exposes each USB serial device as both `cu.*` and `tty.*`; both
/// names share the `cu.*` key
pub fn lock_key(port: &str) -> String {
    let trimmed = port.trim();
    let is_tty_alias = std::path::Path::new(trimmed)
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with("tty."));
    match alternate_port(trimmed) {
        Some(alt) if is_tty_alias => alt,
        _ => trimmed.to_string(),
    }
}
