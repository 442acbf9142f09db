use std::sync::Mutex;

use anyhow::{anyhow, Result};

pub const DEFAULT_BASE_PORT: u16 = 9000;

/// Hands out host ports for sandboxes. Ports are never given out twice in the
/// lifetime of the process, even after the sandbox using one is gone.
#[derive(Debug)]
pub struct PortAllocator {
    last_port: Mutex<u16>,
}

impl PortAllocator {
    /// The first port handed out is `base + 1`.
    pub fn new(base: u16) -> Self {
        Self {
            last_port: Mutex::new(base),
        }
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut last_port = self
            .last_port
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let port = last_port
            .checked_add(1)
            .ok_or_else(|| anyhow!("no host ports left to allocate"))?;
        *last_port = port;
        Ok(port)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT)
    }
}
