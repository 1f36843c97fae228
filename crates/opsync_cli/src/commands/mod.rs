//! CLI command implementations.

pub mod compact;
pub mod inspect;
pub mod list;
pub mod requeue;
pub mod verify;

use opsync_core::{DurableQueue, QueueConfig};
use std::path::Path;

/// Opens an existing queue directory.
pub fn open_existing(path: &Path) -> Result<DurableQueue, Box<dyn std::error::Error>> {
    if !path.join("queue.log").exists() {
        return Err(format!("No queue found at {:?}", path).into());
    }
    Ok(DurableQueue::open(path, QueueConfig::new().create_if_missing(false))?)
}
