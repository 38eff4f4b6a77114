//! Connection and room configuration.
//!
//! Both structs deserialize from any serde format with every field optional,
//! so a config file only needs to mention what it overrides.

use std::time::Duration;

use serde::Deserialize;

/// Default ceiling on a reassembled message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest message (sum of all fragments) accepted before closing with 1009.
    pub max_message_size: usize,
    /// How long `close()` waits for the peer's close frame, in milliseconds.
    pub close_timeout_ms: u64,
    /// Size of each read from the underlying stream.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            close_timeout_ms: 5_000,
            read_buffer_size: 4096,
        }
    }
}

impl ConnectionConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Per-room settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Abort a broadcast at the first failed write and return the error.
    pub restricted_broadcast: bool,
    /// Bound of the event queue; submitters block when it is full.
    pub event_queue_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            restricted_broadcast: false,
            event_queue_capacity: 64,
        }
    }
}
