//! Chat server configuration file (`wsroom-chat.toml`).
//!
//! ```toml
//! listen = "127.0.0.1:9000"
//! room_name = "lobby"
//!
//! [connection]
//! max_message_size = 65536
//!
//! [room]
//! restricted_broadcast = false
//! ```
//!
//! Every key is optional.

use std::path::Path;

use serde::Deserialize;
use wsroom::{ConnectionConfig, RoomConfig};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Address the listener binds to.
    pub listen: String,
    /// Request path that upgrades to a WebSocket. Other paths get a plain greeting.
    pub ws_path: String,
    pub room_name: String,
    pub connection: ConnectionConfig,
    pub room: RoomConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            ws_path: "/ws".to_string(),
            room_name: "lobby".to_string(),
            connection: ConnectionConfig::default(),
            room: RoomConfig::default(),
        }
    }
}

impl ChatConfig {
    /// Read and parse a config file.
    pub fn from_file(path: &Path) -> Result<ChatConfig, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::from_str(&content)
    }

    /// Parse a config from a TOML string.
    pub fn from_str(content: &str) -> Result<ChatConfig, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
    }
}
