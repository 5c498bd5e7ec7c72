use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

pub const DEFAULT_HUB_ID: &str = "background";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;
pub const DEV_TOOLING_CHANNEL: &str = "@crx/client";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub hub_id: String,
    pub reconnect_delay_ms: u64,
    pub ignored_channels: Vec<String>,
    pub event_capacity: usize,
    pub log_filter: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            hub_id: DEFAULT_HUB_ID.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            ignored_channels: vec![DEV_TOOLING_CHANNEL.to_string()],
            event_capacity: 64,
            log_filter: "info,extension_bus=info".to_string(),
        }
    }
}

impl BusConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| BusError::Config(e.to_string()))?;
        let config: BusConfig =
            serde_json::from_str(&content).map_err(|e| BusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hub_id.trim().is_empty() {
            return Err(BusError::Config("hub_id must not be empty".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(BusError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn is_ignored_channel(&self, name: &str) -> bool {
        self.ignored_channels.iter().any(|ignored| ignored == name)
    }
}
