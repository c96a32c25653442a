use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::DEFAULT_NAME;
use super::DEFAULT_VOLUME_STEP;

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_volume_step() -> i64 {
    DEFAULT_VOLUME_STEP
}

fn default_scan_interval_secs() -> u64 {
    10
}

/// Configuration for the Xiaomi gateway radio integration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRadioConfig {
    /// Seconds between state polls of each gateway
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Persisted entries, keyed by entry id
    #[serde(default)]
    pub entries: HashMap<String, EntryData>,
}

impl GatewayRadioConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}

impl Default for GatewayRadioConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            entries: HashMap::new(),
        }
    }
}

/// One configured gateway
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EntryData {
    /// Gateway IP address or hostname
    pub host: String,

    /// 32 character hex miIO token
    pub token: String,

    /// Display name of the radio entity
    #[serde(default = "default_name")]
    pub name: String,

    /// Percent added or removed by a volume step
    #[serde(default = "default_volume_step")]
    pub volume_step: i64,
}
