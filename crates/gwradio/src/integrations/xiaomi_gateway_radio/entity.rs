//! FM radio media player entity.
//!
//! Each command is a single round trip to the gateway. A failed round trip
//! leaves power, volume and mute untouched and marks the entity unavailable;
//! the next successful command or poll makes it available again.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::debug;
use tracing::error;

use super::device::DeviceClient;
use super::device::DeviceInfo;
use crate::engine::MediaPlayerFeature;
use crate::engine::MediaPlayerState;
use crate::engine::PowerState;

/// Volume percent restored by unmuting
const UNMUTE_VOLUME: i64 = 10;

const SUPPORTED_FEATURES: [MediaPlayerFeature; 5] = [
    MediaPlayerFeature::TurnOn,
    MediaPlayerFeature::TurnOff,
    MediaPlayerFeature::VolumeSet,
    MediaPlayerFeature::VolumeStep,
    MediaPlayerFeature::VolumeMute,
];

/// Unique id of the radio of a gateway
pub fn unique_id(info: &DeviceInfo) -> String {
    format!("{}-{}-fm", info.model, info.mac_address)
}

/// Percent for a 0.0-1.0 level, rounding half to even
fn level_to_percent(level: f64) -> i64 {
    ((level * 100.0).round_ties_even() as i64).clamp(0, 100)
}

/// Accepts JSON numbers and numeric strings
fn parse_volume(value: &serde_json::Value) -> Option<f64> {
    let volume = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    volume.is_finite().then_some(volume)
}

pub struct RadioEntity {
    client: Box<dyn DeviceClient>,
    name: String,
    unique_id: String,
    info: DeviceInfo,

    power: PowerState,
    volume: f64,
    muted: bool,
    available: bool,
    volume_step: i64,
}

impl RadioEntity {
    pub fn new(
        client: Box<dyn DeviceClient>,
        name: String,
        info: DeviceInfo,
        volume_step: i64,
    ) -> Self {
        Self {
            client,
            name,
            unique_id: unique_id(&info),
            info,
            power: PowerState::Unknown,
            volume: 0.0,
            muted: false,
            available: true,
            volume_step: volume_step.clamp(1, 100),
        }
    }

    #[cfg(test)]
    pub fn power(&self) -> PowerState {
        self.power
    }

    #[cfg(test)]
    pub fn volume_level(&self) -> f64 {
        self.volume
    }

    #[cfg(test)]
    pub fn is_volume_muted(&self) -> bool {
        self.muted
    }

    #[cfg(test)]
    pub fn available(&self) -> bool {
        self.available
    }

    #[cfg(test)]
    pub fn volume_step(&self) -> i64 {
        self.volume_step
    }

    /// Snapshot reported to the engine
    pub fn state(&self) -> MediaPlayerState {
        let attributes = BTreeMap::from([
            ("model".to_string(), json!(self.info.model)),
            ("firmware_version".to_string(), json!(self.info.firmware_version)),
            ("hardware_version".to_string(), json!(self.info.hardware_version)),
            ("muted".to_string(), json!(self.muted)),
            ("volume_step".to_string(), json!(self.volume_step)),
        ]);

        MediaPlayerState {
            state: self.power,
            available: self.available,
            volume_level: self.volume,
            is_volume_muted: self.muted,
            supported_features: SUPPORTED_FEATURES.to_vec(),
            friendly_name: self.name.clone(),
            icon: Some("mdi:radio".to_string()),
            unique_id: Some(self.unique_id.clone()),
            attributes,
        }
    }

    /// Send one command; on failure log it and mark the entity unavailable
    async fn try_command(
        &mut self,
        failure: &str,
        method: &str,
        params: serde_json::Value,
    ) -> bool {
        match self.client.send(method, params).await {
            Ok(result) => {
                debug!("Response from Xiaomi Gateway Radio: {}", result);
                self.available = true;
                true
            }
            Err(e) => {
                error!("{}: {}", failure, e);
                self.available = false;
                false
            }
        }
    }

    pub async fn turn_on(&mut self) -> bool {
        let ok = self.try_command("Turn on failed", "play_fm", json!(["on"])).await;
        if ok {
            self.power = PowerState::On;
        }
        ok
    }

    pub async fn turn_off(&mut self) -> bool {
        let ok = self.try_command("Turn off failed", "play_fm", json!(["off"])).await;
        if ok {
            self.power = PowerState::Off;
        }
        ok
    }

    /// Send a volume percent and adopt it locally when the gateway accepts it
    async fn send_volume(&mut self, failure: &str, percent: i64) -> bool {
        let ok = self.try_command(failure, "set_fm_volume", json!([percent])).await;
        if ok {
            self.volume = percent as f64 / 100.0;
            self.muted = percent == 0;
        }
        ok
    }

    pub async fn volume_up(&mut self) -> bool {
        let percent = (level_to_percent(self.volume) + self.volume_step).clamp(0, 100);
        self.send_volume("Volume up failed", percent).await
    }

    pub async fn volume_down(&mut self) -> bool {
        let percent = (level_to_percent(self.volume) - self.volume_step).clamp(0, 100);
        self.send_volume("Volume down failed", percent).await
    }

    /// Set the volume from an unvalidated level; non-numeric input is ignored
    pub async fn set_volume_level(&mut self, volume: &serde_json::Value) -> bool {
        let Some(level) = parse_volume(volume) else {
            error!("Invalid volume value: {}", volume);
            return false;
        };

        let percent = level_to_percent(level);
        let ok = self
            .try_command("Setting volume failed", "set_fm_volume", json!([percent]))
            .await;
        if ok {
            self.volume = level.clamp(0.0, 1.0);
            self.muted = percent == 0;
        }
        ok
    }

    /// Muting sends 0%, unmuting always sends 10%
    pub async fn mute_volume(&mut self, mute: bool) -> bool {
        let percent = if mute { 0 } else { UNMUTE_VOLUME };
        let ok = self
            .try_command("Mute failed", "set_fm_volume", json!([percent]))
            .await;
        if ok {
            self.muted = mute;
            self.volume = percent as f64 / 100.0;
        }
        ok
    }

    /// Poll the gateway and reconcile local state
    pub async fn update(&mut self) -> bool {
        let props = match self.client.send("get_prop_fm", json!("")).await {
            Ok(serde_json::Value::Object(props)) => props,
            Ok(other) => {
                self.available = false;
                error!("Error while fetching state: unexpected FM properties {}", other);
                return false;
            }
            Err(e) => {
                self.available = false;
                error!("Error while fetching state: {}", e);
                return false;
            }
        };

        if let Some(volume) = props.get("current_volume").and_then(|v| v.as_f64()) {
            self.volume = (volume / 100.0).clamp(0.0, 1.0);
            self.muted = self.volume == 0.0;
        }

        self.power = match props.get("current_status").and_then(|v| v.as_str()) {
            Some("pause") => PowerState::Off,
            Some("run") => PowerState::On,
            _ => PowerState::Unknown,
        };

        self.available = true;
        true
    }
}
