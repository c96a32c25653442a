use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// Reported power state of a media player.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

/// Capabilities a media player entity advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MediaPlayerFeature {
    TurnOn,
    TurnOff,
    VolumeSet,
    VolumeStep,
    VolumeMute,
}

/// State of a media player entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaPlayerState {
    pub state: PowerState,

    /// False after any failed device interaction, until the next success.
    pub available: bool,

    /// Volume level (0.0-1.0).
    pub volume_level: f64,

    pub is_volume_muted: bool,

    pub supported_features: Vec<MediaPlayerFeature>,

    pub friendly_name: String,

    pub icon: Option<String>,

    pub unique_id: Option<String>,

    /// Read-only auxiliary attributes (model, firmware, ...).
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Centralized snapshot of the entire engine state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub media_players: HashMap<String, MediaPlayerState>,
}
