//! Type-safe message system for gwradio
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Commands from the engine to integrations

use tokio::sync::oneshot;

use super::flow::EntryError;
use super::flow::FlowError;
use super::state::MediaPlayerState;

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug, Clone)]
pub enum FromIntegrationMessage {
    /// An entity was discovered and registered
    EntityDiscovered {
        entity_id: String,
        integration_name: String,
    },

    /// An entity was removed (entry unloaded, etc.)
    EntityRemoved { entity_id: String },

    /// A media player's state changed
    MediaPlayerStateChanged {
        entity_id: String,
        state: MediaPlayerState,
    },
}

/// A command for a media player entity.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaPlayerCommand {
    TurnOn,
    TurnOff,
    VolumeUp,
    VolumeDown,
    /// The level is passed through unparsed; the entity validates it.
    VolumeSet { volume_level: serde_json::Value },
    VolumeMute { is_volume_muted: bool },
}

/// Reply channel for a config flow submission.
pub type FlowReply = oneshot::Sender<Result<serde_json::Value, FlowError>>;

/// Reply channel for an entry removal.
pub type EntryReply = oneshot::Sender<Result<(), EntryError>>;

/// Messages FROM the engine TO integrations (commands)
#[derive(Debug)]
pub enum ToIntegrationMessage {
    /// Command to a media player entity
    MediaPlayerCommand {
        entity_id: String,
        command: MediaPlayerCommand,
    },

    /// Create a new configuration entry from user input
    ConfigFlow {
        input: serde_json::Value,
        reply: FlowReply,
    },

    /// Unload and forget a configuration entry
    RemoveEntry { entry_id: String, reply: EntryReply },
}
