mod engine;
mod flow;
mod integration;
mod message;
pub mod state;

pub use engine::Engine;
pub use flow::EntryError;
pub use flow::FlowError;
pub use integration::FromIntegrationSender;
pub use integration::Integration;
pub use integration::IntegrationContext;
pub use integration::IntegrationFactoryResult;
pub use integration::REGISTRY as INTEGRATION_REGISTRY;
pub use message::FromIntegrationMessage;
pub use message::MediaPlayerCommand;
pub use message::ToIntegrationMessage;
pub use state::MediaPlayerFeature;
pub use state::MediaPlayerState;
pub use state::PowerState;
pub use state::State;
