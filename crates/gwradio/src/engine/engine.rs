use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::flow::EntryError;
use super::flow::FlowError;
use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::ToIntegrationSender;
use super::message::FromIntegrationMessage;
use super::message::MediaPlayerCommand;
use super::message::ToIntegrationMessage;
use super::state::State;
use crate::engine::IntegrationContext;

/// gwradio engine
///
/// This structure routes commands to the integration owning an entity, forwards
/// entry management requests by domain, and maintains a view of the world with
/// State.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: ArcSwap<State>,

    /// Map of entity_id -> integration name for routing messages
    entity_integration_map: std::sync::Mutex<HashMap<String, String>>,

    /// Communication channels to integrations (for commands)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// Handles for integration tasks
    integration_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

fn boxed_error(kind: std::io::ErrorKind, msg: String) -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(kind, msg))
}

impl Engine {
    /// Create a new Engine instance
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        Self {
            state: ArcSwap::new(Arc::default()),
            entity_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            integration_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register integrations from configuration
    ///
    /// Every factory in the integration registry is offered the config; those
    /// whose section is present return an integration, which is registered.
    pub fn register_integrations_from_config(&mut self, cfg: &crate::config::Config) {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integration = match constr(&ctx) {
                Ok(Some(i)) => i,
                Err(e) => {
                    error!("failed to setup integration: {:#}", e);
                    continue;
                }
                Ok(None) => continue,
            };
            let name = integration.name().to_string();
            self.register_integration(name, integration);
        }
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub fn register_integration(&mut self, name: String, mut integration: Box<dyn Integration>) {
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        self.integration_channels
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), to_integration_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = integration.setup(from_integration_tx).await {
                warn!("Integration '{}' setup failed: {}", name, e);
                return;
            }

            while let Some(msg) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_message(msg).await {
                    warn!("Integration '{}' failed to handle message: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("Integration '{}' shutdown failed: {}", name, e);
            }
        });

        self.integration_handles
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Names of the registered integrations
    pub fn integration_names(&self) -> Vec<String> {
        match self.integration_channels.lock() {
            Ok(channels) => channels.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Send a message to an integration by name
    fn send_to_integration(
        &self,
        integration_name: &str,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        let channels = self
            .integration_channels
            .lock()
            .map_err(|e| boxed_error(std::io::ErrorKind::Other, e.to_string()))?;

        let tx = channels.get(integration_name).ok_or_else(|| {
            boxed_error(
                std::io::ErrorKind::NotFound,
                format!("Integration channel not found: {}", integration_name),
            )
        })?;

        tx.send(msg)
            .map_err(|e| -> Box<dyn Error + Send> { Box::new(e) })
    }

    /// Send a command to an integration
    ///
    /// Routes the command to the appropriate integration based on entity_id.
    pub fn send_command(&self, msg: ToIntegrationMessage) -> Result<(), Box<dyn Error + Send>> {
        let entity_id = match &msg {
            ToIntegrationMessage::MediaPlayerCommand { entity_id, .. } => entity_id.clone(),
            ToIntegrationMessage::ConfigFlow { .. } | ToIntegrationMessage::RemoveEntry { .. } => {
                return Err(boxed_error(
                    std::io::ErrorKind::InvalidInput,
                    "entry messages are routed by domain, not by entity".to_string(),
                ));
            }
        };

        // Route to the integration that owns this entity
        let integration_name = {
            let map = self
                .entity_integration_map
                .lock()
                .map_err(|e| boxed_error(std::io::ErrorKind::Other, e.to_string()))?;

            map.get(&entity_id).cloned().ok_or_else(|| {
                boxed_error(
                    std::io::ErrorKind::NotFound,
                    format!("No integration found for entity: {}", entity_id),
                )
            })?
        };

        self.send_to_integration(&integration_name, msg)
    }

    /// Send a command to a media player entity
    pub fn send_media_player_command(
        &self,
        entity_id: String,
        command: MediaPlayerCommand,
    ) -> Result<(), Box<dyn Error + Send>> {
        self.send_command(ToIntegrationMessage::MediaPlayerCommand { entity_id, command })
    }

    /// Submit user input to an integration's config flow and wait for the result
    pub async fn start_config_flow(
        &self,
        domain: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        let (reply, rx) = oneshot::channel();
        self.send_to_integration(domain, ToIntegrationMessage::ConfigFlow { input, reply })
            .map_err(|_| FlowError::UnknownDomain(domain.to_string()))?;

        rx.await
            .map_err(|_| FlowError::UnknownDomain(domain.to_string()))?
    }

    /// Ask an integration to unload and forget one of its entries
    pub async fn remove_entry(&self, domain: &str, entry_id: &str) -> Result<(), EntryError> {
        let (reply, rx) = oneshot::channel();
        let msg = ToIntegrationMessage::RemoveEntry {
            entry_id: entry_id.to_string(),
            reply,
        };
        self.send_to_integration(domain, msg)
            .map_err(|_| EntryError::UnknownDomain(domain.to_string()))?;

        rx.await
            .map_err(|_| EntryError::UnknownDomain(domain.to_string()))?
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming events from integrations and updates state.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send>> {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_event(msg);
        }

        info!("Engine shutting down");
        Ok(())
    }

    /// Close all integration channels and wait for the integrations to shut down
    pub async fn shutdown(&self) {
        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.clear();
        }

        let handles = match self.integration_handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Integration task ended abnormally: {}", e);
            }
        }
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Handle an event from an integration
    fn handle_event(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::EntityDiscovered {
                entity_id,
                integration_name,
            } => {
                info!(
                    "Entity discovered: {} (from {})",
                    entity_id, integration_name
                );

                // State is not populated until the first state-change message arrives.
                if let Ok(mut map) = self.entity_integration_map.lock() {
                    map.insert(entity_id, integration_name);
                }
            }
            FromIntegrationMessage::EntityRemoved { entity_id } => {
                info!("Entity removed: {}", entity_id);

                {
                    let mut state = State::clone(&self.state.load());
                    state.media_players.remove(&entity_id);
                    self.state.store(Arc::new(state));
                }

                if let Ok(mut map) = self.entity_integration_map.lock() {
                    map.remove(&entity_id);
                }
            }
            FromIntegrationMessage::MediaPlayerStateChanged { entity_id, state } => {
                debug!(
                    "Media player state changed: {} -> state={}, available={}, volume={}, muted={}",
                    entity_id,
                    state.state,
                    state.available,
                    state.volume_level,
                    state.is_volume_muted
                );

                let mut snapshot = State::clone(&self.state.load());
                snapshot.media_players.insert(entity_id, state);
                self.state.store(Arc::new(snapshot));
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
