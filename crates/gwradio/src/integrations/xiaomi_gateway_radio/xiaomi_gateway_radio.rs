use std::collections::BTreeMap;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use super::DOMAIN;
use super::GatewayRadioConfig;
use super::config::EntryData;
use super::config_flow;
use super::device::Connector;
use super::setup::LoadedEntries;
use super::setup::entity_id_for;
use super::setup::report_state;
use super::setup::setup_with_retry;
use crate::engine::EntryError;
use crate::engine::FlowError;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::MediaPlayerCommand;
use crate::engine::ToIntegrationMessage;

fn not_found(msg: String) -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, msg))
}

/// Xiaomi gateway FM radio integration
///
/// Owns every configured gateway entry. Entries come from the config file at
/// startup and from config flows at runtime; each loaded entry contributes
/// one media player entity.
pub struct GatewayRadioIntegration {
    scan_interval: std::time::Duration,
    connector: Option<Arc<dyn Connector>>,

    /// Every known entry, loaded or not, keyed by entry id
    records: BTreeMap<String, EntryData>,

    /// Entries whose setup succeeded
    entries: LoadedEntries,

    /// Setup attempts in flight (or finished), keyed by entry id
    setup_tasks: HashMap<String, JoinHandle<()>>,

    to_engine: Option<FromIntegrationSender>,
}

impl GatewayRadioIntegration {
    /// Create the integration; `connector` is `None` when no device transport is available
    pub fn new(config: &GatewayRadioConfig, connector: Option<Arc<dyn Connector>>) -> Self {
        Self {
            scan_interval: config.scan_interval(),
            connector,
            records: config
                .entries
                .iter()
                .map(|(id, data)| (id.clone(), data.clone()))
                .collect(),
            entries: LoadedEntries::default(),
            setup_tasks: HashMap::new(),
            to_engine: None,
        }
    }

    fn to_engine(&self) -> Result<&FromIntegrationSender, Box<dyn Error + Send>> {
        self.to_engine.as_ref().ok_or_else(|| -> Box<dyn Error + Send> {
            Box::new(std::io::Error::other("integration is not set up"))
        })
    }

    /// Start (or restart) setting up an entry in the background
    fn start_entry(&mut self, entry_id: &str) -> Result<(), Box<dyn Error + Send>> {
        let data = self
            .records
            .get(entry_id)
            .cloned()
            .ok_or_else(|| not_found(format!("Entry not found: {}", entry_id)))?;
        let to_engine = self.to_engine()?.clone();

        info!("[{}] Setting up Xiaomi Gateway Radio at {}", entry_id, data.host);
        let task = tokio::spawn(setup_with_retry(
            self.connector.clone(),
            self.entries.clone(),
            entry_id.to_string(),
            data,
            self.scan_interval,
            to_engine,
        ));

        if let Some(previous) = self.setup_tasks.insert(entry_id.to_string(), task) {
            previous.abort();
        }
        Ok(())
    }

    /// Run a media player command and report the resulting state
    async fn handle_command(
        &self,
        entity_id: &str,
        command: MediaPlayerCommand,
    ) -> Result<(), Box<dyn Error + Send>> {
        let entity = {
            let entries = self.entries.lock().await;
            entries
                .values()
                .find(|loaded| loaded.entity_id == entity_id)
                .map(|loaded| loaded.entity.clone())
        }
        .ok_or_else(|| not_found(format!("Media player not found: {}", entity_id)))?;

        let state = {
            let mut entity = entity.lock().await;
            let ok = match &command {
                MediaPlayerCommand::TurnOn => entity.turn_on().await,
                MediaPlayerCommand::TurnOff => entity.turn_off().await,
                MediaPlayerCommand::VolumeUp => entity.volume_up().await,
                MediaPlayerCommand::VolumeDown => entity.volume_down().await,
                MediaPlayerCommand::VolumeSet { volume_level } => {
                    entity.set_volume_level(volume_level).await
                }
                MediaPlayerCommand::VolumeMute { is_volume_muted } => {
                    entity.mute_volume(*is_volume_muted).await
                }
            };
            info!("{} {:?}: {}", entity_id, command, if ok { "ok" } else { "failed" });
            entity.state()
        };

        report_state(entity_id, state, self.to_engine()?).await;
        Ok(())
    }

    /// Create an entry from user input and set it up
    async fn handle_config_flow(
        &mut self,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        let created =
            config_flow::create_entry(self.connector.as_deref(), &self.records, input).await?;

        info!(
            "[{}] Created entry '{}' for {}",
            created.entry_id, created.result.title, created.data.host
        );
        self.records.insert(created.entry_id.clone(), created.data);
        if let Err(e) = self.start_entry(&created.entry_id) {
            warn!("[{}] Failed to start setup: {}", created.entry_id, e);
        }

        serde_json::to_value(&created.result).map_err(|e| FlowError::InvalidInput(e.to_string()))
    }

    /// Unload an entry and forget it
    ///
    /// If the entity cannot be torn down the loaded entry and its record are
    /// kept, so removing it again later can still find them.
    async fn remove_entry(&mut self, entry_id: &str) -> Result<(), EntryError> {
        if !self.records.contains_key(entry_id) {
            return Err(EntryError::NotFound(entry_id.to_string()));
        }

        if let Some(task) = self.setup_tasks.remove(entry_id) {
            task.abort();
            // Once joined, an interrupted setup can no longer announce the entity.
            let _ = task.await;
        }

        {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(entry_id) {
                Some(loaded) => {
                    let to_engine =
                        self.to_engine.as_ref().ok_or_else(|| EntryError::UnloadFailed {
                            entry_id: entry_id.to_string(),
                            reason: "integration is not set up".to_string(),
                        })?;

                    loaded
                        .unload(to_engine)
                        .await
                        .map_err(|reason| EntryError::UnloadFailed {
                            entry_id: entry_id.to_string(),
                            reason,
                        })?;
                    entries.remove(entry_id);
                }
                None => {
                    // Setup may have been interrupted after announcing the entity.
                    if let Some(to_engine) = &self.to_engine {
                        let msg = FromIntegrationMessage::EntityRemoved {
                            entity_id: entity_id_for(entry_id),
                        };
                        if let Err(e) = to_engine.send(msg).await {
                            warn!("[{}] Failed to send EntityRemoved message: {}", entry_id, e);
                        }
                    }
                }
            }
        }

        self.records.remove(entry_id);
        info!("[{}] Entry removed", entry_id);
        Ok(())
    }
}

#[async_trait]
impl Integration for GatewayRadioIntegration {
    fn name(&self) -> &str {
        DOMAIN
    }

    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), Box<dyn Error + Send>> {
        self.to_engine = Some(tx);

        if self.connector.is_none() {
            warn!("No device transport available; Xiaomi gateway entries cannot be set up");
        }

        let entry_ids: Vec<String> = self.records.keys().cloned().collect();
        for entry_id in entry_ids {
            self.start_entry(&entry_id)?;
        }

        info!(
            "Xiaomi Gateway Radio integration ready ({} entries)",
            self.records.len()
        );
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        match msg {
            ToIntegrationMessage::MediaPlayerCommand { entity_id, command } => {
                self.handle_command(&entity_id, command).await?;
            }
            ToIntegrationMessage::ConfigFlow { input, reply } => {
                let result = self.handle_config_flow(input).await;
                if reply.send(result).is_err() {
                    warn!("Config flow requester went away");
                }
            }
            ToIntegrationMessage::RemoveEntry { entry_id, reply } => {
                let result = self.remove_entry(&entry_id).await;
                if reply.send(result).is_err() {
                    warn!("Entry removal requester went away");
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        info!("Xiaomi Gateway Radio integration shutting down");

        for (_, task) in self.setup_tasks.drain() {
            task.abort();
        }
        // Dropping a loaded entry stops its refresh task.
        self.entries.lock().await.clear();
        Ok(())
    }
}
