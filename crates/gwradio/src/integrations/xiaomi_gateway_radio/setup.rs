//! Entry setup and teardown.
//!
//! Setting up an entry opens one device session, reads the identity, builds
//! the radio entity, announces it to the engine and starts the entry's refresh
//! task. That task is the only thing polling the gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::config::EntryData;
use super::device::Connector;
use super::device::DeviceError;
use super::entity::RadioEntity;
use super::DOMAIN;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::MediaPlayerState;

/// Loaded entries keyed by entry id
pub type LoadedEntries = Arc<Mutex<HashMap<String, LoadedEntry>>>;

#[derive(Debug, Error)]
pub enum SetupError {
    /// No device transport compiled in; retrying cannot help
    #[error("device transport not available")]
    DependencyMissing,

    /// The gateway did not answer the identity query
    #[error("unable to connect to Xiaomi Gateway Radio at {host}: {source}")]
    NotReady {
        host: String,
        #[source]
        source: DeviceError,
    },
}

/// Runtime record of a set up entry
pub struct LoadedEntry {
    pub entity_id: String,
    pub entity: Arc<Mutex<RadioEntity>>,
    refresh_task: JoinHandle<()>,
}

impl LoadedEntry {
    /// Stop polling and remove the entity from the engine
    ///
    /// Fails when the engine can no longer be told; the caller keeps the
    /// record in that case so the unload can be retried.
    pub async fn unload(&mut self, to_engine: &FromIntegrationSender) -> Result<(), String> {
        self.refresh_task.abort();

        let msg = FromIntegrationMessage::EntityRemoved {
            entity_id: self.entity_id.clone(),
        };
        to_engine.send(msg).await.map_err(|e| e.to_string())?;
        info!("Unloaded {}", self.entity_id);
        Ok(())
    }
}

impl Drop for LoadedEntry {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

pub fn entity_id_for(entry_id: &str) -> String {
    format!("media_player.{}", entry_id)
}

/// Report a media player state change to the engine
///
/// Returns false once the engine has gone away.
pub async fn report_state(
    entity_id: &str,
    state: MediaPlayerState,
    to_engine: &FromIntegrationSender,
) -> bool {
    let msg = FromIntegrationMessage::MediaPlayerStateChanged {
        entity_id: entity_id.to_string(),
        state,
    };
    if let Err(e) = to_engine.send(msg).await {
        warn!("Failed to send MediaPlayerStateChanged message: {}", e);
        return false;
    }
    true
}

fn spawn_refresh(
    entity: Arc<Mutex<RadioEntity>>,
    entity_id: String,
    scan_interval: Duration,
    to_engine: FromIntegrationSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let state = {
                let mut entity = entity.lock().await;
                entity.update().await;
                entity.state()
            };
            if !report_state(&entity_id, state, &to_engine).await {
                break;
            }
        }
    })
}

/// Set up one entry
pub async fn setup_entry(
    connector: Option<&dyn Connector>,
    entry_id: &str,
    data: &EntryData,
    scan_interval: Duration,
    to_engine: &FromIntegrationSender,
) -> Result<LoadedEntry, SetupError> {
    let connector = connector.ok_or(SetupError::DependencyMissing)?;

    let not_ready = |source| SetupError::NotReady {
        host: data.host.clone(),
        source,
    };
    let mut client = connector
        .connect(&data.host, &data.token)
        .await
        .map_err(not_ready)?;
    let info = client.info().await.map_err(not_ready)?;

    info!(
        "Connected to Xiaomi Gateway Radio {} (fw: {}, hw: {})",
        info.model, info.firmware_version, info.hardware_version
    );

    let entity_id = entity_id_for(entry_id);
    let entity = RadioEntity::new(client, data.name.clone(), info, data.volume_step);

    let msg = FromIntegrationMessage::EntityDiscovered {
        entity_id: entity_id.clone(),
        integration_name: DOMAIN.to_string(),
    };
    if let Err(e) = to_engine.send(msg).await {
        warn!("Failed to send EntityDiscovered message: {}", e);
    } else {
        info!("Registered entity: {}", entity_id);
    }

    let entity = Arc::new(Mutex::new(entity));
    let refresh_task = spawn_refresh(
        entity.clone(),
        entity_id.clone(),
        scan_interval,
        to_engine.clone(),
    );

    Ok(LoadedEntry {
        entity_id,
        entity,
        refresh_task,
    })
}

/// Delay before setup attempt `attempt + 1`
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(5 * 2u64.pow(attempt.min(4)))
}

/// Set up an entry, retrying while the gateway is not ready
pub async fn setup_with_retry(
    connector: Option<Arc<dyn Connector>>,
    entries: LoadedEntries,
    entry_id: String,
    data: EntryData,
    scan_interval: Duration,
    to_engine: FromIntegrationSender,
) {
    let mut attempt = 0;
    loop {
        let result = setup_entry(
            connector.as_deref(),
            &entry_id,
            &data,
            scan_interval,
            &to_engine,
        )
        .await;

        match result {
            Ok(loaded) => {
                entries.lock().await.insert(entry_id, loaded);
                return;
            }
            Err(SetupError::DependencyMissing) => {
                error!(
                    "[{}] Setup failed: {}",
                    entry_id,
                    SetupError::DependencyMissing
                );
                return;
            }
            Err(e) => {
                let delay = retry_delay(attempt);
                warn!("[{}] {}; retrying in {:?}", entry_id, e, delay);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::PowerState;
    use crate::integrations::xiaomi_gateway_radio::device::MockConnector;

    fn kitchen() -> EntryData {
        EntryData {
            host: "192.168.1.20".to_string(),
            token: "0123456789abcdef0123456789abcdef".to_string(),
            name: "Kitchen Radio".to_string(),
            volume_step: 5,
        }
    }

    #[test]
    fn test_retry_delays() {
        let delays: Vec<u64> = (0..6).map(|n| retry_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 80]);
    }

    #[tokio::test]
    async fn test_setup_registers_entity_and_polls() {
        let connector = MockConnector::new();
        connector
            .client
            .push_response(json!({"current_volume": 35, "current_status": "run"}));
        let (tx, mut rx) = mpsc::channel(16);

        let loaded = setup_entry(
            Some(&connector),
            "kitchen",
            &kitchen(),
            Duration::from_secs(60),
            &tx,
        )
        .await
        .unwrap();

        assert_eq!(loaded.entity_id, "media_player.kitchen");
        assert_eq!(
            loaded.entity.lock().await.state().attributes["model"],
            "lumi.gateway.v3"
        );

        match rx.recv().await.unwrap() {
            FromIntegrationMessage::EntityDiscovered {
                entity_id,
                integration_name,
            } => {
                assert_eq!(entity_id, "media_player.kitchen");
                assert_eq!(integration_name, "xiaomi_gateway_radio");
            }
            other => panic!("unexpected message {:?}", other),
        }

        match rx.recv().await.unwrap() {
            FromIntegrationMessage::MediaPlayerStateChanged { entity_id, state } => {
                assert_eq!(entity_id, "media_player.kitchen");
                assert_eq!(state.state, PowerState::On);
                assert_eq!(state.volume_level, 0.35);
                assert!(state.available);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_setup_without_transport_fails_fast() {
        let (tx, _rx) = mpsc::channel(16);
        let result = setup_entry(None, "kitchen", &kitchen(), Duration::from_secs(60), &tx).await;
        assert!(matches!(result, Err(SetupError::DependencyMissing)));
    }

    #[tokio::test]
    async fn test_setup_identity_failure_is_not_ready() {
        let connector = MockConnector::new();
        connector.client.set_info_fails(true);
        let (tx, _rx) = mpsc::channel(16);

        let result = setup_entry(
            Some(&connector),
            "kitchen",
            &kitchen(),
            Duration::from_secs(60),
            &tx,
        )
        .await;
        match result {
            Err(SetupError::NotReady { host, .. }) => assert_eq!(host, "192.168.1.20"),
            _ => panic!("expected NotReady"),
        }
    }

    #[tokio::test]
    async fn test_unload_reports_removal() {
        let connector = MockConnector::new();
        let (tx, mut rx) = mpsc::channel(16);
        let mut loaded = setup_entry(
            Some(&connector),
            "kitchen",
            &kitchen(),
            Duration::from_secs(60),
            &tx,
        )
        .await
        .unwrap();

        loaded.unload(&tx).await.unwrap();

        let mut removed = false;
        while let Ok(msg) = rx.try_recv() {
            if let FromIntegrationMessage::EntityRemoved { entity_id } = msg {
                assert_eq!(entity_id, "media_player.kitchen");
                removed = true;
            }
        }
        assert!(removed);
    }

    #[tokio::test]
    async fn test_unload_fails_when_engine_gone() {
        let connector = MockConnector::new();
        let (tx, rx) = mpsc::channel(16);
        let mut loaded = setup_entry(
            Some(&connector),
            "kitchen",
            &kitchen(),
            Duration::from_secs(60),
            &tx,
        )
        .await
        .unwrap();

        drop(rx);
        assert!(loaded.unload(&tx).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_retries_until_ready() {
        let connector = MockConnector::new();
        connector.client.set_info_fails(true);
        let (tx, _rx) = mpsc::channel(64);
        let entries: LoadedEntries = Arc::default();

        tokio::spawn(setup_with_retry(
            Some(Arc::new(connector.clone())),
            entries.clone(),
            "kitchen".to_string(),
            kitchen(),
            Duration::from_secs(60),
            tx,
        ));

        while connector.connects().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(entries.lock().await.is_empty());
        connector.client.set_info_fails(false);

        for _ in 0..30 {
            if entries.lock().await.contains_key("kitchen") {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(entries.lock().await.contains_key("kitchen"));
        assert_eq!(connector.connects().len(), 2);
    }
}
