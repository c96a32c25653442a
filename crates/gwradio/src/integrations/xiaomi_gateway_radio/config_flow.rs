//! User config flow: turns host/token input into a new entry.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use tracing::error;
use tracing::info;

use super::DEFAULT_NAME;
use super::DEFAULT_VOLUME_STEP;
use super::config::EntryData;
use super::device::Connector;
use super::device::DeviceInfo;
use crate::engine::FlowError;

/// Form fields of the user step
#[derive(Debug, Clone, Deserialize)]
pub struct FlowInput {
    pub host: String,
    pub token: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub volume_step: Option<i64>,
}

/// What the flow reports back for a created entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowResult {
    pub entry_id: String,
    pub title: String,
    pub model: String,
    pub firmware: String,
    pub hardware: String,
}

/// A validated entry, ready to be stored and set up
#[derive(Debug, Clone)]
pub struct CreatedEntry {
    pub entry_id: String,
    pub data: EntryData,
    pub result: FlowResult,
}

/// Connect once and read the device identity
async fn validate_input(
    connector: Option<&dyn Connector>,
    input: &FlowInput,
) -> Result<DeviceInfo, FlowError> {
    let Some(connector) = connector else {
        error!("Error validating Xiaomi Gateway Radio: device transport not available");
        return Err(FlowError::CannotConnect);
    };

    let mut client = connector
        .connect(&input.host, &input.token)
        .await
        .map_err(|e| {
            error!("Error validating Xiaomi Gateway Radio: {}", e);
            FlowError::CannotConnect
        })?;

    client.info().await.map_err(|e| {
        error!("Error validating Xiaomi Gateway Radio: {}", e);
        FlowError::CannotConnect
    })
}

/// Entry id derived from the host, made unique among `existing`
fn entry_id_for(host: &str, existing: &BTreeMap<String, EntryData>) -> String {
    let slug: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    let mut candidate = slug.clone();
    let mut n = 2;
    while existing.contains_key(&candidate) {
        candidate = format!("{}_{}", slug, n);
        n += 1;
    }
    candidate
}

/// Run the user step against the current entries
///
/// A host that already has an entry is rejected before any device traffic.
pub async fn create_entry(
    connector: Option<&dyn Connector>,
    existing: &BTreeMap<String, EntryData>,
    input: serde_json::Value,
) -> Result<CreatedEntry, FlowError> {
    let input: FlowInput =
        serde_json::from_value(input).map_err(|e| FlowError::InvalidInput(e.to_string()))?;

    if existing.values().any(|entry| entry.host == input.host) {
        info!("Xiaomi Gateway Radio at {} is already configured", input.host);
        return Err(FlowError::AlreadyConfigured);
    }

    let info = validate_input(connector, &input).await?;

    let title = input
        .name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_NAME.to_string());
    let entry_id = entry_id_for(&input.host, existing);

    Ok(CreatedEntry {
        data: EntryData {
            host: input.host,
            token: input.token,
            name: title.clone(),
            volume_step: input.volume_step.unwrap_or(DEFAULT_VOLUME_STEP),
        },
        result: FlowResult {
            entry_id: entry_id.clone(),
            title,
            model: info.model,
            firmware: info.firmware_version,
            hardware: info.hardware_version,
        },
        entry_id,
    })
}
