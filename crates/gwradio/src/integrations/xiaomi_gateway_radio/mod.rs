//! FM radio of Xiaomi gateways, controlled over the local miIO protocol.

mod config;
mod config_flow;
pub mod device;
mod entity;
#[cfg(feature = "miio")]
mod miio;
mod setup;
// Private module - allowed by clippy.toml allow-private-module-inception
#[allow(clippy::module_inception)]
mod xiaomi_gateway_radio;

#[cfg(test)]
pub use config::EntryData;
pub use config::GatewayRadioConfig;
use linkme::distributed_slice;
use tracing::info;
pub use xiaomi_gateway_radio::GatewayRadioIntegration;

use crate::engine;

/// Integration name, also the domain config flows are addressed to
pub const DOMAIN: &str = "xiaomi_gateway_radio";

pub const DEFAULT_NAME: &str = "Xiaomi Gateway Radio";

pub const DEFAULT_VOLUME_STEP: i64 = 5;

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_xiaomi_gateway_radio(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    let radio_config = if let Some(c) = &ctx.config.integrations.xiaomi_gateway_radio {
        c
    } else {
        return Ok(None);
    };

    info!(
        "Initializing Xiaomi Gateway Radio integration ({} configured entries)",
        radio_config.entries.len()
    );
    let connector = device::default_connector();
    Ok(Some(Box::new(GatewayRadioIntegration::new(
        radio_config,
        connector,
    ))))
}
