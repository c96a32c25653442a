//! Device control seam.
//!
//! The radio entity only ever talks to a gateway through [`DeviceClient`], and
//! clients are only ever created through a [`Connector`]. Whether a real
//! transport exists is decided once, by [`default_connector`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors that can occur when talking to a gateway
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the transport timeout
    #[error("No response from device")]
    Timeout,

    /// The token is not 32 hex characters
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The device answered with an error object
    #[error("Device error {code}: {message}")]
    Device { code: i64, message: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reply could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Identity reported by `miIO.info`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceInfo {
    pub model: String,

    #[serde(rename = "fw_ver", default)]
    pub firmware_version: String,

    #[serde(rename = "hw_ver", default)]
    pub hardware_version: String,

    #[serde(rename = "mac", default)]
    pub mac_address: String,
}

/// An open session to one gateway
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Send a command verb and return the `result` member of the reply
    async fn send(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;

    /// Query the device identity
    async fn info(&mut self) -> Result<DeviceInfo> {
        let result = self.send("miIO.info", serde_json::json!([])).await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Factory for device sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, token: &str) -> Result<Box<dyn DeviceClient>>;
}

/// The connector compiled into this binary, if any
pub fn default_connector() -> Option<Arc<dyn Connector>> {
    #[cfg(feature = "miio")]
    {
        Some(Arc::new(super::miio::MiioConnector::default()))
    }

    #[cfg(not(feature = "miio"))]
    {
        None
    }
}

#[cfg(test)]
pub use mock::MockConnector;
#[cfg(test)]
pub use mock::MockDeviceClient;

/// Scripted device for tests
#[cfg(test)]
mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct MockDevice {
        sent: Vec<(String, serde_json::Value)>,
        responses: VecDeque<Result<serde_json::Value>>,
        info_fails: bool,
    }

    /// Device client that records every command and replays queued replies.
    ///
    /// Clones share the same script, so a test can keep a handle after giving
    /// the client away. Commands without a queued reply succeed with `["ok"]`.
    #[derive(Debug, Clone, Default)]
    pub struct MockDeviceClient {
        inner: Arc<Mutex<MockDevice>>,
    }

    impl MockDeviceClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a successful reply
        pub fn push_response(&self, result: serde_json::Value) {
            self.inner.lock().unwrap().responses.push_back(Ok(result));
        }

        /// Queue a failed reply
        pub fn push_error(&self) {
            self.inner
                .lock()
                .unwrap()
                .responses
                .push_back(Err(DeviceError::Timeout));
        }

        /// Make identity queries fail
        pub fn set_info_fails(&self, fails: bool) {
            self.inner.lock().unwrap().info_fails = fails;
        }

        /// Every command sent so far, excluding identity queries
        pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
            self.inner.lock().unwrap().sent.clone()
        }

        /// Volume percents sent with `set_fm_volume`
        pub fn sent_volumes(&self) -> Vec<i64> {
            self.sent()
                .into_iter()
                .filter(|(method, _)| method == "set_fm_volume")
                .filter_map(|(_, params)| params[0].as_i64())
                .collect()
        }

        pub fn info_json() -> serde_json::Value {
            serde_json::json!({
                "model": "lumi.gateway.v3",
                "fw_ver": "1.4.1_164",
                "hw_ver": "MW300",
                "mac": "34:CE:00:AA:BB:CC",
            })
        }
    }

    #[async_trait]
    impl DeviceClient for MockDeviceClient {
        async fn send(
            &mut self,
            method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            let mut device = self.inner.lock().unwrap();
            if method == "miIO.info" {
                if device.info_fails {
                    return Err(DeviceError::Timeout);
                }
                return Ok(Self::info_json());
            }

            device.sent.push((method.to_string(), params));
            device
                .responses
                .pop_front()
                .unwrap_or_else(|| Ok(serde_json::json!(["ok"])))
        }
    }

    /// Connector handing out clones of one scripted client
    #[derive(Debug, Clone, Default)]
    pub struct MockConnector {
        pub client: MockDeviceClient,
        connects: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// (host, token) of every connection attempt
        pub fn connects(&self) -> Vec<(String, String)> {
            self.connects.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, host: &str, token: &str) -> Result<Box<dyn DeviceClient>> {
            self.connects
                .lock()
                .unwrap()
                .push((host.to_string(), token.to_string()));
            Ok(Box::new(self.client.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_info_parses_identity() {
        let mut client = MockDeviceClient::new();
        let info = client.info().await.unwrap();
        assert_eq!(info.model, "lumi.gateway.v3");
        assert_eq!(info.firmware_version, "1.4.1_164");
        assert_eq!(info.hardware_version, "MW300");
        assert_eq!(info.mac_address, "34:CE:00:AA:BB:CC");
    }

    #[test]
    fn test_info_tolerates_missing_versions() {
        let info: DeviceInfo =
            serde_json::from_value(serde_json::json!({"model": "lumi.gateway.v2"})).unwrap();
        assert_eq!(info.model, "lumi.gateway.v2");
        assert_eq!(info.hardware_version, "");
    }
}
