//! Results of entry management requests routed through the engine.
//!
//! Integrations that accept new configuration entries at runtime answer these
//! requests; the error values are deliberately coarse so that callers (the
//! HTTP API) can map them to a stable error key.

use thiserror::Error;

/// Why a config flow did not create an entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// The device could not be reached or did not answer the identity query.
    #[error("cannot_connect")]
    CannotConnect,

    /// An entry for the same host already exists.
    #[error("already_configured")]
    AlreadyConfigured,

    /// The submitted input could not be parsed.
    #[error("invalid_input: {0}")]
    InvalidInput(String),

    /// No integration with the requested domain is running.
    #[error("unknown_domain: {0}")]
    UnknownDomain(String),
}

impl FlowError {
    /// Stable error key, as reported to API clients.
    pub fn key(&self) -> &'static str {
        match self {
            FlowError::CannotConnect => "cannot_connect",
            FlowError::AlreadyConfigured => "already_configured",
            FlowError::InvalidInput(_) => "invalid_input",
            FlowError::UnknownDomain(_) => "unknown_domain",
        }
    }
}

/// Why an entry could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("no integration for domain: {0}")]
    UnknownDomain(String),

    /// Entity teardown failed; the entry is still loaded.
    #[error("failed to unload entry {entry_id}: {reason}")]
    UnloadFailed { entry_id: String, reason: String },
}
