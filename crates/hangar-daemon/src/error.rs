// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hangar-daemon.

use thiserror::Error;

/// Daemon errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The handle database file could not be parsed.
    #[error("Properties error: {0}")]
    Properties(#[from] crate::properties::PropertiesError),

    /// Container adapter failed.
    #[error("Container error: {0}")]
    Container(#[from] crate::container::ContainerError),

    /// Container installation failed.
    #[error("Install error: {0}")]
    Install(#[from] crate::installer::InstallError),

    /// A required request parameter is missing or empty.
    #[error("Parameter {0} is required.")]
    MissingParameter(String),

    /// A request parameter could not be interpreted.
    #[error("Parameter {name} is invalid: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Handle was not found.
    #[error("Handle id {0} not found.")]
    HandleNotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type using daemon Error.
pub type Result<T> = std::result::Result<T, Error>;
