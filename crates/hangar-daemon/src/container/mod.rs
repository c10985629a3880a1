// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container abstraction.
//!
//! A container is one running application server. The daemon never talks to
//! a server directly; it builds a [`ContainerSpec`] and hands it to a
//! [`ContainerFactory`], then drives the returned [`Container`].
//!
//! | Adapter | Description |
//! |---------|-------------|
//! | [`ProcessContainerFactory`] | Runs a start script from the container home as a child process group |
//! | [`MockContainerFactory`] | In-memory containers for tests |

pub mod mock;
pub mod process;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::properties::PropertyTable;

pub use mock::{MockContainer, MockContainerFactory, MockEvent, MockEventKind};
pub use process::{ProcessContainer, ProcessContainerFactory};

/// Errors from container adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContainerError {
    /// No adapter serves the requested container id.
    #[error("Unknown container id: {0}")]
    UnknownContainer(String),

    /// The adapter does not support the configuration type.
    #[error("Container {container_id} does not support {kind} configurations")]
    UnsupportedConfiguration {
        /// Container id.
        container_id: String,
        /// Requested configuration type.
        kind: ConfigurationType,
    },

    /// Container failed to start.
    #[error("Container start failed: {0}")]
    StartFailed(String),

    /// Container failed to stop.
    #[error("Container stop failed: {0}")]
    StopFailed(String),

    /// Operation did not finish in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Live state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Start issued, not yet ready.
    Starting,
    /// Running and ready.
    Started,
    /// Stop issued, not yet finished.
    Stopping,
    /// Not running.
    Stopped,
    /// The adapter cannot tell.
    Unknown,
}

impl ContainerState {
    /// Lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Starting => "starting",
            ContainerState::Started => "started",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a configuration relates to the container installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigurationType {
    /// A fresh configuration directory owned by the daemon.
    Standalone,
    /// An already prepared configuration directory.
    Existing,
    /// A server that is already running somewhere.
    Runtime,
}

impl ConfigurationType {
    /// Lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationType::Standalone => "standalone",
            ConfigurationType::Existing => "existing",
            ConfigurationType::Runtime => "runtime",
        }
    }
}

impl fmt::Display for ConfigurationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigurationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standalone" => Ok(ConfigurationType::Standalone),
            "existing" => Ok(ConfigurationType::Existing),
            "runtime" => Ok(ConfigurationType::Runtime),
            other => Err(format!("unknown configuration type '{}'", other)),
        }
    }
}

/// Kind of deployable archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployableType {
    /// Web application archive.
    War,
    /// Enterprise application archive.
    Ear,
    /// EJB module.
    Ejb,
    /// Resource adapter archive.
    Rar,
    /// OSGi bundle.
    Bundle,
    /// Plain file copied into the deployment directory.
    File,
}

impl DeployableType {
    /// Every supported type, in display order.
    pub const ALL: [DeployableType; 6] = [
        DeployableType::War,
        DeployableType::Ear,
        DeployableType::Ejb,
        DeployableType::Rar,
        DeployableType::Bundle,
        DeployableType::File,
    ];

    /// Lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployableType::War => "war",
            DeployableType::Ear => "ear",
            DeployableType::Ejb => "ejb",
            DeployableType::Rar => "rar",
            DeployableType::Bundle => "bundle",
            DeployableType::File => "file",
        }
    }

    /// Guess the type from a file name extension.
    pub fn from_filename(filename: &str) -> Self {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "war" => DeployableType::War,
            "ear" => DeployableType::Ear,
            "rar" => DeployableType::Rar,
            _ => DeployableType::File,
        }
    }
}

impl fmt::Display for DeployableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployableType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        DeployableType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| format!("unknown deployable type '{}'", s.trim()))
    }
}

/// An archive to deploy into a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployable {
    /// Archive kind.
    pub kind: DeployableType,
    /// Location inside the handle workspace.
    pub path: PathBuf,
    /// Web context, for web archives.
    pub context: Option<String>,
}

/// A file materialized into the configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationFile {
    /// Source file in the handle workspace.
    pub source: PathBuf,
    /// Directory relative to the configuration home; `None` is the home itself.
    pub directory: Option<String>,
    /// Target file name; defaults to the source name.
    pub to_file: Option<String>,
    /// Replace `@key@` tokens with configuration properties.
    pub parse: bool,
    /// Replace an existing target file.
    pub overwrite: bool,
}

/// An XML edit the adapter applies to a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlReplacement {
    /// File relative to the configuration home.
    pub file: String,
    /// XPath of the element to edit.
    pub xpath_expression: String,
    /// Attribute to set; `None` sets the element text.
    pub attribute_name: Option<String>,
    /// New value.
    pub value: String,
}

/// A container configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Container id the configuration is for.
    pub container_id: String,
    /// Configuration type.
    pub kind: ConfigurationType,
    /// Configuration home directory.
    pub home: PathBuf,
    /// Configuration properties (ports, users, ...).
    pub properties: PropertyTable,
    /// Files to materialize.
    pub files: Vec<ConfigurationFile>,
    /// Archives to deploy.
    pub deployables: Vec<Deployable>,
    /// XML edits for the adapter.
    pub xml_replacements: Vec<XmlReplacement>,
}

impl Configuration {
    /// Create an empty configuration.
    pub fn new(container_id: impl Into<String>, kind: ConfigurationType, home: impl Into<PathBuf>) -> Self {
        Self {
            container_id: container_id.into(),
            kind,
            home: home.into(),
            properties: PropertyTable::new(),
            files: Vec::new(),
            deployables: Vec::new(),
            xml_replacements: Vec::new(),
        }
    }
}

/// Everything an adapter needs to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Handle the container belongs to.
    pub handle_id: String,
    /// Adapter container id.
    pub container_id: String,
    /// Container installation directory.
    pub home: Option<PathBuf>,
    /// Configuration to run with.
    pub configuration: Configuration,
    /// Start/stop timeout; adapters pick a default when unset.
    pub timeout: Option<Duration>,
    /// System properties for the server JVM.
    pub system_properties: PropertyTable,
    /// Extra JVM arguments.
    pub jvm_args: Option<String>,
    /// Handle-private classpath entries.
    pub extra_classpath: Vec<PathBuf>,
    /// Classpath entries shared between handles.
    pub shared_classpath: Vec<PathBuf>,
    /// Server stdout/stderr capture file.
    pub output: PathBuf,
    /// Append to `output` instead of truncating it.
    pub append: bool,
    /// Adapter log file.
    pub log_file: PathBuf,
    /// Adapter log level.
    pub log_level: Option<String>,
}

/// A running (or runnable) application server.
#[async_trait]
pub trait Container: Send + Sync {
    /// Adapter container id.
    fn id(&self) -> &str;

    /// Start the server and wait until it is ready.
    async fn start(&self) -> Result<()>;

    /// Stop the server and wait until it is down.
    async fn stop(&self) -> Result<()>;

    /// Current state.
    fn state(&self) -> ContainerState;
}

/// Creates configurations, containers and deployables for a set of
/// container ids.
pub trait ContainerFactory: Send + Sync {
    /// Container ids this factory serves.
    fn container_ids(&self) -> Vec<String>;

    /// Whether `container_id` is served by this factory.
    fn supports(&self, container_id: &str) -> bool {
        self.container_ids().iter().any(|id| id == container_id)
    }

    /// Create an empty configuration of `kind` rooted at `home`.
    fn create_configuration(
        &self,
        container_id: &str,
        kind: ConfigurationType,
        home: PathBuf,
    ) -> Result<Configuration> {
        if !self.supports(container_id) {
            return Err(ContainerError::UnknownContainer(container_id.to_string()));
        }
        Ok(Configuration::new(container_id, kind, home))
    }

    /// Create a deployable for `container_id`.
    fn create_deployable(
        &self,
        container_id: &str,
        path: PathBuf,
        kind: DeployableType,
    ) -> Result<Deployable> {
        if !self.supports(container_id) {
            return Err(ContainerError::UnknownContainer(container_id.to_string()));
        }
        Ok(Deployable {
            kind,
            path,
            context: None,
        })
    }

    /// Create a container from `spec`. The container is not started.
    fn create_container(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_names() {
        assert_eq!(ContainerState::Started.to_string(), "started");
        assert_eq!(
            serde_json::to_string(&ContainerState::Stopped).unwrap(),
            "\"stopped\""
        );
    }

    #[test]
    fn test_configuration_type_parse() {
        assert_eq!(
            "Standalone".parse::<ConfigurationType>(),
            Ok(ConfigurationType::Standalone)
        );
        assert_eq!(
            " runtime ".parse::<ConfigurationType>(),
            Ok(ConfigurationType::Runtime)
        );
        assert!("local".parse::<ConfigurationType>().is_err());
    }

    #[test]
    fn test_deployable_type() {
        assert_eq!("WAR".parse::<DeployableType>(), Ok(DeployableType::War));
        assert!("jar".parse::<DeployableType>().is_err());
        assert_eq!(DeployableType::from_filename("app.EAR"), DeployableType::Ear);
        assert_eq!(DeployableType::from_filename("README"), DeployableType::File);
    }
}
