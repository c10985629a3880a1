// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Start requests.
//!
//! A [`StartRequest`] carries the raw parameters and uploaded files of a
//! start, independent of the transport. Composite parameters arrive as JSON
//! text and are stored structured, so the same table can be persisted on the
//! handle and replayed later. [`StartPlan`] is the validated, typed view the
//! lifecycle manager works from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::container::{ConfigurationType, DeployableType, XmlReplacement};
use crate::error::{Error, Result};
use crate::properties::{PropertyTable, PropertyValue};

/// Parameters holding a JSON object.
const TABLE_PARAMETERS: [&str; 2] = ["containerProperties", "configurationProperties"];

/// Parameters holding a JSON array of objects.
const TABLE_LIST_PARAMETERS: [&str; 3] = ["configurationFiles", "deployableFiles", "xmlReplacements"];

/// Parameters holding a JSON array of strings.
const LIST_PARAMETERS: [&str; 4] = ["extraFiles", "sharedFiles", "extraClasspath", "sharedClasspath"];

/// Upload part names for indexed file lists.
pub mod parts {
    /// Uploaded installer archive.
    pub const INSTALLER_ZIP: &str = "installerZipFileData";
    /// Prefix of configuration file uploads.
    pub const CONFIGURATION_FILE: &str = "configurationFileData_";
    /// Prefix of deployable uploads.
    pub const DEPLOYABLE_FILE: &str = "deployableFileData_";
    /// Prefix of handle-private classpath uploads.
    pub const EXTRA_FILE: &str = "extraFileData_";
    /// Prefix of shared classpath uploads.
    pub const SHARED_FILE: &str = "sharedFileData_";
}

/// Parameters and uploads of one start.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    parameters: PropertyTable,
    files: HashMap<String, Bytes>,
    save: bool,
}

impl StartRequest {
    /// Create an empty request that is saved on success.
    pub fn new() -> Self {
        Self {
            save: true,
            ..Self::default()
        }
    }

    /// Create a replay request from persisted parameters. Replays are not
    /// saved again.
    pub fn from_parameters(parameters: PropertyTable) -> Self {
        Self {
            parameters,
            files: HashMap::new(),
            save: false,
        }
    }

    /// Add a raw parameter. Empty values are ignored; composite parameters
    /// must be valid JSON of the expected shape.
    pub fn insert_parameter(&mut self, name: &str, raw: &str) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        let value = if TABLE_PARAMETERS.contains(&name) {
            PropertyValue::Table(parse_object(name, raw)?)
        } else if TABLE_LIST_PARAMETERS.contains(&name) {
            parse_object_list(name, raw)?
        } else if LIST_PARAMETERS.contains(&name) {
            match serde_json::from_str::<Value>(raw) {
                Ok(value @ Value::Array(_)) => PropertyValue::from(value),
                _ => PropertyValue::Text(raw.to_string()),
            }
        } else {
            PropertyValue::Text(raw.to_string())
        };
        self.parameters.insert(name, value);
        Ok(())
    }

    /// Builder form of [`insert_parameter`](Self::insert_parameter).
    pub fn with_parameter(mut self, name: &str, raw: &str) -> Result<Self> {
        self.insert_parameter(name, raw)?;
        Ok(self)
    }

    /// Attach an uploaded file part.
    pub fn insert_file(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(name.into(), data.into());
    }

    /// Builder form of [`insert_file`](Self::insert_file).
    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert_file(name, data);
        self
    }

    /// Parameters.
    pub fn parameters(&self) -> &PropertyTable {
        &self.parameters
    }

    /// Replace the parameters (replay).
    pub fn set_parameters(&mut self, parameters: PropertyTable) {
        self.parameters = parameters;
    }

    /// An uploaded file part.
    pub fn file(&self, name: &str) -> Option<&Bytes> {
        self.files.get(name)
    }

    /// Whether the parameters are persisted after a successful start.
    pub fn is_save(&self) -> bool {
        self.save
    }

    /// Set whether the parameters are persisted.
    pub fn set_save(&mut self, save: bool) {
        self.save = save;
    }
}

fn parse_object(name: &str, raw: &str) -> Result<PropertyTable> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(PropertyTable::from(map)),
        Ok(_) => Err(Error::invalid(name, "expected a JSON object")),
        Err(e) => Err(Error::invalid(name, e.to_string())),
    }
}

fn parse_object_list(name: &str, raw: &str) -> Result<PropertyValue> {
    let items = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items,
        Ok(_) => return Err(Error::invalid(name, "expected a JSON array of objects")),
        Err(e) => return Err(Error::invalid(name, e.to_string())),
    };
    let mut tables = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Object(map) => tables.push(PropertyValue::Table(PropertyTable::from(map))),
            _ => return Err(Error::invalid(name, "expected a JSON array of objects")),
        }
    }
    Ok(PropertyValue::List(tables))
}

/// Where the container home comes from when it is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerPlan {
    /// Download from a URL.
    Url(String),
    /// An uploaded archive, saved in the shared workspace under this name.
    UploadedZip(String),
}

/// A configuration file to materialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationFilePlan {
    /// Position in `configurationFiles`; selects the upload part.
    pub index: usize,
    /// Workspace file name.
    pub filename: String,
    /// Directory under the configuration home.
    pub directory: Option<String>,
    /// Target name when different from `filename`.
    pub to_file: Option<String>,
    /// Replace `@key@` tokens.
    pub parse: bool,
    /// Replace an existing target. Off unless requested.
    pub overwrite: bool,
}

/// A deployable to upload and deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployablePlan {
    /// Position in `deployableFiles`; selects the upload part.
    pub index: usize,
    /// Workspace file name.
    pub filename: String,
    /// Archive kind.
    pub kind: DeployableType,
    /// Web context.
    pub context: Option<String>,
}

/// Validated start parameters.
#[derive(Debug, Clone)]
pub struct StartPlan {
    /// Handle id.
    pub handle_id: String,
    /// Adapter container id.
    pub container_id: String,
    /// Configuration type.
    pub configuration_type: ConfigurationType,
    /// Explicit container home.
    pub container_home: Option<PathBuf>,
    /// Installer source, which takes precedence over `container_home`.
    pub installer: Option<InstallerPlan>,
    /// Explicit configuration home.
    pub configuration_home: Option<PathBuf>,
    /// Output capture file name.
    pub container_output: String,
    /// Append to the output file.
    pub container_append: bool,
    /// Adapter log file name.
    pub container_log_file: String,
    /// Adapter log level.
    pub container_log_level: Option<String>,
    /// Keep the handle running.
    pub autostart: bool,
    /// Start/stop timeout.
    pub timeout: Option<Duration>,
    /// Extra JVM arguments.
    pub jvm_args: Option<String>,
    /// System properties.
    pub container_properties: PropertyTable,
    /// Configuration properties.
    pub configuration_properties: PropertyTable,
    /// Configuration files.
    pub configuration_files: Vec<ConfigurationFilePlan>,
    /// Deployables.
    pub deployables: Vec<DeployablePlan>,
    /// XML edits.
    pub xml_replacements: Vec<XmlReplacement>,
    /// Handle-private uploads for the classpath.
    pub extra_files: Vec<String>,
    /// Shared uploads for the classpath.
    pub shared_files: Vec<String>,
    /// Handle-private classpath entries, relative to the handle workspace.
    pub extra_classpath: Vec<String>,
    /// Shared classpath entries, relative to the shared workspace.
    pub shared_classpath: Vec<String>,
}

/// Default container output file name.
pub const DEFAULT_CONTAINER_OUTPUT: &str = "output.log";

/// Default adapter log file name.
pub const DEFAULT_CONTAINER_LOG_FILE: &str = "cargo.log";

impl StartPlan {
    /// Validate `parameters`.
    pub fn parse(parameters: &PropertyTable) -> Result<Self> {
        let handle_id = parameters.get_required("handleId")?.to_string();
        validate_handle_id(&handle_id)?;
        let container_id = parameters.get_required("containerId")?.to_string();
        let configuration_type = parameters
            .get_required("configurationType")?
            .parse::<ConfigurationType>()
            .map_err(|e| Error::invalid("configurationType", e))?;

        let installer = match (
            non_empty(parameters, "installerZipUrl"),
            non_empty(parameters, "installerZipFile"),
        ) {
            (_, Some(file)) => Some(InstallerPlan::UploadedZip(file.to_string())),
            (Some(url), None) => Some(InstallerPlan::Url(url.to_string())),
            (None, None) => None,
        };

        let timeout = match non_empty(parameters, "timeout") {
            Some(raw) => Some(Duration::from_millis(raw.trim().parse().map_err(|_| {
                Error::invalid("timeout", format!("'{}' is not a number of milliseconds", raw))
            })?)),
            None => None,
        };

        let container_append = non_empty(parameters, "containerAppend")
            .is_some_and(|v| v.eq_ignore_ascii_case("on") || v.eq_ignore_ascii_case("true"));

        let mut configuration_files = Vec::new();
        for (index, table) in parameters.get_tables("configurationFiles").into_iter().enumerate() {
            let filename = required_member(table, "configurationFiles", "filename")?;
            configuration_files.push(ConfigurationFilePlan {
                index,
                filename,
                directory: non_empty(table, "directory").map(String::from),
                to_file: non_empty(table, "toFile").map(String::from),
                parse: table.get_bool("parse"),
                overwrite: table.get_bool("overwrite"),
            });
        }

        let mut deployables = Vec::new();
        for (index, table) in parameters.get_tables("deployableFiles").into_iter().enumerate() {
            let filename = required_member(table, "deployableFiles", "filename")?;
            let kind = match non_empty(table, "type") {
                Some(kind) => kind
                    .parse::<DeployableType>()
                    .map_err(|e| Error::invalid("deployableFiles", e))?,
                None => DeployableType::from_filename(&filename),
            };
            deployables.push(DeployablePlan {
                index,
                filename,
                kind,
                context: non_empty(table, "context").map(String::from),
            });
        }

        let mut xml_replacements = Vec::new();
        for table in parameters.get_tables("xmlReplacements") {
            xml_replacements.push(XmlReplacement {
                file: required_member(table, "xmlReplacements", "file")?,
                xpath_expression: required_member(table, "xmlReplacements", "xpathExpression")?,
                attribute_name: non_empty(table, "attributeName").map(String::from),
                value: table.get("value").unwrap_or_default().to_string(),
            });
        }

        Ok(Self {
            handle_id,
            container_id,
            configuration_type,
            container_home: non_empty(parameters, "containerHome").map(PathBuf::from),
            installer,
            configuration_home: non_empty(parameters, "configurationHome").map(PathBuf::from),
            container_output: non_empty(parameters, "containerOutput")
                .unwrap_or(DEFAULT_CONTAINER_OUTPUT)
                .to_string(),
            container_append,
            container_log_file: non_empty(parameters, "containerLogFile")
                .unwrap_or(DEFAULT_CONTAINER_LOG_FILE)
                .to_string(),
            container_log_level: non_empty(parameters, "containerLogLevel").map(String::from),
            autostart: parameters.get_bool("autostart"),
            timeout,
            jvm_args: non_empty(parameters, "jvmArgs").map(String::from),
            container_properties: parameters
                .get_table("containerProperties")
                .cloned()
                .unwrap_or_default(),
            configuration_properties: parameters
                .get_table("configurationProperties")
                .cloned()
                .unwrap_or_default(),
            configuration_files,
            deployables,
            xml_replacements,
            extra_files: parameters.get_list("extraFiles"),
            shared_files: parameters.get_list("sharedFiles"),
            extra_classpath: parameters.get_list("extraClasspath"),
            shared_classpath: parameters.get_list("sharedClasspath"),
        })
    }
}

/// Handle ids name directories, so they are restricted to a portable set.
pub fn validate_handle_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::invalid(
            "handleId",
            format!("'{}' may only contain letters, digits, '.', '_' and '-'", id),
        ))
    }
}

fn non_empty<'a>(table: &'a PropertyTable, key: &str) -> Option<&'a str> {
    table.get(key).filter(|v| !v.trim().is_empty())
}

fn required_member(table: &PropertyTable, parameter: &str, member: &str) -> Result<String> {
    non_empty(table, member)
        .map(String::from)
        .ok_or_else(|| Error::invalid(parameter, format!("every entry needs a '{}'", member)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> StartRequest {
        StartRequest::new()
            .with_parameter("handleId", "h1")
            .unwrap()
            .with_parameter("containerId", "mock")
            .unwrap()
            .with_parameter("configurationType", "standalone")
            .unwrap()
    }

    #[test]
    fn test_minimal_plan_defaults() {
        let plan = StartPlan::parse(base_request().parameters()).unwrap();
        assert_eq!(plan.handle_id, "h1");
        assert_eq!(plan.configuration_type, ConfigurationType::Standalone);
        assert_eq!(plan.container_output, DEFAULT_CONTAINER_OUTPUT);
        assert_eq!(plan.container_log_file, DEFAULT_CONTAINER_LOG_FILE);
        assert!(!plan.autostart);
        assert!(!plan.container_append);
        assert!(plan.installer.is_none());
        assert!(plan.timeout.is_none());
    }

    #[test]
    fn test_missing_required_parameters() {
        let request = StartRequest::new().with_parameter("handleId", "h1").unwrap();
        let err = StartPlan::parse(request.parameters()).unwrap_err();
        assert_eq!(err.to_string(), "Parameter containerId is required.");

        let request = StartRequest::new()
            .with_parameter("containerId", "mock")
            .unwrap();
        assert!(matches!(
            StartPlan::parse(request.parameters()),
            Err(Error::MissingParameter(name)) if name == "handleId"
        ));
    }

    #[test]
    fn test_invalid_values() {
        let request = base_request().with_parameter("timeout", "soon").unwrap();
        assert!(matches!(
            StartPlan::parse(request.parameters()),
            Err(Error::InvalidParameter { name, .. }) if name == "timeout"
        ));

        let request = base_request()
            .with_parameter("configurationType", "remote")
            .unwrap();
        assert!(StartPlan::parse(request.parameters()).is_err());

        let request = base_request().with_parameter("handleId", "../etc").unwrap();
        assert!(StartPlan::parse(request.parameters()).is_err());

        assert!(
            base_request()
                .with_parameter("containerProperties", "[1]")
                .is_err()
        );
        assert!(
            base_request()
                .with_parameter("deployableFiles", "[\"a.war\"]")
                .is_err()
        );
    }

    #[test]
    fn test_composite_parameters() {
        let request = base_request()
            .with_parameter("containerProperties", r#"{"cargo.servlet.port": 8080}"#)
            .unwrap()
            .with_parameter(
                "deployableFiles",
                r#"[{"filename": "app.war", "context": "/app"}, {"filename": "lib.ear", "type": "ear"}]"#,
            )
            .unwrap()
            .with_parameter(
                "configurationFiles",
                r#"[{"filename": "server.xml", "directory": "conf", "parse": "true", "overwrite": "false"}]"#,
            )
            .unwrap()
            .with_parameter("extraClasspath", r#"["lib/a.jar", "lib/b.jar"]"#)
            .unwrap()
            .with_parameter("installerZipUrl", "https://example.org/server.zip")
            .unwrap()
            .with_parameter("timeout", "30000")
            .unwrap()
            .with_parameter("containerAppend", "on")
            .unwrap()
            .with_parameter("autostart", "true")
            .unwrap();

        let plan = StartPlan::parse(request.parameters()).unwrap();
        assert_eq!(plan.container_properties.get("cargo.servlet.port"), Some("8080"));
        assert_eq!(plan.deployables.len(), 2);
        assert_eq!(plan.deployables[0].kind, DeployableType::War);
        assert_eq!(plan.deployables[0].context.as_deref(), Some("/app"));
        assert_eq!(plan.deployables[1].kind, DeployableType::Ear);
        assert_eq!(plan.deployables[1].index, 1);
        assert_eq!(plan.configuration_files[0].directory.as_deref(), Some("conf"));
        assert!(plan.configuration_files[0].parse);
        assert!(!plan.configuration_files[0].overwrite);
        assert_eq!(plan.extra_classpath, vec!["lib/a.jar", "lib/b.jar"]);
        assert_eq!(
            plan.installer,
            Some(InstallerPlan::Url("https://example.org/server.zip".to_string()))
        );
        assert_eq!(plan.timeout, Some(Duration::from_secs(30)));
        assert!(plan.container_append);
        assert!(plan.autostart);
    }

    #[test]
    fn test_replay_request_is_not_saved() {
        let request = StartRequest::from_parameters(base_request().parameters().clone());
        assert!(!request.is_save());
        assert!(StartRequest::new().is_save());
        assert!(StartPlan::parse(request.parameters()).is_ok());
    }

    #[test]
    fn test_empty_parameters_are_ignored() {
        let request = base_request().with_parameter("containerHome", "").unwrap();
        assert!(!request.parameters().contains_key("containerHome"));
    }
}
