// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handle lifecycle management.
//!
//! [`LifecycleManager`] owns the handle database and drives containers
//! through the adapter contract. Every mutation of a handle happens under
//! that handle's lock, so starts, stops and reconciliation of one handle are
//! totally ordered while different handles proceed in parallel.
//!
//! A start that replaces a running container stops the old one first and
//! waits for the configured settling delay before starting the new one, so
//! at most one container per handle is ever live.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::container::{
    Configuration, ConfigurationFile, ConfigurationType, ContainerFactory, ContainerSpec,
    ContainerState, DeployableType,
};
use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::handle::{Deployment, Handle};
use crate::handle_database::HandleDatabase;
use crate::installer::{InstallSource, Installer};
use crate::log_tail::{self, LogChunk};
use crate::properties::PropertyTable;
use crate::request::{
    ConfigurationFilePlan, InstallerPlan, StartPlan, StartRequest, DEFAULT_CONTAINER_LOG_FILE,
    DEFAULT_CONTAINER_OUTPUT, parts,
};

/// Default pause between stopping a container and starting its replacement.
pub const DEFAULT_STOP_START_DELAY: Duration = Duration::from_secs(5);

const INDEX_TEMPLATE: &str = include_str!("../assets/index.html");

/// Which log of a handle to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Container stdout/stderr capture (`viewlog`).
    Output,
    /// Adapter log (`viewcargolog`).
    Adapter,
}

/// Drives handles through start, stop and reconciliation.
pub struct LifecycleManager {
    handles: Arc<HandleDatabase>,
    files: Arc<FileManager>,
    factory: Arc<dyn ContainerFactory>,
    installer: Arc<dyn Installer>,
    stop_start_delay: Duration,
}

impl LifecycleManager {
    /// Create a manager over a loaded handle database.
    pub fn new(
        handles: Arc<HandleDatabase>,
        files: Arc<FileManager>,
        factory: Arc<dyn ContainerFactory>,
        installer: Arc<dyn Installer>,
    ) -> Self {
        Self {
            handles,
            files,
            factory,
            installer,
            stop_start_delay: DEFAULT_STOP_START_DELAY,
        }
    }

    /// Set the settling delay between stopping and starting.
    pub fn with_stop_start_delay(mut self, delay: Duration) -> Self {
        self.stop_start_delay = delay;
        self
    }

    /// Handle database.
    pub fn handles(&self) -> &Arc<HandleDatabase> {
        &self.handles
    }

    /// File manager.
    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    /// Start (or restart with new parameters) the handle named by `request`.
    ///
    /// A request naming an existing handle without a `containerId` replays
    /// the handle's persisted parameters and is not saved again.
    pub async fn start(&self, mut request: StartRequest) -> Result<()> {
        if let Some(handle) = self.replay_target(&request) {
            debug!(handle_id = %handle.id(), "Replaying persisted start parameters");
            request.set_parameters(handle.properties());
            request.set_save(false);
        }

        let plan = StartPlan::parse(request.parameters())?;
        info!(
            handle_id = %plan.handle_id,
            container_id = %plan.container_id,
            configuration_type = %plan.configuration_type,
            save = request.is_save(),
            "Start request received"
        );

        let (handle, _guard) = self.lock_registered(&plan.handle_id).await;
        self.start_locked(&handle, &plan, &request).await?;

        if request.is_save() {
            handle.merge_properties(request.parameters());
            handle.set_autostart(plan.autostart);
            self.persist().await?;
        }
        Ok(())
    }

    /// Start an existing handle again from its persisted parameters.
    pub async fn restart(&self, handle_id: &str) -> Result<()> {
        let handle = self
            .handles
            .get(handle_id)
            .ok_or_else(|| Error::HandleNotFound(handle_id.to_string()))?;
        self.start(StartRequest::from_parameters(handle.properties()))
            .await
    }

    /// Stop a handle and keep it from being restarted automatically.
    ///
    /// Unknown handles are a no-op. With `delete` the handle is also removed
    /// from the database, which is written immediately.
    pub async fn stop(&self, handle_id: &str, delete: bool) -> Result<()> {
        let Some(handle) = self.handles.get(handle_id) else {
            debug!(handle_id = %handle_id, "Stop of unknown handle ignored");
            return Ok(());
        };
        let _guard = handle.lock().await;
        if !self.is_registered(&handle) {
            return Ok(());
        }

        info!(handle_id = %handle_id, delete, "Stop request received");
        handle.set_force_stop(true);
        // Stop before removing: the container must stay reachable through
        // the handle until it is down.
        if let Some(deployment) = handle.deployment() {
            deployment.container.stop().await?;
        }
        info!(handle_id = %handle_id, "Handle stopped");
        if delete {
            self.handles.remove(handle_id);
            self.persist().await?;
            info!(handle_id = %handle_id, "Handle deleted");
        }
        Ok(())
    }

    /// Live status of every handle, by id.
    pub fn statuses(&self) -> BTreeMap<String, ContainerState> {
        self.handles
            .snapshot()
            .iter()
            .map(|handle| (handle.id().to_string(), handle.status()))
            .collect()
    }

    /// Read a log of `handle_id` from `offset`.
    pub async fn tail_log(
        &self,
        handle_id: &str,
        kind: LogKind,
        offset: Option<u64>,
    ) -> Result<LogChunk> {
        let handle = self
            .handles
            .get(handle_id)
            .ok_or_else(|| Error::HandleNotFound(handle_id.to_string()))?;
        let path = self.log_path(&handle, kind);
        Ok(log_tail::read_from(&path, offset).await?)
    }

    /// Whether `file` was uploaded to the shared workspace.
    pub async fn is_installed(&self, file: &str) -> bool {
        self.files.exists_file(file).await
    }

    /// Status page.
    pub fn index_page(&self) -> String {
        let container_ids = self
            .factory
            .container_ids()
            .iter()
            .map(|id| format!("<option>{}</option>", escape_html(id)))
            .collect::<Vec<_>>()
            .join("\n");
        let deployable_types = DeployableType::ALL
            .iter()
            .map(|kind| format!("<option>{}</option>", kind))
            .collect::<Vec<_>>()
            .join("\n");
        let handles = self
            .statuses()
            .iter()
            .map(|(id, state)| {
                format!(
                    "<tr><td>{}</td><td class=\"{}\">{}</td></tr>",
                    escape_html(id),
                    state,
                    state
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        INDEX_TEMPLATE
            .replace("@containerIds@", &container_ids)
            .replace("@deployableTypes@", &deployable_types)
            .replace("@handles@", &handles)
    }

    /// Stop every live container without marking handles as stopped on
    /// request, so they come back with the next daemon run.
    pub async fn stop_all(&self) {
        for handle in self.handles.snapshot() {
            let _guard = handle.lock().await;
            let Some(deployment) = handle.deployment() else {
                continue;
            };
            if deployment.container.state() == ContainerState::Stopped {
                continue;
            }
            match deployment.container.stop().await {
                Ok(()) => info!(handle_id = %handle.id(), "Container stopped on shutdown"),
                Err(e) => warn!(handle_id = %handle.id(), error = %e, "Failed to stop container on shutdown"),
            }
        }
    }

    /// Write the handle database.
    pub async fn persist(&self) -> Result<()> {
        self.files.save_handle_database(&self.handles).await
    }

    /// Restart `handle` if it should be running and is not.
    ///
    /// Returns whether a start was attempted and succeeded.
    pub async fn reconcile_handle(&self, handle: &Arc<Handle>) -> Result<bool> {
        let _guard = handle.lock().await;
        if !self.is_registered(handle)
            || !handle.is_autostart()
            || handle.is_force_stop()
            || handle.status() != ContainerState::Stopped
        {
            return Ok(false);
        }

        info!(handle_id = %handle.id(), "Restarting stopped autostart handle");
        let request = StartRequest::from_parameters(handle.properties());
        let plan = StartPlan::parse(request.parameters())?;
        self.start_locked(handle, &plan, &request).await?;
        Ok(true)
    }

    /// One reconciliation pass over every handle. Failures are logged and
    /// do not affect other handles. Returns the number of handles restarted.
    pub async fn reconcile(&self) -> usize {
        let mut restarted = 0;
        for handle in self.handles.snapshot() {
            match self.reconcile_handle(&handle).await {
                Ok(true) => restarted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(handle_id = %handle.id(), error = %e, "Failed to restart autostart handle");
                }
            }
        }
        restarted
    }

    fn replay_target(&self, request: &StartRequest) -> Option<Arc<Handle>> {
        let parameters = request.parameters();
        let handle_id = parameters.get("handleId").filter(|id| !id.is_empty())?;
        if parameters.get("containerId").is_some_and(|id| !id.is_empty()) {
            return None;
        }
        self.handles.get(handle_id)
    }

    fn is_registered(&self, handle: &Arc<Handle>) -> bool {
        self.handles
            .get(handle.id())
            .is_some_and(|current| Arc::ptr_eq(&current, handle))
    }

    /// Look up or create the handle and take its lock. Retries when the
    /// handle was deleted while waiting for the lock.
    async fn lock_registered(&self, handle_id: &str) -> (Arc<Handle>, OwnedMutexGuard<()>) {
        loop {
            let handle = self.handles.get_or_create(handle_id);
            let guard = handle.lock().await;
            if self.is_registered(&handle) {
                return (handle, guard);
            }
        }
    }

    fn log_path(&self, handle: &Handle, kind: LogKind) -> PathBuf {
        if let Some(deployment) = handle.deployment() {
            return match kind {
                LogKind::Output => deployment.output_path,
                LogKind::Adapter => deployment.log_path,
            };
        }
        let properties = handle.properties();
        let (key, default) = match kind {
            LogKind::Output => ("containerOutput", DEFAULT_CONTAINER_OUTPUT),
            LogKind::Adapter => ("containerLogFile", DEFAULT_CONTAINER_LOG_FILE),
        };
        let name = properties
            .get(key)
            .filter(|name| !name.is_empty())
            .unwrap_or(default);
        self.files.log_file(handle.id(), name)
    }

    /// Build and start a container for `plan`. The caller holds the handle
    /// lock.
    async fn start_locked(
        &self,
        handle: &Handle,
        plan: &StartPlan,
        request: &StartRequest,
    ) -> Result<()> {
        let handle_id = plan.handle_id.as_str();
        handle.set_force_stop(false);

        let configuration_home = plan
            .configuration_home
            .clone()
            .unwrap_or_else(|| self.files.configuration_dir(handle_id));
        let mut configuration = self.factory.create_configuration(
            &plan.container_id,
            plan.configuration_type,
            configuration_home,
        )?;
        configuration.properties = plan.configuration_properties.clone();

        if plan.configuration_type == ConfigurationType::Standalone {
            tokio::fs::create_dir_all(&configuration.home).await?;
            for file in &plan.configuration_files {
                let part = format!("{}{}", parts::CONFIGURATION_FILE, file.index);
                let rel = match &file.directory {
                    Some(directory) => format!("{}/{}", directory, file.filename),
                    None => file.filename.clone(),
                };
                let source = self
                    .files
                    .save_file(Some(handle_id), &rel, request.file(&part).map(|d| d.as_ref()))
                    .await?;
                self.materialize(&configuration, file, &source).await?;
                configuration.files.push(ConfigurationFile {
                    source,
                    directory: file.directory.clone(),
                    to_file: file.to_file.clone(),
                    parse: file.parse,
                    overwrite: file.overwrite,
                });
            }
        }

        if matches!(
            plan.configuration_type,
            ConfigurationType::Standalone | ConfigurationType::Existing
        ) {
            for deployable in &plan.deployables {
                let part = format!("{}{}", parts::DEPLOYABLE_FILE, deployable.index);
                let path = self
                    .files
                    .save_file(
                        Some(handle_id),
                        &deployable.filename,
                        request.file(&part).map(|d| d.as_ref()),
                    )
                    .await?;
                let mut created =
                    self.factory
                        .create_deployable(&plan.container_id, path, deployable.kind)?;
                created.context = deployable.context.clone();
                configuration.deployables.push(created);
            }
        }
        configuration.xml_replacements = plan.xml_replacements.clone();

        let home = self.resolve_home(plan, request).await?;
        let extra_classpath = self
            .save_classpath(Some(handle_id), &plan.extra_files, parts::EXTRA_FILE, &plan.extra_classpath, request)
            .await?;
        let shared_classpath = self
            .save_classpath(None, &plan.shared_files, parts::SHARED_FILE, &plan.shared_classpath, request)
            .await?;

        let output_path = self.files.log_file(handle_id, &plan.container_output);
        let log_path = self.files.log_file(handle_id, &plan.container_log_file);
        for path in [&output_path, &log_path] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let container = self.factory.create_container(ContainerSpec {
            handle_id: handle_id.to_string(),
            container_id: plan.container_id.clone(),
            home,
            configuration: configuration.clone(),
            timeout: plan.timeout,
            system_properties: plan.container_properties.clone(),
            jvm_args: plan.jvm_args.clone(),
            extra_classpath,
            shared_classpath,
            output: output_path.clone(),
            append: plan.container_append,
            log_file: log_path.clone(),
            log_level: plan.container_log_level.clone(),
        })?;

        if let Some(previous) = handle.take_deployment() {
            info!(handle_id = %handle_id, "Stopping previous container");
            if let Err(e) = previous.container.stop().await {
                warn!(handle_id = %handle_id, error = %e, "Failed to stop previous container");
            }
            tokio::time::sleep(self.stop_start_delay).await;
        }

        handle.replace_deployment(Some(Deployment {
            container: container.clone(),
            configuration,
            output_path,
            log_path,
        }));

        if let Err(e) = container.start().await {
            warn!(handle_id = %handle_id, error = %e, "Container failed to start");
            if let Err(stop_err) = container.stop().await {
                debug!(handle_id = %handle_id, error = %stop_err, "Cleanup stop after failed start also failed");
            }
            return Err(e.into());
        }

        info!(handle_id = %handle_id, container_id = %plan.container_id, "Container started");
        Ok(())
    }

    async fn resolve_home(&self, plan: &StartPlan, request: &StartRequest) -> Result<Option<PathBuf>> {
        let source = match &plan.installer {
            Some(InstallerPlan::UploadedZip(name)) => {
                let data = request.file(parts::INSTALLER_ZIP).map(|d| d.as_ref());
                InstallSource::File(self.files.save_file(None, name, data).await?)
            }
            Some(InstallerPlan::Url(url)) => InstallSource::Url(url.clone()),
            None => return Ok(plan.container_home.clone()),
        };
        let home = self.installer.install(&source).await?;
        debug!(handle_id = %plan.handle_id, home = %home.display(), "Container installed");
        Ok(Some(home))
    }

    /// Save uploaded classpath files and resolve classpath entries against
    /// the handle workspace, or the shared workspace when `handle_id` is
    /// `None`.
    async fn save_classpath(
        &self,
        handle_id: Option<&str>,
        names: &[String],
        part_prefix: &str,
        entries: &[String],
        request: &StartRequest,
    ) -> Result<Vec<PathBuf>> {
        for (index, name) in names.iter().enumerate() {
            let part = format!("{}{}", part_prefix, index);
            self.files
                .save_file(handle_id, name, request.file(&part).map(|d| d.as_ref()))
                .await?;
        }
        entries
            .iter()
            .map(|entry| self.files.resolve_workspace_path(handle_id, entry))
            .collect()
    }

    /// Copy a configuration file into the configuration home, replacing
    /// `@key@` tokens when it is parsed.
    async fn materialize(
        &self,
        configuration: &Configuration,
        file: &ConfigurationFilePlan,
        source: &Path,
    ) -> Result<PathBuf> {
        let dir = match &file.directory {
            Some(directory) => self.files.resolve_under(&configuration.home, directory)?,
            None => configuration.home.clone(),
        };
        let name = file.to_file.as_deref().unwrap_or(&file.filename);
        let name = Path::new(name).file_name().ok_or_else(|| {
            Error::invalid("configurationFiles", format!("'{}' is not a file name", name))
        })?;
        let target = dir.join(name);

        if !file.parse {
            self.files.copy_file(source, &target, file.overwrite).await?;
            return Ok(target);
        }
        if !file.overwrite && tokio::fs::try_exists(&target).await? {
            return Ok(target);
        }
        let text = tokio::fs::read_to_string(source).await?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&target, replace_tokens(&text, &configuration.properties)).await?;
        Ok(target)
    }
}

/// Replace every `@key@` in `text` with the text value of `key`.
fn replace_tokens(text: &str, properties: &PropertyTable) -> String {
    let mut out = text.to_string();
    for (key, value) in properties.iter() {
        if let Some(value) = value.as_text() {
            out = out.replace(&format!("@{}@", key), value);
        }
    }
    out
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
