// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process container adapter.
//!
//! Runs the server as a child process group started from a script inside the
//! container home. Configuration properties select the script and readiness
//! check:
//!
//! | Property | Default | Meaning |
//! |----------|---------|---------|
//! | `hangar.process.command` | `bin/start.sh` | Executable, relative to the container home |
//! | `hangar.process.args` | none | Arguments (list, or whitespace separated text) |
//! | `hangar.process.port` / `cargo.servlet.port` | none | Local TCP port that must accept connections before the start completes |
//!
//! The child inherits `JAVA_OPTS`, `CLASSPATH` and a few `HANGAR_*` variables
//! describing the handle, and writes stdout/stderr to the output file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::*;

/// Start/stop timeout used when the request does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const COMMAND_PROPERTY: &str = "hangar.process.command";
const ARGS_PROPERTY: &str = "hangar.process.args";
const PORT_PROPERTIES: [&str; 2] = ["hangar.process.port", "cargo.servlet.port"];
const DEFAULT_COMMAND: &str = "bin/start.sh";

/// Factory serving a configurable set of container ids with
/// [`ProcessContainer`]s.
pub struct ProcessContainerFactory {
    container_ids: Vec<String>,
}

impl ProcessContainerFactory {
    /// Create a factory serving `container_ids`.
    pub fn new(container_ids: Vec<String>) -> Self {
        Self { container_ids }
    }
}

impl ContainerFactory for ProcessContainerFactory {
    fn container_ids(&self) -> Vec<String> {
        self.container_ids.clone()
    }

    fn create_container(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>> {
        if !self.supports(&spec.container_id) {
            return Err(ContainerError::UnknownContainer(spec.container_id));
        }
        if spec.configuration.kind == ConfigurationType::Runtime {
            return Err(ContainerError::UnsupportedConfiguration {
                container_id: spec.container_id,
                kind: ConfigurationType::Runtime,
            });
        }
        let ignored = unapplied_xml_files(&spec.configuration);
        if !ignored.is_empty() {
            warn!(
                handle_id = %spec.handle_id,
                files = ?ignored,
                "Process adapter does not apply XML replacements; they are ignored"
            );
        }
        Ok(Arc::new(ProcessContainer::new(spec)))
    }
}

/// Files named by XML replacements of `configuration`, which this adapter
/// leaves untouched.
fn unapplied_xml_files(configuration: &Configuration) -> Vec<&str> {
    let mut files: Vec<&str> = configuration
        .xml_replacements
        .iter()
        .map(|r| r.file.as_str())
        .collect();
    files.sort_unstable();
    files.dedup();
    files
}

/// A server running as a local child process group.
pub struct ProcessContainer {
    spec: ContainerSpec,
    state: watch::Sender<ContainerState>,
    pid: Mutex<Option<i32>>,
}

impl ProcessContainer {
    /// Create a stopped container for `spec`.
    pub fn new(spec: ContainerSpec) -> Self {
        let (state, _) = watch::channel(ContainerState::Stopped);
        Self {
            spec,
            state,
            pid: Mutex::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        self.spec.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    fn command_path(&self) -> Result<PathBuf> {
        let command = self
            .spec
            .configuration
            .properties
            .get(COMMAND_PROPERTY)
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(DEFAULT_COMMAND);
        let command = PathBuf::from(command);
        if command.is_absolute() {
            return Ok(command);
        }
        match &self.spec.home {
            Some(home) => Ok(home.join(command)),
            None => Err(ContainerError::StartFailed(format!(
                "container home is not set and {} is relative",
                command.display()
            ))),
        }
    }

    fn args(&self) -> Vec<String> {
        match self.spec.configuration.properties.get_value(ARGS_PROPERTY) {
            Some(crate::properties::PropertyValue::Text(text)) => {
                text.split_whitespace().map(String::from).collect()
            }
            Some(_) => self.spec.configuration.properties.get_list(ARGS_PROPERTY),
            None => Vec::new(),
        }
    }

    fn readiness_port(&self) -> Option<u16> {
        PORT_PROPERTIES.iter().find_map(|key| {
            self.spec
                .configuration
                .properties
                .get(key)
                .and_then(|port| port.trim().parse().ok())
        })
    }

    fn java_opts(&self) -> String {
        let mut opts: Vec<String> = self.spec.jvm_args.iter().cloned().collect();
        for (key, value) in self.spec.system_properties.iter() {
            if let Some(value) = value.as_text() {
                opts.push(format!("-D{}={}", key, value));
            }
        }
        opts.join(" ")
    }

    fn environment(&self) -> Result<Vec<(String, OsString)>> {
        let classpath = join_paths(
            self.spec
                .extra_classpath
                .iter()
                .chain(self.spec.shared_classpath.iter()),
        )?;
        let deployables = join_paths(
            self.spec
                .configuration
                .deployables
                .iter()
                .map(|d| &d.path),
        )?;

        let mut env = vec![
            ("JAVA_OPTS".to_string(), OsString::from(self.java_opts())),
            ("CLASSPATH".to_string(), classpath),
            (
                "HANGAR_HANDLE_ID".to_string(),
                OsString::from(&self.spec.handle_id),
            ),
            (
                "HANGAR_CONFIGURATION_HOME".to_string(),
                self.spec.configuration.home.clone().into_os_string(),
            ),
            ("HANGAR_DEPLOYABLES".to_string(), deployables),
        ];
        if let Some(home) = &self.spec.home {
            env.push((
                "HANGAR_CONTAINER_HOME".to_string(),
                home.clone().into_os_string(),
            ));
        }
        if let Some(level) = &self.spec.log_level {
            env.push(("HANGAR_LOG_LEVEL".to_string(), OsString::from(level)));
        }
        Ok(env)
    }

    fn open_output(&self) -> Result<(Stdio, Stdio)> {
        if let Some(parent) = self.spec.output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.spec.append)
            .truncate(!self.spec.append)
            .open(&self.spec.output)?;
        let stderr = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }

    fn current_pid(&self) -> Option<i32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn log(&self, message: &str) {
        append_log(&self.spec.log_file, &self.spec.handle_id, message).await;
    }

    async fn wait_until_stopped(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, stopped(self.state.subscribe()))
            .await
            .is_ok()
    }
}

#[async_trait]
impl Container for ProcessContainer {
    fn id(&self) -> &str {
        &self.spec.container_id
    }

    async fn start(&self) -> Result<()> {
        if matches!(
            self.state(),
            ContainerState::Started | ContainerState::Starting
        ) {
            return Ok(());
        }

        let command = self.command_path()?;
        let args = self.args();
        let env = self.environment()?;
        let timeout = self.timeout();
        tokio::fs::create_dir_all(&self.spec.configuration.home).await?;
        let (stdout, stderr) = self.open_output()?;

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .current_dir(&self.spec.configuration.home)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);

        self.log(&format!("starting {} {}", command.display(), args.join(" ")))
            .await;
        self.state.send_replace(ContainerState::Starting);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state.send_replace(ContainerState::Stopped);
                self.log(&format!("spawn failed: {}", e)).await;
                return Err(ContainerError::StartFailed(format!(
                    "failed to spawn {}: {}",
                    command.display(),
                    e
                )));
            }
        };

        let pid = child.id().map(|pid| pid as i32);
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = pid;
        info!(
            handle_id = %self.spec.handle_id,
            pid = ?pid,
            command = %command.display(),
            "Container process spawned"
        );

        let state = self.state.clone();
        let log_file = self.spec.log_file.clone();
        let handle_id = self.spec.handle_id.clone();
        tokio::spawn(async move {
            let message = match child.wait().await {
                Ok(status) => format!("process exited: {}", status),
                Err(e) => format!("process wait failed: {}", e),
            };
            state.send_replace(ContainerState::Stopped);
            debug!(handle_id = %handle_id, "{}", message);
            append_log(&log_file, &handle_id, &message).await;
        });

        if let Some(port) = self.readiness_port() {
            let ready = tokio::select! {
                ready = wait_for_local_tcp_port(port, timeout) => ready,
                _ = stopped(self.state.subscribe()) => false,
            };
            if !ready {
                if self.state() == ContainerState::Stopped {
                    self.log("process exited before becoming ready").await;
                    return Err(ContainerError::StartFailed(format!(
                        "{} exited before port {} accepted connections",
                        command.display(),
                        port
                    )));
                }
                self.log(&format!("port {} not ready after {:?}", port, timeout))
                    .await;
                return Err(ContainerError::Timeout(timeout));
            }
        }

        // The monitor may already have observed an exit; keep that.
        self.state.send_if_modified(|s| {
            if *s == ContainerState::Starting {
                *s = ContainerState::Started;
                true
            } else {
                false
            }
        });
        if self.state() != ContainerState::Started {
            return Err(ContainerError::StartFailed(format!(
                "{} exited during startup",
                command.display()
            )));
        }

        self.log("started").await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.state() == ContainerState::Stopped {
            return Ok(());
        }
        let Some(pid) = self.current_pid() else {
            self.state.send_replace(ContainerState::Stopped);
            return Ok(());
        };

        self.state.send_if_modified(|s| {
            if *s == ContainerState::Stopped {
                false
            } else {
                *s = ContainerState::Stopping;
                true
            }
        });

        let timeout = self.timeout();
        self.log("stopping (SIGTERM)").await;
        signal_group(pid, Signal::SIGTERM);
        if self.wait_until_stopped(timeout).await {
            self.log("stopped").await;
            return Ok(());
        }

        warn!(
            handle_id = %self.spec.handle_id,
            pid,
            "Container did not stop in time, sending SIGKILL"
        );
        self.log("killed after timeout (SIGKILL)").await;
        signal_group(pid, Signal::SIGKILL);
        if self.wait_until_stopped(Duration::from_secs(5)).await {
            Ok(())
        } else {
            Err(ContainerError::StopFailed(format!(
                "process group {} survived SIGKILL",
                pid
            )))
        }
    }

    fn state(&self) -> ContainerState {
        *self.state.borrow()
    }
}

fn join_paths<'a, I>(paths: I) -> Result<OsString>
where
    I: Iterator<Item = &'a PathBuf>,
{
    std::env::join_paths(paths).map_err(|e| ContainerError::Other(e.to_string()))
}

fn signal_group(pid: i32, signal: Signal) {
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) => debug!(pid = pid, signal = ?signal, "Signalled process group"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid = pid, "Process group already gone (ESRCH)"),
        Err(e) => warn!(pid = pid, error = %e, "Failed to signal process group"),
    }
}

/// Resolves once the container reports `stopped`.
async fn stopped(mut rx: watch::Receiver<ContainerState>) {
    let _ = rx.wait_for(|s| *s == ContainerState::Stopped).await;
}

async fn wait_for_local_tcp_port(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(stream) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            drop(stream);
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn append_log(path: &Path, handle_id: &str, message: &str) {
    let line = format!(
        "{} [{}] {}\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        handle_id,
        message
    );
    let result = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await
    }
    .await;
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "Failed to write container log");
    }
}
