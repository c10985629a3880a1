// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daemon home layout and file operations.
//!
//! ```text
//! <home>/
//! ├── handle.properties        handle database
//! ├── workspace/               shared uploads (installers, shared classpath)
//! │   └── <handle>/            per-handle uploads (deployables, config files)
//! ├── configurations/<handle>/ default configuration homes
//! ├── installs/                extracted container distributions
//! └── logs/<handle>/           container output and adapter logs
//! ```

use std::path::{Component, Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handle_database::HandleDatabase;

const HANDLE_DATABASE_FILE: &str = "handle.properties";

/// Resolves and manipulates files under the daemon home.
pub struct FileManager {
    home: PathBuf,
    save_lock: Mutex<()>,
}

impl FileManager {
    /// Create a manager rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            save_lock: Mutex::new(()),
        }
    }

    /// Create the top-level directories.
    pub async fn init(&self) -> Result<()> {
        for dir in [
            self.workspace_dir(),
            self.install_dir(),
            self.home.join("configurations"),
            self.home.join("logs"),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        debug!(home = %self.home.display(), "Daemon home ready");
        Ok(())
    }

    /// Daemon home.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Shared workspace.
    pub fn workspace_dir(&self) -> PathBuf {
        self.home.join("workspace")
    }

    /// Workspace of one handle.
    pub fn handle_workspace_dir(&self, handle_id: &str) -> PathBuf {
        self.workspace_dir().join(handle_id)
    }

    /// Where container distributions are installed.
    pub fn install_dir(&self) -> PathBuf {
        self.home.join("installs")
    }

    /// Default configuration home of a handle.
    pub fn configuration_dir(&self, handle_id: &str) -> PathBuf {
        self.home.join("configurations").join(handle_id)
    }

    /// Log directory of a handle.
    pub fn log_dir(&self, handle_id: &str) -> PathBuf {
        self.home.join("logs").join(handle_id)
    }

    /// Log file of a handle. Absolute names are used as they are.
    pub fn log_file(&self, handle_id: &str, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.log_dir(handle_id).join(path)
        }
    }

    /// Location of the handle database.
    pub fn handle_database_file(&self) -> PathBuf {
        self.home.join(HANDLE_DATABASE_FILE)
    }

    /// Resolve a relative path inside the shared workspace, or inside the
    /// workspace of `handle_id` when given.
    pub fn resolve_workspace_path(&self, handle_id: Option<&str>, rel: &str) -> Result<PathBuf> {
        let rel = normalize_rel_path(rel)?;
        let base = match handle_id {
            Some(id) => self.handle_workspace_dir(id),
            None => self.workspace_dir(),
        };
        Ok(base.join(rel))
    }

    /// Resolve a client-supplied relative path under `base`.
    pub fn resolve_under(&self, base: &Path, rel: &str) -> Result<PathBuf> {
        Ok(base.join(normalize_rel_path(rel)?))
    }

    /// Save an upload into a workspace and return its path.
    ///
    /// Without `data` nothing is written and the path of the previously
    /// uploaded file is returned; it must exist.
    pub async fn save_file(
        &self,
        handle_id: Option<&str>,
        rel: &str,
        data: Option<&[u8]>,
    ) -> Result<PathBuf> {
        let path = self.resolve_workspace_path(handle_id, rel)?;
        match data {
            Some(data) => {
                write_atomic(&path, data).await?;
                debug!(path = %path.display(), size = data.len(), "Saved workspace file");
            }
            None if !tokio::fs::try_exists(&path).await? => {
                return Err(Error::Other(format!(
                    "File {} was not uploaded and is not in the workspace",
                    rel
                )));
            }
            None => {}
        }
        Ok(path)
    }

    /// Copy `from` to `to`, creating parent directories. With `overwrite`
    /// unset an existing target is kept; returns whether a copy happened.
    pub async fn copy_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<bool> {
        if !overwrite && tokio::fs::try_exists(to).await? {
            return Ok(false);
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(from, to).await?;
        Ok(true)
    }

    /// Whether a file exists in the shared workspace.
    pub async fn exists_file(&self, rel: &str) -> bool {
        match self.resolve_workspace_path(None, rel) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Load the handle database; a missing file is an empty database.
    pub async fn load_handle_database(&self) -> Result<HandleDatabase> {
        let path = self.handle_database_file();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let db = HandleDatabase::load(bytes.as_slice())?;
                info!(path = %path.display(), handles = db.len(), "Handle database loaded");
                Ok(db)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HandleDatabase::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the handle database (temp file, then rename). Concurrent saves
    /// are serialized.
    pub async fn save_handle_database(&self, db: &HandleDatabase) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let mut buf = Vec::new();
        db.store(&mut buf)?;
        write_atomic(&self.handle_database_file(), &buf).await?;
        debug!(handles = db.len(), "Handle database saved");
        Ok(())
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Validate a client-supplied relative path: no root, no `..`.
fn normalize_rel_path(rel: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(rel.trim()).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid(
                    "filename",
                    format!("{} must be a relative path inside the workspace", rel),
                ));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::invalid("filename", "empty file name"));
    }
    Ok(out)
}
