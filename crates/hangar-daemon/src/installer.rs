// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container installation from ZIP archives.
//!
//! [`ZipInstaller`] fetches an archive (HTTP download or local file), unpacks
//! it under the installs directory and returns the container home. Both the
//! download and the extracted tree are reused by later installs of the same
//! archive.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Marker written once an archive is fully extracted.
const INSTALLED_MARKER: &str = ".hangar-installed";

/// Errors from installing a container.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstallError {
    /// The archive could not be downloaded.
    #[error("Download of {url} failed: {reason}")]
    Download {
        /// Source URL.
        url: String,
        /// Last failure.
        reason: String,
    },

    /// The archive is unreadable or unsafe.
    #[error("Invalid archive {path}: {reason}")]
    Archive {
        /// Archive location.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The install source does not exist.
    #[error("Installer archive not found: {0}")]
    NotFound(PathBuf),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an installer archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// Remote archive (`http://`, `https://` or `file://`).
    Url(String),
    /// Local archive.
    File(PathBuf),
}

/// Installs container distributions.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install from `source` and return the container home directory.
    async fn install(&self, source: &InstallSource) -> Result<PathBuf, InstallError>;
}

/// Installer for ZIP distributions.
pub struct ZipInstaller {
    install_dir: PathBuf,
    client: reqwest::Client,
    locks: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ZipInstaller {
    /// Create an installer extracting under `install_dir`.
    pub fn new(install_dir: impl Into<PathBuf>) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hangar-daemon/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .map_err(|e| InstallError::Download {
                url: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            install_dir: install_dir.into(),
            client,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Directory archives are extracted into.
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    fn lock_for(&self, key: &Path) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn download(&self, url: &str) -> Result<PathBuf, InstallError> {
        let name = url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|n| !n.is_empty())
            .unwrap_or("download.zip");
        let downloads = self.install_dir.join("downloads");
        let zip_path = downloads.join(name);

        let lock = self.lock_for(&zip_path);
        let _guard = lock.lock().await;
        if zip_path.is_file() {
            debug!(url = %url, path = %zip_path.display(), "Reusing downloaded archive");
            return Ok(zip_path);
        }
        tokio::fs::create_dir_all(&downloads).await?;

        let mut last_err = String::from("download failed");
        let mut bytes = None;
        for attempt in 1..=3_u32 {
            match self.fetch(url).await {
                Ok(b) => {
                    bytes = Some(b);
                    break;
                }
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "Archive download failed");
                    last_err = e.to_string();
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_millis(
                            200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                        ))
                        .await;
                    }
                }
            }
        }
        let bytes = bytes.ok_or_else(|| InstallError::Download {
            url: url.to_string(),
            reason: last_err,
        })?;

        let tmp_path = zip_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &zip_path).await?;
        info!(url = %url, path = %zip_path.display(), size = bytes.len(), "Archive downloaded");
        Ok(zip_path)
    }

    async fn fetch(&self, url: &str) -> reqwest::Result<bytes::Bytes> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await
    }
}

#[async_trait]
impl Installer for ZipInstaller {
    async fn install(&self, source: &InstallSource) -> Result<PathBuf, InstallError> {
        let archive = match source {
            InstallSource::Url(url) => match url.strip_prefix("file://") {
                Some(path) => PathBuf::from(path),
                None => self.download(url).await?,
            },
            InstallSource::File(path) => path.clone(),
        };
        if !archive.is_file() {
            return Err(InstallError::NotFound(archive));
        }

        let stem = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "container".to_string());
        let target = self.install_dir.join(stem);

        let lock = self.lock_for(&target);
        let _guard = lock.lock().await;
        let home = tokio::task::spawn_blocking(move || extract(&archive, &target))
            .await
            .map_err(|e| InstallError::Io(std::io::Error::other(e)))??;
        info!(home = %home.display(), "Container installed");
        Ok(home)
    }
}

/// Extract `archive` into `target` unless a previous extraction completed,
/// and return the container home inside it.
fn extract(archive: &Path, target: &Path) -> Result<PathBuf, InstallError> {
    let marker = target.join(INSTALLED_MARKER);
    if marker.is_file() {
        return container_home(target);
    }
    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    fs::create_dir_all(target)?;

    let invalid = |reason: String| InstallError::Archive {
        path: archive.to_path_buf(),
        reason,
    };

    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| invalid(e.to_string()))?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| invalid(e.to_string()))?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(invalid(format!("entry {} escapes the archive root", entry.name())));
        };
        let out_path = target.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = out_path.with_extension("tmp");
        let mut out = fs::File::create(&tmp_path)?;
        std::io::copy(&mut entry, &mut out)?;
        out.flush()?;
        fs::rename(&tmp_path, &out_path)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }

    fs::write(&marker, b"")?;
    container_home(target)
}

/// The single top-level directory of an extraction, or the extraction
/// directory itself.
fn container_home(target: &Path) -> Result<PathBuf, InstallError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(target)? {
        let entry = entry?;
        if entry.file_name() != INSTALLED_MARKER {
            entries.push(entry.path());
        }
    }
    match entries.as_slice() {
        [single] if single.is_dir() => Ok(single.clone()),
        _ => Ok(target.to_path_buf()),
    }
}
