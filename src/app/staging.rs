use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::app::error::AppError;
use crate::app::models::{ClientManifest, ConnectionMethod};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Where staged client bundles come from when none is present locally.
/// The release-fetching layer itself lives outside this crate; the
/// provisioning pipeline only needs "put a bundle at this path".
#[async_trait]
pub trait ClientReleaseSource: Send + Sync {
    async fn download_latest(&self, dest: &Path) -> Result<(), AppError>;
}

/// Default source for deployments with no release feed wired in.
pub struct NoClientReleases;

#[async_trait]
impl ClientReleaseSource for NoClientReleases {
    async fn download_latest(&self, _dest: &Path) -> Result<(), AppError> {
        Err(AppError::dependency(
            "No client release source is configured",
            "",
        ))
    }
}

/// The on-disk staged webapp bundle. The bundle and its manifest are shared
/// mutable state between configure operations; `push_lock` serializes the
/// swap-push-restore sequence process-wide.
pub struct StagedClient {
    root: PathBuf,
    push_lock: Mutex<()>,
}

impl StagedClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            push_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn is_staged(&self) -> bool {
        self.manifest_path().exists()
    }

    pub fn load_manifest(&self) -> Result<ClientManifest, AppError> {
        let path = self.manifest_path();
        let raw = fs::read_to_string(&path).map_err(|err| {
            AppError::system(format!("Failed to read staged manifest: {err}"), "")
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            AppError::system(format!("Failed to parse staged manifest: {err}"), "")
        })
    }

    pub fn save_manifest(&self, manifest: &ClientManifest) -> Result<(), AppError> {
        if let Some(parent) = self.manifest_path().parent() {
            let _ = fs::create_dir_all(parent);
        }
        let payload = serde_json::to_string_pretty(manifest).map_err(|err| {
            AppError::system(format!("Failed to serialize staged manifest: {err}"), "")
        })?;
        fs::write(self.manifest_path(), payload).map_err(|err| {
            AppError::system(format!("Failed to write staged manifest: {err}"), "")
        })
    }

    /// Merge top-level keys of a JSON patch into the staged manifest and
    /// return the merged result.
    pub fn merge_manifest(&self, patch: &serde_json::Value) -> Result<ClientManifest, AppError> {
        let raw = fs::read_to_string(self.manifest_path()).map_err(|err| {
            AppError::system(format!("Failed to read staged manifest: {err}"), "")
        })?;
        let mut current: serde_json::Value = serde_json::from_str(&raw).map_err(|err| {
            AppError::system(format!("Failed to parse staged manifest: {err}"), "")
        })?;

        if let (Some(target), Some(source)) = (current.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        } else {
            return Err(AppError::validation("Manifest patch must be an object", ""));
        }

        let merged: ClientManifest = serde_json::from_value(current).map_err(|err| {
            AppError::validation(format!("Merged manifest is invalid: {err}"), "")
        })?;
        self.save_manifest(&merged)?;
        Ok(merged)
    }

    pub async fn acquire_push_lock(&self) -> MutexGuard<'_, ()> {
        self.push_lock.lock().await
    }

    /// Snapshot the staged manifest ahead of a device-specific rewrite.
    /// Dropping the returned guard restores the snapshot, so the staged
    /// bundle is never left pointing at one device after a failed push.
    pub fn begin_swap(&self) -> Result<ManifestSwap, AppError> {
        let path = self.manifest_path();
        let snapshot = fs::read_to_string(&path).map_err(|err| {
            AppError::system(format!("Failed to snapshot staged manifest: {err}"), "")
        })?;
        Ok(ManifestSwap {
            path,
            snapshot,
            restored: false,
        })
    }
}

pub struct ManifestSwap {
    path: PathBuf,
    snapshot: String,
    restored: bool,
}

impl ManifestSwap {
    /// Point the staged manifest at the device it is about to be pushed to.
    pub fn set_device_context(&self, device_id: &str, port: u16) -> Result<(), AppError> {
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            AppError::system(format!("Failed to read staged manifest: {err}"), "")
        })?;
        let mut manifest: ClientManifest = serde_json::from_str(&raw).map_err(|err| {
            AppError::system(format!("Failed to parse staged manifest: {err}"), "")
        })?;

        manifest.context.method = Some(ConnectionMethod::Adb);
        manifest.context.adb_id = Some(device_id.to_string());
        manifest.context.ip = Some("localhost".to_string());
        manifest.context.port = Some(port);

        let payload = serde_json::to_string_pretty(&manifest).map_err(|err| {
            AppError::system(format!("Failed to serialize staged manifest: {err}"), "")
        })?;
        fs::write(&self.path, payload).map_err(|err| {
            AppError::system(format!("Failed to write staged manifest: {err}"), "")
        })
    }

    /// Explicit restore so the success path can surface write errors; the
    /// drop impl covers every other exit path.
    pub fn restore(mut self) -> Result<(), AppError> {
        let result = fs::write(&self.path, &self.snapshot).map_err(|err| {
            AppError::system(format!("Failed to restore staged manifest: {err}"), "")
        });
        self.restored = result.is_ok();
        result
    }
}

impl Drop for ManifestSwap {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(err) = fs::write(&self.path, &self.snapshot) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "failed to restore staged manifest snapshot"
            );
        }
    }
}
