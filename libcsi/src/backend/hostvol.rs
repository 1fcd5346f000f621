//! Host-volume storage backend for CSI.
//!
//! [`HostVolBackend`] implements [`CsiIdentity`], [`CsiController`], and
//! [`CsiNode`] on top of the hosting volumes mounted by the reconciler.
//! Each provisioned volume is a sub-directory of one hosting volume and is
//! made available to containers with a bind-mount.
//!
//! # On-disk layout
//!
//! ```text
//! <mount_root>/<hostvol>/
//!   subvol/<volume-id>/        # data directory bind-mounted into Pods
//!   info/<volume-id>.json      # persisted CSI metadata
//! ```
//!
//! The metadata lives on the hosting volume itself, so every node that
//! mounts the hosting volume sees the same set of provisioned volumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use nix::mount::MsFlags;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::controller::CsiController;
use crate::directory::VolumeDirectory;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mount::{MountExecutor, is_mountpoint};
use crate::node::CsiNode;
use crate::types::*;

/// Storage class parameter selecting the hosting volume.
pub const PARAM_HOSTVOL: &str = "hostvol";
/// Volume context key carrying the hosting volume name.
pub const CTX_HOSTVOL: &str = "hostvol";
/// Volume context key carrying the path relative to the hosting volume.
pub const CTX_PATH: &str = "path";

const SUBVOL_DIR: &str = "subvol";
const INFO_DIR: &str = "info";

/// Concrete CSI backend carving volumes out of hosting volumes.
pub struct HostVolBackend {
    /// Hosting volumes are mounted at `<mount_root>/<name>`.
    mount_root: PathBuf,
    directory: Arc<dyn VolumeDirectory>,
    executor: Arc<dyn MountExecutor>,
    node_id: String,
    driver_name: String,
    /// Serializes create/delete of the same volume name.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl HostVolBackend {
    pub fn new(
        mount_root: impl Into<PathBuf>,
        directory: Arc<dyn VolumeDirectory>,
        executor: Arc<dyn MountExecutor>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            mount_root: mount_root.into(),
            directory,
            executor,
            node_id: node_id.into(),
            driver_name: crate::config::DEFAULT_DRIVER_NAME.to_owned(),
            locks: DashMap::new(),
        }
    }

    pub fn with_driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = name.into();
        self
    }

    fn meta_path(&self, hostvol: &HostingVolume, volume_id: &VolumeId) -> PathBuf {
        hostvol
            .mount_dir(&self.mount_root)
            .join(INFO_DIR)
            .join(format!("{}.json", volume_id.0))
    }

    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(name.to_owned()).or_default().clone();
        lock.lock_owned().await
    }

    async fn hosting_volume(&self, name: &str) -> Result<HostingVolume, CsiError> {
        self.directory
            .list_hosting_volumes(&VolumeFilter::by_name(name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CsiError::VolumeNotFound(format!("hosting volume {name}")))
    }

    /// The `hostvol` parameter wins; otherwise the first native hosting
    /// volume in the listing.
    async fn choose_hosting_volume(
        &self,
        parameters: &HashMap<String, String>,
    ) -> Result<HostingVolume, CsiError> {
        if let Some(name) = parameters.get(PARAM_HOSTVOL) {
            return self.hosting_volume(name).await.map_err(|e| match e {
                CsiError::VolumeNotFound(_) => {
                    CsiError::InvalidArgument(format!("unknown hosting volume {name:?}"))
                }
                other => other,
            });
        }

        let filter = VolumeFilter {
            kformat: Some(KFormat::Native),
            ..Default::default()
        };
        self.directory
            .list_hosting_volumes(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CsiError::BackendError("no native hosting volume available".into()))
    }

    /// Locate the metadata sidecar of `volume_id` on any hosting volume.
    async fn find_volume(
        &self,
        volume_id: &VolumeId,
    ) -> Result<Option<(HostingVolume, Volume)>, CsiError> {
        for hostvol in self
            .directory
            .list_hosting_volumes(&VolumeFilter::default())
            .await?
        {
            let path = self.meta_path(&hostvol, volume_id);
            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CsiError::BackendError(format!(
                        "read {}: {e}",
                        path.display()
                    )));
                }
            };
            let volume: Volume = serde_json::from_str(&json).map_err(|e| {
                CsiError::BackendError(format!("parse {}: {e}", path.display()))
            })?;
            return Ok(Some((hostvol, volume)));
        }
        Ok(None)
    }

    /// All volumes recorded on one hosting volume.  Corrupt sidecars are
    /// skipped.
    async fn volumes_on(&self, hostvol: &HostingVolume) -> Result<Vec<Volume>, CsiError> {
        let info_dir = hostvol.mount_dir(&self.mount_root).join(INFO_DIR);
        let mut dir = match tokio::fs::read_dir(&info_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CsiError::BackendError(format!(
                    "read_dir {}: {e}",
                    info_dir.display()
                )));
            }
        };

        let mut volumes = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(CsiError::backend)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|json| serde_json::from_str::<Volume>(&json).map_err(|e| e.to_string()));
            match parsed {
                Ok(volume) => volumes.push(volume),
                Err(e) => {
                    warn!(hvol = %hostvol.name, path = %path.display(), error = %e, "skipping volume metadata");
                }
            }
        }
        Ok(volumes)
    }

    /// Resolve the hosting volume and relative path backing a publish
    /// request, preferring the volume context written by `create_volume`.
    async fn resolve_source(
        &self,
        req: &NodePublishVolumeRequest,
    ) -> Result<(HostingVolume, PathBuf), CsiError> {
        if let Some(name) = req.volume_context.get(CTX_HOSTVOL) {
            let hostvol = self.hosting_volume(name).await?;
            let rel = req
                .volume_context
                .get(CTX_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| subvol_path(&req.volume_id));
            return Ok((hostvol, rel));
        }

        match self.find_volume(&req.volume_id).await? {
            Some((hostvol, volume)) => {
                let rel = volume_path(&volume);
                Ok((hostvol, rel))
            }
            None => Err(CsiError::VolumeNotFound(req.volume_id.to_string())),
        }
    }
}

fn subvol_path(volume_id: &VolumeId) -> PathBuf {
    Path::new(SUBVOL_DIR).join(&volume_id.0)
}

fn volume_path(volume: &Volume) -> PathBuf {
    volume
        .volume_context
        .get(CTX_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|| subvol_path(&volume.volume_id))
}

/// Volume names become directory names.
fn validate_name(name: &str) -> Result<(), CsiError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(CsiError::InvalidArgument(format!(
            "invalid volume name {name:?}"
        )));
    }
    Ok(())
}

fn node_topology(node_id: &str) -> Topology {
    Topology {
        segments: HashMap::from([("node".to_owned(), node_id.to_owned())]),
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for HostVolBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Healthy when the mount root exists and is a directory.
        let exists = tokio::fs::metadata(&self.mount_root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(exists)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for HostVolBackend {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        validate_name(&req.name)?;
        if req.volume_capabilities.iter().any(|c| c.block) {
            return Err(CsiError::InvalidArgument(
                "block access type is not supported".into(),
            ));
        }

        let _guard = self.lock(&req.name).await;
        let volume_id = VolumeId(req.name.clone());

        if let Some((hostvol, volume)) = self.find_volume(&volume_id).await? {
            debug!(hvol = %hostvol.name, "returning existing volume for idempotent create");
            return Ok(volume);
        }

        let hostvol = self.choose_hosting_volume(&req.parameters).await?;
        let mount_dir = hostvol.mount_dir(&self.mount_root);
        self.executor.mount(&hostvol, &mount_dir).await?;

        let rel = subvol_path(&volume_id);
        let data_dir = mount_dir.join(&rel);
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            CsiError::BackendError(format!("create dir {}: {e}", data_dir.display()))
        })?;

        let volume = Volume {
            volume_id: volume_id.clone(),
            capacity_bytes: req.capacity_bytes,
            parameters: req.parameters,
            volume_context: HashMap::from([
                (CTX_HOSTVOL.to_owned(), hostvol.name.clone()),
                (CTX_PATH.to_owned(), rel.to_string_lossy().into_owned()),
            ]),
            accessible_topology: Vec::new(),
        };

        // The sidecar is written last: it is what marks the volume as
        // existing, so a failed create leaves nothing a retry would trip on.
        let meta_path = self.meta_path(&hostvol, &volume_id);
        if let Some(parent) = meta_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CsiError::BackendError(format!("create dir {}: {e}", parent.display()))
            })?;
        }
        let meta_json = serde_json::to_string_pretty(&volume).map_err(CsiError::backend)?;
        tokio::fs::write(&meta_path, meta_json)
            .await
            .map_err(|e| CsiError::BackendError(format!("write meta {volume_id}: {e}")))?;

        info!(hvol = %hostvol.name, %volume_id, "volume created");
        Ok(volume)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let _guard = self.lock(&volume_id.0).await;

        let Some((hostvol, volume)) = self.find_volume(volume_id).await? else {
            debug!("volume not found, nothing to delete");
            return Ok(());
        };

        // Data first, so a failed removal keeps the sidecar and can be retried.
        let data_dir = hostvol.mount_dir(&self.mount_root).join(volume_path(&volume));
        if tokio::fs::try_exists(&data_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&data_dir).await.map_err(|e| {
                CsiError::BackendError(format!("remove dir {}: {e}", data_dir.display()))
            })?;
        }

        let meta_path = self.meta_path(&hostvol, volume_id);
        tokio::fs::remove_file(&meta_path).await.map_err(|e| {
            CsiError::BackendError(format!("remove meta {}: {e}", meta_path.display()))
        })?;

        info!(hvol = %hostvol.name, "volume deleted");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if self.find_volume(volume_id).await?.is_none() {
            return Err(CsiError::VolumeNotFound(volume_id.to_string()));
        }
        // Every access mode works on a shared filesystem; raw block does not.
        Ok(capabilities.iter().all(|c| !c.block))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        let mut volumes = Vec::new();
        for hostvol in self
            .directory
            .list_hosting_volumes(&VolumeFilter::default())
            .await?
        {
            volumes.extend(self.volumes_on(&hostvol).await?);
        }
        volumes.sort_by(|a, b| a.volume_id.0.cmp(&b.volume_id.0));
        Ok(volumes)
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        let mut total = 0;
        for hostvol in self
            .directory
            .list_hosting_volumes(&VolumeFilter::default())
            .await?
        {
            let dir = hostvol.mount_dir(&self.mount_root);
            if !is_mountpoint(&dir).await {
                continue;
            }
            let stat = nix::sys::statvfs::statvfs(dir.as_path())
                .map_err(|e| CsiError::Internal(format!("statvfs {}: {e}", dir.display())))?;
            total += stat.fragment_size() * stat.blocks_available();
        }
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for HostVolBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        let target = Path::new(&req.target_path);

        // Without this check a second call would fail with EBUSY.
        if is_mountpoint(target).await {
            debug!(target_path = %req.target_path, "target already mounted, assuming idempotent retry");
            return Ok(());
        }

        let (hostvol, rel) = self.resolve_source(&req).await?;
        let mount_dir = hostvol.mount_dir(&self.mount_root);
        self.executor.mount(&hostvol, &mount_dir).await?;

        let source = mount_dir.join(rel);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(CsiError::VolumeNotFound(format!(
                "{} ({} missing)",
                req.volume_id,
                source.display()
            )));
        }

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: e.to_string(),
            })?;

        let read_only = req.read_only
            || matches!(
                req.volume_capability.access_mode,
                AccessMode::ReadOnlyOnce | AccessMode::ReadOnlyMany
            );

        let mut flags = MsFlags::MS_BIND;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }

        nix::mount::mount(
            Some(source.as_path()),
            target,
            None::<&str>,
            flags,
            None::<&str>,
        )
        .map_err(|e| CsiError::MountFailed {
            path: req.target_path.clone(),
            reason: e.to_string(),
        })?;

        // MS_RDONLY is ignored on the initial bind; a remount enforces it.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: format!("remount read-only: {e}"),
            })?;
        }

        info!(
            hvol = %hostvol.name,
            target_path = %req.target_path,
            read_only,
            "volume published (bind-mount)",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if !is_mountpoint(Path::new(target_path)).await {
            debug!("target not mounted, nothing to unpublish");
            return Ok(());
        }

        nix::mount::umount(target_path).map_err(|e| CsiError::UnmountFailed {
            path: target_path.to_owned(),
            reason: e.to_string(),
        })?;

        info!(%target_path, "volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: 0,
            accessible_topology: Some(node_topology(&self.node_id)),
        })
    }
}
