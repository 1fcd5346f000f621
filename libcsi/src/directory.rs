//! Volume Directory: the read-only source of hosting volume descriptors.
//!
//! [`InfoDirectory`] reads one JSON descriptor per hosting volume from
//! `<info_dir>/<name>.info`, the files the operator drops into the plugin
//! pods through a config map.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CsiError;
use crate::types::{HostingVolume, VolumeFilter};

const INFO_SUFFIX: &str = ".info";

/// Source of hosting volume listings, queried on demand.
#[async_trait]
pub trait VolumeDirectory: Send + Sync {
    /// Return every hosting volume matching `filter`, names unique.
    async fn list_hosting_volumes(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<HostingVolume>, CsiError>;
}

/// [`VolumeDirectory`] backed by a directory of `.info` files.
pub struct InfoDirectory {
    info_dir: PathBuf,
}

impl InfoDirectory {
    pub fn new(info_dir: impl Into<PathBuf>) -> Self {
        Self {
            info_dir: info_dir.into(),
        }
    }
}

#[async_trait]
impl VolumeDirectory for InfoDirectory {
    async fn list_hosting_volumes(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<HostingVolume>, CsiError> {
        let mut dir = match tokio::fs::read_dir(&self.info_dir).await {
            Ok(d) => d,
            // No descriptors deployed yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CsiError::ListingFailed(format!(
                    "read_dir {}: {e}",
                    self.info_dir.display()
                )));
            }
        };

        let mut volumes: Vec<HostingVolume> = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| CsiError::ListingFailed(e.to_string()))?
        {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(INFO_SUFFIX) {
                continue;
            }

            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume info, skipping");
                    continue;
                }
            };
            let volume: HostingVolume = match serde_json::from_str(&json) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume info, skipping");
                    continue;
                }
            };
            if filter.matches(&volume) {
                volumes.push(volume);
            }
        }

        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        volumes.dedup_by(|dup, kept| {
            let same = dup.name == kept.name;
            if same {
                warn!(hvol = %dup.name, "duplicate hosting volume descriptor ignored");
            }
            same
        });

        debug!(dir = %self.info_dir.display(), count = volumes.len(), "hosting volumes listed");
        Ok(volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KFormat, VolumeType};

    async fn write_info(dir: &std::path::Path, file: &str, body: &str) {
        tokio::fs::write(dir.join(file), body).await.unwrap();
    }

    #[tokio::test]
    async fn missing_directory_is_empty_listing() {
        let directory = InfoDirectory::new("/nonexistent/volinfo/for/test");
        let vols = directory
            .list_hosting_volumes(&VolumeFilter::default())
            .await
            .unwrap();
        assert!(vols.is_empty());
    }

    #[tokio::test]
    async fn unreadable_directory_is_listing_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let not_a_dir = tmp.path().join("plain-file");
        tokio::fs::write(&not_a_dir, b"x").await.unwrap();

        let result = InfoDirectory::new(&not_a_dir)
            .list_hosting_volumes(&VolumeFilter::default())
            .await;
        assert!(matches!(result, Err(CsiError::ListingFailed(_))));
    }

    #[tokio::test]
    async fn lists_sorted_and_skips_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        write_info(
            tmp.path(),
            "vol2.info",
            r#"{"volname": "vol2", "kadalu_format": "non-native", "type": "External",
                "gluster_hosts": ["g1"], "gluster_volname": "remote"}"#,
        )
        .await;
        write_info(
            tmp.path(),
            "vol1.info",
            r#"{"volname": "vol1", "kadalu_format": "native", "type": "Replica1"}"#,
        )
        .await;
        write_info(tmp.path(), "broken.info", "{not json").await;
        write_info(tmp.path(), "README", "ignored").await;

        let vols = InfoDirectory::new(tmp.path())
            .list_hosting_volumes(&VolumeFilter::default())
            .await
            .unwrap();
        let names: Vec<_> = vols.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["vol1", "vol2"]);
        assert_eq!(vols[1].kformat, KFormat::NonNative);
        assert_eq!(vols[1].volume_type, VolumeType::External);
    }

    #[tokio::test]
    async fn duplicate_names_are_collapsed() {
        let tmp = tempfile::tempdir().unwrap();
        let body = r#"{"volname": "vol1", "type": "Replica3"}"#;
        write_info(tmp.path(), "vol1.info", body).await;
        write_info(tmp.path(), "vol1-copy.info", body).await;

        let vols = InfoDirectory::new(tmp.path())
            .list_hosting_volumes(&VolumeFilter::default())
            .await
            .unwrap();
        assert_eq!(vols.len(), 1);
    }

    #[tokio::test]
    async fn filter_is_applied() {
        let tmp = tempfile::tempdir().unwrap();
        write_info(tmp.path(), "a.info", r#"{"volname": "a", "type": "Replica1"}"#).await;
        write_info(tmp.path(), "b.info", r#"{"volname": "b", "type": "Disperse"}"#).await;

        let vols = InfoDirectory::new(tmp.path())
            .list_hosting_volumes(&VolumeFilter::by_name("b"))
            .await
            .unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].volume_type, VolumeType::Disperse);
    }
}
