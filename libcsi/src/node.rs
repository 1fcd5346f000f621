//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a provisioned volume
//! visible inside a Pod:
//!
//! 1. **Publish**: make sure the hosting volume is mounted, then bind-mount
//!    the volume's sub-directory onto the kubelet target path.
//! 2. **Unpublish**: remove the bind-mount.
//!
//! Staging is not used; the hosting volume mount is shared by all volumes
//! carved out of it.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodeInfo, NodePublishVolumeRequest, VolumeId};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Publish a volume: bind-mount its directory into the container.
    ///
    /// This is idempotent: calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the container path.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
