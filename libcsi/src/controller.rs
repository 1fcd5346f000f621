//! CSI Controller service trait.
//!
//! The Controller service runs in the provisioner pod and carves persistent
//! volumes out of the hosting volumes mounted by the startup reconciliation
//! pass.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{CreateVolumeRequest, Volume, VolumeCapability, VolumeId};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// Idempotent by name: a second call with the same name returns the
    /// existing volume.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Deleting an unknown volume
    /// succeeds.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List all volumes known to this controller.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the total available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;
}
