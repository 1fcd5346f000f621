//! Core CSI types: hosting volumes, mount outcomes, provisioned volumes,
//! capabilities, requests, and topology.
//!
//! Hosting volume descriptors are [`Deserialize`] so they can be read from
//! the `<name>.info` files written by the operator.  The remaining types are
//! the domain side of the gRPC messages in [`crate::proto`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Hosting volumes
// ---------------------------------------------------------------------------

/// Ownership format of a hosting volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum KFormat {
    /// Fully managed by this plugin (mount, quota, lifecycle).
    Native,
    /// Pre-existing volume adopted for provisioning metadata only.
    NonNative,
}

impl fmt::Display for KFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::NonNative => f.write_str("non-native"),
        }
    }
}

/// Topology type of a hosting volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VolumeType {
    /// Storage lives outside this plugin's mount domain.
    External,
    Replica1,
    Replica2,
    Replica3,
    Disperse,
    /// Any type this build does not know about.
    #[serde(other)]
    Unknown,
}

/// Remote servers of an [`VolumeType::External`] hosting volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalSource {
    /// Volfile servers, tried in order.
    #[serde(default, rename = "gluster_hosts")]
    pub hosts: Vec<String>,
    /// Volume name on the remote cluster.
    #[serde(rename = "gluster_volname")]
    pub volname: String,
}

/// Descriptor of a backing volume this plugin may mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostingVolume {
    /// Unique name within one listing.
    #[serde(alias = "volname")]
    pub name: String,
    #[serde(alias = "kadalu_format", default = "default_kformat")]
    pub kformat: KFormat,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    /// Present for external volumes only.
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalSource>,
}

fn default_kformat() -> KFormat {
    KFormat::Native
}

impl HostingVolume {
    pub fn new(name: impl Into<String>, kformat: KFormat, volume_type: VolumeType) -> Self {
        Self {
            name: name.into(),
            kformat,
            volume_type,
            external: None,
        }
    }

    /// Local mount point: `<mount_root>/<name>`.
    pub fn mount_dir(&self, mount_root: &Path) -> PathBuf {
        mount_root.join(&self.name)
    }

    pub fn is_external(&self) -> bool {
        self.volume_type == VolumeType::External
    }
}

/// Criteria for [`crate::directory::VolumeDirectory::list_hosting_volumes`].
///
/// The default value matches every volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    pub name: Option<String>,
    pub kformat: Option<KFormat>,
    pub volume_type: Option<VolumeType>,
}

impl VolumeFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, volume: &HostingVolume) -> bool {
        self.name.as_ref().is_none_or(|n| *n == volume.name)
            && self.kformat.is_none_or(|k| k == volume.kformat)
            && self.volume_type.is_none_or(|t| t == volume.volume_type)
    }
}

// ---------------------------------------------------------------------------
// Reconciliation results
// ---------------------------------------------------------------------------

/// Which sweep a reconciliation pass performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Mount volumes that are missing after a (re)start.
    Startup,
    /// Reapply configuration of existing mounts.
    Reload,
}

impl fmt::Display for PassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => f.write_str("startup"),
            Self::Reload => f.write_str("reload"),
        }
    }
}

/// Action taken for one volume in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountAction {
    Mounted,
    Reloaded,
    Skipped,
}

/// Result of one mount/reload attempt.  Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOutcome {
    pub volume: String,
    pub action: MountAction,
    /// `None` on success.
    pub error: Option<String>,
}

impl MountOutcome {
    pub fn success(volume: impl Into<String>, action: MountAction) -> Self {
        Self {
            volume: volume.into(),
            action,
            error: None,
        }
    }

    pub fn failure(volume: impl Into<String>, action: MountAction, error: impl fmt::Display) -> Self {
        Self {
            volume: volume.into(),
            action,
            error: Some(error.to_string()),
        }
    }

    pub fn skipped(volume: impl Into<String>) -> Self {
        Self::success(volume, MountAction::Skipped)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Single-node read-only.
    ReadOnlyOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node, one writer.
    SingleWriterMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// `true` when a raw block device was requested.
    #[serde(default)]
    pub block: bool,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteMany,
            mount_flags: Vec::new(),
            block: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioned volume metadata
// ---------------------------------------------------------------------------

/// Full metadata for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// User-supplied parameters from the storage class / request.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Topology constraints (e.g. node affinity).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    /// Topology segments, e.g. `{"node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    /// Name chosen by the CO; doubles as the volume ID.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters, e.g. `hostvol`.
    pub parameters: HashMap<String, String>,
}

/// Request to publish (bind-mount) a volume into a Pod container.
#[derive(Debug, Clone)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Target path inside the container,
    /// e.g. `/var/lib/kubelet/pods/<pod-uid>/volumes/<vol-name>/mount`.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    pub read_only: bool,
    /// Opaque context carried from `CreateVolume`.
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.glusterfs.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host (0 = unlimited).
    pub max_volumes: u64,
    /// Optional topology of this node.
    pub accessible_topology: Option<Topology>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("pvc-abc".into());
        assert_eq!(id.to_string(), "pvc-abc");
    }

    #[test]
    fn parse_native_info_file() {
        let json = r#"{"volname": "storage-pool-1", "kadalu_format": "native", "type": "Replica3"}"#;
        let vol: HostingVolume = serde_json::from_str(json).expect("deserialize");
        assert_eq!(vol.name, "storage-pool-1");
        assert_eq!(vol.kformat, KFormat::Native);
        assert_eq!(vol.volume_type, VolumeType::Replica3);
        assert!(vol.external.is_none());
    }

    #[test]
    fn parse_external_info_file() {
        let json = r#"{
            "volname": "ext-pool",
            "kadalu_format": "non-native",
            "type": "External",
            "gluster_hosts": ["gluster1.example.com", "gluster2.example.com"],
            "gluster_volname": "shared"
        }"#;
        let vol: HostingVolume = serde_json::from_str(json).expect("deserialize");
        assert_eq!(vol.kformat, KFormat::NonNative);
        assert!(vol.is_external());
        let ext = vol.external.expect("external source");
        assert_eq!(ext.hosts.len(), 2);
        assert_eq!(ext.volname, "shared");
    }

    #[test]
    fn unknown_type_and_missing_kformat() {
        let json = r#"{"name": "arbiter-pool", "type": "Arbiter"}"#;
        let vol: HostingVolume = serde_json::from_str(json).expect("deserialize");
        assert_eq!(vol.volume_type, VolumeType::Unknown);
        assert_eq!(vol.kformat, KFormat::Native);
    }

    #[test]
    fn mount_dir_is_joined_under_root() {
        let vol = HostingVolume::new("vol1", KFormat::Native, VolumeType::Replica1);
        assert_eq!(vol.mount_dir(Path::new("/mnt")), PathBuf::from("/mnt/vol1"));
    }

    #[test]
    fn filter_matching() {
        let vol = HostingVolume::new("vol1", KFormat::Native, VolumeType::Replica1);
        assert!(VolumeFilter::default().matches(&vol));
        assert!(VolumeFilter::by_name("vol1").matches(&vol));
        assert!(!VolumeFilter::by_name("vol2").matches(&vol));

        let filter = VolumeFilter {
            kformat: Some(KFormat::NonNative),
            ..Default::default()
        };
        assert!(!filter.matches(&vol));

        let filter = VolumeFilter {
            volume_type: Some(VolumeType::Replica1),
            ..Default::default()
        };
        assert!(filter.matches(&vol));
    }

    #[test]
    fn outcome_helpers() {
        assert!(MountOutcome::skipped("vol2").is_success());
        let failed = MountOutcome::failure("vol1", MountAction::Mounted, "exit code 1");
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("exit code 1"));
    }
}
