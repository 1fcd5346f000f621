//! Plugin configuration.
//!
//! The library never reads the environment on its own; the `csid` binary
//! maps these variables onto [`PluginConfig`] and hands it over explicitly.
//!
//! Environment variables:
//! - `CSI_ROLE`: `provisioner` runs the startup mount pass, anything else
//!   (including unset) is a node plugin.
//! - `CSI_ENDPOINT`: gRPC listen address, defaults to [`DEFAULT_ENDPOINT`].
//! - `HOSTVOL_MOUNTDIR`: root of hosting volume mounts, defaults to `/mnt`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CsiError;

pub const ENV_ROLE: &str = "CSI_ROLE";
pub const ENV_ENDPOINT: &str = "CSI_ENDPOINT";
pub const ENV_HOSTVOL_MOUNTDIR: &str = "HOSTVOL_MOUNTDIR";

pub const DEFAULT_ENDPOINT: &str = "unix://plugin/csi.sock";
pub const HOSTVOL_MOUNTDIR: &str = "/mnt";
pub const DEFAULT_VOLINFO_DIR: &str = "/var/lib/gluster";
pub const DEFAULT_VOLFILE_DIR: &str = "/var/lib/gluster";
pub const DEFAULT_RUN_DIR: &str = "/var/run/gluster";
pub const DEFAULT_LOG_DIR: &str = "/var/log/gluster";
pub const DEFAULT_DRIVER_NAME: &str = "rk8s.glusterfs.csi";
pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(120);

/// Deployment role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Controller-side pod that provisions volumes out of hosting volumes.
    Provisioner,
    /// Per-node plugin (kubelet side).
    NodePlugin,
}

impl Role {
    /// Map the raw `CSI_ROLE` value to a role.  Only the exact string
    /// `provisioner` selects [`Role::Provisioner`].
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some("provisioner") => Self::Provisioner,
            _ => Self::NodePlugin,
        }
    }

    pub fn is_provisioner(self) -> bool {
        self == Self::Provisioner
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioner => f.write_str("provisioner"),
            Self::NodePlugin => f.write_str("nodeplugin"),
        }
    }
}

/// gRPC listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket; relative paths resolve against the working dir.
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(CsiError::InvalidArgument(format!(
                    "endpoint {s:?} has an empty socket path"
                )));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        addr.parse::<SocketAddr>()
            .map(Self::Tcp)
            .map_err(|e| CsiError::InvalidArgument(format!("invalid endpoint {s:?}: {e}")))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Everything the composition root and its collaborators need.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub role: Role,
    pub endpoint: Endpoint,
    /// Hosting volumes are mounted at `<mount_root>/<name>`.
    pub mount_root: PathBuf,
    /// Directory of `<name>.info` hosting volume descriptors.
    pub volinfo_dir: PathBuf,
    /// Directory of `<name>.client.vol` files.
    pub volfile_dir: PathBuf,
    /// Pid files of running FUSE clients.
    pub run_dir: PathBuf,
    /// Client log files.
    pub log_dir: PathBuf,
    pub node_id: String,
    pub driver_name: String,
    /// Deadline for a single mount or reload.
    pub mount_timeout: Duration,
    /// Volumes processed concurrently within one reconciliation pass.
    pub pass_parallelism: usize,
    /// Concurrent RPCs across all connections.
    pub max_workers: usize,
    /// Register the SIGHUP reload listener.
    pub reload_on_hangup: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            role: Role::NodePlugin,
            endpoint: Endpoint::Unix(PathBuf::from("plugin/csi.sock")),
            mount_root: PathBuf::from(HOSTVOL_MOUNTDIR),
            volinfo_dir: PathBuf::from(DEFAULT_VOLINFO_DIR),
            volfile_dir: PathBuf::from(DEFAULT_VOLFILE_DIR),
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            node_id: String::new(),
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            pass_parallelism: 4,
            max_workers: DEFAULT_MAX_WORKERS,
            reload_on_hangup: true,
        }
    }
}

impl PluginConfig {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), CsiError> {
        if self.max_workers == 0 {
            return Err(CsiError::InvalidArgument("max_workers must be at least 1".into()));
        }
        if self.pass_parallelism == 0 {
            return Err(CsiError::InvalidArgument("pass_parallelism must be at least 1".into()));
        }
        if self.mount_timeout.is_zero() {
            return Err(CsiError::InvalidArgument("mount_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
