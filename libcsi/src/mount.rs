//! Mount Executor: performs the actual FUSE mount / reload of a hosting
//! volume.
//!
//! [`GlusterMounter`] drives the `glusterfs` FUSE client.  Every mount is
//! started with a pid file so that a later reload can signal the running
//! client (SIGHUP makes it re-read its volfile) instead of remounting.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::error::CsiError;
use crate::types::HostingVolume;

/// Performs mount side effects for hosting volumes.
#[async_trait]
pub trait MountExecutor: Send + Sync {
    /// Mount `volume` at `target`.  Mounting an already mounted volume is
    /// not an error.
    async fn mount(&self, volume: &HostingVolume, target: &Path) -> Result<(), CsiError>;

    /// Reapply the configuration of a mounted `volume`.
    ///
    /// Returns `Ok(false)` without side effects when the volume is not
    /// mounted; reload never creates a mount.
    async fn reload(&self, volume: &HostingVolume) -> Result<bool, CsiError>;
}

/// Return `true` if `path` is currently listed as a mount point in
/// `/proc/self/mounts`.
///
/// Note: `/proc/self/mounts` uses octal escapes (`\040` for space, etc.).
/// Hosting volume names and CSI target paths must not contain whitespace,
/// so direct string comparison is safe here.
pub async fn is_mountpoint(path: &Path) -> bool {
    let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
        Ok(c) => c,
        Err(_) => return false,
    };
    let Some(path) = path.to_str() else {
        return false;
    };
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

/// [`MountExecutor`] that runs the `glusterfs` FUSE client.
pub struct GlusterMounter {
    mount_root: PathBuf,
    volfile_dir: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
    program: PathBuf,
}

impl GlusterMounter {
    pub fn new(
        mount_root: impl Into<PathBuf>,
        volfile_dir: impl Into<PathBuf>,
        run_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mount_root: mount_root.into(),
            volfile_dir: volfile_dir.into(),
            run_dir: run_dir.into(),
            log_dir: log_dir.into(),
            program: PathBuf::from("glusterfs"),
        }
    }

    /// Override the client binary (defaults to `glusterfs` on `PATH`).
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn volfile_path(&self, volume: &HostingVolume) -> PathBuf {
        self.volfile_dir.join(format!("{}.client.vol", volume.name))
    }

    fn pid_file(&self, volume: &HostingVolume) -> PathBuf {
        self.run_dir.join(format!("{}.pid", volume.name))
    }

    /// Build the client invocation for `volume` at `target`.
    fn mount_command(&self, volume: &HostingVolume, target: &Path) -> Result<Command, CsiError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--process-name")
            .arg("fuse")
            .arg("-l")
            .arg(self.log_dir.join(format!("{}.log", volume.name)));

        match (&volume.external, volume.is_external()) {
            (Some(ext), true) => {
                if ext.hosts.is_empty() {
                    return Err(CsiError::InvalidArgument(format!(
                        "external volume {} has no volfile servers",
                        volume.name
                    )));
                }
                for host in &ext.hosts {
                    cmd.arg("--volfile-server").arg(host);
                }
                cmd.arg("--volfile-id").arg(&ext.volname);
            }
            (None, true) => {
                return Err(CsiError::InvalidArgument(format!(
                    "external volume {} is missing gluster_hosts/gluster_volname",
                    volume.name
                )));
            }
            _ => {
                cmd.arg("--volfile-id")
                    .arg(&volume.name)
                    .arg("-f")
                    .arg(self.volfile_path(volume));
            }
        }

        cmd.arg("--pid-file").arg(self.pid_file(volume)).arg(target);
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    async fn read_pid(&self, volume: &HostingVolume) -> Result<Pid, CsiError> {
        let path = self.pid_file(volume);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CsiError::BackendError(format!("read {}: {e}", path.display())))?;
        raw.trim()
            .parse::<i32>()
            .map(Pid::from_raw)
            .map_err(|e| CsiError::BackendError(format!("invalid pid in {}: {e}", path.display())))
    }
}

fn render_command(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    std::iter::once(std_cmd.get_program())
        .chain(std_cmd.get_args())
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl MountExecutor for GlusterMounter {
    #[instrument(skip_all, fields(hvol = %volume.name))]
    async fn mount(&self, volume: &HostingVolume, target: &Path) -> Result<(), CsiError> {
        if is_mountpoint(target).await {
            debug!(target = %target.display(), "already mounted");
            return Ok(());
        }

        let volfile = self.volfile_path(volume);
        if !volume.is_external() && !tokio::fs::try_exists(&volfile).await.unwrap_or(false) {
            return Err(CsiError::MountFailed {
                path: target.display().to_string(),
                reason: format!("volfile {} missing", volfile.display()),
            });
        }

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut cmd = self.mount_command(volume, target)?;
        let command = render_command(&cmd);
        debug!(%command, "running mount command");

        let output = cmd.output().await.map_err(|e| CsiError::CommandFailed {
            command: command.clone(),
            code: None,
            stderr: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(CsiError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        info!(target = %target.display(), "hosting volume mounted");
        Ok(())
    }

    #[instrument(skip_all, fields(hvol = %volume.name))]
    async fn reload(&self, volume: &HostingVolume) -> Result<bool, CsiError> {
        let target = volume.mount_dir(&self.mount_root);
        if !is_mountpoint(&target).await {
            debug!(target = %target.display(), "not mounted, nothing to reload");
            return Ok(false);
        }

        let pid = self.read_pid(volume).await?;
        signal::kill(pid, Signal::SIGHUP).map_err(|e| CsiError::CommandFailed {
            command: format!("kill -HUP {pid}"),
            code: None,
            stderr: e.to_string(),
        })?;

        info!(%pid, "client signalled to reload volfile");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExternalSource, KFormat, VolumeType};

    fn mounter(root: &Path) -> GlusterMounter {
        GlusterMounter::new(
            root.join("mnt"),
            root.join("volfiles"),
            root.join("run"),
            root.join("log"),
        )
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn native_mount_command_uses_local_volfile() {
        let m = mounter(Path::new("/srv"));
        let vol = HostingVolume::new("vol1", KFormat::Native, VolumeType::Replica3);
        let cmd = m.mount_command(&vol, Path::new("/srv/mnt/vol1")).unwrap();
        let args = args(&cmd);

        assert_eq!(cmd.as_std().get_program(), "glusterfs");
        assert!(args.windows(2).any(|w| w == ["--volfile-id", "vol1"]));
        assert!(args.windows(2).any(|w| w == ["-f", "/srv/volfiles/vol1.client.vol"]));
        assert!(args.windows(2).any(|w| w == ["--pid-file", "/srv/run/vol1.pid"]));
        assert_eq!(args.last().map(String::as_str), Some("/srv/mnt/vol1"));
    }

    #[test]
    fn external_mount_command_uses_remote_servers() {
        let m = mounter(Path::new("/srv"));
        let mut vol = HostingVolume::new("ext", KFormat::NonNative, VolumeType::External);
        vol.external = Some(ExternalSource {
            hosts: vec!["g1".into(), "g2".into()],
            volname: "shared".into(),
        });
        let args = args(&m.mount_command(&vol, Path::new("/srv/mnt/ext")).unwrap());

        assert_eq!(args.iter().filter(|a| *a == "--volfile-server").count(), 2);
        assert!(args.windows(2).any(|w| w == ["--volfile-id", "shared"]));
        assert!(!args.iter().any(|a| a == "-f"));
    }

    #[test]
    fn external_without_source_is_rejected() {
        let m = mounter(Path::new("/srv"));
        let vol = HostingVolume::new("ext", KFormat::NonNative, VolumeType::External);
        assert!(matches!(
            m.mount_command(&vol, Path::new("/srv/mnt/ext")),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn mount_without_volfile_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mounter(tmp.path());
        let vol = HostingVolume::new("vol1", KFormat::Native, VolumeType::Replica1);
        let target = vol.mount_dir(&tmp.path().join("mnt"));

        let err = m.mount(&vol, &target).await.unwrap_err();
        assert!(matches!(err, CsiError::MountFailed { .. }));
    }

    #[tokio::test]
    async fn failing_client_reports_command_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mounter(tmp.path()).with_program("false");
        let vol = HostingVolume::new("vol1", KFormat::Native, VolumeType::Replica1);
        tokio::fs::create_dir_all(tmp.path().join("volfiles")).await.unwrap();
        tokio::fs::write(tmp.path().join("volfiles/vol1.client.vol"), "volume vol1\n")
            .await
            .unwrap();
        let target = vol.mount_dir(&tmp.path().join("mnt"));

        let err = m.mount(&vol, &target).await.unwrap_err();
        assert!(matches!(err, CsiError::CommandFailed { code: Some(1), .. }));
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn successful_client_mounts() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mounter(tmp.path()).with_program("true");
        let vol = HostingVolume::new("vol1", KFormat::Native, VolumeType::Replica1);
        tokio::fs::create_dir_all(tmp.path().join("volfiles")).await.unwrap();
        tokio::fs::write(tmp.path().join("volfiles/vol1.client.vol"), "volume vol1\n")
            .await
            .unwrap();

        m.mount(&vol, &vol.mount_dir(&tmp.path().join("mnt")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reload_of_unmounted_volume_has_no_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mounter(tmp.path()).with_program("true");
        tokio::fs::create_dir_all(tmp.path().join("volfiles")).await.unwrap();
        for name in ["vol1", "nn"] {
            tokio::fs::write(
                tmp.path().join(format!("volfiles/{name}.client.vol")),
                format!("volume {name}\n"),
            )
            .await
            .unwrap();
        }

        let native = HostingVolume::new("vol1", KFormat::Native, VolumeType::Replica1);
        assert!(!m.reload(&native).await.unwrap());
        assert!(!tmp.path().join("mnt/vol1").exists());

        let non_native = HostingVolume::new("nn", KFormat::NonNative, VolumeType::Replica1);
        assert!(!m.reload(&non_native).await.unwrap());
        assert!(!tmp.path().join("mnt/nn").exists());
    }

    #[tokio::test]
    async fn root_mountpoint_is_detected() {
        assert!(is_mountpoint(Path::new("/")).await);
        assert!(!is_mountpoint(Path::new("/definitely/not/a/mount")).await);
    }
}
