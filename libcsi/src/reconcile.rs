//! Mount Reconciler.
//!
//! A pass lists the hosting volumes afresh, applies the skip policy for its
//! mode and hands every remaining volume to the [`MountExecutor`]:
//!
//! | Mode | Skipped | Executor call |
//! |---|---|---|
//! | [`PassMode::Startup`] | non-native volumes, or every volume outside the provisioner role | `mount(volume, <mount_root>/<name>)` |
//! | [`PassMode::Reload`] | `External` volumes | `reload(volume)` |
//!
//! A failing volume never stops the pass; its error is recorded in the
//! returned [`MountOutcome`] list.  Only a listing failure fails the pass as
//! a whole.  Passes keep no state between runs apart from the per-volume
//! locks that stop two passes from touching the same mount directory at once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

use crate::config::{DEFAULT_MOUNT_TIMEOUT, Role};
use crate::directory::VolumeDirectory;
use crate::error::CsiError;
use crate::mount::MountExecutor;
use crate::types::{HostingVolume, KFormat, MountAction, MountOutcome, PassMode, VolumeFilter};

pub struct MountReconciler {
    directory: Arc<dyn VolumeDirectory>,
    executor: Arc<dyn MountExecutor>,
    role: Role,
    mount_root: PathBuf,
    timeout: Duration,
    parallelism: usize,
    /// Serializes operations on one volume name across concurrent passes.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MountReconciler {
    pub fn new(
        directory: Arc<dyn VolumeDirectory>,
        executor: Arc<dyn MountExecutor>,
        role: Role,
        mount_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            directory,
            executor,
            role,
            mount_root: mount_root.into(),
            timeout: DEFAULT_MOUNT_TIMEOUT,
            parallelism: 1,
            locks: DashMap::new(),
        }
    }

    /// Deadline for a single mount or reload.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of volumes processed concurrently within one pass.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Mount every native hosting volume after a (re)start.
    ///
    /// Outside the provisioner role this logs the skip and returns an empty
    /// outcome list without touching the directory.
    pub async fn reconcile_startup(&self) -> Result<Vec<MountOutcome>, CsiError> {
        if !self.role.is_provisioner() {
            info!(role = %self.role, "startup mount skipped: hosting volumes are mounted by the provisioner only");
            return Ok(Vec::new());
        }
        self.run_pass(PassMode::Startup).await
    }

    /// Reapply the configuration of every non-external hosting volume.
    pub async fn reconcile_reload(&self) -> Result<Vec<MountOutcome>, CsiError> {
        self.run_pass(PassMode::Reload).await
    }

    #[instrument(skip(self))]
    async fn run_pass(&self, mode: PassMode) -> Result<Vec<MountOutcome>, CsiError> {
        let volumes = match self
            .directory
            .list_hosting_volumes(&VolumeFilter::default())
            .await
        {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "reconciliation pass aborted: unable to list hosting volumes");
                return Err(e);
            }
        };

        let outcomes: Vec<MountOutcome> = stream::iter(volumes)
            .map(|volume| self.reconcile_volume(mode, volume))
            .buffered(self.parallelism)
            .collect()
            .await;

        let skipped = outcomes
            .iter()
            .filter(|o| o.action == MountAction::Skipped)
            .count();
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        let attempted = outcomes.len() - skipped;
        info!(
            attempted,
            succeeded = attempted - failed,
            failed,
            skipped,
            "reconciliation pass complete",
        );
        Ok(outcomes)
    }

    async fn reconcile_volume(&self, mode: PassMode, volume: HostingVolume) -> MountOutcome {
        match mode {
            // Mounting a non-native volume here would let the quota daemon
            // set xattrs on storage this plugin does not own.
            PassMode::Startup if volume.kformat == KFormat::NonNative => {
                info!(hvol = %volume.name, "skipping mount of non-native volume");
                return MountOutcome::skipped(volume.name);
            }
            PassMode::Reload if volume.is_external() => {
                info!(hvol = %volume.name, "skipping reload of external volume");
                return MountOutcome::skipped(volume.name);
            }
            _ => {}
        }

        let lock = self.lock_for(&volume.name);
        let guard = lock.lock().await;

        let (action, operation) = match mode {
            PassMode::Startup => (MountAction::Mounted, "mount"),
            PassMode::Reload => (MountAction::Reloaded, "reload"),
        };
        let op = async {
            match mode {
                PassMode::Startup => {
                    let target = volume.mount_dir(&self.mount_root);
                    self.executor.mount(&volume, &target).await.map(|()| true)
                }
                PassMode::Reload => self.executor.reload(&volume).await,
            }
        };
        let result = match tokio::time::timeout(self.timeout, op).await {
            Ok(r) => r,
            Err(_) => Err(CsiError::Timeout {
                operation,
                volume: volume.name.clone(),
                secs: self.timeout.as_secs(),
            }),
        };

        drop(guard);
        drop(lock);
        self.release_lock(&volume.name);

        match result {
            Ok(true) => {
                info!(hvol = %volume.name, "volume {operation} succeeded");
                MountOutcome::success(volume.name, action)
            }
            Ok(false) => {
                info!(hvol = %volume.name, "volume not mounted, {operation} skipped");
                MountOutcome::skipped(volume.name)
            }
            Err(e) => {
                error!(hvol = %volume.name, error = %e, "volume {operation} failed");
                MountOutcome::failure(volume.name, action, e)
            }
        }
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.entry(name.to_owned()).or_default().clone()
    }

    /// Drop the lock entry for `name` once no other operation holds or
    /// waits on it.
    fn release_lock(&self, name: &str) {
        self.locks.remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, RecordingExecutor, StaticDirectory};
    use crate::types::VolumeType;

    fn reconciler(
        dir: Arc<StaticDirectory>,
        exec: Arc<RecordingExecutor>,
        role: Role,
    ) -> MountReconciler {
        MountReconciler::new(dir, exec, role, "/mnt").with_parallelism(4)
    }

    fn native(name: &str) -> HostingVolume {
        HostingVolume::new(name, KFormat::Native, VolumeType::Replica3)
    }

    #[tokio::test]
    async fn empty_listing_is_a_noop() {
        let dir = Arc::new(StaticDirectory::new(vec![]));
        let exec = Arc::new(RecordingExecutor::default());
        let r = reconciler(dir, exec.clone(), Role::Provisioner);

        assert!(r.reconcile_startup().await.unwrap().is_empty());
        assert!(r.reconcile_reload().await.unwrap().is_empty());
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn startup_mounts_only_native_volumes() {
        let dir = Arc::new(StaticDirectory::new(vec![
            native("a"),
            HostingVolume::new("b", KFormat::NonNative, VolumeType::Replica1),
            native("c"),
            HostingVolume::new("d", KFormat::NonNative, VolumeType::External),
        ]));
        let exec = Arc::new(RecordingExecutor::default());
        let r = reconciler(dir, exec.clone(), Role::Provisioner);

        let outcomes = r.reconcile_startup().await.unwrap();
        assert_eq!(
            exec.calls(),
            vec![
                Call::Mount("a".into(), PathBuf::from("/mnt/a")),
                Call::Mount("c".into(), PathBuf::from("/mnt/c")),
            ]
        );
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[1].action, MountAction::Skipped);
        assert_eq!(outcomes[3].action, MountAction::Skipped);
        assert!(outcomes.iter().all(MountOutcome::is_success));
    }

    #[tokio::test]
    async fn reload_skips_only_external_volumes() {
        let dir = Arc::new(StaticDirectory::new(vec![
            native("a"),
            HostingVolume::new("b", KFormat::NonNative, VolumeType::Replica1),
            HostingVolume::new("c", KFormat::NonNative, VolumeType::External),
        ]));
        let exec = Arc::new(RecordingExecutor::default());
        let r = reconciler(dir, exec.clone(), Role::NodePlugin);

        r.reconcile_reload().await.unwrap();
        assert_eq!(
            exec.calls(),
            vec![Call::Reload("a".into()), Call::Reload("b".into())]
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_pass() {
        let dir = Arc::new(StaticDirectory::new(vec![native("A"), native("B"), native("C")]));
        let exec = Arc::new(RecordingExecutor::failing_on(["B"]));
        let r = reconciler(dir, exec.clone(), Role::Provisioner);

        let outcomes = r.reconcile_startup().await.unwrap();
        let mounted: Vec<_> = exec.calls().into_iter().map(Call::into_volume).collect();
        assert_eq!(mounted, ["A", "B", "C"]);
        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());

        exec.clear();
        let outcomes = r.reconcile_reload().await.unwrap();
        let reloaded: Vec<_> = exec.calls().into_iter().map(Call::into_volume).collect();
        assert_eq!(reloaded, ["A", "B", "C"]);
        assert_eq!(outcomes.iter().filter(|o| !o.is_success()).count(), 1);
    }

    #[tokio::test]
    async fn reload_is_idempotent() {
        let dir = Arc::new(StaticDirectory::new(vec![native("a"), native("b")]));
        let exec = Arc::new(RecordingExecutor::default());
        let r = reconciler(dir, exec.clone(), Role::Provisioner);

        let first_outcomes = r.reconcile_reload().await.unwrap();
        let first = exec.calls();
        exec.clear();
        let second_outcomes = r.reconcile_reload().await.unwrap();

        assert_eq!(first, exec.calls());
        assert_eq!(first_outcomes, second_outcomes);
        assert!(second_outcomes.iter().all(MountOutcome::is_success));
    }

    #[tokio::test]
    async fn non_provisioner_role_never_mounts() {
        let dir = Arc::new(StaticDirectory::new(vec![native("a"), native("b")]));
        let exec = Arc::new(RecordingExecutor::default());
        let r = reconciler(dir.clone(), exec.clone(), Role::from_env_value(None));
        assert!(r.reconcile_startup().await.unwrap().is_empty());

        let r = reconciler(dir.clone(), exec.clone(), Role::from_env_value(Some("node")));
        assert!(r.reconcile_startup().await.unwrap().is_empty());

        assert!(exec.calls().is_empty());
        assert_eq!(dir.list_count(), 0);
    }

    #[tokio::test]
    async fn listing_failure_fails_the_pass() {
        let dir = Arc::new(StaticDirectory::failing());
        let exec = Arc::new(RecordingExecutor::default());
        let r = reconciler(dir, exec.clone(), Role::Provisioner);

        assert!(matches!(
            r.reconcile_startup().await,
            Err(CsiError::ListingFailed(_))
        ));
        assert!(matches!(
            r.reconcile_reload().await,
            Err(CsiError::ListingFailed(_))
        ));
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn reload_requeries_the_directory() {
        let dir = Arc::new(StaticDirectory::new(vec![native("a")]));
        let exec = Arc::new(RecordingExecutor::default());
        let r = reconciler(dir.clone(), exec.clone(), Role::Provisioner);

        r.reconcile_startup().await.unwrap();
        dir.set(vec![native("a"), native("b")]);
        exec.clear();
        r.reconcile_reload().await.unwrap();

        assert_eq!(
            exec.calls(),
            vec![Call::Reload("a".into()), Call::Reload("b".into())]
        );
    }

    #[tokio::test]
    async fn hung_mount_times_out_without_blocking_others() {
        let dir = Arc::new(StaticDirectory::new(vec![native("slow"), native("fast")]));
        let exec = Arc::new(RecordingExecutor::default().with_delay("slow", Duration::from_secs(30)));
        let r = reconciler(dir, exec.clone(), Role::Provisioner)
            .with_timeout(Duration::from_millis(50));

        let outcomes = r.reconcile_startup().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        let err = outcomes[0].error.as_deref().unwrap();
        assert!(err.contains("timed out"), "unexpected error: {err}");
        assert!(outcomes[1].is_success());
    }

    #[tokio::test]
    async fn concurrent_passes_serialize_per_volume() {
        let dir = Arc::new(StaticDirectory::new(vec![native("a"), native("b"), native("c")]));
        let exec = Arc::new(RecordingExecutor::default().with_delay_all(Duration::from_millis(20)));
        let r = reconciler(dir, exec.clone(), Role::Provisioner);

        let (startup, reload) = tokio::join!(r.reconcile_startup(), r.reconcile_reload());
        assert_eq!(startup.unwrap().len(), 3);
        assert_eq!(reload.unwrap().len(), 3);
        assert_eq!(exec.calls().len(), 6);
        assert!(!exec.saw_overlap(), "two operations ran on one volume at once");
    }

    #[tokio::test]
    async fn reload_skips_volumes_that_are_not_mounted() {
        let dir = Arc::new(StaticDirectory::new(vec![
            native("a"),
            HostingVolume::new("nn", KFormat::NonNative, VolumeType::Replica1),
        ]));
        let exec = Arc::new(RecordingExecutor::default().with_unmounted(["nn"]));
        let r = reconciler(dir, exec.clone(), Role::NodePlugin);

        assert!(r.reconcile_startup().await.unwrap().is_empty());
        let outcomes = r.reconcile_reload().await.unwrap();
        assert_eq!(outcomes[0], MountOutcome::success("a", MountAction::Reloaded));
        assert_eq!(outcomes[1], MountOutcome::skipped("nn"));
        assert!(
            exec.calls().iter().all(|c| matches!(c, Call::Reload(_))),
            "reload pass must never mount"
        );
    }

    #[tokio::test]
    async fn volume_locks_are_released_after_a_pass() {
        let dir = Arc::new(StaticDirectory::new(vec![native("a"), native("b"), native("c")]));
        let exec = Arc::new(RecordingExecutor::default().with_delay_all(Duration::from_millis(10)));
        let r = reconciler(dir, exec, Role::Provisioner);

        let (startup, reload) = tokio::join!(r.reconcile_startup(), r.reconcile_reload());
        startup.unwrap();
        reload.unwrap();
        assert!(r.locks.is_empty());
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let dir = Arc::new(StaticDirectory::new(vec![
            HostingVolume::new("vol1", KFormat::Native, VolumeType::Replica1),
            HostingVolume::new("vol2", KFormat::NonNative, VolumeType::External),
        ]));
        let exec = Arc::new(RecordingExecutor::default());
        let r = reconciler(dir, exec.clone(), Role::Provisioner);

        r.reconcile_startup().await.unwrap();
        assert_eq!(
            exec.calls(),
            vec![Call::Mount("vol1".into(), PathBuf::from("/mnt/vol1"))]
        );

        exec.clear();
        r.reconcile_reload().await.unwrap();
        assert_eq!(exec.calls(), vec![Call::Reload("vol1".into())]);
    }
}
