//! Stub collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::directory::VolumeDirectory;
use crate::error::CsiError;
use crate::mount::MountExecutor;
use crate::types::{HostingVolume, VolumeFilter};

/// Directory returning a fixed (replaceable) listing.
pub(crate) struct StaticDirectory {
    volumes: Mutex<Option<Vec<HostingVolume>>>,
    lists: AtomicUsize,
}

impl StaticDirectory {
    pub(crate) fn new(volumes: Vec<HostingVolume>) -> Self {
        Self {
            volumes: Mutex::new(Some(volumes)),
            lists: AtomicUsize::new(0),
        }
    }

    /// Every listing fails.
    pub(crate) fn failing() -> Self {
        Self {
            volumes: Mutex::new(None),
            lists: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set(&self, volumes: Vec<HostingVolume>) {
        *self.volumes.lock().unwrap() = Some(volumes);
    }

    pub(crate) fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VolumeDirectory for StaticDirectory {
    async fn list_hosting_volumes(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<HostingVolume>, CsiError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        match &*self.volumes.lock().unwrap() {
            Some(vols) => Ok(vols.iter().filter(|v| filter.matches(v)).cloned().collect()),
            None => Err(CsiError::ListingFailed("directory unavailable".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Mount(String, PathBuf),
    Reload(String),
}

impl Call {
    pub(crate) fn into_volume(self) -> String {
        match self {
            Self::Mount(name, _) | Self::Reload(name) => name,
        }
    }
}

/// Executor recording every call, optionally failing or stalling on
/// selected volumes.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    calls: Mutex<Vec<Call>>,
    fail_on: HashSet<String>,
    unmounted: HashSet<String>,
    delays: HashMap<String, Duration>,
    delay_all: Option<Duration>,
    active: Mutex<HashMap<String, usize>>,
    overlap: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingExecutor {
    pub(crate) fn failing_on<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            fail_on: names.into_iter().map(str::to_owned).collect(),
            ..Default::default()
        }
    }

    /// Report `names` as not mounted on reload.
    pub(crate) fn with_unmounted<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.unmounted.extend(names.into_iter().map(str::to_owned));
        self
    }

    pub(crate) fn with_delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_owned(), delay);
        self
    }

    pub(crate) fn with_delay_all(mut self, delay: Duration) -> Self {
        self.delay_all = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// `true` if two operations on the same volume were ever in flight
    /// together.
    pub(crate) fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    /// Highest number of operations in flight at once, across volumes.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn record(&self, call: Call) -> Result<(), CsiError> {
        let name = match &call {
            Call::Mount(name, _) | Call::Reload(name) => name.clone(),
        };
        self.calls.lock().unwrap().push(call);
        let _in_flight = InFlight::enter(self, &name);

        if let Some(delay) = self.delays.get(&name).copied().or(self.delay_all) {
            tokio::time::sleep(delay).await;
        }

        if self.fail_on.contains(&name) {
            return Err(CsiError::CommandFailed {
                command: format!("glusterfs --volfile-id {name}"),
                code: Some(1),
                stderr: "simulated failure".into(),
            });
        }
        Ok(())
    }
}

/// Tracks one in-flight operation; released on drop so that operations
/// cancelled by a timeout are accounted for too.
struct InFlight<'a> {
    exec: &'a RecordingExecutor,
    name: String,
}

impl<'a> InFlight<'a> {
    fn enter(exec: &'a RecordingExecutor, name: &str) -> Self {
        {
            let mut active = exec.active.lock().unwrap();
            let count = active.entry(name.to_owned()).or_default();
            *count += 1;
            if *count > 1 {
                exec.overlap.store(true, Ordering::SeqCst);
            }
        }
        let now = exec.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        exec.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self {
            exec,
            name: name.to_owned(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.exec.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.exec.active.lock().unwrap().get_mut(&self.name) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl MountExecutor for RecordingExecutor {
    async fn mount(&self, volume: &HostingVolume, target: &Path) -> Result<(), CsiError> {
        self.record(Call::Mount(volume.name.clone(), target.to_path_buf()))
            .await
    }

    async fn reload(&self, volume: &HostingVolume) -> Result<bool, CsiError> {
        self.record(Call::Reload(volume.name.clone())).await?;
        Ok(!self.unmounted.contains(&volume.name))
    }
}
