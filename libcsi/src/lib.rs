//! # libcsi: GlusterFS-backed CSI plugin for RK8s
//!
//! `libcsi` implements a [Container Storage Interface][csi] plugin serving
//! the Identity, Controller and Node services over gRPC (tonic).  Volumes are
//! carved out of *hosting volumes*: GlusterFS volumes that the plugin keeps
//! mounted under a common root.  Keeping those mounts in line with the
//! hosting volume descriptors, at startup and on SIGHUP, is the job of the
//! [`reconcile`] and [`reload`] modules.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: hosting volumes, mount outcomes, CSI volumes and requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`config`] | [`PluginConfig`], deployment [`Role`] and listen [`Endpoint`]. |
//! | [`directory`] | [`VolumeDirectory`] seam and the `.info` file implementation. |
//! | [`mount`] | [`MountExecutor`] seam and the `glusterfs` FUSE client driver. |
//! | [`reconcile`] | [`MountReconciler`]: startup and reload passes. |
//! | [`reload`] | SIGHUP listener and the serialized reload worker. |
//! | [`lifecycle`] | Server state machine shared through a watch channel. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume create/delete. |
//! | [`node`] | [`CsiNode`] trait: publish, unpublish. |
//! | [`backend`] | [`HostVolBackend`] implementing the three traits. |
//! | [`transport`] | tonic adapters and the [`CsiServer`] composition root. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod mount;
pub mod node;
pub mod reconcile;
pub mod reload;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

/// Code generated from `proto/csi.proto`.
pub mod proto {
    tonic::include_proto!("csi.v1");
}

// Re-export the most commonly used items at crate root for convenience.
pub use backend::HostVolBackend;
pub use config::{Endpoint, PluginConfig, Role};
pub use controller::CsiController;
pub use directory::{InfoDirectory, VolumeDirectory};
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use lifecycle::{Lifecycle, ServerState};
pub use mount::{GlusterMounter, MountExecutor};
pub use node::CsiNode;
pub use reconcile::MountReconciler;
pub use reload::ReloadHandle;
pub use transport::{BoundServer, CsiServer};
pub use types::*;
