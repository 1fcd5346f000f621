//! Storage backend implementations.
//!
//! A backend is a concrete type implementing [`CsiIdentity`], [`CsiController`],
//! and [`CsiNode`].
//!
//! [`CsiIdentity`]: crate::identity::CsiIdentity
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

pub mod hostvol;

pub use hostvol::HostVolBackend;
