//! gRPC transport for the CSI services.
//!
//! [`grpc`] adapts the domain traits to the tonic-generated service traits;
//! [`server`] binds them to one endpoint and owns the server lifecycle.

pub mod grpc;
pub mod server;

pub use server::{BoundServer, CsiServer};
