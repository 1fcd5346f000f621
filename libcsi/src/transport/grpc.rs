//! tonic adapters exposing the domain traits as the CSI v1 gRPC services.
//!
//! Each adapter owns an `Arc` of the backend, converts protobuf messages to
//! the domain types in [`crate::types`], and maps [`CsiError`] into
//! [`Status`] through its `From` impl.

use std::sync::Arc;

use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::lifecycle::ServerState;
use crate::node::CsiNode;
use crate::proto::{
    self, controller_server::Controller, controller_service_capability, identity_server::Identity,
    node_server::Node, plugin_capability, volume_capability,
};
use crate::types::{
    AccessMode, CreateVolumeRequest, NodePublishVolumeRequest, PluginCapability, Topology, Volume,
    VolumeCapability, VolumeId,
};

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl From<proto::VolumeCapability> for VolumeCapability {
    fn from(cap: proto::VolumeCapability) -> Self {
        use volume_capability::access_mode::Mode;

        let access_mode = match cap.access_mode.map(|m| m.mode()) {
            Some(Mode::SingleNodeWriter | Mode::SingleNodeSingleWriter | Mode::SingleNodeMultiWriter) => {
                AccessMode::ReadWriteOnce
            }
            Some(Mode::SingleNodeReaderOnly) => AccessMode::ReadOnlyOnce,
            Some(Mode::MultiNodeReaderOnly) => AccessMode::ReadOnlyMany,
            Some(Mode::MultiNodeSingleWriter) => AccessMode::SingleWriterMany,
            Some(Mode::MultiNodeMultiWriter | Mode::Unknown) | None => AccessMode::ReadWriteMany,
        };
        let (block, mount_flags) = match cap.access_type {
            Some(volume_capability::AccessType::Block(_)) => (true, Vec::new()),
            Some(volume_capability::AccessType::Mount(m)) => (false, m.mount_flags),
            None => (false, Vec::new()),
        };
        Self {
            access_mode,
            mount_flags,
            block,
        }
    }
}

impl From<Topology> for proto::Topology {
    fn from(t: Topology) -> Self {
        Self {
            segments: t.segments,
        }
    }
}

impl From<Volume> for proto::Volume {
    fn from(v: Volume) -> Self {
        Self {
            capacity_bytes: to_i64(v.capacity_bytes),
            volume_id: v.volume_id.0,
            volume_context: v.volume_context,
            accessible_topology: v.accessible_topology.into_iter().map(Into::into).collect(),
        }
    }
}

fn required(field: &str, value: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{field} is required")).into());
    }
    Ok(())
}

/// Requested size: `required_bytes`, or `limit_bytes` when only a limit
/// was given.
fn requested_capacity(range: Option<proto::CapacityRange>) -> Result<u64, Status> {
    let Some(range) = range else {
        return Ok(0);
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(Status::invalid_argument("capacity range must not be negative"));
    }
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(Status::out_of_range("required_bytes exceeds limit_bytes"));
    }
    let bytes = if range.required_bytes > 0 {
        range.required_bytes
    } else {
        range.limit_bytes
    };
    Ok(bytes as u64)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// `csi.v1.Identity` backed by a [`CsiIdentity`].
///
/// `Probe` reports ready only while the server is [`ServerState::Serving`]
/// and the backend itself is healthy.
pub struct IdentityService<T> {
    handler: Arc<T>,
    state: watch::Receiver<ServerState>,
}

impl<T> IdentityService<T> {
    pub fn new(handler: Arc<T>, state: watch::Receiver<ServerState>) -> Self {
        Self { handler, state }
    }
}

#[tonic::async_trait]
impl<T> Identity for IdentityService<T>
where
    T: CsiIdentity + 'static,
{
    async fn get_plugin_info(
        &self,
        _request: Request<proto::GetPluginInfoRequest>,
    ) -> Result<Response<proto::GetPluginInfoResponse>, Status> {
        let info = self.handler.get_plugin_info().await?;
        Ok(Response::new(proto::GetPluginInfoResponse {
            name: info.name,
            vendor_version: info.vendor_version,
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<proto::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<proto::GetPluginCapabilitiesResponse>, Status> {
        use plugin_capability::service::Type;

        let capabilities = self
            .handler
            .get_plugin_capabilities()
            .await?
            .into_iter()
            .map(|cap| {
                let ty = match cap {
                    PluginCapability::ControllerService => Type::ControllerService,
                    PluginCapability::VolumeAccessibilityConstraints => {
                        Type::VolumeAccessibilityConstraints
                    }
                };
                proto::PluginCapability {
                    r#type: Some(plugin_capability::Type::Service(
                        plugin_capability::Service { r#type: ty as i32 },
                    )),
                }
            })
            .collect();
        Ok(Response::new(proto::GetPluginCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn probe(
        &self,
        _request: Request<proto::ProbeRequest>,
    ) -> Result<Response<proto::ProbeResponse>, Status> {
        let state = *self.state.borrow();
        let ready = state.is_serving() && self.handler.probe().await?;
        debug!(?state, ready, "probe");
        Ok(Response::new(proto::ProbeResponse {
            ready: Some(proto::BoolValue { value: ready }),
        }))
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// `csi.v1.Controller` backed by a [`CsiController`].
pub struct ControllerService<T> {
    handler: Arc<T>,
}

impl<T> ControllerService<T> {
    pub fn new(handler: Arc<T>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl<T> Controller for ControllerService<T>
where
    T: CsiController + 'static,
{
    #[instrument(skip_all, fields(name = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<proto::CreateVolumeRequest>,
    ) -> Result<Response<proto::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        required("name", &req.name)?;
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume_capabilities are required"));
        }

        let volume = self
            .handler
            .create_volume(CreateVolumeRequest {
                name: req.name,
                capacity_bytes: requested_capacity(req.capacity_range)?,
                volume_capabilities: req.volume_capabilities.into_iter().map(Into::into).collect(),
                parameters: req.parameters,
            })
            .await?;
        Ok(Response::new(proto::CreateVolumeResponse {
            volume: Some(volume.into()),
        }))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<proto::DeleteVolumeRequest>,
    ) -> Result<Response<proto::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        required("volume_id", &req.volume_id)?;
        self.handler
            .delete_volume(&VolumeId(req.volume_id))
            .await?;
        Ok(Response::new(proto::DeleteVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<proto::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<proto::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        required("volume_id", &req.volume_id)?;
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume_capabilities are required"));
        }

        let caps: Vec<VolumeCapability> = req
            .volume_capabilities
            .iter()
            .cloned()
            .map(Into::into)
            .collect();
        let valid = self
            .handler
            .validate_volume_capabilities(&VolumeId(req.volume_id), &caps)
            .await?;

        let response = if valid {
            proto::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(proto::validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                }),
                message: String::new(),
            }
        } else {
            proto::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "block access type is not supported".to_owned(),
            }
        };
        Ok(Response::new(response))
    }

    async fn list_volumes(
        &self,
        request: Request<proto::ListVolumesRequest>,
    ) -> Result<Response<proto::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        let max_entries = usize::try_from(req.max_entries)
            .map_err(|_| Status::invalid_argument("max_entries must not be negative"))?;

        let volumes = self.handler.list_volumes().await?;
        let start = if req.starting_token.is_empty() {
            0
        } else {
            req.starting_token
                .parse::<usize>()
                .ok()
                .filter(|start| *start <= volumes.len())
                .ok_or_else(|| {
                    Status::aborted(format!("invalid starting_token {:?}", req.starting_token))
                })?
        };
        let end = match max_entries {
            0 => volumes.len(),
            n => start.saturating_add(n).min(volumes.len()),
        };
        let next_token = if end < volumes.len() {
            end.to_string()
        } else {
            String::new()
        };

        let entries = volumes
            .into_iter()
            .skip(start)
            .take(end - start)
            .map(|v| proto::list_volumes_response::Entry {
                volume: Some(v.into()),
            })
            .collect();
        Ok(Response::new(proto::ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<proto::GetCapacityRequest>,
    ) -> Result<Response<proto::GetCapacityResponse>, Status> {
        let available = self.handler.get_capacity().await?;
        Ok(Response::new(proto::GetCapacityResponse {
            available_capacity: to_i64(available),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<proto::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<proto::ControllerGetCapabilitiesResponse>, Status> {
        use controller_service_capability::rpc::Type;

        let capabilities = [Type::CreateDeleteVolume, Type::ListVolumes, Type::GetCapacity]
            .into_iter()
            .map(|ty| proto::ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc { r#type: ty as i32 },
                )),
            })
            .collect();
        Ok(Response::new(proto::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// `csi.v1.Node` backed by a [`CsiNode`].
pub struct NodeService<T> {
    handler: Arc<T>,
}

impl<T> NodeService<T> {
    pub fn new(handler: Arc<T>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl<T> Node for NodeService<T>
where
    T: CsiNode + 'static,
{
    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_publish_volume(
        &self,
        request: Request<proto::NodePublishVolumeRequest>,
    ) -> Result<Response<proto::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        required("volume_id", &req.volume_id)?;
        required("target_path", &req.target_path)?;
        let capability = req
            .volume_capability
            .ok_or_else(|| Status::invalid_argument("volume_capability is required"))?;

        self.handler
            .publish_volume(NodePublishVolumeRequest {
                volume_id: VolumeId(req.volume_id),
                target_path: req.target_path,
                volume_capability: capability.into(),
                read_only: req.readonly,
                volume_context: req.volume_context,
            })
            .await?;
        Ok(Response::new(proto::NodePublishVolumeResponse {}))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_unpublish_volume(
        &self,
        request: Request<proto::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<proto::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        required("volume_id", &req.volume_id)?;
        required("target_path", &req.target_path)?;
        self.handler
            .unpublish_volume(&VolumeId(req.volume_id), &req.target_path)
            .await?;
        Ok(Response::new(proto::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<proto::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<proto::NodeGetCapabilitiesResponse>, Status> {
        // No staging, stats or expansion.
        Ok(Response::new(proto::NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<proto::NodeGetInfoRequest>,
    ) -> Result<Response<proto::NodeGetInfoResponse>, Status> {
        let info = self.handler.get_info().await?;
        Ok(Response::new(proto::NodeGetInfoResponse {
            node_id: info.node_id,
            max_volumes_per_node: to_i64(info.max_volumes),
            accessible_topology: info.accessible_topology.map(Into::into),
        }))
    }
}
