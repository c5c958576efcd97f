//! CSI controller: provisions, attaches and snapshots storages.
//!
//! The controller keeps no state of its own; every request is answered from
//! what the `Service` reports, which makes retries by the orchestrator safe.

use std::{collections::HashMap, sync::Arc};

use prost_types::Timestamp;
use tonic::{Code, Request, Response, Status};
use upcloud::{
    CloneStorageRequest,
    CreateStorageRequest,
    Label,
    Storage,
    StorageType,
};
use uuid::Uuid;

use crate::{
    context::{traced, CORRELATION_ID_KEY},
    csi::{
        controller_service_capability::{self, rpc::Type as RpcType},
        list_snapshots_response,
        list_volumes_response,
        validate_volume_capabilities_response::Confirmed,
        volume_capability::AccessMode,
        volume_content_source,
        ControllerExpandVolumeRequest,
        ControllerExpandVolumeResponse,
        ControllerGetCapabilitiesRequest,
        ControllerGetCapabilitiesResponse,
        ControllerGetVolumeRequest,
        ControllerGetVolumeResponse,
        ControllerPublishVolumeRequest,
        ControllerPublishVolumeResponse,
        ControllerServiceCapability,
        ControllerUnpublishVolumeRequest,
        ControllerUnpublishVolumeResponse,
        CreateSnapshotRequest,
        CreateSnapshotResponse,
        CreateVolumeRequest,
        CreateVolumeResponse,
        DeleteSnapshotRequest,
        DeleteSnapshotResponse,
        DeleteVolumeRequest,
        DeleteVolumeResponse,
        GetCapacityRequest,
        GetCapacityResponse,
        ListSnapshotsRequest,
        ListSnapshotsResponse,
        ListVolumesRequest,
        ListVolumesResponse,
        Snapshot,
        Topology,
        ValidateVolumeCapabilitiesRequest,
        ValidateVolumeCapabilitiesResponse,
        Volume,
        VolumeCapability,
        VolumeContentSource,
    },
    service::{Service, ServiceError},
    SUPPORTED_ACCESS_MODE,
    TOPOLOGY_REGION_KEY,
};

pub mod capacity;
pub mod paginate;
pub mod params;

use capacity::GIB;

pub struct Controller {
    service: Arc<dyn Service>,
    zone: String,
    labels: Vec<Label>,
    max_volumes_per_node: i64,
}

impl Controller {
    pub fn new(
        service: Arc<dyn Service>,
        zone: &str,
        labels: Vec<Label>,
        max_volumes_per_node: i64,
    ) -> Self {
        Self {
            service,
            zone: zone.to_string(),
            labels,
            max_volumes_per_node,
        }
    }

    fn topology(&self) -> Vec<Topology> {
        let mut segments = HashMap::new();
        segments.insert(TOPOLOGY_REGION_KEY.to_string(), self.zone.clone());
        vec![Topology {
            segments,
        }]
    }

    fn volume(
        &self,
        storage: &Storage,
        content_source: Option<VolumeContentSource>,
    ) -> Volume {
        Volume {
            capacity_bytes: storage.size as i64 * GIB,
            volume_id: storage.uuid.clone(),
            volume_context: HashMap::new(),
            content_source,
            accessible_topology: self.topology(),
        }
    }
}

fn internal(operation: &str, error: &ServiceError) -> Status {
    failure!(Code::Internal, "Failed to {}: {}", operation, error)
}

fn require(value: &str, what: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(failure!(Code::InvalidArgument, "{} is required", what));
    }
    Ok(())
}

fn creation_time(created: &str) -> Option<Timestamp> {
    chrono::DateTime::parse_from_rfc3339(created)
        .ok()
        .map(|time| Timestamp {
            seconds: time.timestamp(),
            nanos: time.timestamp_subsec_nanos() as i32,
        })
}

/// CSI view of a backup storage.
fn snapshot(backup: &Storage) -> Snapshot {
    Snapshot {
        size_bytes: backup.size as i64 * GIB,
        snapshot_id: backup.uuid.clone(),
        source_volume_id: backup.origin.clone(),
        creation_time: creation_time(&backup.created),
        ready_to_use: backup.is_online(),
    }
}

fn capability(kind: RpcType) -> ControllerServiceCapability {
    ControllerServiceCapability {
        r#type: Some(controller_service_capability::Type::Rpc(
            controller_service_capability::Rpc {
                r#type: kind as i32,
            },
        )),
    }
}

fn publish_context(correlation_id: &str) -> HashMap<String, String> {
    let mut context = HashMap::new();
    context.insert(CORRELATION_ID_KEY.to_string(), correlation_id.to_string());
    context
}

impl Controller {
    async fn create(
        &self,
        args: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, Status> {
        require(&args.name, "Volume name")?;
        params::check_volume_capabilities(&args.volume_capabilities)?;
        params::check_topology(
            args.accessibility_requirements.as_ref(),
            &self.zone,
        )?;
        let size = capacity::volume_size_gib(args.capacity_range.as_ref())?;

        let existing = self
            .service
            .get_storage_by_name(&args.name)
            .await
            .map_err(|e| internal("look up volume by name", &e))?;
        match existing.as_slice() {
            [] => {}
            [volume] if volume.size == size => {
                info!(
                    "volume {} already exists as {}",
                    args.name, volume.uuid
                );
                return Ok(CreateVolumeResponse {
                    volume: Some(
                        self.volume(volume, args.volume_content_source),
                    ),
                });
            }
            [volume] => {
                return Err(failure!(
                    Code::AlreadyExists,
                    "Volume {} already exists with size {} (requested {})",
                    args.name,
                    capacity::format_bytes(volume.size as i64 * GIB),
                    capacity::format_bytes(size as i64 * GIB)
                ));
            }
            volumes => {
                let uuids: Vec<&str> =
                    volumes.iter().map(|v| v.uuid.as_str()).collect();
                return Err(failure!(
                    Code::Internal,
                    "Found {} volumes named {}: {}",
                    volumes.len(),
                    args.name,
                    uuids.join(", ")
                ));
            }
        }

        let tier = params::tier(&args.parameters)?;
        let encrypted = params::encrypted(&args.parameters);

        let storage = match &args.volume_content_source {
            Some(source) => {
                self.clone_volume(&args.name, source, size, tier, encrypted)
                    .await?
            }
            None => {
                let request = CreateStorageRequest {
                    size,
                    tier,
                    title: args.name.clone(),
                    zone: self.zone.clone(),
                    labels: self.labels.clone(),
                    encrypted,
                };
                self.service
                    .create_storage(&request)
                    .await
                    .map_err(|e| internal("create volume", &e))?
                    .storage
            }
        };

        info!(
            "volume {} created as {} ({} GiB)",
            args.name, storage.uuid, storage.size
        );
        Ok(CreateVolumeResponse {
            volume: Some(self.volume(&storage, args.volume_content_source)),
        })
    }

    /// Clone a volume or restore a snapshot, growing the result to `size`
    /// when the source is smaller.
    async fn clone_volume(
        &self,
        name: &str,
        source: &VolumeContentSource,
        size: u64,
        tier: Option<upcloud::StorageTier>,
        encrypted: bool,
    ) -> Result<Storage, Status> {
        let source_id = match &source.r#type {
            Some(volume_content_source::Type::Snapshot(snapshot)) => {
                snapshot.snapshot_id.as_str()
            }
            Some(volume_content_source::Type::Volume(volume)) => {
                volume.volume_id.as_str()
            }
            None => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Volume content source type is missing"
                ))
            }
        };
        require(source_id, "Volume content source ID")?;

        let source = match self.service.get_storage_by_uuid(source_id).await {
            Ok(source) => source,
            Err(ServiceError::StorageNotFound {
                ..
            }) => {
                return Err(failure!(
                    Code::NotFound,
                    "Source {} of volume {} not found",
                    source_id,
                    name
                ))
            }
            Err(e) => return Err(internal("look up clone source", &e)),
        };
        let source = self
            .service
            .require_storage_online(&source)
            .await
            .map_err(|e| internal("wait for clone source", &e))?;
        if source.encrypted != encrypted {
            return Err(failure!(
                Code::InvalidArgument,
                "Encryption of source {} does not match the requested volume {}",
                source_id,
                name
            ));
        }

        let request = CloneStorageRequest {
            zone: self.zone.clone(),
            tier,
            title: name.to_string(),
            encrypted,
        };
        let clone = self
            .service
            .clone_storage(&source.uuid, &request, &self.labels)
            .await
            .map_err(|e| internal("clone volume", &e))?;

        if size <= clone.size {
            return Ok(clone.storage);
        }
        debug!(
            "growing clone {} from {} GiB to {} GiB",
            clone.uuid, clone.size, size
        );
        let resized = self
            .service
            .resize_storage(&clone.uuid, size, true)
            .await
            .map_err(|e| internal("resize cloned volume", &e))?;
        Ok(resized.storage)
    }

    async fn delete(
        &self,
        args: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse, Status> {
        require(&args.volume_id, "Volume ID")?;
        match self.service.delete_storage(&args.volume_id).await {
            Ok(()) => {}
            Err(ServiceError::StorageNotFound {
                ..
            }) => {
                info!("volume {} is already deleted", args.volume_id);
            }
            Err(e) => return Err(internal("delete volume", &e)),
        }
        Ok(DeleteVolumeResponse {})
    }

    async fn publish(
        &self,
        correlation_id: String,
        args: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status> {
        require(&args.volume_id, "Volume ID")?;
        require(&args.node_id, "Node ID")?;
        let capability = match &args.volume_capability {
            Some(capability) => capability,
            None => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Volume capability is required"
                ))
            }
        };
        params::check_volume_capabilities(std::slice::from_ref(capability))?;
        if args.readonly {
            return Err(failure!(
                Code::InvalidArgument,
                "Read-only volumes are not supported"
            ));
        }

        let server = match self
            .service
            .get_server_by_hostname(&args.node_id)
            .await
        {
            Ok(server) => server,
            Err(ServiceError::ServerNotFound {
                ..
            }) => {
                return Err(failure!(
                    Code::NotFound,
                    "Node {} not found",
                    args.node_id
                ))
            }
            Err(e) => return Err(internal("look up node", &e)),
        };
        let storage = match self
            .service
            .get_storage_by_uuid(&args.volume_id)
            .await
        {
            Ok(storage) => storage,
            Err(ServiceError::StorageNotFound {
                ..
            }) => {
                return Err(failure!(
                    Code::NotFound,
                    "Volume {} not found",
                    args.volume_id
                ))
            }
            Err(e) => return Err(internal("look up volume", &e)),
        };
        // attachments may have changed while the volume settled
        let storage = self
            .service
            .require_storage_online(&storage)
            .await
            .map_err(|e| internal("wait for volume", &e))?;

        let attached = storage.server_uuids();
        if attached.iter().any(|uuid| *uuid == server.uuid) {
            info!(
                "volume {} is already published to {}",
                args.volume_id, args.node_id
            );
            return Ok(ControllerPublishVolumeResponse {
                publish_context: publish_context(&correlation_id),
            });
        }
        if !attached.is_empty() {
            return Err(failure!(
                Code::FailedPrecondition,
                "Volume {} is attached to wrong node: {}",
                args.volume_id,
                attached.join(", ")
            ));
        }

        if server.devices().len() as i64 >= self.max_volumes_per_node {
            return Err(failure!(
                Code::ResourceExhausted,
                "Node {} has reached its limit of {} volumes",
                args.node_id,
                self.max_volumes_per_node
            ));
        }

        match self.service.attach_storage(&storage.uuid, &server.uuid).await {
            Ok(()) => {}
            Err(e) if e.is_device_limit() => {
                return Err(failure!(
                    Code::ResourceExhausted,
                    "Node {} can not take more volumes: {}",
                    args.node_id,
                    e
                ))
            }
            Err(e) => return Err(internal("attach volume", &e)),
        }

        info!("volume {} published to {}", args.volume_id, args.node_id);
        Ok(ControllerPublishVolumeResponse {
            publish_context: publish_context(&correlation_id),
        })
    }

    async fn unpublish(
        &self,
        args: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status> {
        require(&args.volume_id, "Volume ID")?;

        let storage = match self
            .service
            .get_storage_by_uuid(&args.volume_id)
            .await
        {
            Ok(storage) => storage,
            Err(ServiceError::StorageNotFound {
                ..
            }) => {
                info!("volume {} not found, nothing to detach", args.volume_id);
                return Ok(ControllerUnpublishVolumeResponse {});
            }
            Err(e) => return Err(internal("look up volume", &e)),
        };

        let servers = if args.node_id.is_empty() {
            storage.server_uuids().to_vec()
        } else {
            match self.service.get_server_by_hostname(&args.node_id).await {
                Ok(server) => vec![server.uuid.clone()],
                Err(ServiceError::ServerNotFound {
                    ..
                }) => {
                    info!(
                        "node {} not found, volume {} is not attached to it",
                        args.node_id, args.volume_id
                    );
                    return Ok(ControllerUnpublishVolumeResponse {});
                }
                Err(e) => return Err(internal("look up node", &e)),
            }
        };

        for server in &servers {
            match self.service.detach_storage(&storage.uuid, server).await {
                Ok(()) => {
                    info!("volume {} detached from {}", args.volume_id, server)
                }
                Err(ServiceError::ServerStorageNotFound {
                    ..
                }) => debug!(
                    "volume {} is not attached to {}",
                    args.volume_id, server
                ),
                Err(ServiceError::ServerNotFound {
                    ..
                }) => info!(
                    "server {} is gone, volume {} is detached from it",
                    server, args.volume_id
                ),
                Err(e) => return Err(internal("detach volume", &e)),
            }
        }
        Ok(ControllerUnpublishVolumeResponse {})
    }

    async fn validate(
        &self,
        args: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status> {
        require(&args.volume_id, "Volume ID")?;
        if args.volume_capabilities.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume capabilities must be provided"
            ));
        }
        match self.service.get_storage_by_uuid(&args.volume_id).await {
            Ok(_) => {}
            Err(ServiceError::StorageNotFound {
                ..
            }) => {
                return Err(failure!(
                    Code::NotFound,
                    "Volume {} not found",
                    args.volume_id
                ))
            }
            Err(e) => return Err(internal("look up volume", &e)),
        }

        let violations =
            params::capability_violations(&args.volume_capabilities);
        if !violations.is_empty() {
            return Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: violations.join("; "),
            });
        }
        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(Confirmed {
                volume_context: args.volume_context,
                volume_capabilities: vec![VolumeCapability {
                    access_mode: Some(AccessMode {
                        mode: SUPPORTED_ACCESS_MODE as i32,
                    }),
                    access_type: None,
                }],
                parameters: args.parameters,
            }),
            message: String::new(),
        })
    }

    async fn list_volumes(
        &self,
        args: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, Status> {
        let size = paginate::parse_max_entries(args.max_entries)?;
        let start = paginate::parse_token(&args.starting_token)?;

        let mut storages = self
            .service
            .list_storage(&self.zone)
            .await
            .map_err(|e| internal("list volumes", &e))?;
        storages.sort_by(|a, b| a.uuid.cmp(&b.uuid));

        let (page, next) = paginate::paginate(&storages, start, size);
        Ok(ListVolumesResponse {
            entries: page
                .iter()
                .map(|storage| list_volumes_response::Entry {
                    volume: Some(self.volume(storage, None)),
                    status: None,
                })
                .collect(),
            next_token: next.to_string(),
        })
    }

    async fn create_snapshot(
        &self,
        args: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, Status> {
        require(&args.name, "Snapshot name")?;
        require(&args.source_volume_id, "Source volume ID")?;

        match self.service.get_storage_backup_by_name(&args.name).await {
            Ok(backup) if backup.origin == args.source_volume_id => {
                info!(
                    "snapshot {} of {} already exists as {}",
                    args.name, args.source_volume_id, backup.uuid
                );
                return Ok(CreateSnapshotResponse {
                    snapshot: Some(snapshot(&backup)),
                });
            }
            Ok(backup) => {
                return Err(failure!(
                    Code::AlreadyExists,
                    "Snapshot {} already exists for volume {}",
                    args.name,
                    backup.origin
                ))
            }
            Err(ServiceError::BackupNotFound {
                ..
            }) => {}
            Err(e) => return Err(internal("look up snapshot", &e)),
        }

        let backup = match self
            .service
            .create_storage_backup(&args.source_volume_id, &args.name)
            .await
        {
            Ok(backup) => backup,
            Err(ServiceError::BackupInProgress {
                ..
            }) => {
                return Err(failure!(
                    Code::Aborted,
                    "Volume {} is already being backed up",
                    args.source_volume_id
                ))
            }
            Err(ServiceError::StorageNotFound {
                ..
            }) => {
                return Err(failure!(
                    Code::NotFound,
                    "Source volume {} not found",
                    args.source_volume_id
                ))
            }
            Err(e) => return Err(internal("create snapshot", &e)),
        };

        info!(
            "snapshot {} of {} created as {}",
            args.name, args.source_volume_id, backup.uuid
        );
        Ok(CreateSnapshotResponse {
            snapshot: Some(snapshot(&backup)),
        })
    }

    async fn delete_snapshot(
        &self,
        args: DeleteSnapshotRequest,
    ) -> Result<DeleteSnapshotResponse, Status> {
        require(&args.snapshot_id, "Snapshot ID")?;
        if Uuid::parse_str(&args.snapshot_id).is_err() {
            info!(
                "snapshot {} can not exist, nothing to delete",
                args.snapshot_id
            );
            return Ok(DeleteSnapshotResponse {});
        }
        match self.service.delete_storage_backup(&args.snapshot_id).await {
            Ok(()) => {}
            Err(ServiceError::StorageNotFound {
                ..
            }) => info!("snapshot {} is already deleted", args.snapshot_id),
            Err(e @ ServiceError::NotBackup {
                ..
            }) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Refusing to delete {}: {}",
                    args.snapshot_id,
                    e
                ))
            }
            Err(e) => return Err(internal("delete snapshot", &e)),
        }
        Ok(DeleteSnapshotResponse {})
    }

    async fn list_snapshots(
        &self,
        args: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, Status> {
        let size = paginate::parse_max_entries(args.max_entries)?;
        let start = paginate::parse_token(&args.starting_token)?;

        if !args.snapshot_id.is_empty() {
            let entries = self
                .find_snapshot(&args.snapshot_id, &args.source_volume_id)
                .await?
                .map(|backup| list_snapshots_response::Entry {
                    snapshot: Some(snapshot(&backup)),
                })
                .into_iter()
                .collect();
            return Ok(ListSnapshotsResponse {
                entries,
                next_token: 0.to_string(),
            });
        }

        let mut backups = self
            .service
            .list_storage_backups(&args.source_volume_id)
            .await
            .map_err(|e| internal("list snapshots", &e))?;
        backups.sort_by(|a, b| a.uuid.cmp(&b.uuid));

        let (page, next) = paginate::paginate(&backups, start, size);
        Ok(ListSnapshotsResponse {
            entries: page
                .iter()
                .map(|backup| list_snapshots_response::Entry {
                    snapshot: Some(snapshot(backup)),
                })
                .collect(),
            next_token: next.to_string(),
        })
    }

    /// The backup with the given id, if it exists and belongs to
    /// `source_volume_id` (any source when empty).
    async fn find_snapshot(
        &self,
        snapshot_id: &str,
        source_volume_id: &str,
    ) -> Result<Option<Storage>, Status> {
        if Uuid::parse_str(snapshot_id).is_err() {
            return Ok(None);
        }
        let backup = match self.service.get_storage_by_uuid(snapshot_id).await {
            Ok(backup) => backup.storage,
            Err(ServiceError::StorageNotFound {
                ..
            }) => return Ok(None),
            Err(e) => return Err(internal("look up snapshot", &e)),
        };
        if backup.kind != StorageType::Backup {
            return Ok(None);
        }
        if !source_volume_id.is_empty() && backup.origin != source_volume_id {
            return Ok(None);
        }
        Ok(Some(backup))
    }

    async fn expand(
        &self,
        args: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, Status> {
        require(&args.volume_id, "Volume ID")?;
        let range = match &args.capacity_range {
            Some(range) => range,
            None => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Capacity range is required"
                ))
            }
        };

        let storage = match self
            .service
            .get_storage_by_uuid(&args.volume_id)
            .await
        {
            Ok(storage) => storage,
            Err(ServiceError::StorageNotFound {
                ..
            }) => {
                return Err(failure!(
                    Code::NotFound,
                    "Volume {} not found",
                    args.volume_id
                ))
            }
            Err(e) => return Err(internal("look up volume", &e)),
        };
        if !storage.server_uuids().is_empty() {
            return Err(failure!(
                Code::FailedPrecondition,
                "Volume {} is published, only offline expansion is supported",
                args.volume_id
            ));
        }

        let size = capacity::volume_size_gib(Some(range))?;
        if size <= storage.size {
            info!(
                "volume {} is already {} GiB, requested {} GiB",
                args.volume_id, storage.size, size
            );
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: storage.size as i64 * GIB,
                node_expansion_required: true,
            });
        }

        let resized = if params::is_block(args.volume_capability.as_ref()) {
            self.service.resize_block_device(&storage.uuid, size).await
        } else {
            self.service.resize_storage(&storage.uuid, size, true).await
        };
        let resized = resized.map_err(|e| internal("expand volume", &e))?;

        info!("volume {} expanded to {} GiB", args.volume_id, resized.size);
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: resized.size as i64 * GIB,
            node_expansion_required: false,
        })
    }
}

#[tonic::async_trait]
impl rpc::csi::controller_server::Controller for Controller {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        traced("CreateVolume", request, |_, args| self.create(args)).await
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        traced("DeleteVolume", request, |_, args| self.delete(args)).await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        traced("ControllerPublishVolume", request, |id, args| {
            self.publish(id, args)
        })
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        traced("ControllerUnpublishVolume", request, |_, args| {
            self.unpublish(args)
        })
        .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        traced("ValidateVolumeCapabilities", request, |_, args| {
            self.validate(args)
        })
        .await
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        traced("ListVolumes", request, |_, args| self.list_volumes(args)).await
    }

    async fn get_capacity(
        &self,
        request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        traced("GetCapacity", request, |_, _| async {
            Err(Status::unimplemented("GetCapacity is not supported"))
        })
        .await
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        traced("ControllerGetCapabilities", request, |_, _| async {
            Ok(ControllerGetCapabilitiesResponse {
                capabilities: [
                    RpcType::CreateDeleteVolume,
                    RpcType::PublishUnpublishVolume,
                    RpcType::ListVolumes,
                    RpcType::CreateDeleteSnapshot,
                    RpcType::ListSnapshots,
                    RpcType::ExpandVolume,
                    RpcType::CloneVolume,
                ]
                .iter()
                .map(|kind| capability(*kind))
                .collect(),
            })
        })
        .await
    }

    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        traced("CreateSnapshot", request, |_, args| self.create_snapshot(args))
            .await
    }

    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        traced("DeleteSnapshot", request, |_, args| self.delete_snapshot(args))
            .await
    }

    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        traced("ListSnapshots", request, |_, args| self.list_snapshots(args))
            .await
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        traced("ControllerExpandVolume", request, |_, args| self.expand(args))
            .await
    }

    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        traced("ControllerGetVolume", request, |_, _| async {
            Err(Status::unimplemented("ControllerGetVolume is not supported"))
        })
        .await
    }
}
