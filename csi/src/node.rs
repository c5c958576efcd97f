//! CSI node service: stages attached block devices and publishes them to
//! the paths chosen by the orchestrator.

use std::{collections::HashMap, path::Path, sync::Arc};

use tonic::{Code, Request, Response, Status};

use crate::{
    block_vol::publish_block_volume,
    context::{record_origin, traced},
    csi::{
        node_service_capability::{self, rpc::Type as RpcType},
        volume_capability::AccessType,
        volume_usage::Unit,
        NodeExpandVolumeRequest,
        NodeExpandVolumeResponse,
        NodeGetCapabilitiesRequest,
        NodeGetCapabilitiesResponse,
        NodeGetInfoRequest,
        NodeGetInfoResponse,
        NodeGetVolumeStatsRequest,
        NodeGetVolumeStatsResponse,
        NodePublishVolumeRequest,
        NodePublishVolumeResponse,
        NodeServiceCapability,
        NodeStageVolumeRequest,
        NodeStageVolumeResponse,
        NodeUnpublishVolumeRequest,
        NodeUnpublishVolumeResponse,
        NodeUnstageVolumeRequest,
        NodeUnstageVolumeResponse,
        Topology,
        VolumeCapability,
        VolumeUsage,
    },
    filesystem::Filesystem,
    filesystem_vol::{
        fs_failure,
        publish_fs_volume,
        stage_fs_volume,
        unmount_and_remove,
    },
    TOPOLOGY_REGION_KEY,
};

pub struct Node {
    node_id: String,
    zone: String,
    max_volumes_per_node: i64,
    fs: Arc<dyn Filesystem>,
}

impl Node {
    pub fn new(
        node_id: &str,
        zone: &str,
        max_volumes_per_node: i64,
        fs: Arc<dyn Filesystem>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            zone: zone.to_string(),
            max_volumes_per_node,
            fs,
        }
    }
}

fn require(value: &str, what: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(failure!(Code::InvalidArgument, "{} is required", what));
    }
    Ok(())
}

fn access_type<'a>(
    volume_id: &str,
    capability: &'a Option<VolumeCapability>,
) -> Result<&'a AccessType, Status> {
    match capability.as_ref().and_then(|c| c.access_type.as_ref()) {
        Some(access_type) => Ok(access_type),
        None => Err(failure!(
            Code::InvalidArgument,
            "Missing access type for volume {}",
            volume_id
        )),
    }
}

impl Node {
    async fn stage(
        &self,
        args: NodeStageVolumeRequest,
    ) -> Result<NodeStageVolumeResponse, Status> {
        record_origin(&args.publish_context);
        require(&args.volume_id, "Volume ID")?;
        require(&args.staging_target_path, "Staging target path")?;

        match access_type(&args.volume_id, &args.volume_capability)? {
            AccessType::Block(_) => {
                debug!("Block volume {} needs no staging", args.volume_id);
            }
            AccessType::Mount(mnt) => {
                stage_fs_volume(
                    self.fs.as_ref(),
                    &args.volume_id,
                    Path::new(&args.staging_target_path),
                    mnt,
                )
                .await?;
            }
        }
        Ok(NodeStageVolumeResponse {})
    }

    async fn unstage(
        &self,
        args: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, Status> {
        require(&args.volume_id, "Volume ID")?;
        require(&args.staging_target_path, "Staging target path")?;

        unmount_and_remove(
            self.fs.as_ref(),
            "unstage",
            &args.volume_id,
            Path::new(&args.staging_target_path),
        )
        .await?;
        info!(
            "Volume {} unstaged from {}",
            args.volume_id, args.staging_target_path
        );
        Ok(NodeUnstageVolumeResponse {})
    }

    async fn publish(
        &self,
        args: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status> {
        record_origin(&args.publish_context);
        require(&args.volume_id, "Volume ID")?;
        require(&args.staging_target_path, "Staging target path")?;
        require(&args.target_path, "Target path")?;

        let target_path = Path::new(&args.target_path);
        match access_type(&args.volume_id, &args.volume_capability)? {
            AccessType::Block(_) => {
                publish_block_volume(
                    self.fs.as_ref(),
                    &args.volume_id,
                    target_path,
                    args.readonly,
                )
                .await?
            }
            AccessType::Mount(mnt) => {
                publish_fs_volume(
                    self.fs.as_ref(),
                    &args.volume_id,
                    Path::new(&args.staging_target_path),
                    target_path,
                    mnt,
                    args.readonly,
                )
                .await?
            }
        }
        Ok(NodePublishVolumeResponse {})
    }

    async fn unpublish(
        &self,
        args: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status> {
        require(&args.volume_id, "Volume ID")?;
        require(&args.target_path, "Target path")?;

        unmount_and_remove(
            self.fs.as_ref(),
            "unpublish",
            &args.volume_id,
            Path::new(&args.target_path),
        )
        .await?;
        info!(
            "Volume {} unpublished from {}",
            args.volume_id, args.target_path
        );
        Ok(NodeUnpublishVolumeResponse {})
    }

    async fn stats(
        &self,
        args: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, Status> {
        require(&args.volume_id, "Volume ID")?;
        require(&args.volume_path, "Volume path")?;

        let path = Path::new(&args.volume_path);
        let mounted = self
            .fs
            .is_mounted(path)
            .await
            .map_err(|e| fs_failure("get statistics of", &args.volume_id, e))?;
        if !mounted {
            return Err(failure!(
                Code::NotFound,
                "Volume {} is not mounted on {}",
                args.volume_id,
                args.volume_path
            ));
        }

        let stats = self
            .fs
            .statistics(path)
            .await
            .map_err(|e| fs_failure("get statistics of", &args.volume_id, e))?;
        Ok(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    available: stats.available_bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                    unit: Unit::Bytes as i32,
                },
                VolumeUsage {
                    available: stats.available_inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                    unit: Unit::Inodes as i32,
                },
            ],
            volume_condition: None,
        })
    }
}

#[tonic::async_trait]
impl rpc::csi::node_server::Node for Node {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        traced("NodeStageVolume", request, |_, args| self.stage(args)).await
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        traced("NodeUnstageVolume", request, |_, args| self.unstage(args))
            .await
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        traced("NodePublishVolume", request, |_, args| self.publish(args))
            .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        traced("NodeUnpublishVolume", request, |_, args| self.unpublish(args))
            .await
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        traced("NodeGetVolumeStats", request, |_, args| self.stats(args)).await
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        traced("NodeExpandVolume", request, |_, _| async {
            Err(Status::unimplemented("Online expansion is not supported"))
        })
        .await
    }

    async fn node_get_capabilities(
        &self,
        request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        traced("NodeGetCapabilities", request, |_, _| async {
            Ok(NodeGetCapabilitiesResponse {
                capabilities: [
                    RpcType::StageUnstageVolume,
                    RpcType::GetVolumeStats,
                ]
                .iter()
                .map(|kind| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc {
                            r#type: *kind as i32,
                        },
                    )),
                })
                .collect(),
            })
        })
        .await
    }

    async fn node_get_info(
        &self,
        request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        traced("NodeGetInfo", request, |_, _| async move {
            let mut segments = HashMap::new();
            segments.insert(TOPOLOGY_REGION_KEY.to_string(), self.zone.clone());
            Ok(NodeGetInfoResponse {
                node_id: self.node_id.clone(),
                max_volumes_per_node: self.max_volumes_per_node,
                accessible_topology: Some(Topology {
                    segments,
                }),
            })
        })
        .await
    }
}
