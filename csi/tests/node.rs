mod common;

use std::{collections::HashMap, path::PathBuf};

use tonic::{Code, Request};

use common::{MockFilesystem, ZONE};
use csi::{
    context::CORRELATION_ID_KEY,
    csi::{
        node_server::Node as _,
        volume_capability::{
            access_mode::Mode,
            AccessMode,
            AccessType,
            BlockVolume,
            MountVolume,
        },
        volume_usage::Unit,
        NodeGetCapabilitiesRequest,
        NodeGetInfoRequest,
        NodeGetVolumeStatsRequest,
        NodePublishVolumeRequest,
        NodeStageVolumeRequest,
        NodeUnpublishVolumeRequest,
        NodeUnstageVolumeRequest,
        VolumeCapability,
    },
    node::Node,
};

const VOLUME: &str = "f67db1ca-825b-40aa-a6f4-390ac6ff1b91";

fn mount_capability(fs_type: &str, flags: &[&str]) -> Option<VolumeCapability> {
    Some(VolumeCapability {
        access_mode: Some(AccessMode {
            mode: Mode::SingleNodeWriter as i32,
        }),
        access_type: Some(AccessType::Mount(MountVolume {
            fs_type: fs_type.into(),
            mount_flags: flags.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        })),
    })
}

fn block_capability() -> Option<VolumeCapability> {
    Some(VolumeCapability {
        access_mode: Some(AccessMode {
            mode: Mode::SingleNodeWriter as i32,
        }),
        access_type: Some(AccessType::Block(BlockVolume {})),
    })
}

struct Fixture {
    fs: std::sync::Arc<MockFilesystem>,
    node: Node,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fs = MockFilesystem::new();
        let node = Node::new("node1", ZONE, 7, fs.clone());
        Self {
            fs,
            node,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn stage_request(
        &self,
        capability: Option<VolumeCapability>,
    ) -> NodeStageVolumeRequest {
        let mut publish_context = HashMap::new();
        publish_context.insert(CORRELATION_ID_KEY.to_string(), "abc123".to_string());
        NodeStageVolumeRequest {
            volume_id: VOLUME.into(),
            publish_context,
            staging_target_path: self.path("staging").display().to_string(),
            volume_capability: capability,
            ..Default::default()
        }
    }

    fn publish_request(
        &self,
        capability: Option<VolumeCapability>,
        readonly: bool,
    ) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: VOLUME.into(),
            staging_target_path: self.path("staging").display().to_string(),
            target_path: self.path("target").display().to_string(),
            volume_capability: capability,
            readonly,
            ..Default::default()
        }
    }
}

#[tokio::test]
async fn stage_formats_and_mounts_once() {
    let fixture = Fixture::new();
    let device = fixture.fs.attach(VOLUME);

    fixture
        .node
        .node_stage_volume(Request::new(
            fixture.stage_request(mount_capability("", &["noatime"])),
        ))
        .await
        .unwrap();
    assert_eq!(fixture.fs.formatted(&device).as_deref(), Some("ext4"));
    let mount = fixture.fs.mount_of(&fixture.path("staging")).unwrap();
    assert_eq!(mount.source, PathBuf::from(format!("{}1", device.display())));
    assert_eq!(mount.fs_type, "ext4");
    assert_eq!(mount.options, vec!["noatime"]);

    fixture
        .node
        .node_stage_volume(Request::new(
            fixture.stage_request(mount_capability("", &["noatime"])),
        ))
        .await
        .unwrap();
    assert_eq!(fixture.fs.formatted(&device).as_deref(), Some("ext4"));
}

#[tokio::test]
async fn stage_errors() {
    let fixture = Fixture::new();

    let status = fixture
        .node
        .node_stage_volume(Request::new(
            fixture.stage_request(mount_capability("xfs", &[])),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    fixture.fs.attach(VOLUME);
    let status = fixture
        .node
        .node_stage_volume(Request::new(
            fixture.stage_request(mount_capability("ntfs", &[])),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut request = fixture.stage_request(mount_capability("xfs", &[]));
    request.volume_id = "not-a-volume".into();
    let status = fixture
        .node
        .node_stage_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = fixture
        .node
        .node_stage_volume(Request::new(fixture.stage_request(None)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut request = fixture.stage_request(mount_capability("xfs", &[]));
    request.staging_target_path.clear();
    let status = fixture
        .node
        .node_stage_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn block_volumes_skip_staging() {
    let fixture = Fixture::new();
    let device = fixture.fs.attach(VOLUME);

    fixture
        .node
        .node_stage_volume(Request::new(fixture.stage_request(block_capability())))
        .await
        .unwrap();
    assert_eq!(fixture.fs.format_calls(), 0);
    assert!(fixture.fs.mount_of(&fixture.path("staging")).is_none());

    fixture
        .node
        .node_publish_volume(Request::new(
            fixture.publish_request(block_capability(), false),
        ))
        .await
        .unwrap();
    let mount = fixture.fs.mount_of(&fixture.path("target")).unwrap();
    assert_eq!(mount.source, device);
    assert_eq!(mount.fs_type, "");
    assert_eq!(mount.options, vec!["bind"]);
}

#[tokio::test]
async fn publish_bind_mounts_the_staging_path() {
    let fixture = Fixture::new();
    fixture.fs.attach(VOLUME);

    fixture
        .node
        .node_publish_volume(Request::new(
            fixture.publish_request(mount_capability("xfs", &["discard"]), true),
        ))
        .await
        .unwrap();
    let mount = fixture.fs.mount_of(&fixture.path("target")).unwrap();
    assert_eq!(mount.source, fixture.path("staging"));
    assert_eq!(mount.fs_type, "xfs");
    assert_eq!(mount.options, vec!["bind", "ro", "discard"]);

    fixture
        .node
        .node_publish_volume(Request::new(
            fixture.publish_request(mount_capability("xfs", &[]), false),
        ))
        .await
        .unwrap();
    // already mounted, left untouched
    let mount = fixture.fs.mount_of(&fixture.path("target")).unwrap();
    assert_eq!(mount.options, vec!["bind", "ro", "discard"]);

    let mut request = fixture.publish_request(mount_capability("xfs", &[]), false);
    request.target_path.clear();
    let status = fixture
        .node
        .node_publish_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn unpublish_and_unstage_tear_down() {
    let fixture = Fixture::new();
    fixture.fs.attach(VOLUME);
    let staging = fixture.path("staging");
    let target = fixture.path("target");
    std::fs::create_dir(&staging).unwrap();
    std::fs::create_dir(&target).unwrap();

    fixture
        .node
        .node_stage_volume(Request::new(
            fixture.stage_request(mount_capability("ext4", &[])),
        ))
        .await
        .unwrap();
    fixture
        .node
        .node_publish_volume(Request::new(
            fixture.publish_request(mount_capability("ext4", &[]), false),
        ))
        .await
        .unwrap();

    let unpublish = || {
        Request::new(NodeUnpublishVolumeRequest {
            volume_id: VOLUME.into(),
            target_path: target.display().to_string(),
        })
    };
    fixture.node.node_unpublish_volume(unpublish()).await.unwrap();
    assert!(fixture.fs.mount_of(&target).is_none());
    assert!(!target.exists());
    fixture.node.node_unpublish_volume(unpublish()).await.unwrap();

    let unstage = || {
        Request::new(NodeUnstageVolumeRequest {
            volume_id: VOLUME.into(),
            staging_target_path: staging.display().to_string(),
        })
    };
    fixture.node.node_unstage_volume(unstage()).await.unwrap();
    assert!(fixture.fs.mount_of(&staging).is_none());
    assert!(!staging.exists());
    fixture.node.node_unstage_volume(unstage()).await.unwrap();
}

#[tokio::test]
async fn teardown_unmounts_unshared_mounts() {
    let fixture = Fixture::new();
    let target = fixture.path("target");
    std::fs::write(&target, b"").unwrap();
    fixture.fs.mount_unshared(&target);

    fixture
        .node
        .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
            volume_id: VOLUME.into(),
            target_path: target.display().to_string(),
        }))
        .await
        .unwrap();
    assert!(fixture.fs.mount_of(&target).is_none());
    assert!(!target.exists());
}

#[tokio::test]
async fn volume_stats() {
    let fixture = Fixture::new();
    fixture.fs.attach(VOLUME);

    let stats = |path: PathBuf| {
        Request::new(NodeGetVolumeStatsRequest {
            volume_id: VOLUME.into(),
            volume_path: path.display().to_string(),
            ..Default::default()
        })
    };
    let status = fixture
        .node
        .node_get_volume_stats(stats(fixture.path("target")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    fixture
        .node
        .node_publish_volume(Request::new(
            fixture.publish_request(mount_capability("ext4", &[]), false),
        ))
        .await
        .unwrap();
    let usage = fixture
        .node
        .node_get_volume_stats(stats(fixture.path("target")))
        .await
        .unwrap()
        .into_inner()
        .usage;
    assert_eq!(usage.len(), 2);
    assert_eq!(usage[0].unit, Unit::Bytes as i32);
    assert_eq!(usage[0].total, 10 << 30);
    assert_eq!(usage[0].used, 4 << 30);
    assert_eq!(usage[1].unit, Unit::Inodes as i32);
    assert_eq!(usage[1].available, 600);
}

#[tokio::test]
async fn info_and_capabilities() {
    let fixture = Fixture::new();

    let info = fixture
        .node
        .node_get_info(Request::new(NodeGetInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.node_id, "node1");
    assert_eq!(info.max_volumes_per_node, 7);
    assert_eq!(
        info.accessible_topology
            .unwrap()
            .segments
            .get("region")
            .map(String::as_str),
        Some(ZONE)
    );

    let capabilities = fixture
        .node
        .node_get_capabilities(Request::new(NodeGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner()
        .capabilities;
    assert_eq!(capabilities.len(), 2);
}
