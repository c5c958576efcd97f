//! Local block device operations needed to stage and publish volumes.
//!
//! Every operation is idempotent: formatting an already formatted device,
//! or unmounting a path that does not exist, succeeds without side effects.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use snafu::Snafu;

pub mod device;
pub mod findmnt;
mod linux;

pub use device::disk_id;
pub use linux::{CommandOutput, LinuxFilesystem, Runner, SystemRunner};

pub const DEFAULT_FS_TYPE: &str = "ext4";

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum FsError {
    #[snafu(display("Invalid volume ID {}", volume_id))]
    InvalidVolumeId { volume_id: String },
    #[snafu(display("Device {} did not appear within {:?}", disk_id, timeout))]
    DeviceNotFound { disk_id: String, timeout: Duration },
    #[snafu(display(
        "Filesystem {} is not supported, expected one of {}",
        fs_type,
        supported
    ))]
    UnsupportedFsType { fs_type: String, supported: String },
    #[snafu(display("Failed to run {}: {}", command, source))]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[snafu(display("{} exited with {}: {}", command, status, stderr))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[snafu(display("Failed to parse output of {}: {}", command, source))]
    ParseOutput {
        command: String,
        source: serde_json::Error,
    },
    #[snafu(display("Device {} has no partition", device))]
    NoPartition { device: String },
    #[snafu(display(
        "{} is mounted with {} propagation instead of shared",
        target,
        propagation
    ))]
    UnsharedPropagation { target: String, propagation: String },
    #[snafu(display("{}: {}", path, source))]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to get statistics of {}: {}", path, source))]
    Statistics { path: String, source: nix::Error },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeStatistics {
    pub available_bytes: i64,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_inodes: i64,
    pub total_inodes: i64,
    pub used_inodes: i64,
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Absolute path of the block device backing a volume.
    async fn get_device_by_id(&self, volume_id: &str)
        -> Result<PathBuf, FsError>;

    /// Partition `source` and create a filesystem of `fs_type` on the
    /// partition, skipping whatever already exists.
    async fn format(
        &self,
        source: &Path,
        fs_type: &str,
        mkfs_args: &[String],
    ) -> Result<(), FsError>;

    /// Mount `source` onto `target`. An empty `fs_type` denotes a block
    /// device bind mount, for which the target is created as a file.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), FsError>;

    /// Whether something is mounted on `target`. A mount without shared
    /// propagation is reported as `FsError::UnsharedPropagation`.
    async fn is_mounted(&self, target: &Path) -> Result<bool, FsError>;

    async fn unmount(&self, target: &Path) -> Result<(), FsError>;

    async fn statistics(&self, path: &Path)
        -> Result<VolumeStatistics, FsError>;

    async fn get_device_last_partition(
        &self,
        source: &Path,
    ) -> Result<PathBuf, FsError>;
}
