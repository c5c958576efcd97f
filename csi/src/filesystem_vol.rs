//! Functions for CSI stage, unstage, publish and unpublish filesystem volumes.

use std::{io::ErrorKind, path::Path};

use tonic::{Code, Status};

use crate::{
    csi::volume_capability::MountVolume,
    filesystem::{Filesystem, FsError, DEFAULT_FS_TYPE},
};

/// gRPC status for a filesystem driver error raised while performing
/// `operation` on a volume.
pub(crate) fn fs_failure(
    operation: &str,
    volume_id: &str,
    error: FsError,
) -> Status {
    let code = match &error {
        FsError::InvalidVolumeId {
            ..
        }
        | FsError::UnsupportedFsType {
            ..
        } => Code::InvalidArgument,
        FsError::DeviceNotFound {
            ..
        } => Code::NotFound,
        _ => Code::Internal,
    };
    let message =
        format!("Failed to {} volume {}: {}", operation, volume_id, error);
    error!("{}", message);
    Status::new(code, message)
}

fn fs_type(mnt: &MountVolume) -> &str {
    if mnt.fs_type.is_empty() {
        DEFAULT_FS_TYPE
    } else {
        &mnt.fs_type
    }
}

pub async fn stage_fs_volume(
    fs: &dyn Filesystem,
    volume_id: &str,
    staging_path: &Path,
    mnt: &MountVolume,
) -> Result<(), Status> {
    let fs_type = fs_type(mnt);

    let device = fs
        .get_device_by_id(volume_id)
        .await
        .map_err(|e| fs_failure("stage", volume_id, e))?;
    debug!("Volume {} is device {}", volume_id, device.display());

    fs.format(&device, fs_type, &[])
        .await
        .map_err(|e| fs_failure("stage", volume_id, e))?;

    if fs
        .is_mounted(staging_path)
        .await
        .map_err(|e| fs_failure("stage", volume_id, e))?
    {
        info!(
            "Volume {} is already staged to {}",
            volume_id,
            staging_path.display()
        );
        return Ok(());
    }

    let partition = fs
        .get_device_last_partition(&device)
        .await
        .map_err(|e| fs_failure("stage", volume_id, e))?;

    debug!(
        "Mounting {} onto {}",
        partition.display(),
        staging_path.display()
    );
    fs.mount(&partition, staging_path, fs_type, &mnt.mount_flags)
        .await
        .map_err(|e| fs_failure("stage", volume_id, e))?;

    info!("Volume {} staged to {}", volume_id, staging_path.display());
    Ok(())
}

pub async fn publish_fs_volume(
    fs: &dyn Filesystem,
    volume_id: &str,
    staging_path: &Path,
    target_path: &Path,
    mnt: &MountVolume,
    readonly: bool,
) -> Result<(), Status> {
    let mut options = bind_options(readonly);
    options.extend(mnt.mount_flags.iter().cloned());

    if fs
        .is_mounted(target_path)
        .await
        .map_err(|e| fs_failure("publish", volume_id, e))?
    {
        info!(
            "Volume {} is already published to {}",
            volume_id,
            target_path.display()
        );
        return Ok(());
    }

    debug!(
        "Bind mounting {} onto {}",
        staging_path.display(),
        target_path.display()
    );
    fs.mount(staging_path, target_path, fs_type(mnt), &options)
        .await
        .map_err(|e| fs_failure("publish", volume_id, e))?;

    info!("Volume {} published to {}", volume_id, target_path.display());
    Ok(())
}

pub(crate) fn bind_options(readonly: bool) -> Vec<String> {
    let mut options = vec![String::from("bind")];
    if readonly {
        options.push(String::from("ro"));
    }
    options
}

/// Unmount whatever is mounted on `path` and remove it, be it the directory
/// of a filesystem volume or the file of a block volume.
pub async fn unmount_and_remove(
    fs: &dyn Filesystem,
    operation: &str,
    volume_id: &str,
    path: &Path,
) -> Result<(), Status> {
    let mounted = match fs.is_mounted(path).await {
        Ok(mounted) => mounted,
        Err(FsError::UnsharedPropagation {
            propagation,
            ..
        }) => {
            warn!(
                "{} is mounted with {} propagation, unmounting anyway",
                path.display(),
                propagation
            );
            true
        }
        Err(error) => return Err(fs_failure(operation, volume_id, error)),
    };

    if mounted {
        debug!("Unmounting {}", path.display());
        fs.unmount(path)
            .await
            .map_err(|e| fs_failure(operation, volume_id, e))?;
    } else {
        debug!("Nothing is mounted on {}", path.display());
    }

    remove_path(path).await.map_err(|error| {
        failure!(
            Code::Internal,
            "Failed to {} volume {}: failed to remove {}: {}",
            operation,
            volume_id,
            path.display(),
            error
        )
    })?;
    Ok(())
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removes_dirs_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mount");
        std::fs::create_dir(&target).unwrap();
        remove_path(&target).await.unwrap();
        assert!(!target.exists());

        let block = dir.path().join("block");
        std::fs::write(&block, b"").unwrap();
        remove_path(&block).await.unwrap();
        assert!(!block.exists());

        remove_path(&block).await.unwrap();
    }

    #[test]
    fn error_codes() {
        let status = fs_failure(
            "stage",
            "x",
            FsError::DeviceNotFound {
                disk_id: String::from("virtio-x"),
                timeout: std::time::Duration::from_secs(1),
            },
        );
        assert_eq!(status.code(), Code::NotFound);
        let status = fs_failure(
            "stage",
            "x",
            FsError::UnsupportedFsType {
                fs_type: String::from("ntfs"),
                supported: String::from("ext4"),
            },
        );
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(bind_options(true), vec!["bind", "ro"]);
    }
}
