//! Publishing of raw block volumes. Nothing happens at stage time; the
//! device itself is bind mounted onto a file at the target path.

use std::path::Path;

use tonic::Status;

use crate::{
    filesystem::Filesystem,
    filesystem_vol::{bind_options, fs_failure},
};

pub async fn publish_block_volume(
    fs: &dyn Filesystem,
    volume_id: &str,
    target_path: &Path,
    readonly: bool,
) -> Result<(), Status> {
    let device = fs
        .get_device_by_id(volume_id)
        .await
        .map_err(|e| fs_failure("publish", volume_id, e))?;

    if fs
        .is_mounted(target_path)
        .await
        .map_err(|e| fs_failure("publish", volume_id, e))?
    {
        info!(
            "Block volume {} is already published to {}",
            volume_id,
            target_path.display()
        );
        return Ok(());
    }

    debug!(
        "Bind mounting device {} onto {}",
        device.display(),
        target_path.display()
    );
    fs.mount(&device, target_path, "", &bind_options(readonly))
        .await
        .map_err(|e| fs_failure("publish", volume_id, e))?;

    info!(
        "Block volume {} published to {}",
        volume_id,
        target_path.display()
    );
    Ok(())
}
