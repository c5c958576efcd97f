//! Block device naming and discovery helpers.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use super::FsError;

/// Length of the serial the hypervisor exposes for a virtio disk.
const SERIAL_LEN: usize = 20;

/// udev name of the disk backing a storage: `virtio-` followed by the
/// first 20 characters of the uuid with dashes removed.
pub fn disk_id(volume_id: &str) -> Result<String, FsError> {
    let serial: String = volume_id.chars().filter(|c| *c != '-').collect();
    if serial.len() < SERIAL_LEN
        || !serial.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(FsError::InvalidVolumeId {
            volume_id: volume_id.to_string(),
        });
    }
    Ok(format!("virtio-{}", &serial[.. SERIAL_LEN]))
}

/// Resolve `..` and `.` lexically, without touching the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    clean.push(component);
                }
            }
            other => clean.push(other),
        }
    }
    clean
}

/// Absolute target of a by-id link, relative links are taken relative to
/// the directory holding the link.
pub fn resolve_link(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        clean_path(target)
    } else {
        let dir = link.parent().unwrap_or_else(|| Path::new("/"));
        clean_path(&dir.join(target))
    }
}

#[derive(Debug, Deserialize)]
struct Lsblk {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

impl BlockDevice {
    fn collect_partitions(&self, partitions: &mut Vec<PathBuf>) {
        if self.kind == "part" {
            partitions.push(PathBuf::from(&self.name));
        }
        for child in &self.children {
            child.collect_partitions(partitions);
        }
    }
}

/// Partitions in the output of `lsblk -J -p -o NAME,TYPE <device>`, in
/// the order lsblk lists them.
pub fn parse_partitions(json: &str) -> Result<Vec<PathBuf>, serde_json::Error> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let lsblk: Lsblk = serde_json::from_str(json)?;
    let mut partitions = Vec::new();
    for device in &lsblk.blockdevices {
        device.collect_partitions(&mut partitions);
    }
    Ok(partitions)
}
