use serde::Deserialize;

/// One entry of `findmnt -J -o TARGET,SOURCE,FSTYPE,PROPAGATION`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MountInfo {
    pub target: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub propagation: String,
}

#[derive(Debug, Deserialize)]
struct Findmnt {
    #[serde(default)]
    filesystems: Vec<MountInfo>,
}

/// Mounts listed by findmnt; empty output means nothing is mounted.
pub fn parse(json: &str) -> Result<Vec<MountInfo>, serde_json::Error> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let findmnt: Findmnt = serde_json::from_str(json)?;
    Ok(findmnt.filesystems)
}
