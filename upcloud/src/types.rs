//! Data model of the storage and server resources.
//!
//! Field names follow the JSON documents of the API. List responses are
//! wrapped twice (`{"storages":{"storage":[...]}}`), the envelopes live in
//! the HTTP client.

use std::{fmt, ops::Deref};

use serde::{Deserialize, Serialize};

/// Sizes are expressed in GiB throughout the API.
pub const GIB: u64 = 1 << 30;

macro_rules! api_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant,)+
            #[serde(other)]
            Unknown,
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                    $name::Unknown => "unknown",
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

api_enum!(StorageState {
    Online => "online",
    Maintenance => "maintenance",
    Backuping => "backuping",
    Cloning => "cloning",
    Syncing => "syncing",
    Error => "error",
});

api_enum!(StorageType {
    Normal => "normal",
    Backup => "backup",
    Template => "template",
    Cdrom => "cdrom",
});

api_enum!(StorageTier {
    Maxiops => "maxiops",
    Hdd => "hdd",
    Standard => "standard",
});

api_enum!(StorageAccess {
    Private => "private",
    Public => "public",
});

api_enum!(ServerState {
    Started => "started",
    Stopped => "stopped",
    Maintenance => "maintenance",
    Error => "error",
});

/// `yes`/`no` encoded booleans.
mod yes_no {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &bool,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "yes" } else { "no" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<bool, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(matches!(value.as_deref(), Some("yes")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub uuid: String,
    #[serde(default)]
    pub title: String,
    /// GiB
    pub size: u64,
    pub state: StorageState,
    #[serde(default = "unknown_tier")]
    pub tier: StorageTier,
    #[serde(rename = "type")]
    pub kind: StorageType,
    #[serde(default = "private_access")]
    pub access: StorageAccess,
    #[serde(default)]
    pub zone: String,
    /// Source storage of a backup, empty for anything else.
    #[serde(default)]
    pub origin: String,
    /// RFC 3339
    #[serde(default)]
    pub created: String,
    #[serde(default, with = "yes_no")]
    pub encrypted: bool,
    #[serde(default)]
    pub labels: Vec<Label>,
}

fn unknown_tier() -> StorageTier {
    StorageTier::Unknown
}

fn private_access() -> StorageAccess {
    StorageAccess::Private
}

impl Storage {
    pub fn size_bytes(&self) -> u64 {
        self.size * GIB
    }

    pub fn is_online(&self) -> bool {
        self.state == StorageState::Online
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerUuids {
    #[serde(default)]
    pub server: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDetails {
    #[serde(flatten)]
    pub storage: Storage,
    #[serde(default)]
    pub servers: ServerUuids,
}

impl StorageDetails {
    /// Servers the storage is attached to.
    pub fn server_uuids(&self) -> &[String] {
        &self.servers.server
    }
}

impl Deref for StorageDetails {
    type Target = Storage;

    fn deref(&self) -> &Storage {
        &self.storage
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub uuid: String,
    pub hostname: String,
    pub state: ServerState,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDevice {
    /// Bus address, e.g. `virtio:1`.
    pub address: String,
    #[serde(rename = "storage")]
    pub uuid: String,
    #[serde(default)]
    pub storage_size: u64,
    #[serde(default)]
    pub storage_title: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageDevices {
    #[serde(default)]
    pub storage_device: Vec<StorageDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDetails {
    #[serde(flatten)]
    pub server: Server,
    #[serde(default)]
    pub storage_devices: StorageDevices,
}

impl ServerDetails {
    pub fn devices(&self) -> &[StorageDevice] {
        &self.storage_devices.storage_device
    }

    pub fn device(&self, storage_uuid: &str) -> Option<&StorageDevice> {
        self.devices().iter().find(|d| d.uuid == storage_uuid)
    }
}

impl Deref for ServerDetails {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.server
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    #[serde(default)]
    pub credits: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateStorageRequest {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<StorageTier>,
    pub title: String,
    pub zone: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub labels: Vec<Label>,
    #[serde(with = "yes_no", default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneStorageRequest {
    pub zone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<StorageTier>,
    pub title: String,
    #[serde(with = "yes_no", default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModifyStorageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<Label>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachStorageRequest {
    #[serde(rename = "storage")]
    pub storage_uuid: String,
    /// Bus name; the API picks the slot.
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl AttachStorageRequest {
    pub fn virtio_disk(storage_uuid: impl Into<String>) -> Self {
        Self {
            storage_uuid: storage_uuid.into(),
            address: "virtio".into(),
            kind: "disk".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachStorageRequest {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBackupRequest {
    pub title: String,
}

/// Backup taken automatically by a filesystem resize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeStorageFilesystemBackup {
    pub uuid: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn storage_details_decode() {
        let details: StorageDetails = serde_json::from_value(json!({
            "access": "private",
            "created": "2021-03-01T10:00:00Z",
            "encrypted": "yes",
            "labels": [{"key": "env", "value": "test"}],
            "license": 0,
            "origin": "",
            "servers": {"server": ["00798b85-efdc-41ca-8021-f6ef457b8531"]},
            "size": 10,
            "state": "online",
            "tier": "maxiops",
            "title": "pvc-1",
            "type": "normal",
            "uuid": "01d4fcd4-e446-433b-8a9c-551a1284952e",
            "zone": "fi-hel2"
        }))
        .unwrap();
        assert_eq!(details.size_bytes(), 10 * GIB);
        assert!(details.encrypted);
        assert!(details.is_online());
        assert_eq!(details.tier, StorageTier::Maxiops);
        assert_eq!(details.labels, vec![Label::new("env", "test")]);
        assert_eq!(
            details.server_uuids(),
            &["00798b85-efdc-41ca-8021-f6ef457b8531".to_string()]
        );
    }

    #[test]
    fn unknown_state_is_tolerated() {
        let storage: Storage = serde_json::from_value(json!({
            "uuid": "x",
            "size": 1,
            "state": "migrating",
            "type": "backup",
            "encrypted": "no"
        }))
        .unwrap();
        assert_eq!(storage.state, StorageState::Unknown);
        assert_eq!(storage.kind, StorageType::Backup);
        assert!(!storage.encrypted);
        assert_eq!(storage.access, StorageAccess::Private);
    }

    #[test]
    fn server_details_decode() {
        let details: ServerDetails = serde_json::from_value(json!({
            "uuid": "s1",
            "hostname": "node1",
            "state": "maintenance",
            "zone": "de-fra1",
            "storage_devices": {"storage_device": [
                {"address": "virtio:0", "storage": "root", "storage_size": 25, "type": "disk"},
                {"address": "virtio:1", "storage": "data", "storage_size": 10, "type": "disk"}
            ]}
        }))
        .unwrap();
        assert_eq!(details.state, ServerState::Maintenance);
        assert_eq!(details.devices().len(), 2);
        assert_eq!(details.device("data").unwrap().address, "virtio:1");
        assert!(details.device("missing").is_none());
    }

    #[test]
    fn create_request_encoding() {
        let request = CreateStorageRequest {
            size: 20,
            tier: Some(StorageTier::Hdd),
            title: "pvc-2".into(),
            zone: "fi-hel1".into(),
            labels: vec![],
            encrypted: true,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "size": 20,
                "tier": "hdd",
                "title": "pvc-2",
                "zone": "fi-hel1",
                "encrypted": "yes"
            })
        );
        assert_eq!(
            serde_json::to_value(&AttachStorageRequest::virtio_disk("u"))
                .unwrap(),
            json!({"storage": "u", "address": "virtio", "type": "disk"})
        );
    }
}
