//! Storage operations the controller relies on, expressed in terms of the
//! domain rather than of individual API calls.

use async_trait::async_trait;
use snafu::Snafu;
use upcloud::{
    codes,
    CloneStorageRequest,
    CreateStorageRequest,
    Label,
    ServerDetails,
    Storage,
    StorageDetails,
};

mod upcloud_svc;

pub use upcloud_svc::{
    UpCloudService,
    SERVER_STATE_TIMEOUT,
    STORAGE_STATE_TIMEOUT,
};

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum ServiceError {
    #[snafu(display("Storage {} not found", uuid))]
    StorageNotFound { uuid: String },
    #[snafu(display("Backup {} not found", name))]
    BackupNotFound { name: String },
    /// `server` is the hostname or uuid the lookup was made with.
    #[snafu(display("Server {} not found", server))]
    ServerNotFound { server: String },
    #[snafu(display(
        "Storage {} is not attached to server {}",
        storage,
        server
    ))]
    ServerStorageNotFound { storage: String, server: String },
    #[snafu(display("Storage {} is already being backed up", uuid))]
    BackupInProgress { uuid: String },
    #[snafu(display("Storage {} is not a backup", uuid))]
    NotBackup { uuid: String },
    #[snafu(display(
        "Storage {} is missing from the devices of server {} after attach",
        storage,
        server
    ))]
    AttachUnconfirmed { storage: String, server: String },
    #[snafu(display(
        "Storage {} is still among the devices of server {} after detach",
        storage,
        server
    ))]
    DetachUnconfirmed { storage: String, server: String },
    #[snafu(display("Failed to {}: {}", operation, source))]
    Api {
        operation: String,
        source: upcloud::Error,
    },
}

impl ServiceError {
    /// The server already holds as many storage devices as it can.
    pub fn is_device_limit(&self) -> bool {
        match self {
            ServiceError::Api {
                source, ..
            } => source.code() == Some(codes::STORAGE_DEVICE_LIMIT_REACHED),
            _ => false,
        }
    }
}

#[async_trait]
pub trait Service: Send + Sync {
    /// Details of the storage with the given uuid.
    async fn get_storage_by_uuid(
        &self,
        uuid: &str,
    ) -> Result<StorageDetails, ServiceError>;

    /// Every normal storage titled `name`. More than one match is a
    /// violation the caller has to deal with.
    async fn get_storage_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<StorageDetails>, ServiceError>;

    /// Private normal storages of a zone.
    async fn list_storage(
        &self,
        zone: &str,
    ) -> Result<Vec<Storage>, ServiceError>;

    async fn get_storage_backup_by_name(
        &self,
        name: &str,
    ) -> Result<Storage, ServiceError>;

    /// Backups of `origin_uuid`, or every backup with an origin when it is
    /// empty.
    async fn list_storage_backups(
        &self,
        origin_uuid: &str,
    ) -> Result<Vec<Storage>, ServiceError>;

    async fn create_storage(
        &self,
        request: &CreateStorageRequest,
    ) -> Result<StorageDetails, ServiceError>;

    async fn clone_storage(
        &self,
        source_uuid: &str,
        request: &CloneStorageRequest,
        labels: &[Label],
    ) -> Result<StorageDetails, ServiceError>;

    async fn delete_storage(&self, uuid: &str) -> Result<(), ServiceError>;

    /// Grow a storage and its filesystem to `size` GiB.
    async fn resize_storage(
        &self,
        uuid: &str,
        size: u64,
        delete_auto_backup: bool,
    ) -> Result<StorageDetails, ServiceError>;

    /// Grow a storage used as a raw block device to `size` GiB.
    async fn resize_block_device(
        &self,
        uuid: &str,
        size: u64,
    ) -> Result<StorageDetails, ServiceError>;

    async fn create_storage_backup(
        &self,
        uuid: &str,
        title: &str,
    ) -> Result<StorageDetails, ServiceError>;

    async fn delete_storage_backup(
        &self,
        uuid: &str,
    ) -> Result<(), ServiceError>;

    /// Wait for the storage to be online, returning its current details.
    async fn require_storage_online(
        &self,
        storage: &StorageDetails,
    ) -> Result<StorageDetails, ServiceError>;

    async fn attach_storage(
        &self,
        storage_uuid: &str,
        server_uuid: &str,
    ) -> Result<(), ServiceError>;

    async fn detach_storage(
        &self,
        storage_uuid: &str,
        server_uuid: &str,
    ) -> Result<(), ServiceError>;

    async fn get_server_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<ServerDetails, ServiceError>;
}
