use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::{
    error::Error,
    types::{
        Account,
        AttachStorageRequest,
        CloneStorageRequest,
        CreateBackupRequest,
        CreateStorageRequest,
        DetachStorageRequest,
        ModifyStorageRequest,
        ResizeStorageFilesystemBackup,
        Server,
        ServerDetails,
        ServerState,
        Storage,
        StorageDetails,
        StorageState,
    },
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Operations of the storage and server API.
///
/// Every call is a single round trip; state transitions are observed with
/// the provided `wait_for_*` methods which poll the details endpoint.
#[async_trait]
pub trait Api: Send + Sync {
    async fn get_account(&self) -> Result<Account, Error>;

    async fn get_storages(&self) -> Result<Vec<Storage>, Error>;

    async fn get_storage_details(
        &self,
        uuid: &str,
    ) -> Result<StorageDetails, Error>;

    async fn create_storage(
        &self,
        request: &CreateStorageRequest,
    ) -> Result<StorageDetails, Error>;

    async fn clone_storage(
        &self,
        uuid: &str,
        request: &CloneStorageRequest,
    ) -> Result<StorageDetails, Error>;

    async fn modify_storage(
        &self,
        uuid: &str,
        request: &ModifyStorageRequest,
    ) -> Result<StorageDetails, Error>;

    /// Grow the filesystem of a storage after its size was modified. The
    /// API takes a backup of the storage first and returns it.
    async fn resize_storage_filesystem(
        &self,
        uuid: &str,
    ) -> Result<ResizeStorageFilesystemBackup, Error>;

    async fn delete_storage(&self, uuid: &str) -> Result<(), Error>;

    async fn create_backup(
        &self,
        uuid: &str,
        request: &CreateBackupRequest,
    ) -> Result<StorageDetails, Error>;

    async fn get_servers(&self) -> Result<Vec<Server>, Error>;

    async fn get_server_details(
        &self,
        uuid: &str,
    ) -> Result<ServerDetails, Error>;

    async fn attach_storage(
        &self,
        server_uuid: &str,
        request: &AttachStorageRequest,
    ) -> Result<ServerDetails, Error>;

    async fn detach_storage(
        &self,
        server_uuid: &str,
        request: &DetachStorageRequest,
    ) -> Result<ServerDetails, Error>;

    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Poll the storage until it reaches `desired` or `timeout` elapses.
    async fn wait_for_storage_state(
        &self,
        uuid: &str,
        desired: StorageState,
        timeout: Duration,
    ) -> Result<StorageDetails, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let details = self.get_storage_details(uuid).await?;
            if details.state == desired {
                return Ok(details);
            }
            if Instant::now() >= deadline {
                return Err(Error::WaitTimeout {
                    kind: "storage",
                    uuid: uuid.to_string(),
                    state: desired.to_string(),
                    timeout,
                });
            }
            tracing::trace!(
                "storage {} is {}, waiting for {}",
                uuid,
                details.state,
                desired
            );
            sleep(self.poll_interval()).await;
        }
    }

    /// Poll the server until it reaches `desired` or `timeout` elapses.
    async fn wait_for_server_state(
        &self,
        uuid: &str,
        desired: ServerState,
        timeout: Duration,
    ) -> Result<ServerDetails, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let details = self.get_server_details(uuid).await?;
            if details.state == desired {
                return Ok(details);
            }
            if Instant::now() >= deadline {
                return Err(Error::WaitTimeout {
                    kind: "server",
                    uuid: uuid.to_string(),
                    state: desired.to_string(),
                    timeout,
                });
            }
            tracing::trace!(
                "server {} is {}, waiting for {}",
                uuid,
                details.state,
                desired
            );
            sleep(self.poll_interval()).await;
        }
    }
}
