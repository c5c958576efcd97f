use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::ResultExt;
use upcloud::{
    Api,
    AttachStorageRequest,
    CloneStorageRequest,
    CreateBackupRequest,
    CreateStorageRequest,
    DetachStorageRequest,
    Label,
    ModifyStorageRequest,
    ServerDetails,
    ServerState,
    Storage,
    StorageAccess,
    StorageDetails,
    StorageState,
    StorageType,
};

use super::{Api as ApiError, Service, ServiceError};

/// Bound of the wait for a storage to settle after a mutation.
pub const STORAGE_STATE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Bound of the wait for a server to leave maintenance.
pub const SERVER_STATE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// `Service` backed by the UpCloud API.
///
/// Attach and detach are serialized per server: the API moves the server
/// through `maintenance` on every device change and rejects anything issued
/// meanwhile.
pub struct UpCloudService<A: ?Sized> {
    api: Arc<A>,
    storage_timeout: Duration,
    server_timeout: Duration,
    server_locks: ServerLocks,
}

type ServerLock = Arc<tokio::sync::Mutex<()>>;

/// One async lock per server uuid, kept only while somebody holds or waits
/// for it.
#[derive(Default)]
struct ServerLocks(Mutex<HashMap<String, ServerLock>>);

impl ServerLocks {
    fn acquire(&self, server_uuid: &str) -> ServerLock {
        self.0
            .lock()
            .entry(server_uuid.to_string())
            .or_default()
            .clone()
    }

    /// Hand back a lock from `acquire`, dropping the entry once the map
    /// holds the last other reference.
    fn release(&self, server_uuid: &str, lock: ServerLock) {
        let mut locks = self.0.lock();
        // map entry plus `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(server_uuid);
        }
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl<A: Api + ?Sized> UpCloudService<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            storage_timeout: STORAGE_STATE_TIMEOUT,
            server_timeout: SERVER_STATE_TIMEOUT,
            server_locks: ServerLocks::default(),
        }
    }

    pub fn with_timeouts(
        mut self,
        storage: Duration,
        server: Duration,
    ) -> Self {
        self.storage_timeout = storage;
        self.server_timeout = server;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Servers with an attach or detach in flight.
    pub fn busy_servers(&self) -> usize {
        self.server_locks.len()
    }

    async fn wait_storage(
        &self,
        uuid: &str,
        state: StorageState,
    ) -> Result<StorageDetails, ServiceError> {
        self.api
            .wait_for_storage_state(uuid, state, self.storage_timeout)
            .await
            .map_err(storage_error(uuid, "wait for storage state"))
    }

    async fn wait_server_started(
        &self,
        uuid: &str,
    ) -> Result<ServerDetails, ServiceError> {
        self.api
            .wait_for_server_state(
                uuid,
                ServerState::Started,
                self.server_timeout,
            )
            .await
            .map_err(|source| {
                if source.is_not_found() {
                    ServiceError::ServerNotFound {
                        server: uuid.to_string(),
                    }
                } else {
                    ServiceError::Api {
                        operation: "wait for server state".into(),
                        source,
                    }
                }
            })
    }

    async fn storages(&self) -> Result<Vec<Storage>, ServiceError> {
        self.api.get_storages().await.context(ApiError {
            operation: "list storages",
        })
    }

    async fn details(
        &self,
        uuid: &str,
    ) -> Result<StorageDetails, ServiceError> {
        self.api
            .get_storage_details(uuid)
            .await
            .map_err(storage_error(uuid, "get storage details"))
    }

    /// Attach under the server lock.
    async fn attach(
        &self,
        storage_uuid: &str,
        server_uuid: &str,
    ) -> Result<(), ServiceError> {
        self.wait_server_started(server_uuid).await?;
        let request = AttachStorageRequest::virtio_disk(storage_uuid);
        let server = self
            .api
            .attach_storage(server_uuid, &request)
            .await
            .context(ApiError {
                operation: format!(
                    "attach storage {} to server {}",
                    storage_uuid, server_uuid
                ),
            })?;
        let address = match server.device(storage_uuid) {
            Some(device) => device.address.clone(),
            None => {
                return Err(ServiceError::AttachUnconfirmed {
                    storage: storage_uuid.to_string(),
                    server: server_uuid.to_string(),
                })
            }
        };
        self.wait_server_started(server_uuid).await?;
        info!(
            "attached storage {} to server {} at {}",
            storage_uuid, server_uuid, address
        );
        Ok(())
    }

    async fn detach(
        &self,
        storage_uuid: &str,
        server_uuid: &str,
    ) -> Result<(), ServiceError> {
        let server = self.wait_server_started(server_uuid).await?;
        let address = match server.device(storage_uuid) {
            Some(device) => device.address.clone(),
            None => {
                return Err(ServiceError::ServerStorageNotFound {
                    storage: storage_uuid.to_string(),
                    server: server_uuid.to_string(),
                })
            }
        };

        let request = DetachStorageRequest {
            address: address.clone(),
        };
        let server = self
            .api
            .detach_storage(server_uuid, &request)
            .await
            .context(ApiError {
                operation: format!(
                    "detach storage {} from server {}",
                    storage_uuid, server_uuid
                ),
            })?;
        if server.device(storage_uuid).is_some() {
            return Err(ServiceError::DetachUnconfirmed {
                storage: storage_uuid.to_string(),
                server: server_uuid.to_string(),
            });
        }
        self.wait_server_started(server_uuid).await?;
        info!(
            "detached storage {} from server {} ({})",
            storage_uuid, server_uuid, address
        );
        Ok(())
    }

    /// Delete a storage, treating an already missing one as deleted.
    async fn delete(&self, uuid: &str) -> Result<(), ServiceError> {
        match self.api.delete_storage(uuid).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => {
                debug!("storage {} is already gone", uuid);
                Ok(())
            }
            Err(source) => Err(ServiceError::Api {
                operation: format!("delete storage {}", uuid),
                source,
            }),
        }
    }
}

/// Map a failed storage call, recognising a missing storage.
fn storage_error<'a>(
    uuid: &'a str,
    operation: &'static str,
) -> impl FnOnce(upcloud::Error) -> ServiceError + 'a {
    move |source| {
        if source.is_not_found() {
            ServiceError::StorageNotFound {
                uuid: uuid.to_string(),
            }
        } else {
            ServiceError::Api {
                operation: operation.to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl<A: Api + ?Sized> Service for UpCloudService<A> {
    async fn get_storage_by_uuid(
        &self,
        uuid: &str,
    ) -> Result<StorageDetails, ServiceError> {
        // storage details of an unknown uuid can not be told apart from
        // other failures, so look it up in the listing first
        let found =
            self.storages().await?.into_iter().any(|s| s.uuid == uuid);
        if !found {
            return Err(ServiceError::StorageNotFound {
                uuid: uuid.to_string(),
            });
        }
        self.details(uuid).await
    }

    async fn get_storage_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<StorageDetails>, ServiceError> {
        let mut volumes = Vec::new();
        for storage in self.storages().await? {
            if storage.title == name && storage.kind == StorageType::Normal {
                volumes.push(self.details(&storage.uuid).await?);
            }
        }
        Ok(volumes)
    }

    async fn list_storage(
        &self,
        zone: &str,
    ) -> Result<Vec<Storage>, ServiceError> {
        Ok(self
            .storages()
            .await?
            .into_iter()
            .filter(|s| {
                s.access == StorageAccess::Private
                    && s.kind == StorageType::Normal
                    && s.zone == zone
            })
            .collect())
    }

    async fn get_storage_backup_by_name(
        &self,
        name: &str,
    ) -> Result<Storage, ServiceError> {
        self.storages()
            .await?
            .into_iter()
            .find(|s| s.kind == StorageType::Backup && s.title == name)
            .ok_or_else(|| ServiceError::BackupNotFound {
                name: name.to_string(),
            })
    }

    async fn list_storage_backups(
        &self,
        origin_uuid: &str,
    ) -> Result<Vec<Storage>, ServiceError> {
        Ok(self
            .storages()
            .await?
            .into_iter()
            .filter(|s| s.kind == StorageType::Backup)
            .filter(|s| {
                if origin_uuid.is_empty() {
                    !s.origin.is_empty()
                } else {
                    s.origin == origin_uuid
                }
            })
            .collect())
    }

    async fn create_storage(
        &self,
        request: &CreateStorageRequest,
    ) -> Result<StorageDetails, ServiceError> {
        let storage =
            self.api.create_storage(request).await.context(ApiError {
                operation: format!("create storage {}", request.title),
            })?;
        info!(
            "created storage {} ({}) of {} GiB in {}",
            storage.uuid, storage.title, storage.size, storage.zone
        );
        self.wait_storage(&storage.uuid, StorageState::Online).await
    }

    async fn clone_storage(
        &self,
        source_uuid: &str,
        request: &CloneStorageRequest,
        labels: &[Label],
    ) -> Result<StorageDetails, ServiceError> {
        let clone = self
            .api
            .clone_storage(source_uuid, request)
            .await
            .map_err(storage_error(source_uuid, "clone storage"))?;
        info!(
            "cloning storage {} into {} ({})",
            source_uuid, clone.uuid, clone.title
        );
        let clone = self.wait_storage(&clone.uuid, StorageState::Online).await?;
        if labels.is_empty() {
            return Ok(clone);
        }

        let modify = ModifyStorageRequest {
            labels: Some(labels.to_vec()),
            ..Default::default()
        };
        self.api
            .modify_storage(&clone.uuid, &modify)
            .await
            .context(ApiError {
                operation: format!("label storage {}", clone.uuid),
            })?;
        self.wait_storage(&clone.uuid, StorageState::Online).await
    }

    async fn delete_storage(&self, uuid: &str) -> Result<(), ServiceError> {
        let storage = self.get_storage_by_uuid(uuid).await?;
        self.delete(&storage.uuid).await?;
        info!("deleted storage {}", uuid);
        Ok(())
    }

    async fn resize_storage(
        &self,
        uuid: &str,
        size: u64,
        delete_auto_backup: bool,
    ) -> Result<StorageDetails, ServiceError> {
        let modify = ModifyStorageRequest {
            size: Some(size),
            ..Default::default()
        };
        self.api
            .modify_storage(uuid, &modify)
            .await
            .map_err(storage_error(uuid, "modify storage size"))?;
        self.wait_storage(uuid, StorageState::Online).await?;

        let backup = self
            .api
            .resize_storage_filesystem(uuid)
            .await
            .map_err(storage_error(uuid, "resize storage filesystem"))?;
        debug!("resize of {} produced backup {}", uuid, backup.uuid);
        let storage = self.wait_storage(uuid, StorageState::Online).await?;

        if delete_auto_backup {
            // the backup can not be deleted while it is still being taken
            self.wait_storage(&backup.uuid, StorageState::Online).await?;
            self.delete(&backup.uuid).await?;
            debug!("deleted resize backup {} of {}", backup.uuid, uuid);
        }
        info!("resized storage {} to {} GiB", uuid, storage.size);
        Ok(storage)
    }

    async fn resize_block_device(
        &self,
        uuid: &str,
        size: u64,
    ) -> Result<StorageDetails, ServiceError> {
        let modify = ModifyStorageRequest {
            size: Some(size),
            ..Default::default()
        };
        self.api
            .modify_storage(uuid, &modify)
            .await
            .map_err(storage_error(uuid, "modify storage size"))?;
        let storage = self.wait_storage(uuid, StorageState::Online).await?;
        info!("resized block device {} to {} GiB", uuid, storage.size);
        Ok(storage)
    }

    async fn create_storage_backup(
        &self,
        uuid: &str,
        title: &str,
    ) -> Result<StorageDetails, ServiceError> {
        let source = self.details(uuid).await?;
        if source.state == StorageState::Backuping {
            return Err(ServiceError::BackupInProgress {
                uuid: uuid.to_string(),
            });
        }
        let request = CreateBackupRequest {
            title: title.to_string(),
        };
        let backup = self
            .api
            .create_backup(uuid, &request)
            .await
            .map_err(storage_error(uuid, "create backup"))?;
        info!("creating backup {} ({}) of {}", backup.uuid, title, uuid);
        self.wait_storage(&backup.uuid, StorageState::Online).await
    }

    async fn delete_storage_backup(
        &self,
        uuid: &str,
    ) -> Result<(), ServiceError> {
        let storage = self.details(uuid).await?;
        if storage.kind != StorageType::Backup {
            return Err(ServiceError::NotBackup {
                uuid: uuid.to_string(),
            });
        }
        self.delete(uuid).await?;
        info!("deleted backup {}", uuid);
        Ok(())
    }

    async fn require_storage_online(
        &self,
        storage: &StorageDetails,
    ) -> Result<StorageDetails, ServiceError> {
        if storage.state == StorageState::Online {
            return Ok(storage.clone());
        }
        debug!(
            "storage {} is {}, waiting for it to come online",
            storage.uuid, storage.state
        );
        self.wait_storage(&storage.uuid, StorageState::Online).await
    }

    async fn attach_storage(
        &self,
        storage_uuid: &str,
        server_uuid: &str,
    ) -> Result<(), ServiceError> {
        let lock = self.server_locks.acquire(server_uuid);
        let result = {
            let _guard = lock.lock().await;
            self.attach(storage_uuid, server_uuid).await
        };
        self.server_locks.release(server_uuid, lock);
        result
    }

    async fn detach_storage(
        &self,
        storage_uuid: &str,
        server_uuid: &str,
    ) -> Result<(), ServiceError> {
        let lock = self.server_locks.acquire(server_uuid);
        let result = {
            let _guard = lock.lock().await;
            self.detach(storage_uuid, server_uuid).await
        };
        self.server_locks.release(server_uuid, lock);
        result
    }

    async fn get_server_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<ServerDetails, ServiceError> {
        let servers = self.api.get_servers().await.context(ApiError {
            operation: "list servers",
        })?;
        let server = servers
            .into_iter()
            .find(|s| s.hostname == hostname)
            .ok_or_else(|| ServiceError::ServerNotFound {
                server: hostname.to_string(),
            })?;
        self.api
            .get_server_details(&server.uuid)
            .await
            .map_err(|source| {
                if source.is_not_found() {
                    ServiceError::ServerNotFound {
                        server: hostname.to_string(),
                    }
                } else {
                    ServiceError::Api {
                        operation: format!("get server {}", server.uuid),
                        source,
                    }
                }
            })
    }
}
