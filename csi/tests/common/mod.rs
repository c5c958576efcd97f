//! In-memory doubles of the storage API and of the local filesystem.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use upcloud::{
    codes,
    Account,
    Api,
    AttachStorageRequest,
    CloneStorageRequest,
    CreateBackupRequest,
    CreateStorageRequest,
    DetachStorageRequest,
    Error,
    ModifyStorageRequest,
    ResizeStorageFilesystemBackup,
    Server,
    ServerDetails,
    ServerState,
    ServerUuids,
    Storage,
    StorageAccess,
    StorageDetails,
    StorageDevice,
    StorageDevices,
    StorageState,
    StorageTier,
    StorageType,
};

use csi::{
    filesystem::{disk_id, Filesystem, FsError, VolumeStatistics},
    service::UpCloudService,
};

pub const ZONE: &str = "fi-hel2";
pub const CREATED: &str = "2021-03-01T10:00:00Z";

/// How long a storage or server stays busy after a mutation.
const SETTLE: Duration = Duration::from_millis(20);

fn problem(status: u16, code: &str, message: String) -> Error {
    Error::Problem {
        method: "TEST".into(),
        path: String::new(),
        status,
        code: code.into(),
        message,
    }
}

fn storage_not_found(uuid: &str) -> Error {
    problem(404, codes::STORAGE_NOT_FOUND, format!("storage {} not found", uuid))
}

fn server_not_found(uuid: &str) -> Error {
    problem(404, codes::SERVER_NOT_FOUND, format!("server {} not found", uuid))
}

struct FakeStorage {
    storage: Storage,
    servers: Vec<String>,
    busy: Option<(StorageState, Option<Instant>)>,
}

impl FakeStorage {
    fn state(&mut self) -> StorageState {
        match self.busy {
            Some((state, None)) => state,
            Some((state, Some(until))) if Instant::now() < until => state,
            _ => {
                self.busy = None;
                StorageState::Online
            }
        }
    }

    fn keep_busy(&mut self, state: StorageState) {
        self.busy = Some((state, Some(Instant::now() + SETTLE)));
    }

    fn view(&mut self) -> Storage {
        let mut storage = self.storage.clone();
        storage.state = self.state();
        storage
    }

    fn details(&mut self) -> StorageDetails {
        StorageDetails {
            storage: self.view(),
            servers: ServerUuids {
                server: self.servers.clone(),
            },
        }
    }
}

struct FakeServer {
    server: Server,
    devices: Vec<StorageDevice>,
    maintenance_until: Option<Instant>,
    next_slot: u32,
}

impl FakeServer {
    fn in_maintenance(&self) -> bool {
        matches!(self.maintenance_until, Some(until) if Instant::now() < until)
    }

    fn details(&self) -> ServerDetails {
        let mut server = self.server.clone();
        if self.in_maintenance() {
            server.state = ServerState::Maintenance;
        }
        ServerDetails {
            server,
            storage_devices: StorageDevices {
                storage_device: self.devices.clone(),
            },
        }
    }
}

#[derive(Default)]
struct Inner {
    storages: HashMap<String, FakeStorage>,
    servers: HashMap<String, FakeServer>,
    device_limit: usize,
    attach_calls: usize,
    detach_calls: usize,
    rejected_calls: usize,
}

impl Inner {
    fn storage(&mut self, uuid: &str) -> Result<&mut FakeStorage, Error> {
        self.storages
            .get_mut(uuid)
            .ok_or_else(|| storage_not_found(uuid))
    }

    fn online(&mut self, uuid: &str) -> Result<&mut FakeStorage, Error> {
        let storage = self.storage(uuid)?;
        let state = storage.state();
        if state != StorageState::Online {
            return Err(problem(
                409,
                codes::STORAGE_STATE_ILLEGAL,
                format!("storage {} is {}", uuid, state),
            ));
        }
        Ok(storage)
    }

    fn started(&mut self, uuid: &str) -> Result<&mut FakeServer, Error> {
        let server = self
            .servers
            .get_mut(uuid)
            .ok_or_else(|| server_not_found(uuid))?;
        if server.in_maintenance() {
            self.rejected_calls += 1;
            return Err(problem(
                409,
                codes::SERVER_STATE_ILLEGAL,
                format!("server {} is in maintenance", uuid),
            ));
        }
        Ok(server)
    }

    fn insert(&mut self, storage: Storage, busy: Option<StorageState>) -> StorageDetails {
        let mut fake = FakeStorage {
            storage,
            servers: Vec::new(),
            busy: None,
        };
        if let Some(state) = busy {
            fake.keep_busy(state);
        }
        let details = fake.details();
        self.storages.insert(details.uuid.clone(), fake);
        details
    }
}

fn new_storage(title: &str, size: u64, zone: &str) -> Storage {
    Storage {
        uuid: uuid::Uuid::new_v4().to_string(),
        title: title.to_string(),
        size,
        state: StorageState::Online,
        tier: StorageTier::Maxiops,
        kind: StorageType::Normal,
        access: StorageAccess::Private,
        zone: zone.to_string(),
        origin: String::new(),
        created: CREATED.to_string(),
        encrypted: false,
        labels: Vec::new(),
    }
}

/// Storage API keeping its resources in memory. Mutations put resources
/// into a transient state for a short while, like the real thing does.
#[derive(Default)]
pub struct FakeCloud {
    inner: Mutex<Inner>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        let cloud = Self::default();
        cloud.inner.lock().device_limit = 16;
        Arc::new(cloud)
    }

    /// A started server in `ZONE` with its root disk attached.
    pub fn add_server(&self, hostname: &str) -> String {
        let uuid = uuid::Uuid::new_v4().to_string();
        let root = StorageDevice {
            address: "virtio:0".into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            storage_size: 25,
            storage_title: format!("{} root disk", hostname),
            kind: "disk".into(),
        };
        let server = FakeServer {
            server: Server {
                uuid: uuid.clone(),
                hostname: hostname.to_string(),
                state: ServerState::Started,
                zone: ZONE.to_string(),
                title: hostname.to_string(),
            },
            devices: vec![root],
            maintenance_until: None,
            next_slot: 1,
        };
        self.inner.lock().servers.insert(uuid.clone(), server);
        uuid
    }

    /// Forget a server; storages keep listing it as attached.
    pub fn remove_server(&self, uuid: &str) {
        self.inner.lock().servers.remove(uuid);
    }

    /// An online, unattached normal storage.
    pub fn add_storage(&self, title: &str, size: u64) -> String {
        let storage = new_storage(title, size, ZONE);
        self.inner.lock().insert(storage, None).uuid.clone()
    }

    pub fn add_storage_with(&self, storage: Storage) -> String {
        self.inner.lock().insert(storage, None).uuid.clone()
    }

    /// An online backup of `origin`.
    pub fn add_backup(&self, origin: &str, title: &str) -> String {
        let mut inner = self.inner.lock();
        let size = inner.storages.get(origin).map_or(10, |s| s.storage.size);
        let mut backup = new_storage(title, size, ZONE);
        backup.kind = StorageType::Backup;
        backup.origin = origin.to_string();
        inner.insert(backup, None).uuid.clone()
    }

    pub fn storage(&self, uuid: &str) -> Option<StorageDetails> {
        self.inner.lock().storages.get_mut(uuid).map(FakeStorage::details)
    }

    pub fn server(&self, uuid: &str) -> Option<ServerDetails> {
        self.inner.lock().servers.get(uuid).map(FakeServer::details)
    }

    pub fn storages(&self) -> Vec<Storage> {
        self.inner
            .lock()
            .storages
            .values_mut()
            .map(FakeStorage::view)
            .collect()
    }

    /// Hold a storage in `state` until released.
    pub fn hold_storage(&self, uuid: &str, state: StorageState) {
        if let Some(storage) = self.inner.lock().storages.get_mut(uuid) {
            storage.busy = Some((state, None));
        }
    }

    pub fn release_storage(&self, uuid: &str) {
        if let Some(storage) = self.inner.lock().storages.get_mut(uuid) {
            storage.busy = None;
        }
    }

    pub fn set_device_limit(&self, limit: usize) {
        self.inner.lock().device_limit = limit;
    }

    pub fn attach_calls(&self) -> usize {
        self.inner.lock().attach_calls
    }

    pub fn detach_calls(&self) -> usize {
        self.inner.lock().detach_calls
    }

    /// Calls refused because the server was in maintenance.
    pub fn rejected_calls(&self) -> usize {
        self.inner.lock().rejected_calls
    }

    pub fn service(self: &Arc<Self>) -> UpCloudService<FakeCloud> {
        UpCloudService::new(self.clone())
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
    }
}

#[async_trait]
impl Api for FakeCloud {
    async fn get_account(&self) -> Result<Account, Error> {
        Ok(Account {
            username: "csi-test".into(),
            credits: 100.0,
        })
    }

    async fn get_storages(&self) -> Result<Vec<Storage>, Error> {
        Ok(self.storages())
    }

    async fn get_storage_details(
        &self,
        uuid: &str,
    ) -> Result<StorageDetails, Error> {
        Ok(self.inner.lock().storage(uuid)?.details())
    }

    async fn create_storage(
        &self,
        request: &CreateStorageRequest,
    ) -> Result<StorageDetails, Error> {
        let mut storage = new_storage(&request.title, request.size, &request.zone);
        storage.tier = request.tier.unwrap_or(StorageTier::Maxiops);
        storage.encrypted = request.encrypted;
        storage.labels = request.labels.clone();
        Ok(self
            .inner
            .lock()
            .insert(storage, Some(StorageState::Maintenance)))
    }

    async fn clone_storage(
        &self,
        uuid: &str,
        request: &CloneStorageRequest,
    ) -> Result<StorageDetails, Error> {
        let mut inner = self.inner.lock();
        let source = inner.online(uuid)?;
        source.keep_busy(StorageState::Cloning);
        let mut clone =
            new_storage(&request.title, source.storage.size, &request.zone);
        clone.tier = request.tier.unwrap_or(source.storage.tier);
        clone.encrypted = request.encrypted;
        Ok(inner.insert(clone, Some(StorageState::Maintenance)))
    }

    async fn modify_storage(
        &self,
        uuid: &str,
        request: &ModifyStorageRequest,
    ) -> Result<StorageDetails, Error> {
        let mut inner = self.inner.lock();
        let storage = inner.online(uuid)?;
        if let Some(title) = &request.title {
            storage.storage.title = title.clone();
        }
        if let Some(size) = request.size {
            storage.storage.size = size;
        }
        if let Some(labels) = &request.labels {
            storage.storage.labels = labels.clone();
        }
        storage.keep_busy(StorageState::Maintenance);
        Ok(storage.details())
    }

    async fn resize_storage_filesystem(
        &self,
        uuid: &str,
    ) -> Result<ResizeStorageFilesystemBackup, Error> {
        let mut inner = self.inner.lock();
        let source = inner.online(uuid)?;
        source.keep_busy(StorageState::Maintenance);
        let mut backup = new_storage(
            &format!("resize backup of {}", uuid),
            source.storage.size,
            &source.storage.zone,
        );
        backup.kind = StorageType::Backup;
        backup.origin = uuid.to_string();
        let backup = inner.insert(backup, Some(StorageState::Maintenance));
        Ok(ResizeStorageFilesystemBackup {
            uuid: backup.uuid.clone(),
        })
    }

    async fn delete_storage(&self, uuid: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let storage = inner.online(uuid)?;
        if !storage.servers.is_empty() {
            return Err(problem(
                409,
                codes::STORAGE_STATE_ILLEGAL,
                format!("storage {} is attached", uuid),
            ));
        }
        inner.storages.remove(uuid);
        Ok(())
    }

    async fn create_backup(
        &self,
        uuid: &str,
        request: &CreateBackupRequest,
    ) -> Result<StorageDetails, Error> {
        let mut inner = self.inner.lock();
        let source = inner.online(uuid)?;
        source.keep_busy(StorageState::Backuping);
        let mut backup = new_storage(
            &request.title,
            source.storage.size,
            &source.storage.zone,
        );
        backup.kind = StorageType::Backup;
        backup.origin = uuid.to_string();
        backup.encrypted = source.storage.encrypted;
        Ok(inner.insert(backup, Some(StorageState::Maintenance)))
    }

    async fn get_servers(&self) -> Result<Vec<Server>, Error> {
        Ok(self
            .inner
            .lock()
            .servers
            .values()
            .map(|s| s.details().server)
            .collect())
    }

    async fn get_server_details(
        &self,
        uuid: &str,
    ) -> Result<ServerDetails, Error> {
        self.server(uuid).ok_or_else(|| server_not_found(uuid))
    }

    async fn attach_storage(
        &self,
        server_uuid: &str,
        request: &AttachStorageRequest,
    ) -> Result<ServerDetails, Error> {
        let mut inner = self.inner.lock();
        inner.attach_calls += 1;
        let limit = inner.device_limit;
        inner.storage(&request.storage_uuid)?;
        let server = inner.started(server_uuid)?;
        if server.devices.len() >= limit {
            return Err(problem(
                409,
                codes::STORAGE_DEVICE_LIMIT_REACHED,
                format!("server {} has no free slots", server_uuid),
            ));
        }
        let address = format!("{}:{}", request.address, server.next_slot);
        server.next_slot += 1;
        server.devices.push(StorageDevice {
            address,
            uuid: request.storage_uuid.clone(),
            storage_size: 0,
            storage_title: String::new(),
            kind: request.kind.clone(),
        });
        server.maintenance_until = Some(Instant::now() + SETTLE);
        let details = server.details();
        if let Some(storage) = inner.storages.get_mut(&request.storage_uuid) {
            storage.servers.push(server_uuid.to_string());
        }
        Ok(details)
    }

    async fn detach_storage(
        &self,
        server_uuid: &str,
        request: &DetachStorageRequest,
    ) -> Result<ServerDetails, Error> {
        let mut inner = self.inner.lock();
        inner.detach_calls += 1;
        let server = inner.started(server_uuid)?;
        let position = server
            .devices
            .iter()
            .position(|d| d.address == request.address)
            .ok_or_else(|| {
                problem(
                    404,
                    "STORAGE_DEVICE_NOT_FOUND",
                    format!("no device at {}", request.address),
                )
            })?;
        let device = server.devices.remove(position);
        server.maintenance_until = Some(Instant::now() + SETTLE);
        let details = server.details();
        if let Some(storage) = inner.storages.get_mut(&device.uuid) {
            storage.servers.retain(|s| s != server_uuid);
        }
        Ok(details)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountRecord {
    pub source: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

#[derive(Default)]
struct Disks {
    devices: HashMap<String, PathBuf>,
    formatted: HashMap<PathBuf, String>,
    format_calls: usize,
    mounts: HashMap<PathBuf, MountRecord>,
    unshared: HashSet<PathBuf>,
}

/// `Filesystem` recording what would have been done to the host.
pub struct MockFilesystem {
    fs_types: Vec<String>,
    disks: Mutex<Disks>,
}

impl MockFilesystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fs_types: vec!["ext3".into(), "ext4".into(), "xfs".into()],
            disks: Mutex::default(),
        })
    }

    /// Make the device of `volume_id` appear, returning its path.
    pub fn attach(&self, volume_id: &str) -> PathBuf {
        let path = PathBuf::from(format!("/dev/vd{}", self.disks.lock().devices.len() + 1));
        self.disks
            .lock()
            .devices
            .insert(volume_id.to_string(), path.clone());
        path
    }

    pub fn mount_of(&self, target: &Path) -> Option<MountRecord> {
        self.disks.lock().mounts.get(target).cloned()
    }

    pub fn formatted(&self, device: &Path) -> Option<String> {
        self.disks.lock().formatted.get(device).cloned()
    }

    pub fn format_calls(&self) -> usize {
        self.disks.lock().format_calls
    }

    /// Pretend something is mounted on `target` with private propagation.
    pub fn mount_unshared(&self, target: &Path) {
        let mut disks = self.disks.lock();
        disks.unshared.insert(target.to_path_buf());
        disks.mounts.insert(
            target.to_path_buf(),
            MountRecord {
                source: PathBuf::from("/dev/unknown"),
                fs_type: "ext4".into(),
                options: Vec::new(),
            },
        );
    }
}

#[async_trait]
impl Filesystem for MockFilesystem {
    async fn get_device_by_id(
        &self,
        volume_id: &str,
    ) -> Result<PathBuf, FsError> {
        let disk_id = disk_id(volume_id)?;
        self.disks
            .lock()
            .devices
            .get(volume_id)
            .cloned()
            .ok_or(FsError::DeviceNotFound {
                disk_id,
                timeout: Duration::from_secs(30),
            })
    }

    async fn format(
        &self,
        source: &Path,
        fs_type: &str,
        _mkfs_args: &[String],
    ) -> Result<(), FsError> {
        if !self.fs_types.iter().any(|t| t == fs_type) {
            return Err(FsError::UnsupportedFsType {
                fs_type: fs_type.to_string(),
                supported: self.fs_types.join(","),
            });
        }
        let mut disks = self.disks.lock();
        disks.format_calls += 1;
        disks
            .formatted
            .entry(source.to_path_buf())
            .or_insert_with(|| fs_type.to_string());
        Ok(())
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), FsError> {
        self.disks.lock().mounts.insert(
            target.to_path_buf(),
            MountRecord {
                source: source.to_path_buf(),
                fs_type: fs_type.to_string(),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, FsError> {
        let disks = self.disks.lock();
        if disks.unshared.contains(target) {
            return Err(FsError::UnsharedPropagation {
                target: target.display().to_string(),
                propagation: "private".into(),
            });
        }
        Ok(disks.mounts.contains_key(target))
    }

    async fn unmount(&self, target: &Path) -> Result<(), FsError> {
        let mut disks = self.disks.lock();
        disks.mounts.remove(target);
        disks.unshared.remove(target);
        Ok(())
    }

    async fn statistics(
        &self,
        _path: &Path,
    ) -> Result<VolumeStatistics, FsError> {
        Ok(VolumeStatistics {
            available_bytes: 6 << 30,
            total_bytes: 10 << 30,
            used_bytes: 4 << 30,
            available_inodes: 600,
            total_inodes: 1000,
            used_inodes: 400,
        })
    }

    async fn get_device_last_partition(
        &self,
        source: &Path,
    ) -> Result<PathBuf, FsError> {
        Ok(PathBuf::from(format!("{}1", source.display())))
    }
}
