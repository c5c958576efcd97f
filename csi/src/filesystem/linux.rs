//! Filesystem driver built on the usual Linux utilities: udevadm, blkid,
//! parted, lsblk, mkfs, mount, umount and findmnt.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::{
    process::Command,
    time::{sleep, Instant},
};

use super::{
    device::{self, resolve_link},
    findmnt,
    Filesystem,
    FsError,
    Io,
    ParseOutput,
    Spawn,
    VolumeStatistics,
};

const BY_ID_DIR: &str = "/dev/disk/by-id";
const UDEV_TIMEOUT: Duration = Duration::from_secs(20);
const UDEV_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external commands.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, FsError>;
}

/// Spawns the real process. The child is killed if the request that
/// spawned it is dropped.
#[derive(Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl Runner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, FsError> {
        trace!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .context(Spawn {
                command: program,
            })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub struct LinuxFilesystem {
    runner: Arc<dyn Runner>,
    fs_types: Vec<String>,
    by_id_dir: PathBuf,
    udev_timeout: Duration,
    poll_interval: Duration,
}

impl LinuxFilesystem {
    /// Driver allowed to create the given filesystems.
    pub fn new(fs_types: Vec<String>) -> Self {
        Self {
            runner: Arc::new(SystemRunner),
            fs_types,
            by_id_dir: PathBuf::from(BY_ID_DIR),
            udev_timeout: UDEV_TIMEOUT,
            poll_interval: UDEV_POLL_INTERVAL,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_by_id_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.by_id_dir = dir.into();
        self
    }

    pub fn with_udev_timeout(
        mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        self.udev_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Run a command, failing on a non-zero exit.
    async fn exec(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<String, FsError> {
        let output = self.runner.run(program, args).await?;
        if !output.success() {
            return Err(FsError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                status: output
                    .code
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Wait for pending udev events. Failure only delays device discovery.
    async fn settle(&self) {
        let timeout = format!("--timeout={}", self.udev_timeout.as_secs());
        if let Err(error) =
            self.exec("udevadm", &args(&["settle", &timeout])).await
        {
            warn!("udevadm settle failed: {}", error);
        }
    }

    /// Value of a low level probe tag (`PTTYPE`, `TYPE`), empty when the
    /// device carries none.
    async fn probe(&self, device: &Path, tag: &str) -> Result<String, FsError> {
        let args = args(&["-p", "-s", tag, "-o", "value", &path_arg(device)]);
        let output = self.runner.run("blkid", &args).await?;
        match output.code {
            Some(0) => Ok(output.stdout.trim().to_string()),
            // nothing detected
            Some(2) => Ok(String::new()),
            code => Err(FsError::CommandFailed {
                command: format!("blkid {}", args.join(" ")),
                status: format!("{:?}", code),
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    async fn partitions(&self, device: &Path) -> Result<Vec<PathBuf>, FsError> {
        let stdout = self
            .exec(
                "lsblk",
                &args(&["-J", "-p", "-o", "NAME,TYPE", &path_arg(device)]),
            )
            .await?;
        device::parse_partitions(&stdout).context(ParseOutput {
            command: "lsblk",
        })
    }
}

#[async_trait]
impl Filesystem for LinuxFilesystem {
    async fn get_device_by_id(
        &self,
        volume_id: &str,
    ) -> Result<PathBuf, FsError> {
        let disk_id = device::disk_id(volume_id)?;
        let link = self.by_id_dir.join(&disk_id);
        let deadline = Instant::now() + self.udev_timeout;

        loop {
            self.settle().await;
            match tokio::fs::read_link(&link).await {
                Ok(target) => {
                    let device = resolve_link(&link, &target);
                    debug!(
                        "volume {} is device {}",
                        volume_id,
                        device.display()
                    );
                    return Ok(device);
                }
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(FsError::Io {
                        path: path_arg(&link),
                        source,
                    })
                }
            }
            if Instant::now() >= deadline {
                return Err(FsError::DeviceNotFound {
                    disk_id,
                    timeout: self.udev_timeout,
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn format(
        &self,
        source: &Path,
        fs_type: &str,
        mkfs_args: &[String],
    ) -> Result<(), FsError> {
        if !self.fs_types.iter().any(|t| t == fs_type) {
            return Err(FsError::UnsupportedFsType {
                fs_type: fs_type.to_string(),
                supported: self.fs_types.join(", "),
            });
        }
        let device = path_arg(source);

        if self.probe(source, "PTTYPE").await?.is_empty() {
            info!("creating GPT partition table on {}", device);
            self.exec("parted", &args(&["-s", &device, "mklabel", "gpt"]))
                .await?;
            self.settle().await;
        }

        let mut partitions = self.partitions(source).await?;
        if partitions.is_empty() {
            info!("creating partition on {}", device);
            self.exec(
                "parted",
                &args(&[
                    "-s", "-a", "optimal", &device, "mkpart", "primary", "0%",
                    "100%",
                ]),
            )
            .await?;
            self.settle().await;
            partitions = self.partitions(source).await?;
        }
        let partition = partitions.pop().ok_or_else(|| FsError::NoPartition {
            device: device.clone(),
        })?;

        let existing = self.probe(&partition, "TYPE").await?;
        if existing == fs_type {
            debug!(
                "{} is already formatted with {}",
                partition.display(),
                fs_type
            );
            return Ok(());
        }
        if !existing.is_empty() {
            warn!(
                "{} holds {} instead of {}, formatting",
                partition.display(),
                existing,
                fs_type
            );
        }

        info!("creating {} filesystem on {}", fs_type, partition.display());
        let mut mkfs = mkfs_args.to_vec();
        mkfs.push(path_arg(&partition));
        self.exec(&format!("mkfs.{}", fs_type), &mkfs).await?;
        Ok(())
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), FsError> {
        if fs_type.is_empty() {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.context(Io {
                    path: path_arg(parent),
                })?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(target)
                .await
                .context(Io {
                    path: path_arg(target),
                })?;
        } else {
            tokio::fs::create_dir_all(target).await.context(Io {
                path: path_arg(target),
            })?;
        }

        let mut mount_args = Vec::new();
        if !fs_type.is_empty() {
            mount_args.push("-t".to_string());
            mount_args.push(fs_type.to_string());
        }
        if !options.is_empty() {
            mount_args.push("-o".to_string());
            mount_args.push(options.join(","));
        }
        mount_args.push(path_arg(source));
        mount_args.push(path_arg(target));

        debug!("mounting {} onto {}", source.display(), target.display());
        self.exec("mount", &mount_args).await?;
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, FsError> {
        let args = args(&[
            "-J",
            "-o",
            "TARGET,SOURCE,FSTYPE,PROPAGATION",
            "--mountpoint",
            &path_arg(target),
        ]);
        let output = self.runner.run("findmnt", &args).await?;
        if !output.success() {
            if output.stdout.trim().is_empty() {
                return Ok(false);
            }
            return Err(FsError::CommandFailed {
                command: format!("findmnt {}", args.join(" ")),
                status: format!("{:?}", output.code),
                stderr: output.stderr.trim().to_string(),
            });
        }

        let mounts = findmnt::parse(&output.stdout).context(ParseOutput {
            command: "findmnt",
        })?;
        match mounts.first() {
            None => Ok(false),
            Some(mount) if mount.propagation != "shared" => {
                Err(FsError::UnsharedPropagation {
                    target: path_arg(target),
                    propagation: mount.propagation.clone(),
                })
            }
            Some(_) => Ok(true),
        }
    }

    async fn unmount(&self, target: &Path) -> Result<(), FsError> {
        match tokio::fs::symlink_metadata(target).await {
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(
                    "{} does not exist, nothing to unmount",
                    target.display()
                );
                return Ok(());
            }
            Err(source) => {
                return Err(FsError::Io {
                    path: path_arg(target),
                    source,
                })
            }
            Ok(_) => {}
        }
        debug!("unmounting {}", target.display());
        self.exec("umount", &[path_arg(target)]).await?;
        Ok(())
    }

    async fn statistics(
        &self,
        path: &Path,
    ) -> Result<VolumeStatistics, FsError> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|source| {
            FsError::Statistics {
                path: path_arg(path),
                source,
            }
        })?;
        let fragment = stat.fragment_size() as i64;
        Ok(VolumeStatistics {
            available_bytes: stat.blocks_available() as i64 * fragment,
            total_bytes: stat.blocks() as i64 * fragment,
            used_bytes: (stat.blocks() as i64 - stat.blocks_free() as i64)
                * fragment,
            available_inodes: stat.files_available() as i64,
            total_inodes: stat.files() as i64,
            used_inodes: stat.files() as i64 - stat.files_free() as i64,
        })
    }

    async fn get_device_last_partition(
        &self,
        source: &Path,
    ) -> Result<PathBuf, FsError> {
        self.partitions(source)
            .await?
            .pop()
            .ok_or_else(|| FsError::NoPartition {
                device: path_arg(source),
            })
    }
}
