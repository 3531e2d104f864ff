//! NBD slot discovery and attachment.
//!
//! A slot is one of the host's `/dev/nbdN` nodes. Attaching binds a free slot to the bridge
//! daemon's unix socket and export; destroying disconnects it again.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httpdisk_device::RetryPolicy;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::command::{with_timeout, CommandError, CommandRunner};

/// Upper bound on a single `connect` before the next slot is tried.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A `/dev/nbd<index>` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdSlot {
    pub index: u32,
    pub path: PathBuf,
}

impl NbdSlot {
    pub fn name(&self) -> String {
        format!("nbd{}", self.index)
    }
}

/// A slot attached to an export. Produced by [`SlotManager::attach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSlot {
    pub slot: NbdSlot,
    pub export: String,
}

impl DeviceSlot {
    pub fn name(&self) -> String {
        self.slot.name()
    }

    pub fn path(&self) -> &Path {
        &self.slot.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    /// Bound to some export. `pid` is the owning client process when it could be parsed.
    Connected { pid: Option<i32> },
}

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("no nbd devices present, even after loading the nbd module")]
    NoSlots,
    #[error("could not attach any of {candidates} nbd devices")]
    CannotAttach { candidates: usize },
    #[error("failed to enumerate nbd devices: {0}")]
    Enumerate(#[source] io::Error),
}

/// Host facilities the slot scan depends on.
#[async_trait]
pub trait SlotHost: Send + Sync {
    /// All slots present on the host, ordered by index.
    async fn list_slots(&self) -> io::Result<Vec<NbdSlot>>;

    async fn load_module(&self) -> Result<(), CommandError>;

    /// Whether the slot can currently be opened exclusively.
    async fn is_available(&self, slot: &NbdSlot) -> bool;

    async fn status(&self, slot: &NbdSlot) -> Result<SlotStatus, CommandError>;

    fn process_alive(&self, pid: i32) -> bool;

    async fn connect(
        &self,
        slot: &NbdSlot,
        socket_path: &Path,
        export: &str,
    ) -> Result<(), CommandError>;

    /// Switch the slot's IO scheduler to `none`.
    async fn disable_scheduler(&self, slot: &NbdSlot) -> io::Result<()>;

    async fn disconnect(&self, slot: &NbdSlot) -> Result<(), CommandError>;
}

/// Production [`SlotHost`] backed by `nbd-client`, `modprobe`, `/dev` and sysfs.
#[derive(Debug, Clone)]
pub struct CommandSlotHost {
    runner: CommandRunner,
    nbd_client: String,
    modprobe: String,
    dev_dir: PathBuf,
    sysfs_block_dir: PathBuf,
}

impl CommandSlotHost {
    pub fn new(nbd_client: impl Into<String>) -> Self {
        Self {
            runner: CommandRunner::new(),
            nbd_client: nbd_client.into(),
            modprobe: "modprobe".to_string(),
            dev_dir: PathBuf::from("/dev"),
            sysfs_block_dir: PathBuf::from("/sys/block"),
        }
    }

    /// Look for device nodes and scheduler files under other roots.
    pub fn with_roots(
        mut self,
        dev_dir: impl Into<PathBuf>,
        sysfs_block_dir: impl Into<PathBuf>,
    ) -> Self {
        self.dev_dir = dev_dir.into();
        self.sysfs_block_dir = sysfs_block_dir.into();
        self
    }

    fn path_arg(slot: &NbdSlot) -> String {
        slot.path.to_string_lossy().into_owned()
    }
}

#[async_trait]
impl SlotHost for CommandSlotHost {
    async fn list_slots(&self) -> io::Result<Vec<NbdSlot>> {
        let mut entries = tokio::fs::read_dir(&self.dev_dir).await?;
        let mut slots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(parse_slot_index) {
                slots.push(NbdSlot {
                    index,
                    path: entry.path(),
                });
            }
        }
        slots.sort_by_key(|slot| slot.index);
        Ok(slots)
    }

    async fn load_module(&self) -> Result<(), CommandError> {
        self.runner.run(&[self.modprobe.as_str(), "nbd"], 0).await?;
        Ok(())
    }

    async fn is_available(&self, slot: &NbdSlot) -> bool {
        let path = slot.path.clone();
        tokio::task::spawn_blocking(move || httpdisk_device::is_exclusively_available(&path))
            .await
            .unwrap_or(false)
    }

    async fn status(&self, slot: &NbdSlot) -> Result<SlotStatus, CommandError> {
        let path = Self::path_arg(slot);
        status_from(self.runner.run(&[self.nbd_client.as_str(), "-c", path.as_str()], 0).await)
    }

    fn process_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            // EPERM: it exists, it just is not ours.
            Err(_) => true,
        }
    }

    async fn connect(
        &self,
        slot: &NbdSlot,
        socket_path: &Path,
        export: &str,
    ) -> Result<(), CommandError> {
        let socket = socket_path.to_string_lossy().into_owned();
        let path = Self::path_arg(slot);
        self.runner
            .run(
                &[
                    self.nbd_client.as_str(),
                    "-unix",
                    socket.as_str(),
                    path.as_str(),
                    "-name",
                    export,
                ],
                0,
            )
            .await?;
        Ok(())
    }

    async fn disable_scheduler(&self, slot: &NbdSlot) -> io::Result<()> {
        let file = self
            .sysfs_block_dir
            .join(slot.name())
            .join("queue")
            .join("scheduler");
        tokio::fs::write(file, "none").await
    }

    async fn disconnect(&self, slot: &NbdSlot) -> Result<(), CommandError> {
        let path = Self::path_arg(slot);
        self.runner
            .run(&[self.nbd_client.as_str(), "-d", path.as_str()], 0)
            .await?;
        Ok(())
    }
}

/// `nbd-0` style names and partitions (`nbd0p1`) are not slots.
fn parse_slot_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("nbd")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Interpret `nbd-client -c`: exit 0 means connected with the client pid on stdout, exit 1 means
/// free.
fn status_from(result: Result<String, CommandError>) -> Result<SlotStatus, CommandError> {
    match result {
        Ok(stdout) => Ok(SlotStatus::Connected {
            pid: stdout.trim().parse().ok(),
        }),
        Err(err) if err.exit_code() == Some(1) => Ok(SlotStatus::Free),
        Err(err) => Err(err),
    }
}

/// Finds a free slot and binds it to an export.
pub struct SlotManager {
    host: Arc<dyn SlotHost>,
    scan_retry: RetryPolicy,
    connect_timeout: Duration,
}

impl SlotManager {
    pub fn new(host: Arc<dyn SlotHost>) -> Self {
        Self {
            host,
            scan_retry: RetryPolicy::once(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Repeat the whole scan according to `policy` when it fails.
    pub fn with_scan_retry(mut self, policy: RetryPolicy) -> Self {
        self.scan_retry = policy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Attach the first usable slot, in index order, to `export` served on `socket_path`.
    pub async fn attach(&self, socket_path: &Path, export: &str) -> Result<DeviceSlot, SlotError> {
        self.scan_retry
            .retry_async(
                |attempt| async move {
                    if attempt > 0 {
                        tracing::info!(attempt, "retrying nbd slot scan");
                    }
                    self.scan(socket_path, export).await
                },
                |err| !matches!(err, SlotError::Enumerate(_)),
            )
            .await
    }

    async fn scan(&self, socket_path: &Path, export: &str) -> Result<DeviceSlot, SlotError> {
        let mut slots = self.host.list_slots().await.map_err(SlotError::Enumerate)?;
        if slots.is_empty() {
            tracing::info!("no nbd devices found, loading the nbd module");
            if let Err(err) = self.host.load_module().await {
                tracing::warn!("failed to load nbd module: {err}");
            }
            slots = self.host.list_slots().await.map_err(SlotError::Enumerate)?;
        }
        if slots.is_empty() {
            return Err(SlotError::NoSlots);
        }

        for slot in &slots {
            let name = slot.name();
            if !self.host.is_available(slot).await {
                tracing::debug!(slot = %name, "slot is busy");
                continue;
            }

            match self.host.status(slot).await {
                Ok(SlotStatus::Free) => {}
                Ok(SlotStatus::Connected { pid: Some(pid) }) if !self.host.process_alive(pid) => {
                    tracing::warn!(slot = %name, pid, "slot is held by a dead nbd client, leaked");
                    continue;
                }
                Ok(SlotStatus::Connected { pid }) => {
                    tracing::debug!(slot = %name, ?pid, "slot is connected");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(slot = %name, "could not determine slot status: {err}");
                    continue;
                }
            }

            match with_timeout(
                self.connect_timeout,
                self.host.connect(slot, socket_path, export),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(slot = %name, "connect failed: {err}");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(slot = %name, "connect failed: {err}");
                    continue;
                }
            }

            if let Err(err) = self.host.disable_scheduler(slot).await {
                tracing::warn!(slot = %name, "failed to set io scheduler: {err}");
            }
            tracing::info!(slot = %name, export, "attached");
            return Ok(DeviceSlot {
                slot: slot.clone(),
                export: export.to_string(),
            });
        }

        Err(SlotError::CannotAttach {
            candidates: slots.len(),
        })
    }

    /// Disconnect `slot`. Failures are logged, never returned.
    pub async fn destroy(&self, slot: &DeviceSlot) {
        match self.host.disconnect(&slot.slot).await {
            Ok(()) => tracing::info!(slot = %slot.name(), "detached"),
            Err(err) => tracing::error!(slot = %slot.name(), "failed to detach: {err}"),
        }
    }
}
