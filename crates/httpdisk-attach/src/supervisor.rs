//! Bridge daemon lifecycle around a slot attachment.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::command::SPAWN_RETRY;
use crate::slot::{DeviceSlot, SlotError, SlotManager};

pub const DEFAULT_SOCKET_WAIT: Duration = Duration::from_secs(5);

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How the bridge daemon is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub plugin: String,
    /// How long the bridge may take to create its socket.
    pub socket_wait: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("nbdkit"),
            plugin: "httpdisk".to_string(),
            socket_wait: DEFAULT_SOCKET_WAIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Attached,
    Running,
    Detaching,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to remove stale socket {}: {source}", .path.display())]
    StaleSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start bridge {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("bridge socket {} did not appear within {waited:?}", .path.display())]
    SocketTimeout { path: PathBuf, waited: Duration },
    #[error("bridge exited unexpectedly ({status})")]
    BridgeExited { status: ExitStatus },
    #[error(transparent)]
    Attach(#[from] SlotError),
    #[error("failed to report device path: {0}")]
    Report(#[source] io::Error),
}

/// The running bridge daemon.
#[derive(Debug)]
pub struct BridgeProcess {
    child: Child,
    socket_path: PathBuf,
    export: String,
}

impl BridgeProcess {
    async fn spawn(
        config: &BridgeConfig,
        socket_path: &Path,
        export: &str,
        urls: &str,
    ) -> Result<Self, SupervisorError> {
        let child = SPAWN_RETRY
            .retry_async(
                |_| async move {
                    Command::new(&config.program)
                        .arg("--foreground")
                        .arg("--unix")
                        .arg(socket_path)
                        .arg("--exportname")
                        .arg(export)
                        .arg(&config.plugin)
                        .arg(format!("urls={urls}"))
                        .stdin(Stdio::null())
                        // stdout carries the device path.
                        .stdout(Stdio::null())
                        .kill_on_drop(true)
                        .spawn()
                },
                |err| err.raw_os_error() == Some(Errno::ETXTBSY as i32),
            )
            .await
            .map_err(|source| SupervisorError::Spawn {
                program: config.program.clone(),
                source,
            })?;

        tracing::info!(
            pid = child.id(),
            socket = %socket_path.display(),
            export,
            "bridge started"
        );
        Ok(Self {
            child,
            socket_path: socket_path.to_path_buf(),
            export: export.to_string(),
        })
    }

    /// Poll for the socket file until it exists, the bridge dies, or `limit` passes.
    async fn wait_for_socket(&mut self, limit: Duration) -> Result<(), SupervisorError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if tokio::fs::try_exists(&self.socket_path).await.unwrap_or(false) {
                return Ok(());
            }
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(SupervisorError::BridgeExited { status });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SupervisorError::SocketTimeout {
                    path: self.socket_path.clone(),
                    waited: limit,
                });
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// Ask the bridge to quit with SIGQUIT and reap it.
    async fn stop(mut self) {
        if let Some(pid) = self.child.id() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGQUIT) {
                tracing::warn!(pid, "failed to signal bridge: {err}");
            }
        }
        match self.child.wait().await {
            Ok(status) => tracing::info!(
                %status,
                socket = %self.socket_path.display(),
                export = %self.export,
                "bridge exited"
            ),
            Err(err) => tracing::warn!("failed to wait for bridge: {err}"),
        }
    }
}

/// Starts the bridge, attaches it to a slot, and tears both down again when cancelled.
pub struct ProcessSupervisor {
    slots: SlotManager,
    bridge_config: BridgeConfig,
    state: SupervisorState,
    bridge: Option<BridgeProcess>,
    slot: Option<DeviceSlot>,
}

impl ProcessSupervisor {
    pub fn new(slots: SlotManager, bridge_config: BridgeConfig) -> Self {
        Self {
            slots,
            bridge_config,
            state: SupervisorState::Starting,
            bridge: None,
            slot: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn slot(&self) -> Option<&DeviceSlot> {
        self.slot.as_ref()
    }

    /// Run until `cancel` fires, then tear down.
    ///
    /// The attached device path is written to `out` as one line once attachment succeeds. Any
    /// startup failure is returned after teardown; cancellation before attachment is not an
    /// error. Cancellation interrupts the bridge launch but never an attach in progress: the
    /// attach completes first so that a bound slot is always detached again.
    pub async fn run<W>(
        &mut self,
        socket_path: &Path,
        export: &str,
        urls: &str,
        cancel: CancellationToken,
        out: &mut W,
    ) -> Result<(), SupervisorError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let launched = tokio::select! {
            res = self.launch_bridge(socket_path, export, urls) => Some(res),
            _ = cancel.cancelled() => None,
        };

        let started = match launched {
            None => Ok(false),
            Some(Ok(())) => self.attach(socket_path, export, &cancel, out).await,
            Some(Err(err)) => Err(err),
        };

        let result = match started {
            Ok(true) => {
                self.state = SupervisorState::Running;
                self.wait_running(&cancel).await
            }
            Ok(false) => {
                tracing::info!("cancelled before the device was reported");
                Ok(())
            }
            Err(err) => {
                tracing::error!("failed to attach: {err}");
                Err(err)
            }
        };

        self.shutdown().await;
        result
    }

    async fn launch_bridge(
        &mut self,
        socket_path: &Path,
        export: &str,
        urls: &str,
    ) -> Result<(), SupervisorError> {
        self.state = SupervisorState::Starting;
        remove_stale_socket(socket_path).await?;

        let bridge = self.bridge.insert(
            BridgeProcess::spawn(&self.bridge_config, socket_path, export, urls).await?,
        );
        bridge.wait_for_socket(self.bridge_config.socket_wait).await
    }

    /// Attach a slot and report its path. Returns `false` when `cancel` fired meanwhile; the slot
    /// is still recorded so teardown detaches it.
    async fn attach<W>(
        &mut self,
        socket_path: &Path,
        export: &str,
        cancel: &CancellationToken,
        out: &mut W,
    ) -> Result<bool, SupervisorError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let slot = self.slots.attach(socket_path, export).await?;
        let path = slot.path().to_path_buf();
        self.slot = Some(slot);
        self.state = SupervisorState::Attached;

        if cancel.is_cancelled() {
            return Ok(false);
        }

        out.write_all(format!("{}\n", path.display()).as_bytes())
            .await
            .map_err(SupervisorError::Report)?;
        out.flush().await.map_err(SupervisorError::Report)?;
        Ok(true)
    }

    /// Wait for cancellation. A bridge that exits on its own ends the run early.
    async fn wait_running(&mut self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let Some(bridge) = self.bridge.as_mut() else {
            cancel.cancelled().await;
            return Ok(());
        };
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            status = bridge.child.wait() => match status {
                Ok(status) => {
                    tracing::error!(%status, "bridge exited while attached");
                    Err(SupervisorError::BridgeExited { status })
                }
                Err(err) => {
                    tracing::error!("failed to wait for bridge: {err}");
                    cancel.cancelled().await;
                    Ok(())
                }
            },
        }
    }

    /// Detach the slot, then stop the bridge. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.state == SupervisorState::Stopped {
            return;
        }
        self.state = SupervisorState::Detaching;
        if let Some(slot) = self.slot.take() {
            self.slots.destroy(&slot).await;
        }
        if let Some(bridge) = self.bridge.take() {
            bridge.stop().await;
        }
        self.state = SupervisorState::Stopped;
    }
}

async fn remove_stale_socket(path: &Path) -> Result<(), SupervisorError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SupervisorError::StaleSocket {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;
    use crate::slot::fake::{Connect, FakeHost, FakeSlot};

    /// A stand-in bridge: optionally creates the socket file (`$3`), then sleeps.
    fn bridge_script(dir: &Path, creates_socket: bool) -> PathBuf {
        let path = dir.join(if creates_socket { "bridge" } else { "mute-bridge" });
        let body = if creates_socket {
            "#!/bin/sh\n: > \"$3\"\nexec sleep 30\n"
        } else {
            "#!/bin/sh\nexec sleep 30\n"
        };
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(
        host: &Arc<FakeHost>,
        program: PathBuf,
        socket_wait: Duration,
    ) -> ProcessSupervisor {
        ProcessSupervisor::new(
            SlotManager::new(host.clone()),
            BridgeConfig {
                program,
                plugin: "httpdisk".into(),
                socket_wait,
            },
        )
    }

    #[tokio::test]
    async fn attaches_reports_path_and_tears_down_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nbd.sock");
        std::fs::write(&socket, b"stale").unwrap();

        let host = Arc::new(FakeHost::with_slots(vec![FakeSlot::free()]));
        let mut sup = supervisor(&host, bridge_script(dir.path(), true), DEFAULT_SOCKET_WAIT);
        let cancel = CancellationToken::new();
        let (reader, mut writer) = tokio::io::duplex(64);

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let socket = socket.clone();
            async move {
                let res = sup
                    .run(&socket, "disk", "http://a/ http://b/", cancel, &mut writer)
                    .await;
                (sup, res)
            }
        });

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        assert_eq!(line, "/dev/nbd0\n");

        cancel.cancel();
        let (mut sup, res) = task.await.unwrap();
        res.unwrap();
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert!(sup.slot().is_none());

        let calls = host.calls();
        let connect = format!("connect nbd0 {} disk", socket.display());
        assert!(calls.contains(&connect), "{calls:?}");
        assert_eq!(calls.last().unwrap(), "disconnect nbd0");

        sup.shutdown().await;
        assert_eq!(
            host.calls().iter().filter(|c| c.starts_with("disconnect")).count(),
            1
        );
    }

    #[tokio::test]
    async fn cancel_during_connect_still_detaches_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nbd.sock");
        let host = Arc::new(FakeHost::with_slots(vec![FakeSlot {
            connect: Connect::Slow(Duration::from_millis(300)),
            ..FakeSlot::free()
        }]));
        let mut sup = supervisor(&host, bridge_script(dir.path(), true), DEFAULT_SOCKET_WAIT);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let socket = socket.clone();
            async move {
                let mut out = Vec::new();
                let res = sup.run(&socket, "disk", "http://a/", cancel, &mut out).await;
                (sup, res, out)
            }
        });

        while !host.calls().iter().any(|c| c.starts_with("connect")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        let (sup, res, out) = task.await.unwrap();
        res.unwrap();
        assert!(out.is_empty(), "path must not be reported after cancellation");
        assert_eq!(sup.state(), SupervisorState::Stopped);
        let calls = host.calls();
        assert!(calls.contains(&"bound nbd0".to_string()), "{calls:?}");
        assert_eq!(calls.last().unwrap(), "disconnect nbd0");
    }

    #[tokio::test]
    async fn attach_failure_stops_bridge_and_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nbd.sock");
        let host = Arc::new(FakeHost::default());
        let mut sup = supervisor(&host, bridge_script(dir.path(), true), DEFAULT_SOCKET_WAIT);

        let mut out = Vec::new();
        let err = sup
            .run(&socket, "disk", "http://a/", CancellationToken::new(), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Attach(SlotError::NoSlots)), "{err:?}");
        assert!(out.is_empty());
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert!(!host.calls().iter().any(|c| c.starts_with("disconnect")));
    }

    #[tokio::test]
    async fn missing_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nbd.sock");
        let host = Arc::new(FakeHost::with_slots(vec![FakeSlot::free()]));
        let mut sup = supervisor(
            &host,
            bridge_script(dir.path(), false),
            Duration::from_millis(200),
        );

        let mut out = Vec::new();
        let err = sup
            .run(&socket, "disk", "http://a/", CancellationToken::new(), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::SocketTimeout { .. }), "{err:?}");
        assert!(!host.calls().iter().any(|c| c.starts_with("connect")));
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn bridge_that_cannot_start() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::with_slots(vec![FakeSlot::free()]));
        let mut sup = supervisor(
            &host,
            dir.path().join("does-not-exist"),
            DEFAULT_SOCKET_WAIT,
        );
        let mut out = Vec::new();
        let err = sup
            .run(
                &dir.path().join("nbd.sock"),
                "disk",
                "http://a/",
                CancellationToken::new(),
                &mut out,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }), "{err:?}");
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn cancellation_during_startup_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::with_slots(vec![FakeSlot::free()]));
        let mut sup = supervisor(&host, bridge_script(dir.path(), false), DEFAULT_SOCKET_WAIT);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        sup.run(&dir.path().join("nbd.sock"), "disk", "u", cancel, &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }
}
