//! Raw access to the block device (or plain file) backing a disk.
//!
//! Handles are short-lived: callers open one per operation and close it before returning. The
//! open path tolerates the transient `EROFS` that replicated (DRBD) devices report while they
//! change role.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;

use crate::retry::RetryPolicy;

/// Block major number assigned to DRBD devices.
pub const DRBD_MAJOR: u64 = 147;

/// Retry budget for `EROFS` on a replicated device (~10 seconds).
pub const REPLICATED_READONLY_RETRY: RetryPolicy =
    RetryPolicy::new(100, Duration::from_millis(100));

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{op} failed on {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DeviceError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Opens devices with the read-only retry policy applied.
#[derive(Debug, Clone)]
pub struct DeviceAccessor {
    readonly_retry: RetryPolicy,
}

impl Default for DeviceAccessor {
    fn default() -> Self {
        Self::new(REPLICATED_READONLY_RETRY)
    }
}

impl DeviceAccessor {
    pub fn new(readonly_retry: RetryPolicy) -> Self {
        Self { readonly_retry }
    }

    /// Open `path` read-write.
    ///
    /// `EAGAIN`/`EINTR` are retried immediately without limit. `EROFS` is retried per the
    /// configured policy only when `path` is a replicated device; every other failure is
    /// returned straight away.
    pub fn open(&self, path: &Path) -> Result<BlockDevice, DeviceError> {
        self.open_with(path, is_replicated_device, |path| {
            OpenOptions::new().read(true).write(true).open(path)
        })
    }

    /// Open `path`, read its capacity and close it again.
    pub fn capacity(&self, path: &Path) -> Result<u64, DeviceError> {
        let mut device = self.open(path)?;
        let size = device.size();
        device.close();
        size
    }

    fn open_with(
        &self,
        path: &Path,
        is_replicated: impl Fn(&Path) -> bool,
        mut opener: impl FnMut(&Path) -> io::Result<File>,
    ) -> Result<BlockDevice, DeviceError> {
        let mut replicated = None;
        let file = self
            .readonly_retry
            .retry(
                |_| open_uninterrupted(path, &mut opener),
                |err| {
                    if err.raw_os_error() != Some(libc::EROFS) {
                        return false;
                    }
                    let retry = *replicated.get_or_insert_with(|| is_replicated(path));
                    if retry {
                        tracing::debug!(path = %path.display(), "replicated device is read-only, retrying open");
                    }
                    retry
                },
            )
            .map_err(|source| DeviceError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(BlockDevice {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }
}

fn open_uninterrupted(
    path: &Path,
    opener: &mut impl FnMut(&Path) -> io::Result<File>,
) -> io::Result<File> {
    loop {
        match opener(path) {
            Err(err) if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                continue
            }
            res => return res,
        }
    }
}

/// Whether `path` is a DRBD block device.
pub fn is_replicated_device(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.file_type().is_block_device() => {
            nix::sys::stat::major(meta.rdev()) == DRBD_MAJOR
        }
        _ => false,
    }
}

/// Check whether nothing else holds `path` open, using an `O_EXCL` open. The temporary handle is
/// closed before returning.
pub fn is_exclusively_available(path: &Path) -> bool {
    match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_EXCL)
        .open(path)
    {
        Ok(file) => {
            drop(file);
            true
        }
        Err(err) => {
            tracing::debug!(path = %path.display(), "exclusive open failed: {err}");
            false
        }
    }
}

/// An open handle on a device or file. Closed explicitly with [`BlockDevice::close`] or on drop.
#[derive(Debug)]
pub struct BlockDevice {
    path: PathBuf,
    file: Option<File>,
}

impl BlockDevice {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Capacity in bytes: `BLKGETSIZE64` for block devices, the `fstat` size otherwise.
    pub fn size(&mut self) -> Result<u64, DeviceError> {
        let path = self.path.clone();
        let file = self.file().map_err(|err| DeviceError::io("stat", &path, err))?;

        let meta = loop {
            match file.metadata() {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                res => break res.map_err(|err| DeviceError::io("stat", &path, err))?,
            }
        };

        if !meta.file_type().is_block_device() {
            return Ok(meta.len());
        }

        let fd = file.as_raw_fd();
        let mut bytes: u64 = 0;
        loop {
            // SAFETY: `fd` is an open descriptor owned by `file` and `bytes` outlives the call.
            match unsafe { blkgetsize64(fd, &mut bytes) } {
                Ok(_) => return Ok(bytes),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(DeviceError::io("BLKGETSIZE64", &path, errno.into())),
            }
        }
    }

    /// Read up to `len` bytes starting at `offset`. Returns fewer bytes when the device ends
    /// first.
    pub fn read_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, DeviceError> {
        let path = self.path.clone();
        let file = self.file().map_err(|err| DeviceError::io("read", &path, err))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| DeviceError::io("seek", &path, err))?;

        let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(usize::MAX).min(1 << 20));
        file.take(len)
            .read_to_end(&mut buf)
            .map_err(|err| DeviceError::io("read", &path, err))?;
        Ok(buf)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let path = self.path.clone();
        let file = self.file().map_err(|err| DeviceError::io("write", &path, err))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| DeviceError::io("seek", &path, err))?;
        file.write_all(data)
            .map_err(|err| DeviceError::io("write", &path, err))?;
        file.flush()
            .map_err(|err| DeviceError::io("flush", &path, err))
    }

    /// Release the descriptor. Safe to call more than once; failures are logged, not returned.
    pub fn close(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        let fd = file.into_raw_fd();
        loop {
            match nix::unistd::close(fd) {
                Ok(()) | Err(Errno::EBADF) => return,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::warn!(path = %self.path.display(), "failed to close device: {errno}");
                    return;
                }
            }
        }
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        self.close();
    }
}
