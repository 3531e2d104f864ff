//! Request handlers for the disk resource.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, EXPECT, RANGE};
use http::{HeaderMap, HeaderValue, StatusCode};
use httpdisk_device::{DeviceAccessor, DeviceError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::http::body::{self, TransferError};
use crate::http::range::{self, ByteRange, MAX_READ_BYTES};
use crate::http::response::{Response, CONTENT_TYPE_DISK, CONTINUE};

/// Serves one backing device. Capacity is read once when the service is built and is not
/// refreshed afterwards, even if the device is resized.
#[derive(Debug, Clone)]
pub struct DiskService {
    path: PathBuf,
    capacity: u64,
    accessor: DeviceAccessor,
}

impl DiskService {
    pub fn new(path: impl Into<PathBuf>, capacity: u64, accessor: DeviceAccessor) -> Self {
        Self {
            path: path.into(),
            capacity,
            accessor,
        }
    }

    /// Build a service for `path`, probing its capacity. Blocks on device I/O.
    pub fn open(path: impl Into<PathBuf>, accessor: DeviceAccessor) -> Result<Self, DeviceError> {
        let path = path.into();
        let capacity = accessor.capacity(&path)?;
        Ok(Self::new(path, capacity, accessor))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn head(&self) -> Response {
        Response::new(StatusCode::OK)
            .with_header(ACCEPT_RANGES, HeaderValue::from_static("bytes"))
            .with_header(CONTENT_LENGTH, HeaderValue::from(self.capacity))
    }

    pub async fn get(&self, headers: &HeaderMap) -> Response {
        let requested = match range::parse_range(headers.get(RANGE), self.capacity) {
            Ok(range) => range,
            Err(err) => {
                tracing::warn!("rejecting read: {err}");
                return Response::text(err.status(), err.to_string());
            }
        };
        let range = requested.clamp_len(MAX_READ_BYTES);

        let accessor = self.accessor.clone();
        let path = self.path.clone();
        let read = tokio::task::spawn_blocking(move || {
            let mut device = accessor.open(&path)?;
            let data = device.read_at(range.start, range.len());
            device.close();
            data
        })
        .await;

        let data = match read {
            Ok(Ok(data)) => data,
            Ok(Err(err)) => {
                tracing::error!(offset = range.start, len = range.len(), "read failed: {err}");
                return Response::text(StatusCode::INTERNAL_SERVER_ERROR, "read failed");
            }
            Err(err) => {
                tracing::error!(offset = range.start, len = range.len(), "read task failed: {err}");
                return Response::text(StatusCode::INTERNAL_SERVER_ERROR, "read failed");
            }
        };

        if data.is_empty() {
            // The device shrank below the capacity captured at startup.
            tracing::warn!(offset = range.start, "read past end of device");
            return Response::text(StatusCode::RANGE_NOT_SATISFIABLE, "read past end of device");
        }

        let n = data.len() as u64;
        if n < range.len() {
            tracing::debug!(offset = range.start, requested = range.len(), read = n, "short read");
        }
        let content_range = format!(
            "bytes {}-{}/{}",
            range.start,
            range.start + n - 1,
            self.capacity
        );
        let Ok(content_range) = HeaderValue::from_str(&content_range) else {
            return Response::text(StatusCode::INTERNAL_SERVER_ERROR, "invalid content-range");
        };
        tracing::debug!(offset = range.start, bytes = n, "read complete");

        Response::new(StatusCode::PARTIAL_CONTENT)
            .with_header(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_DISK))
            .with_header(CONTENT_RANGE, content_range)
            .with_body(Bytes::from(data))
    }

    /// Handle a `PUT`, reading its body from `conn`.
    pub async fn put<S>(&self, headers: &HeaderMap, conn: &mut BufReader<S>) -> Response
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let range = match range::parse_content_range(headers.get(CONTENT_RANGE), self.capacity) {
            Ok(range) => range,
            Err(err) => {
                tracing::warn!("rejecting write: {err}");
                return Response::text(err.status(), err.to_string());
            }
        };

        if expects_continue(headers) {
            if let Err(err) = conn.get_mut().write_all(CONTINUE).await {
                tracing::debug!("failed to send 100 Continue: {err}");
            }
        }

        let payload = match body::read_body(conn, headers, range.len()).await {
            Ok(payload) => payload,
            Err(err) => {
                log_transfer_error(&err, range);
                return Response::text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            }
        };

        let accessor = self.accessor.clone();
        let path = self.path.clone();
        let written = payload.len() as u64;
        let write = tokio::task::spawn_blocking(move || {
            let mut device = accessor.open(&path)?;
            let res = device.write_at(range.start, &payload);
            device.close();
            res
        })
        .await;

        match write {
            Ok(Ok(())) => {
                tracing::debug!(offset = range.start, bytes = written, "write complete");
                Response::text(StatusCode::OK, "ok")
            }
            Ok(Err(err)) => {
                tracing::error!(offset = range.start, len = written, "write failed: {err}");
                Response::text(StatusCode::INTERNAL_SERVER_ERROR, "write failed")
            }
            Err(err) => {
                tracing::error!(offset = range.start, len = written, "write task failed: {err}");
                Response::text(StatusCode::INTERNAL_SERVER_ERROR, "write failed")
            }
        }
    }
}

fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

fn log_transfer_error(err: &TransferError, range: ByteRange) {
    match err {
        TransferError::Io(io) => {
            tracing::warn!(offset = range.start, len = range.len(), "body read failed: {io}")
        }
        _ => tracing::warn!(offset = range.start, len = range.len(), "rejecting body: {err}"),
    }
}
