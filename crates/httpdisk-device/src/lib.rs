//! Block device access shared by the disk server and the attach supervisor.

pub mod device;
pub mod retry;

pub use device::{
    is_exclusively_available, is_replicated_device, BlockDevice, DeviceAccessor, DeviceError,
    DRBD_MAJOR, REPLICATED_READONLY_RETRY,
};
pub use retry::RetryPolicy;
