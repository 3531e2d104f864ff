#![forbid(unsafe_code)]

//! Maps an HTTP-served disk onto a local `/dev/nbdN` device.
//!
//! [`ProcessSupervisor`] starts the bridge daemon that speaks NBD on a unix socket, has
//! [`SlotManager`] bind that socket to a free nbd slot, and undoes both in reverse order on
//! shutdown.

pub mod command;
pub mod config;
pub mod slot;
pub mod supervisor;

pub use command::{with_timeout, CommandError, CommandRunner, TimeoutError};
pub use config::AttachConfig;
pub use slot::{CommandSlotHost, DeviceSlot, NbdSlot, SlotError, SlotHost, SlotManager, SlotStatus};
pub use supervisor::{BridgeConfig, ProcessSupervisor, SupervisorError, SupervisorState};
