#![forbid(unsafe_code)]

//! HTTP byte-range server for a single block device.
//!
//! `HEAD` reports the device capacity, `GET` reads a `Range`, `PUT` writes a `Content-Range`.
//! Connections are served strictly one after another and every request opens its own device
//! handle.

pub mod config;
pub mod http;
pub mod server;
pub mod service;

pub use config::ServerConfig;
pub use server::{run, serve, start, RunningDiskServer};
pub use service::DiskService;
