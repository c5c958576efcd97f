//! UpCloud block storage CSI plugin.
//!
//! The controller translates CSI requests into storage operations against the
//! UpCloud API, the node prepares and mounts the attached block devices and
//! the identity service reports the plugin capabilities and readiness.

#[macro_use]
extern crate tracing;

/// Log an error and turn it into a gRPC status with the given code.
macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ error!($msg); Status::new(Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); error!("{}", message); Status::new(Code::$code, message) }};
}

pub use rpc::csi;

mod block_vol;
mod filesystem_vol;

pub mod config;
pub mod context;
pub mod controller;
pub mod filesystem;
pub mod health;
pub mod identity;
pub mod node;
pub mod service;
pub mod shutdown;

/// Topology segment carrying the zone of a volume or a node.
pub const TOPOLOGY_REGION_KEY: &str = "region";

/// The only access mode the plugin supports.
pub const SUPPORTED_ACCESS_MODE: csi::volume_capability::access_mode::Mode =
    csi::volume_capability::access_mode::Mode::SingleNodeWriter;
