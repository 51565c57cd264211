//! Coordinator core for TI Z-Stack ZNP coprocessors
//!
//! Builds the full coordinator control flow on top of the `znp-protocol`
//! dispatcher: typed NVRAM access, the security store used for network
//! backup and restore, the ZDO rewriter, and the controller application
//! with its startup sequence, data request path and watchdog.

pub mod config;
pub mod controller;
pub mod error;
pub mod network;
pub mod nvram;
pub mod security;
pub mod zdo;

mod serde_hex;

pub use config::{ControllerConfig, NetworkConfig};
pub use controller::{ApsMessage, Controller, ControllerEvent};
pub use error::{ControllerError, NvAddress};
pub use network::{FirmwareGeneration, NetworkInfo};
pub use nvram::Nvram;
pub use security::{NetworkBackup, StoredDevice};
