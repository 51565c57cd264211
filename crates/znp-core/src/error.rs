//! Controller error types

use thiserror::Error;
use znp_protocol::codec::DecodeError;
use znp_protocol::types::{ProtocolError, Status};

/// Address of an NV item in either address space, for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvAddress {
    Osal(u16),
    Extended {
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
    },
}

impl std::fmt::Display for NvAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Osal(id) => write!(f, "OSAL[{id:#06X}]"),
            Self::Extended {
                sys_id,
                item_id,
                sub_id,
            } => write!(f, "NV[{sys_id}:{item_id:#06X}:{sub_id:#06X}]"),
        }
    }
}

/// Errors surfaced by the coordinator core
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("NV item {item} does not exist")]
    NvramMissing { item: NvAddress },

    #[error("stored length of {item} differs from the value: {stored} != {actual}")]
    NvramLengthMismatch {
        item: NvAddress,
        stored: usize,
        actual: usize,
    },

    #[error("NVRAM values cannot be empty")]
    EmptyNvValue,

    #[error("NV item {item} cannot be read due to security constraints")]
    Security { item: NvAddress },

    #[error("stored structure could not be decoded: {0}")]
    InvalidNvData(#[from] DecodeError),

    #[error("table write of {count} entries exceeds the capacity of {capacity}")]
    TableOverflow { count: usize, capacity: usize },

    #[error("delivery failed with status {status:?}")]
    Delivery { status: Status },

    #[error("device is not part of a network")]
    NotOnNetwork,

    #[error("no security material entry was found for this network")]
    NoSecurityMaterial,

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("unsupported ZDO cluster {cluster:#06X}")]
    UnsupportedZdoCluster { cluster: u16 },

    #[error("malformed ZDO request payload for cluster {cluster:#06X}")]
    MalformedZdoRequest { cluster: u16 },
}
