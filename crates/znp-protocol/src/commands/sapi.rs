//! SAPI subsystem
//!
//! Only the configuration read is carried: it bypasses the security policy
//! that blocks `OSALNVRead` for key material on some firmware.

use crate::codec::ShortBytes;
use crate::types::Status;

mt_command! {
    /// Reads a configuration property by its 8-bit id
    sreq ZbReadConfiguration(Sapi, 0x04) {
        config_id: u8,
    }
    rsp ZbReadConfigurationRsp / SapiZbReadConfigurationRsp / ZbReadConfigurationRspPattern {
        status: Status,
        config_id: u8,
        value: ShortBytes,
    }
}
