//! SYS subsystem: reset, capability discovery and NVRAM access

use crate::codec::ShortBytes;
use crate::types::{MtCapabilities, ResetReason, ResetType, Status};

mt_command! {
    /// Resets the device. No SRSP; a `ResetInd` callback follows once the
    /// chip is back up.
    areq ResetReq(Sys, 0x00) {
        reset_type: ResetType,
    }
}

mt_command! {
    /// Verifies the device is alive and reports the MT interfaces it speaks
    sreq Ping(Sys, 0x01) {}
    rsp PingRsp / SysPingRsp / PingRspPattern {
        capabilities: MtCapabilities,
    }
}

mt_command! {
    /// Reads the firmware version descriptor
    sreq Version(Sys, 0x02) {}
    rsp VersionRsp / SysVersionRsp / VersionRspPattern {
        transport_rev: u8,
        product_id: u8,
        major_rel: u8,
        minor_rel: u8,
        maint_rel: u8,
        /// Build id, only reported by newer firmware
        code_revision: Option<u32>,
    }
}

mt_command! {
    /// Creates an uninitialized legacy NV item of the given length
    sreq OsalNvItemInit(Sys, 0x07) {
        id: u16,
        item_len: u16,
        value: ShortBytes,
    }
    rsp OsalNvItemInitRsp / SysOsalNvItemInitRsp / OsalNvItemInitRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Reads a legacy NV item with an 8-bit offset
    sreq OsalNvRead(Sys, 0x08) {
        id: u16,
        offset: u8,
    }
    rsp OsalNvReadRsp / SysOsalNvReadRsp / OsalNvReadRspPattern {
        status: Status,
        value: ShortBytes,
    }
}

mt_command! {
    /// Writes a legacy NV item. The `offset` parameter is silently ignored
    /// by the firmware; offset writes must use `OsalNvWriteExt`.
    sreq OsalNvWrite(Sys, 0x09) {
        id: u16,
        offset: u8,
        value: ShortBytes,
    }
    rsp OsalNvWriteRsp / SysOsalNvWriteRsp / OsalNvWriteRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Deletes a legacy NV item; `item_len` must match the stored length
    sreq OsalNvDelete(Sys, 0x12) {
        id: u16,
        item_len: u16,
    }
    rsp OsalNvDeleteRsp / SysOsalNvDeleteRsp / OsalNvDeleteRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Reports the stored length of a legacy NV item, zero when absent
    sreq OsalNvLength(Sys, 0x13) {
        id: u16,
    }
    rsp OsalNvLengthRsp / SysOsalNvLengthRsp / OsalNvLengthRspPattern {
        item_len: u16,
    }
}

mt_command! {
    /// Sets the radio TX power. The response byte is a status on newer
    /// firmware and the applied dBm value on older firmware.
    sreq SetTxPower(Sys, 0x14) {
        tx_power: i8,
    }
    rsp SetTxPowerRsp / SysSetTxPowerRsp / SetTxPowerRspPattern {
        status_or_power: u8,
    }
}

mt_command! {
    /// Reads a legacy NV item with a 16-bit offset
    sreq OsalNvReadExt(Sys, 0x1C) {
        id: u16,
        offset: u16,
    }
    rsp OsalNvReadExtRsp / SysOsalNvReadExtRsp / OsalNvReadExtRspPattern {
        status: Status,
        value: ShortBytes,
    }
}

mt_command! {
    /// Writes a legacy NV item at a real 16-bit offset
    sreq OsalNvWriteExt(Sys, 0x1D) {
        id: u16,
        offset: u16,
        value: ShortBytes,
    }
    rsp OsalNvWriteExtRsp / SysOsalNvWriteExtRsp / OsalNvWriteExtRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Creates an extended NV item
    sreq NvCreate(Sys, 0x30) {
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
        length: u32,
    }
    rsp NvCreateRsp / SysNvCreateRsp / NvCreateRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Deletes an extended NV item
    sreq NvDelete(Sys, 0x31) {
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
    }
    rsp NvDeleteRsp / SysNvDeleteRsp / NvDeleteRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Reports the stored length of an extended NV item, zero when absent
    sreq NvLength(Sys, 0x32) {
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
    }
    rsp NvLengthRsp / SysNvLengthRsp / NvLengthRspPattern {
        length: u32,
    }
}

mt_command! {
    /// Reads a chunk of an extended NV item
    sreq NvRead(Sys, 0x33) {
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
        offset: u16,
        length: u8,
    }
    rsp NvReadRsp / SysNvReadRsp / NvReadRspPattern {
        status: Status,
        value: ShortBytes,
    }
}

mt_command! {
    /// Writes a chunk of an extended NV item at a real offset
    sreq NvWrite(Sys, 0x34) {
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
        offset: u16,
        value: ShortBytes,
    }
    rsp NvWriteRsp / SysNvWriteRsp / NvWriteRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Sent by the device after any reset, carrying the firmware version
    callback ResetInd / SysResetInd / ResetIndPattern (Sys, 0x80) {
        reason: ResetReason,
        transport_rev: u8,
        product_id: u8,
        major_rel: u8,
        minor_rel: u8,
        hw_rev: u8,
    }
}
