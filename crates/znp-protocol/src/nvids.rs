//! Non-volatile item identifiers
//!
//! Two address spaces exist: the legacy 16-bit OSAL ids used by every
//! firmware generation, and the extended `(sys_id, item_id, sub_id)`
//! triplets introduced with Z-Stack 3.30.

/// Legacy 16-bit OSAL NV item ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OsalNvId {
    ExtAddr = 0x0001,
    BootCounter = 0x0002,
    StartupOption = 0x0003,
    StartDelay = 0x0004,

    Nib = 0x0021,
    DeviceList = 0x0022,
    AddrMgr = 0x0023,
    /// Deprecated when the poll rate grew from 16 to 32 bits; reads return
    /// an aliased, shorter value
    PollRateOld16 = 0x0024,
    PollRate = 0x0035,

    ExtendedPanId = 0x002D,
    NwkActiveKeyInfo = 0x003A,
    NwkAlternKeyInfo = 0x003B,

    ApsLinkKeyTable = 0x004C,

    BdbNodeIsOnANetwork = 0x0055,

    SecurityLevel = 0x0061,
    PreCfgKey = 0x0062,
    PreCfgKeysEnable = 0x0063,
    ApsLinkKeyType = 0x0066,
    UseDefaultTclk = 0x006D,
    TrustCenterAddr = 0x0071,

    LegacyNwkSecMaterialTableStart = 0x0075,
    LegacyNwkSecMaterialTableEnd = 0x0080,

    UserDesc = 0x0081,
    NwkKey = 0x0082,
    PanId = 0x0083,
    ChanList = 0x0084,
    LeaveCtrl = 0x0085,
    ScanDuration = 0x0086,
    LogicalType = 0x0087,
    ZdoDirectCb = 0x008F,

    /// Marker written after configuration, checked by zigbee-shepherd
    /// descendants (value 0x55)
    HasConfiguredZstack1 = 0x0F00,
    HasConfiguredZstack3 = 0x0060,

    TclkSeed = 0x0101,
    TclkJoinDev = 0x0102,

    LegacyTclkTableStart = 0x0111,
    LegacyTclkTableEnd = 0x01FF,

    LegacyApsLinkKeyDataStart = 0x0201,
    LegacyApsLinkKeyDataEnd = 0x02FF,
}

impl OsalNvId {
    #[must_use]
    pub const fn id(self) -> u16 {
        self as u16
    }
}

/// Whether reads of this id may be refused by the firmware's security
/// policy, requiring the SAPI fallback
#[must_use]
pub fn is_secure_nvid(nv_id: u16) -> bool {
    if [
        OsalNvId::NwkActiveKeyInfo,
        OsalNvId::NwkAlternKeyInfo,
        OsalNvId::PreCfgKey,
        OsalNvId::TclkSeed,
    ]
    .iter()
    .any(|id| id.id() == nv_id)
    {
        return true;
    }

    (OsalNvId::LegacyTclkTableStart.id()..=OsalNvId::LegacyTclkTableEnd.id())
        .contains(&nv_id)
        || (OsalNvId::LegacyApsLinkKeyDataStart.id()
            ..=OsalNvId::LegacyApsLinkKeyDataEnd.id())
            .contains(&nv_id)
}

/// Extended NV system ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NvSysId {
    Nv = 0,
    Zstack = 1,
    Tls = 2,
    TiMac = 3,
    Remoti = 4,
    Ble = 5,
    SnpTi = 6,
    Tidrivers = 7,
    App = 8,
}

/// Extended NV item ids within `NvSysId::Zstack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ExNvId {
    /// Sub ids of this item alias the legacy OSAL id space
    Legacy = 0x0000,
    AddrMgr = 0x0001,
    BindingTable = 0x0002,
    DeviceList = 0x0003,
    TclkTable = 0x0004,
    TclkIcTable = 0x0005,
    ApsKeyDataTable = 0x0006,
    NwkSecMaterialTable = 0x0007,
}

impl ExNvId {
    #[must_use]
    pub const fn id(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_nvids() {
        assert!(is_secure_nvid(OsalNvId::TclkSeed.id()));
        assert!(is_secure_nvid(OsalNvId::PreCfgKey.id()));
        assert!(is_secure_nvid(0x0150)); // inside the legacy TCLK table
        assert!(!is_secure_nvid(OsalNvId::Nib.id()));
        assert!(!is_secure_nvid(OsalNvId::StartupOption.id()));
    }
}
