//! Named types shared across the MT command set

use crate::codec::{take, Codec, DecodeError};
use crate::frame::CommandHeader;
use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("payload decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("serial port error: {0}")]
    Serial(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport was closed while the request was pending")]
    ConnectionClosed,

    #[error("coprocessor does not recognize command {request}")]
    CommandNotRecognized { request: CommandHeader },

    #[error("unexpected synchronous response: {response:?}")]
    InvalidCommandResponse {
        response: Box<crate::commands::AnyCommand>,
    },

    #[error("no command registered for header {0}")]
    UnknownCommand(CommandHeader),
}

/// Generates a `u8`-backed enum that round-trips values missing from the
/// table instead of rejecting them. Firmware revisions add status codes and
/// enum members faster than this table can track them.
macro_rules! mt_enum_u8 {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )*
            Unknown(u8),
        }

        impl $name {
            #[must_use]
            pub fn from_u8(value: u8) -> Self {
                match value {
                    $( $value => Self::$variant, )*
                    other => Self::Unknown(other),
                }
            }

            #[must_use]
            pub fn as_u8(self) -> u8 {
                match self {
                    $( Self::$variant => $value, )*
                    Self::Unknown(other) => other,
                }
            }
        }

        impl $crate::codec::Codec for $name {
            fn encode(&self, buf: &mut Vec<u8>) {
                buf.push(self.as_u8());
            }

            fn decode(
                buf: &mut &[u8],
            ) -> Result<Self, $crate::codec::DecodeError> {
                Ok(Self::from_u8(<u8 as $crate::codec::Codec>::decode(buf)?))
            }
        }
    };
}

pub(crate) use mt_enum_u8;

mt_enum_u8! {
    /// MT status byte, shared by nearly every SRSP
    pub enum Status {
        Success = 0x00,
        Failure = 0x01,
        InvalidParameter = 0x02,
        InvalidTask = 0x03,
        MsgBufferNotAvail = 0x04,
        InvalidMsgPointer = 0x05,
        InvalidEventId = 0x06,
        NoTimerAvail = 0x08,
        NvItemUninit = 0x09,
        NvOperFailed = 0x0A,
        InvalidMemSize = 0x0B,
        NvBadItemLen = 0x0C,
        MemError = 0x10,
        BufferFull = 0x11,
        UnsupportedMode = 0x12,
        NotAuthorized = 0x7E,
        ApsFail = 0xB1,
        ApsTableFull = 0xB2,
        ApsIllegalRequest = 0xB3,
        ApsNoAck = 0xB7,
        ApsNotAuthenticated = 0xBB,
        SecNoKey = 0xA1,
        SecOldFrmCount = 0xA2,
        SecMaxFrmCount = 0xA3,
        SecCcmFail = 0xA4,
        SecFailure = 0xAD,
        NwkInvalidParam = 0xC1,
        NwkInvalidRequest = 0xC2,
        NwkNotPermitted = 0xC3,
        NwkStartupFailure = 0xC4,
        NwkTableFull = 0xC7,
        NwkUnknownDevice = 0xC8,
        NwkNoNetworks = 0xCA,
        NwkNoAck = 0xCC,
        NwkNoRoute = 0xCD,
        MacChannelAccessFailure = 0xE1,
        MacInvalidParameter = 0xE8,
        MacNoAck = 0xE9,
        MacNoBeacon = 0xEA,
        MacNoData = 0xEB,
        MacTransactionExpired = 0xF0,
        MacTransactionOverflow = 0xF1,
    }
}

mt_enum_u8! {
    /// Error codes in an `RPCError.CommandNotRecognized` SRSP
    pub enum RpcErrorCode {
        InvalidSubsystem = 0x01,
        InvalidCommandId = 0x02,
        InvalidParameter = 0x03,
        InvalidLength = 0x04,
    }
}

mt_enum_u8! {
    pub enum ResetReason {
        PowerUp = 0x00,
        External = 0x01,
        Watchdog = 0x02,
    }
}

mt_enum_u8! {
    pub enum ResetType {
        Hard = 0x00,
        Soft = 0x01,
    }
}

mt_enum_u8! {
    /// ZDO device state reported by `ZDO.StateChangeInd`
    pub enum DeviceState {
        InitializedNotStarted = 0x00,
        InitializedNotConnected = 0x01,
        DiscoveringPans = 0x02,
        Joining = 0x03,
        JoinedNotAuthenticated = 0x05,
        JoinedAsEndDevice = 0x06,
        JoinedAsRouter = 0x07,
        StartingAsCoordinator = 0x08,
        StartedAsCoordinator = 0x09,
        LostParent = 0x0A,
    }
}

mt_enum_u8! {
    pub enum DeviceLogicalType {
        Coordinator = 0x00,
        Router = 0x01,
        EndDevice = 0x02,
    }
}

mt_enum_u8! {
    pub enum LatencyReq {
        NoLatency = 0x00,
        FastBeacons = 0x01,
        SlowBeacons = 0x02,
    }
}

mt_enum_u8! {
    /// Key type field of a TCLK device entry
    pub enum KeyType {
        None = 0x00,
        Nwk = 0x01,
        AppMaster = 0x02,
        AppLink = 0x03,
        TcLink = 0x04,
    }
}

mt_enum_u8! {
    pub enum KeyAttributes {
        ProvisionalKey = 0x00,
        UnverifiedKey = 0x01,
        VerifiedKey = 0x02,
        DistributedDefaultKey = 0xFC,
        NonR21NwkJoined = 0xFD,
        VerifiedKeyJoiningDev = 0xFE,
        DefaultKey = 0xFF,
    }
}

mt_enum_u8! {
    pub enum AuthenticationOption {
        NotAuthenticated = 0x00,
        AuthenticatedCbkc = 0x01,
        AuthenticatedEa = 0x02,
    }
}

mt_enum_u8! {
    /// Relationship of an associated device to the coordinator
    pub enum NodeRelation {
        Parent = 0x00,
        ChildRfd = 0x01,
        ChildRfdRxIdle = 0x02,
        ChildFfd = 0x03,
        ChildFfdRxIdle = 0x04,
        Neighbor = 0x05,
        Other = 0x06,
        NotUsed = 0xFF,
    }
}

mt_enum_u8! {
    /// Status of a BDB commissioning notification
    pub enum BdbCommissioningStatus {
        Success = 0x00,
        InProgress = 0x01,
        NoNetwork = 0x02,
        TlTargetFailure = 0x03,
        TclkExFailure = 0x07,
        FormationFailure = 0x08,
        NetworkRestored = 0x0D,
        Failure = 0x0E,
    }
}

bitflags::bitflags! {
    /// MT interfaces advertised by `SYS.Ping`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MtCapabilities: u16 {
        const SYS = 1 << 0;
        const MAC = 1 << 1;
        const NWK = 1 << 2;
        const AF = 1 << 3;
        const ZDO = 1 << 4;
        const SAPI = 1 << 5;
        const UTIL = 1 << 6;
        const DEBUG = 1 << 7;
        const APP = 1 << 8;
        const GP = 1 << 9;
        const APP_CNF = 1 << 10;
    }
}

impl Codec for MtCapabilities {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.bits().encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_bits_retain(u16::decode(buf)?))
    }
}

bitflags::bitflags! {
    /// 2.4 GHz channel mask, bits 11 through 26
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Channels: u32 {
        const NONE = 0;
        const ALL_2_4_GHZ = 0x07FF_F800;
    }
}

impl Channels {
    /// Builds a mask from 802.15.4 channel numbers (11..=26)
    #[must_use]
    pub fn from_channel_list<I: IntoIterator<Item = u8>>(channels: I) -> Self {
        let mut bits = 0u32;
        for channel in channels {
            debug_assert!((11..=26).contains(&channel));
            bits |= 1 << channel;
        }
        Self::from_bits_retain(bits)
    }

    /// Iterates the channel numbers present in the mask
    pub fn iter_channels(self) -> impl Iterator<Item = u8> {
        let bits = self.bits();
        (11u8..=26).filter(move |c| bits & (1 << c) != 0)
    }
}

impl Codec for Channels {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.bits().encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_bits_retain(u32::decode(buf)?))
    }
}

bitflags::bitflags! {
    /// AF data request transmit options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransmitOptions: u8 {
        const WILDCARD_PROFILE_ID = 0x02;
        const APS_PREPROCESS = 0x04;
        const LIMIT_CONCENTRATOR = 0x08;
        const ACK_REQUEST = 0x10;
        const SUPPRESS_ROUTE_DISC = 0x20;
        const ENABLE_SECURITY = 0x40;
        const SKIP_ROUTING = 0x80;
    }
}

impl Codec for TransmitOptions {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.bits());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_bits_retain(u8::decode(buf)?))
    }
}

bitflags::bitflags! {
    /// `STARTUP_OPTION` NV item
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StartupOptions: u8 {
        const CLEAR_CONFIG = 1 << 0;
        const CLEAR_STATE = 1 << 1;
        const AUTO_START = 1 << 2;
        const CLEAR_NWK_FRAME_COUNTER = 1 << 7;
    }
}

impl Codec for StartupOptions {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.bits());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_bits_retain(u8::decode(buf)?))
    }
}

bitflags::bitflags! {
    /// Type flags of an address manager entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddrMgrUserType: u8 {
        const DEFAULT = 0x00;
        const ASSOC = 0x01;
        const SECURITY = 0x02;
        const BINDING = 0x04;
        const PRIVATE1 = 0x08;
    }
}

impl Codec for AddrMgrUserType {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.bits());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_bits_retain(u8::decode(buf)?))
    }
}

bitflags::bitflags! {
    /// BDB commissioning modes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BdbCommissioningMode: u8 {
        const NONE = 0;
        const INITIATOR_TOUCHLINK = 1 << 0;
        const NWK_STEERING = 1 << 1;
        const NWK_FORMATION = 1 << 2;
        const FINDING_BINDING = 1 << 3;
        const TOUCHLINK = 1 << 4;
        const PARENT_LOST = 1 << 5;
    }
}

impl Codec for BdbCommissioningMode {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.bits());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_bits_retain(u8::decode(buf)?))
    }
}

bitflags::bitflags! {
    /// MAC capability flags carried in a device announcement
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MacCapabilities: u8 {
        const ALTERNATE_PAN_COORDINATOR = 1 << 0;
        const ROUTER = 1 << 1;
        const MAINS_POWERED = 1 << 2;
        const RX_ON_WHEN_IDLE = 1 << 3;
        const SECURITY_CAPABLE = 1 << 6;
        const ALLOCATE_ADDRESS = 1 << 7;
    }
}

impl Codec for MacCapabilities {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.bits());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_bits_retain(u8::decode(buf)?))
    }
}

bitflags::bitflags! {
    /// Options of a `ZDO.MgmtLeaveReq`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LeaveOptions: u8 {
        const NONE = 0;
        const REJOIN = 1 << 0;
        const REMOVE_CHILDREN = 1 << 1;
    }
}

impl Codec for LeaveOptions {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.bits());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_bits_retain(u8::decode(buf)?))
    }
}

mt_enum_u8! {
    /// Addressing mode byte used by ZDO management requests
    pub enum AddrMode {
        NotPresent = 0x00,
        Group = 0x01,
        Nwk = 0x02,
        Ieee = 0x03,
        Broadcast = 0x0F,
    }
}

/// 64-bit IEEE address in wire (little-endian) byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub const ZERO: Self = Self([0x00; 8]);
    pub const BROADCAST: Self = Self([0xFF; 8]);
}

impl Codec for Eui64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(take(buf, 8)?.try_into().unwrap()))
    }
}

impl std::fmt::Display for Eui64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Stored little-endian, displayed big-endian
        for (i, b) in self.0.iter().rev().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// 128-bit network or link key
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyData(pub [u8; 16]);

impl Codec for KeyData {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(take(buf, 16)?.try_into().unwrap()))
    }
}

impl std::fmt::Debug for KeyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys are secrets, keep them out of the logs
        write!(f, "KeyData(..)")
    }
}

/// NWK broadcast address reaching every device
pub const BROADCAST_ALL: u16 = 0xFFFF;
/// NWK broadcast address reaching devices whose receiver is on when idle
pub const BROADCAST_RX_ON_WHEN_IDLE: u16 = 0xFFFD;
/// NWK broadcast address reaching routers and the coordinator
pub const BROADCAST_ROUTERS: u16 = 0xFFFC;

/// Destination address with its addressing mode
///
/// On the wire this is one mode byte followed by a fixed 8-byte address
/// field; short addresses occupy the first two bytes and are padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Group(u16),
    Nwk(u16),
    Ieee(Eui64),
    Broadcast(u16),
}

impl Address {
    const MODE_GROUP: u8 = 0x01;
    const MODE_NWK: u8 = 0x02;
    const MODE_IEEE: u8 = 0x03;
    const MODE_BROADCAST: u8 = 0x0F;
}

impl Codec for Address {
    fn encode(&self, buf: &mut Vec<u8>) {
        match *self {
            Self::Ieee(ieee) => {
                buf.push(Self::MODE_IEEE);
                ieee.encode(buf);
            }
            Self::Group(addr) | Self::Nwk(addr) | Self::Broadcast(addr) => {
                buf.push(match self {
                    Self::Group(_) => Self::MODE_GROUP,
                    Self::Nwk(_) => Self::MODE_NWK,
                    _ => Self::MODE_BROADCAST,
                });
                addr.encode(buf);
                // Short addresses are padded to the fixed 8-byte field
                buf.extend_from_slice(&[0x00; 6]);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let mode = u8::decode(buf)?;
        let raw = take(buf, 8)?;

        let short = u16::from_le_bytes([raw[0], raw[1]]);
        match mode {
            Self::MODE_GROUP => Ok(Self::Group(short)),
            Self::MODE_NWK => Ok(Self::Nwk(short)),
            Self::MODE_BROADCAST => Ok(Self::Broadcast(short)),
            Self::MODE_IEEE => Ok(Self::Ieee(Eui64(raw.try_into().unwrap()))),
            value => Err(DecodeError::InvalidValue {
                what: "address mode",
                value,
            }),
        }
    }
}

/// Binding destination of a `ZDO.BindReq`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindAddress {
    Group(u16),
    Ieee { address: Eui64, endpoint: u8 },
}

impl Codec for BindAddress {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Group(group) => {
                buf.push(Address::MODE_GROUP);
                group.encode(buf);
            }
            Self::Ieee { address, endpoint } => {
                buf.push(Address::MODE_IEEE);
                address.encode(buf);
                buf.push(*endpoint);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            Address::MODE_GROUP => Ok(Self::Group(u16::decode(buf)?)),
            Address::MODE_IEEE => Ok(Self::Ieee {
                address: Eui64::decode(buf)?,
                endpoint: u8::decode(buf)?,
            }),
            value => Err(DecodeError::InvalidValue {
                what: "bind address mode",
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_to_vec;

    #[test]
    fn test_status_unknown_preserved() {
        let status = Status::from_u8(0x42);
        assert_eq!(status, Status::Unknown(0x42));
        assert_eq!(encode_to_vec(&status), [0x42]);
    }

    #[test]
    fn test_channels_from_list() {
        let channels = Channels::from_channel_list([15, 20, 25]);
        assert_eq!(channels.bits(), (1 << 15) | (1 << 20) | (1 << 25));
        assert_eq!(channels.iter_channels().collect::<Vec<_>>(), [15, 20, 25]);
    }

    #[test]
    fn test_address_nwk_padding() {
        let addr = Address::Nwk(0x1234);
        let buf = encode_to_vec(&addr);
        assert_eq!(buf, [0x02, 0x34, 0x12, 0, 0, 0, 0, 0, 0]);

        let mut slice = buf.as_slice();
        assert_eq!(Address::decode(&mut slice).unwrap(), addr);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_address_ieee_roundtrip() {
        let addr = Address::Ieee(Eui64([1, 2, 3, 4, 5, 6, 7, 8]));
        let buf = encode_to_vec(&addr);
        assert_eq!(buf.len(), 9);

        let mut slice = buf.as_slice();
        assert_eq!(Address::decode(&mut slice).unwrap(), addr);
    }

    #[test]
    fn test_eui64_display() {
        let ieee = Eui64([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(ieee.to_string(), "88:77:66:55:44:33:22:11");
    }
}
