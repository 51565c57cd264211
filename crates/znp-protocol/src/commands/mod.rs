//! Typed MT command registry
//!
//! Every MT command is declared once with its subsystem, id and schema; the
//! macros below expand that declaration into the concrete request, response
//! and callback structs, a partial-match pattern type, and the registry
//! entries used to decode inbound frames.

use crate::codec::DecodeError;
use crate::frame::{CommandHeader, GeneralFrame};
use crate::types::ProtocolError;

/// A concrete MT command with a fixed header and a parameter schema
pub trait MtCommand: Sized + Clone + std::fmt::Debug + Send + 'static {
    const HEADER: CommandHeader;

    fn encode_payload(&self, buf: &mut Vec<u8>);
    fn decode_payload(buf: &mut &[u8]) -> Result<Self, DecodeError>;

    fn to_frame(&self) -> GeneralFrame {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);
        GeneralFrame::new(Self::HEADER, payload)
    }
}

/// A partial command used as a listener pattern
///
/// Unbound fields are wildcards; a pattern matches a command when every
/// bound field compares equal.
pub trait CommandMatcher: Send + Sync + std::fmt::Debug + 'static {
    /// Header of the command this pattern matches
    fn header(&self) -> CommandHeader;

    /// Match against a decoded inbound command
    fn matches_any(&self, command: &AnyCommand) -> bool;

    /// True when every command matched by `other` is also matched by `self`
    fn subsumes(&self, other: &dyn CommandMatcher) -> bool;

    fn as_any(&self) -> &dyn std::any::Any;
}

/// Links an SREQ to its SRSP and the SRSP's pattern type
pub trait SyncRequest: MtCommand {
    type Rsp: MtCommand + TryFrom<AnyCommand, Error = AnyCommand>;
    type Pattern: CommandMatcher + Default;
}

/// Links a pattern back to the command type it matches
pub trait PatternOf: CommandMatcher {
    type Command: MtCommand + TryFrom<AnyCommand, Error = AnyCommand>;
}

macro_rules! mt_payload_struct {
    (
        $(#[$meta:meta])*
        $name:ident, $ty_expr:expr, $subsys:ident, $id:literal {
            $( $(#[$fmeta:meta])* $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $fty, )*
        }

        impl $crate::commands::MtCommand for $name {
            const HEADER: $crate::frame::CommandHeader =
                $crate::frame::CommandHeader::new(
                    $ty_expr,
                    $crate::frame::Subsystem::$subsys,
                    $id,
                );

            fn encode_payload(&self, buf: &mut Vec<u8>) {
                let _ = &buf;
                $( $crate::codec::Codec::encode(&self.$field, buf); )*
            }

            fn decode_payload(
                buf: &mut &[u8],
            ) -> Result<Self, $crate::codec::DecodeError> {
                let _ = &buf;
                Ok(Self {
                    $( $field: $crate::codec::Codec::decode(buf)?, )*
                })
            }
        }
    };
}

macro_rules! mt_pattern_struct {
    (
        $pattern:ident, $cmd:ident, $variant:ident {
            $( $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        /// Partial-match pattern; `None` fields are wildcards
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $pattern {
            $( pub $field: Option<$fty>, )*
        }

        impl $pattern {
            #[must_use]
            pub fn matches(&self, command: &$cmd) -> bool {
                let _ = command;
                $(
                    if let Some(ref expected) = self.$field {
                        if *expected != command.$field {
                            return false;
                        }
                    }
                )*
                true
            }

            fn is_more_general_than(&self, other: &Self) -> bool {
                let _ = other;
                $(
                    match (&self.$field, &other.$field) {
                        (Some(a), Some(b)) if a == b => {}
                        (Some(_), _) => return false,
                        (None, _) => {}
                    }
                )*
                true
            }
        }

        impl $crate::commands::CommandMatcher for $pattern {
            fn header(&self) -> $crate::frame::CommandHeader {
                <$cmd as $crate::commands::MtCommand>::HEADER
            }

            fn matches_any(&self, command: &$crate::commands::AnyCommand) -> bool {
                match command {
                    $crate::commands::AnyCommand::$variant(cmd) => self.matches(cmd),
                    _ => false,
                }
            }

            fn subsumes(&self, other: &dyn $crate::commands::CommandMatcher) -> bool {
                other
                    .as_any()
                    .downcast_ref::<Self>()
                    .is_some_and(|other| self.is_more_general_than(other))
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        impl $crate::commands::PatternOf for $pattern {
            type Command = $cmd;
        }

        impl TryFrom<$crate::commands::AnyCommand> for $cmd {
            type Error = $crate::commands::AnyCommand;

            fn try_from(
                command: $crate::commands::AnyCommand,
            ) -> Result<Self, Self::Error> {
                match command {
                    $crate::commands::AnyCommand::$variant(cmd) => Ok(cmd),
                    other => Err(other),
                }
            }
        }
    };
}

/// Declares one MT command and derives its concrete types
macro_rules! mt_command {
    // Synchronous request with its paired synchronous response
    (
        $(#[$meta:meta])*
        sreq $req:ident($subsys:ident, $id:literal) {
            $( $(#[$qmeta:meta])* $qfield:ident : $qty:ty ),* $(,)?
        }
        rsp $rsp:ident / $variant:ident / $pattern:ident {
            $( $(#[$pmeta:meta])* $pfield:ident : $pty:ty ),* $(,)?
        }
    ) => {
        $crate::commands::mt_payload_struct! {
            $(#[$meta])*
            $req, $crate::frame::CommandType::Sreq, $subsys, $id {
                $( $(#[$qmeta])* $qfield : $qty ),*
            }
        }

        $crate::commands::mt_payload_struct! {
            $rsp, $crate::frame::CommandType::Srsp, $subsys, $id {
                $( $(#[$pmeta])* $pfield : $pty ),*
            }
        }

        $crate::commands::mt_pattern_struct! {
            $pattern, $rsp, $variant {
                $( $pfield : $pty ),*
            }
        }

        impl $crate::commands::SyncRequest for $req {
            type Rsp = $rsp;
            type Pattern = $pattern;
        }
    };

    // Fire-and-forget asynchronous request; no response exists
    (
        $(#[$meta:meta])*
        areq $req:ident($subsys:ident, $id:literal) {
            $( $(#[$qmeta:meta])* $qfield:ident : $qty:ty ),* $(,)?
        }
    ) => {
        $crate::commands::mt_payload_struct! {
            $(#[$meta])*
            $req, $crate::frame::CommandType::Areq, $subsys, $id {
                $( $(#[$qmeta])* $qfield : $qty ),*
            }
        }
    };

    // Unsolicited callback
    (
        $(#[$meta:meta])*
        callback $cb:ident / $variant:ident / $pattern:ident ($subsys:ident, $id:literal) {
            $( $(#[$fmeta:meta])* $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $crate::commands::mt_payload_struct! {
            $(#[$meta])*
            $cb, $crate::frame::CommandType::Areq, $subsys, $id {
                $( $(#[$fmeta])* $field : $fty ),*
            }
        }

        $crate::commands::mt_pattern_struct! {
            $pattern, $cb, $variant {
                $( $field : $fty ),*
            }
        }
    };

    // Standalone synchronous response with no request (RPCError only)
    (
        $(#[$meta:meta])*
        srsp $rsp:ident / $variant:ident / $pattern:ident ($subsys:ident, $id:literal) {
            $( $(#[$fmeta:meta])* $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $crate::commands::mt_payload_struct! {
            $(#[$meta])*
            $rsp, $crate::frame::CommandType::Srsp, $subsys, $id {
                $( $(#[$fmeta])* $field : $fty ),*
            }
        }

        $crate::commands::mt_pattern_struct! {
            $pattern, $rsp, $variant {
                $( $field : $fty ),*
            }
        }
    };
}

pub(crate) use {mt_command, mt_payload_struct, mt_pattern_struct};

pub mod af;
pub mod app_config;
pub mod rpc_error;
pub mod sapi;
pub mod sys;
pub mod util;
pub mod zdo;

/// Every inbound command (SRSPs and callbacks) keyed by its header
macro_rules! inbound_commands {
    ($apply:ident) => {
        $apply! {
            RpcCommandNotRecognized => rpc_error::CommandNotRecognized,

            SysPingRsp => sys::PingRsp,
            SysVersionRsp => sys::VersionRsp,
            SysOsalNvItemInitRsp => sys::OsalNvItemInitRsp,
            SysOsalNvReadRsp => sys::OsalNvReadRsp,
            SysOsalNvWriteRsp => sys::OsalNvWriteRsp,
            SysOsalNvDeleteRsp => sys::OsalNvDeleteRsp,
            SysOsalNvLengthRsp => sys::OsalNvLengthRsp,
            SysSetTxPowerRsp => sys::SetTxPowerRsp,
            SysOsalNvReadExtRsp => sys::OsalNvReadExtRsp,
            SysOsalNvWriteExtRsp => sys::OsalNvWriteExtRsp,
            SysNvCreateRsp => sys::NvCreateRsp,
            SysNvDeleteRsp => sys::NvDeleteRsp,
            SysNvLengthRsp => sys::NvLengthRsp,
            SysNvReadRsp => sys::NvReadRsp,
            SysNvWriteRsp => sys::NvWriteRsp,
            SysResetInd => sys::ResetInd,

            AfRegisterRsp => af::RegisterRsp,
            AfDataRequestRsp => af::DataRequestRsp,
            AfDataRequestExtRsp => af::DataRequestExtRsp,
            AfDataRequestSrcRtgRsp => af::DataRequestSrcRtgRsp,
            AfDeleteRsp => af::DeleteRsp,
            AfDataConfirm => af::DataConfirm,
            AfIncomingMsg => af::IncomingMsg,
            AfIncomingMsgExt => af::IncomingMsgExt,

            ZdoNodeDescReqRsp => zdo::NodeDescReqRsp,
            ZdoSimpleDescReqRsp => zdo::SimpleDescReqRsp,
            ZdoActiveEpReqRsp => zdo::ActiveEpReqRsp,
            ZdoBindReqRsp => zdo::BindReqRsp,
            ZdoMgmtLqiReqRsp => zdo::MgmtLqiReqRsp,
            ZdoMgmtRtgReqRsp => zdo::MgmtRtgReqRsp,
            ZdoMgmtLeaveReqRsp => zdo::MgmtLeaveReqRsp,
            ZdoMgmtPermitJoinReqRsp => zdo::MgmtPermitJoinReqRsp,
            ZdoMgmtNwkUpdateReqRsp => zdo::MgmtNwkUpdateReqRsp,
            ZdoStartupFromAppRsp => zdo::StartupFromAppRsp,
            ZdoExtRouteDiscRsp => zdo::ExtRouteDiscRsp,
            ZdoNodeDescRsp => zdo::NodeDescRsp,
            ZdoSimpleDescRsp => zdo::SimpleDescRsp,
            ZdoActiveEpRsp => zdo::ActiveEpRsp,
            ZdoBindRsp => zdo::BindRsp,
            ZdoMgmtLqiRsp => zdo::MgmtLqiRsp,
            ZdoMgmtRtgRsp => zdo::MgmtRtgRsp,
            ZdoMgmtLeaveRsp => zdo::MgmtLeaveRsp,
            ZdoMgmtPermitJoinRsp => zdo::MgmtPermitJoinRsp,
            ZdoMgmtNwkUpdateNotify => zdo::MgmtNwkUpdateNotify,
            ZdoStateChangeInd => zdo::StateChangeInd,
            ZdoEndDeviceAnnceInd => zdo::EndDeviceAnnceInd,
            ZdoSrcRtgInd => zdo::SrcRtgInd,
            ZdoLeaveInd => zdo::LeaveInd,
            ZdoTcDevInd => zdo::TcDevInd,
            ZdoPermitJoinInd => zdo::PermitJoinInd,

            UtilGetDeviceInfoRsp => util::GetDeviceInfoRsp,
            UtilSetChannelsRsp => util::SetChannelsRsp,
            UtilSetPreConfigKeyRsp => util::SetPreConfigKeyRsp,
            UtilLedControlRsp => util::LedControlRsp,
            UtilAssocGetWithAddressRsp => util::AssocGetWithAddressRsp,
            UtilAssocRemoveRsp => util::AssocRemoveRsp,
            UtilAssocAddRsp => util::AssocAddRsp,

            AppCnfBdbStartCommissioningRsp => app_config::BdbStartCommissioningRsp,
            AppCnfBdbSetChannelRsp => app_config::BdbSetChannelRsp,
            AppCnfSetNwkFrameCounterRsp => app_config::SetNwkFrameCounterRsp,
            AppCnfBdbCommissioningNotification => app_config::BdbCommissioningNotification,

            SapiZbReadConfigurationRsp => sapi::ZbReadConfigurationRsp,
        }
    };
}

macro_rules! define_any_command {
    ($( $variant:ident => $path:ty ),* $(,)?) => {
        /// A decoded inbound command
        #[derive(Debug, Clone, PartialEq)]
        pub enum AnyCommand {
            $( $variant($path), )*
        }

        impl AnyCommand {
            #[must_use]
            pub fn header(&self) -> CommandHeader {
                match self {
                    $( Self::$variant(_) => <$path as MtCommand>::HEADER, )*
                }
            }

            /// Decode an inbound frame via the command registry
            ///
            /// Trailing bytes are tolerated with a warning; newer firmware
            /// appends parameters to existing commands.
            pub fn decode(frame: &GeneralFrame) -> Result<Self, ProtocolError> {
                $(
                    if frame.header == <$path as MtCommand>::HEADER {
                        let mut buf = frame.payload.as_slice();
                        let command = Self::$variant(
                            <$path as MtCommand>::decode_payload(&mut buf)?,
                        );
                        if !buf.is_empty() {
                            tracing::warn!(
                                header = %frame.header,
                                trailing = buf.len(),
                                "unparsed bytes after command payload"
                            );
                        }
                        return Ok(command);
                    }
                )*
                Err(ProtocolError::UnknownCommand(frame.header))
            }
        }
    };
}

inbound_commands!(define_any_command);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CommandType, Subsystem};
    use crate::types::{MtCapabilities, Status};

    #[test]
    fn test_ping_req_frame() {
        let frame = sys::Ping {}.to_frame();
        assert_eq!(
            frame.header,
            CommandHeader::new(CommandType::Sreq, Subsystem::Sys, 0x01)
        );
        assert!(frame.payload.is_empty());
        assert_eq!(frame.encode_transport(), [0xFE, 0x00, 0x21, 0x01, 0x20]);
    }

    #[test]
    fn test_decode_ping_rsp() {
        let frame = GeneralFrame::new(
            <sys::PingRsp as MtCommand>::HEADER,
            vec![0x01, 0x00],
        );
        let command = AnyCommand::decode(&frame).unwrap();

        assert_eq!(
            command,
            AnyCommand::SysPingRsp(sys::PingRsp {
                capabilities: MtCapabilities::SYS,
            })
        );
        assert_eq!(command.header(), frame.header);
    }

    #[test]
    fn test_unknown_header_is_an_error() {
        let frame = GeneralFrame::new(CommandHeader::from_raw(0xBEEF), vec![]);
        assert!(matches!(
            AnyCommand::decode(&frame),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_pattern_wildcards() {
        let confirm = af::DataConfirm {
            status: Status::Success,
            endpoint: 1,
            tsn: 5,
        };

        let wildcard = af::DataConfirmPattern::default();
        assert!(wildcard.matches(&confirm));

        let bound = af::DataConfirmPattern {
            endpoint: Some(1),
            tsn: Some(5),
            ..Default::default()
        };
        assert!(bound.matches(&confirm));

        let wrong_tsn = af::DataConfirmPattern {
            tsn: Some(6),
            ..Default::default()
        };
        assert!(!wrong_tsn.matches(&confirm));
    }

    #[test]
    fn test_pattern_subsumption() {
        let general = af::DataConfirmPattern {
            endpoint: Some(1),
            ..Default::default()
        };
        let specific = af::DataConfirmPattern {
            endpoint: Some(1),
            tsn: Some(5),
            ..Default::default()
        };

        assert!(general.subsumes(&specific));
        assert!(!specific.subsumes(&general));

        // Patterns for different commands never subsume each other
        let other = sys::PingRspPattern::default();
        assert!(!general.subsumes(&other));
    }

    #[test]
    fn test_roundtrip_data_request_ext() {
        use crate::types::{Address, TransmitOptions};

        let req = af::DataRequestExt {
            dst_addr: Address::Nwk(0x1234),
            dst_endpoint: 1,
            dst_pan_id: 0x0000,
            src_endpoint: 1,
            cluster_id: 0x0006,
            tsn: 0x42,
            options: TransmitOptions::SUPPRESS_ROUTE_DISC,
            radius: 30,
            data: crate::codec::LongBytes(vec![0x01, 0x02, 0x03]),
        };

        let frame = req.to_frame();
        let mut buf = frame.payload.as_slice();
        let decoded = af::DataRequestExt::decode_payload(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_command_not_recognized_fields() {
        use crate::types::RpcErrorCode;

        // ErrorCode, then the header of the offending request
        let frame = GeneralFrame::new(
            <rpc_error::CommandNotRecognized as MtCommand>::HEADER,
            vec![0x02, 0x21, 0x01],
        );
        let command = AnyCommand::decode(&frame).unwrap();

        match command {
            AnyCommand::RpcCommandNotRecognized(rsp) => {
                assert_eq!(rsp.error_code, RpcErrorCode::InvalidCommandId);
                assert_eq!(
                    rsp.request_header,
                    CommandHeader::new(CommandType::Sreq, Subsystem::Sys, 0x01)
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
