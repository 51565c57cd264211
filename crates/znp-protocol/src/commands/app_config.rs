//! APP_CONFIG subsystem: BDB commissioning and trust center policy

use crate::types::{BdbCommissioningMode, BdbCommissioningStatus, Channels, Status};

mt_command! {
    /// Starts the selected BDB commissioning modes; progress arrives via
    /// `BdbCommissioningNotification` callbacks
    sreq BdbStartCommissioning(AppConfig, 0x05) {
        mode: BdbCommissioningMode,
    }
    rsp BdbStartCommissioningRsp / AppCnfBdbStartCommissioningRsp / BdbStartCommissioningRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Sets the BDB primary or secondary channel mask
    sreq BdbSetChannel(AppConfig, 0x08) {
        is_primary: bool,
        channel: Channels,
    }
    rsp BdbSetChannelRsp / AppCnfBdbSetChannelRsp / BdbSetChannelRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Sets the network frame counter of the current network
    sreq SetNwkFrameCounter(AppConfig, 0xFF) {
        value: u32,
    }
    rsp SetNwkFrameCounterRsp / AppCnfSetNwkFrameCounterRsp / SetNwkFrameCounterRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Progress notification from the BDB state machine; commissioning is
    /// finished when no modes remain
    callback BdbCommissioningNotification / AppCnfBdbCommissioningNotification / BdbCommissioningNotificationPattern (AppConfig, 0x80) {
        status: BdbCommissioningStatus,
        mode: BdbCommissioningMode,
        remaining_modes: BdbCommissioningMode,
    }
}
