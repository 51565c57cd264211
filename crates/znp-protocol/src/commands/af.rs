//! AF subsystem: endpoint registration and the application data plane

use crate::codec::{LongBytes, ShortBytes, ShortList};
use crate::types::{Address, LatencyReq, Status, TransmitOptions};

mt_command! {
    /// Registers an application endpoint description
    sreq Register(Af, 0x00) {
        endpoint: u8,
        profile_id: u16,
        device_id: u16,
        device_version: u8,
        latency_req: LatencyReq,
        input_clusters: ShortList<u16>,
        output_clusters: ShortList<u16>,
    }
    rsp RegisterRsp / AfRegisterRsp / RegisterRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Sends a message through the AF layer to a short address
    sreq DataRequest(Af, 0x01) {
        dst_addr: u16,
        dst_endpoint: u8,
        src_endpoint: u8,
        cluster_id: u16,
        tsn: u8,
        options: TransmitOptions,
        radius: u8,
        data: ShortBytes,
    }
    rsp DataRequestRsp / AfDataRequestRsp / DataRequestRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Extended data request carrying a full addressing mode, used for
    /// IEEE-addressed, broadcast and inter-PAN transmissions
    sreq DataRequestExt(Af, 0x02) {
        dst_addr: Address,
        dst_endpoint: u8,
        /// 0x0000 keeps the message intra-PAN
        dst_pan_id: u16,
        src_endpoint: u8,
        cluster_id: u16,
        tsn: u8,
        options: TransmitOptions,
        radius: u8,
        data: LongBytes,
    }
    rsp DataRequestExtRsp / AfDataRequestExtRsp / DataRequestExtRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Data request along a caller-supplied relay list
    sreq DataRequestSrcRtg(Af, 0x03) {
        dst_addr: u16,
        dst_endpoint: u8,
        src_endpoint: u8,
        cluster_id: u16,
        tsn: u8,
        options: TransmitOptions,
        radius: u8,
        source_route: ShortList<u16>,
        data: ShortBytes,
    }
    rsp DataRequestSrcRtgRsp / AfDataRequestSrcRtgRsp / DataRequestSrcRtgRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Deletes a registered endpoint
    sreq Delete(Af, 0x04) {
        endpoint: u8,
    }
    rsp DeleteRsp / AfDeleteRsp / DeleteRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Delivery confirmation for a previously issued data request,
    /// correlated by source endpoint and TSN
    callback DataConfirm / AfDataConfirm / DataConfirmPattern (Af, 0x80) {
        status: Status,
        endpoint: u8,
        tsn: u8,
    }
}

mt_command! {
    /// Incoming message addressed to one of the registered endpoints
    callback IncomingMsg / AfIncomingMsg / IncomingMsgPattern (Af, 0x81) {
        group_id: u16,
        cluster_id: u16,
        src_addr: u16,
        src_endpoint: u8,
        dst_endpoint: u8,
        was_broadcast: bool,
        lqi: u8,
        security_use: bool,
        timestamp: u32,
        tsn: u8,
        data: ShortBytes,
        mac_src_addr: u16,
        msg_result_radius: u8,
    }
}

mt_command! {
    /// Incoming message in the extended (inter-PAN capable) format
    callback IncomingMsgExt / AfIncomingMsgExt / IncomingMsgExtPattern (Af, 0x82) {
        group_id: u16,
        cluster_id: u16,
        src_addr: Address,
        src_endpoint: u8,
        src_pan_id: u16,
        dst_endpoint: u8,
        was_broadcast: bool,
        lqi: u8,
        security_use: u8,
        timestamp: u32,
        tsn: u8,
        data: LongBytes,
        mac_src_addr: u16,
        msg_result_radius: u8,
    }
}
