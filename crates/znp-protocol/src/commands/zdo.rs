//! ZDO subsystem: the management plane the firmware exposes as first-class
//! MT commands
//!
//! Each management SREQ is acknowledged by a status-only SRSP; the actual
//! answer arrives later as an AREQ callback from the destination device.

use crate::codec::{take, Codec, DecodeError, ShortList};
use crate::types::{
    mt_enum_u8, AddrMode, BindAddress, Channels, DeviceState, Eui64, LeaveOptions,
    MacCapabilities, Status,
};

mt_enum_u8! {
    /// Options of a `ZDO.ExtRouteDisc`
    pub enum RouteDiscoveryOptions {
        Unicast = 0x00,
        ManyToOneWithCache = 0x01,
        ManyToOneWithoutCache = 0x03,
    }
}

mt_enum_u8! {
    /// Result of a `ZDO.StartupFromApp`
    pub enum StartupState {
        RestoredNetworkState = 0x00,
        NewNetworkState = 0x01,
        NotStarted = 0x02,
    }
}

/// One row of a `Mgmt_Lqi_rsp` neighbor table (22 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborLqi {
    pub extended_pan_id: Eui64,
    pub ext_addr: Eui64,
    pub nwk_addr: u16,
    /// Packed device type, rx-on-when-idle and relationship bits
    pub packed: u8,
    pub permit_joining: u8,
    pub depth: u8,
    pub lqi: u8,
}

impl Codec for NeighborLqi {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.extended_pan_id.encode(buf);
        self.ext_addr.encode(buf);
        self.nwk_addr.encode(buf);
        self.packed.encode(buf);
        self.permit_joining.encode(buf);
        self.depth.encode(buf);
        self.lqi.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            extended_pan_id: Eui64::decode(buf)?,
            ext_addr: Eui64::decode(buf)?,
            nwk_addr: u16::decode(buf)?,
            packed: u8::decode(buf)?,
            permit_joining: u8::decode(buf)?,
            depth: u8::decode(buf)?,
            lqi: u8::decode(buf)?,
        })
    }
}

/// Neighbor table slice carried by `MgmtLqiRsp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    /// Total entries available on the device
    pub entries: u8,
    pub start_index: u8,
    pub neighbor_list: ShortList<NeighborLqi>,
}

impl Codec for Neighbors {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.entries.encode(buf);
        self.start_index.encode(buf);
        self.neighbor_list.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            entries: u8::decode(buf)?,
            start_index: u8::decode(buf)?,
            neighbor_list: ShortList::decode(buf)?,
        })
    }
}

/// One row of a `Mgmt_Rtg_rsp` routing table (5 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    pub dst_addr: u16,
    /// Packed route status and memory-constrained/many-to-one bits
    pub route_status: u8,
    pub next_hop: u16,
}

impl Codec for RoutingEntry {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.dst_addr.encode(buf);
        self.route_status.encode(buf);
        self.next_hop.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            dst_addr: u16::decode(buf)?,
            route_status: u8::decode(buf)?,
            next_hop: u16::decode(buf)?,
        })
    }
}

/// Routing table slice carried by `MgmtRtgRsp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    pub entries: u8,
    pub start_index: u8,
    pub route_list: ShortList<RoutingEntry>,
}

impl Codec for Routes {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.entries.encode(buf);
        self.start_index.encode(buf);
        self.route_list.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            entries: u8::decode(buf)?,
            start_index: u8::decode(buf)?,
            route_list: ShortList::decode(buf)?,
        })
    }
}

/// Fixed 13-byte node descriptor in its over-the-air layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDescriptor(pub [u8; 13]);

impl Codec for NodeDescriptor {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(take(buf, 13)?.try_into().unwrap()))
    }
}

mt_command! {
    /// Requests the node descriptor of a remote device
    sreq NodeDescReq(Zdo, 0x02) {
        dst_addr: u16,
        nwk_addr_of_interest: u16,
    }
    rsp NodeDescReqRsp / ZdoNodeDescReqRsp / NodeDescReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Requests the simple descriptor of one endpoint
    sreq SimpleDescReq(Zdo, 0x04) {
        dst_addr: u16,
        nwk_addr_of_interest: u16,
        endpoint: u8,
    }
    rsp SimpleDescReqRsp / ZdoSimpleDescReqRsp / SimpleDescReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Requests the list of active endpoints
    sreq ActiveEpReq(Zdo, 0x05) {
        dst_addr: u16,
        nwk_addr_of_interest: u16,
    }
    rsp ActiveEpReqRsp / ZdoActiveEpReqRsp / ActiveEpReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Creates a binding on a remote device
    sreq BindReq(Zdo, 0x21) {
        dst: u16,
        src: Eui64,
        src_endpoint: u8,
        cluster_id: u16,
        address: BindAddress,
    }
    rsp BindReqRsp / ZdoBindReqRsp / BindReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Requests a slice of a remote neighbor table
    sreq MgmtLqiReq(Zdo, 0x31) {
        dst: u16,
        start_index: u8,
    }
    rsp MgmtLqiReqRsp / ZdoMgmtLqiReqRsp / MgmtLqiReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Requests a slice of a remote routing table
    sreq MgmtRtgReq(Zdo, 0x32) {
        dst: u16,
        start_index: u8,
    }
    rsp MgmtRtgReqRsp / ZdoMgmtRtgReqRsp / MgmtRtgReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Asks a device to leave the network
    sreq MgmtLeaveReq(Zdo, 0x34) {
        dst_addr: u16,
        ieee: Eui64,
        options: LeaveOptions,
    }
    rsp MgmtLeaveReqRsp / ZdoMgmtLeaveReqRsp / MgmtLeaveReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Opens or closes the join window
    ///
    /// Broadcast permit-join must go through this command rather than a raw
    /// AF message, or the coordinator will not hand out the network key
    /// during the window.
    sreq MgmtPermitJoinReq(Zdo, 0x36) {
        addr_mode: AddrMode,
        dst: u16,
        duration: u8,
        /// Unused by the firmware
        tc_significance: u8,
    }
    rsp MgmtPermitJoinReqRsp / ZdoMgmtPermitJoinReqRsp / MgmtPermitJoinReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Network update request: channel changes and energy scans
    sreq MgmtNwkUpdateReq(Zdo, 0x37) {
        dst: u16,
        dst_addr_mode: AddrMode,
        channels: Channels,
        scan_duration: u8,
        scan_count: u8,
        nwk_manager_addr: u16,
    }
    rsp MgmtNwkUpdateReqRsp / ZdoMgmtNwkUpdateReqRsp / MgmtNwkUpdateReqRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Starts the network layer from the stored configuration; how
    /// Z-Stack 1.2 forms a network
    sreq StartupFromApp(Zdo, 0x40) {
        start_delay: u16,
    }
    rsp StartupFromAppRsp / ZdoStartupFromAppRsp / StartupFromAppRspPattern {
        state: StartupState,
    }
}

mt_command! {
    /// Triggers route discovery toward a destination
    sreq ExtRouteDisc(Zdo, 0x45) {
        dst: u16,
        options: RouteDiscoveryOptions,
        radius: u8,
    }
    rsp ExtRouteDiscRsp / ZdoExtRouteDiscRsp / ExtRouteDiscRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Node descriptor response from a remote device
    callback NodeDescRsp / ZdoNodeDescRsp / NodeDescRspPattern (Zdo, 0x82) {
        src: u16,
        status: Status,
        nwk: u16,
        descriptor: NodeDescriptor,
    }
}

mt_command! {
    /// Simple descriptor response; the descriptor is kept in its
    /// length-prefixed over-the-air form
    callback SimpleDescRsp / ZdoSimpleDescRsp / SimpleDescRspPattern (Zdo, 0x84) {
        src: u16,
        status: Status,
        nwk: u16,
        descriptor: crate::codec::ShortBytes,
    }
}

mt_command! {
    /// Active endpoint list response
    callback ActiveEpRsp / ZdoActiveEpRsp / ActiveEpRspPattern (Zdo, 0x85) {
        src: u16,
        status: Status,
        nwk: u16,
        active_endpoints: ShortList<u8>,
    }
}

mt_command! {
    /// Bind request result
    callback BindRsp / ZdoBindRsp / BindRspPattern (Zdo, 0xA1) {
        src: u16,
        status: Status,
    }
}

mt_command! {
    /// Neighbor table response
    callback MgmtLqiRsp / ZdoMgmtLqiRsp / MgmtLqiRspPattern (Zdo, 0xB1) {
        src: u16,
        status: Status,
        neighbors: Neighbors,
    }
}

mt_command! {
    /// Routing table response
    callback MgmtRtgRsp / ZdoMgmtRtgRsp / MgmtRtgRspPattern (Zdo, 0xB2) {
        src: u16,
        status: Status,
        routes: Routes,
    }
}

mt_command! {
    /// Leave request result
    callback MgmtLeaveRsp / ZdoMgmtLeaveRsp / MgmtLeaveRspPattern (Zdo, 0xB4) {
        src: u16,
        status: Status,
    }
}

mt_command! {
    /// Permit-join request result
    callback MgmtPermitJoinRsp / ZdoMgmtPermitJoinRsp / MgmtPermitJoinRspPattern (Zdo, 0xB6) {
        src: u16,
        status: Status,
    }
}

mt_command! {
    /// Network update notification with energy scan results
    callback MgmtNwkUpdateNotify / ZdoMgmtNwkUpdateNotify / MgmtNwkUpdateNotifyPattern (Zdo, 0xB8) {
        src: u16,
        status: Status,
        scanned_channels: Channels,
        total_transmissions: u16,
        transmission_failures: u16,
        energy_values: crate::codec::ShortBytes,
    }
}

mt_command! {
    /// ZDO state machine transition
    callback StateChangeInd / ZdoStateChangeInd / StateChangeIndPattern (Zdo, 0xC0) {
        state: DeviceState,
    }
}

mt_command! {
    /// Device announce received from the network
    callback EndDeviceAnnceInd / ZdoEndDeviceAnnceInd / EndDeviceAnnceIndPattern (Zdo, 0xC1) {
        src: u16,
        nwk: u16,
        ieee: Eui64,
        capabilities: MacCapabilities,
    }
}

mt_command! {
    /// Source route received for a destination
    callback SrcRtgInd / ZdoSrcRtgInd / SrcRtgIndPattern (Zdo, 0xC4) {
        dst_addr: u16,
        relays: ShortList<u16>,
    }
}

mt_command! {
    /// A device left the network
    callback LeaveInd / ZdoLeaveInd / LeaveIndPattern (Zdo, 0xC9) {
        nwk: u16,
        ieee: Eui64,
        request: bool,
        remove: bool,
        rejoin: bool,
    }
}

mt_command! {
    /// Trust center: a device joined through a parent
    callback TcDevInd / ZdoTcDevInd / TcDevIndPattern (Zdo, 0xCA) {
        src_nwk: u16,
        src_ieee: Eui64,
        parent_nwk: u16,
    }
}

mt_command! {
    /// Join window state changed
    callback PermitJoinInd / ZdoPermitJoinInd / PermitJoinIndPattern (Zdo, 0xCB) {
        duration: u8,
    }
}
