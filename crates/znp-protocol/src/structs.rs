//! NVRAM-persisted structures
//!
//! These are bit-exact images of Z-Stack's in-memory tables. Every struct
//! exists in a packed and an aligned flavor depending on the platform; see
//! [`crate::cstruct`].

use crate::codec::{Codec, DecodeError};
use crate::cstruct::{CReader, CStruct, CWriter};
use crate::types::{
    mt_enum_u8, AddrMgrUserType, AuthenticationOption, Channels, Eui64, KeyAttributes,
    KeyData, KeyType, NodeRelation,
};

mt_enum_u8! {
    /// NWK layer state machine state, persisted inside the NIB
    pub enum NwkState {
        Init = 0,
        JoiningOrphan = 1,
        Disc = 2,
        Joining = 3,
        EndDevice = 4,
        PanChnlSelection = 5,
        PanChnlVerify = 6,
        PanStarting = 7,
        Router = 8,
        Rejoining = 9,
    }
}

/// Network key with its sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NwkKeyDesc {
    pub key_seq_num: u8,
    pub key: KeyData,
}

impl CStruct for NwkKeyDesc {
    const ALIGNMENT: usize = 1;

    fn write(&self, writer: &mut CWriter) {
        writer.write_u8(self.key_seq_num);
        writer.write_bytes(&self.key.0);
    }

    fn read(reader: &mut CReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            key_seq_num: reader.read_u8()?,
            key: KeyData(reader.read_bytes()?),
        })
    }
}

/// `NWKKEY` NV item: the active network key and the TC frame counter
/// (Z-Stack 1.2 keeps the counter here)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NwkActiveKeyItems {
    pub active: NwkKeyDesc,
    pub frame_counter: u32,
}

impl CStruct for NwkActiveKeyItems {
    const ALIGNMENT: usize = 4;

    fn write(&self, writer: &mut CWriter) {
        self.active.write(writer);
        writer.write_u32(self.frame_counter);
    }

    fn read(reader: &mut CReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            active: NwkKeyDesc::read(reader)?,
            frame_counter: reader.read_u32()?,
        })
    }
}

/// Network Information Base, the radio's persisted network state
///
/// 110 bytes packed, 116 bytes aligned. `nwk_state` is 16 bits on newer
/// platforms; storing it as one byte and letting `channel_list` alignment
/// padding absorb the difference reproduces both layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nib {
    pub sequence_num: u8,
    pub passive_ack_timeout: u8,
    pub max_broadcast_retries: u8,
    pub max_children: u8,
    pub max_depth: u8,
    pub max_routers: u8,
    pub dummy_neighbor_table: u8,
    pub broadcast_delivery_time: u8,
    pub report_constant_cost: u8,
    pub route_disc_retries: u8,
    pub dummy_routing_table: u8,
    pub secure_all_frames: u8,
    pub security_level: u8,
    pub sym_link: u8,
    pub capability_flags: u8,
    pub transaction_persistence_time: u16,
    pub nwk_protocol_version: u8,
    pub route_discovery_time: u8,
    pub route_expiry_time: u8,
    pub nwk_dev_address: u16,
    pub nwk_logical_channel: u8,
    pub nwk_coord_address: u16,
    pub nwk_coord_ext_address: Eui64,
    pub nwk_pan_id: u16,
    pub nwk_state: NwkState,
    pub channel_list: Channels,
    pub beacon_order: u8,
    pub super_frame_order: u8,
    pub scan_duration: u8,
    pub batt_life_ext: u8,
    pub allocated_router_addresses: u32,
    pub allocated_end_device_addresses: u32,
    pub node_depth: u8,
    pub extended_pan_id: Eui64,
    pub nwk_key_loaded: bool,
    pub spare1: NwkKeyDesc,
    pub spare2: NwkKeyDesc,
    pub spare3: u8,
    pub spare4: u8,
    pub nwk_link_status_period: u8,
    pub nwk_router_age_limit: u8,
    pub nwk_use_multi_cast: bool,
    pub nwk_is_concentrator: bool,
    pub nwk_concentrator_discovery_time: u8,
    pub nwk_concentrator_radius: u8,
    pub nwk_all_fresh: u8,
    pub nwk_manager_addr: u16,
    pub nwk_total_transmissions: u16,
    pub nwk_update_id: u8,
}

impl CStruct for Nib {
    const ALIGNMENT: usize = 4;
    const PADDING_BYTE: u8 = 0x00;

    fn write(&self, writer: &mut CWriter) {
        writer.write_u8(self.sequence_num);
        writer.write_u8(self.passive_ack_timeout);
        writer.write_u8(self.max_broadcast_retries);
        writer.write_u8(self.max_children);
        writer.write_u8(self.max_depth);
        writer.write_u8(self.max_routers);
        writer.write_u8(self.dummy_neighbor_table);
        writer.write_u8(self.broadcast_delivery_time);
        writer.write_u8(self.report_constant_cost);
        writer.write_u8(self.route_disc_retries);
        writer.write_u8(self.dummy_routing_table);
        writer.write_u8(self.secure_all_frames);
        writer.write_u8(self.security_level);
        writer.write_u8(self.sym_link);
        writer.write_u8(self.capability_flags);
        writer.write_u16(self.transaction_persistence_time);
        writer.write_u8(self.nwk_protocol_version);
        writer.write_u8(self.route_discovery_time);
        writer.write_u8(self.route_expiry_time);
        writer.write_u16(self.nwk_dev_address);
        writer.write_u8(self.nwk_logical_channel);
        writer.write_u16(self.nwk_coord_address);
        writer.write_bytes(&self.nwk_coord_ext_address.0);
        writer.write_u16(self.nwk_pan_id);
        writer.write_u8(self.nwk_state.as_u8());
        writer.write_u32(self.channel_list.bits());
        writer.write_u8(self.beacon_order);
        writer.write_u8(self.super_frame_order);
        writer.write_u8(self.scan_duration);
        writer.write_u8(self.batt_life_ext);
        writer.write_u32(self.allocated_router_addresses);
        writer.write_u32(self.allocated_end_device_addresses);
        writer.write_u8(self.node_depth);
        writer.write_bytes(&self.extended_pan_id.0);
        writer.write_u8(u8::from(self.nwk_key_loaded));
        self.spare1.write(writer);
        self.spare2.write(writer);
        writer.write_u8(self.spare3);
        writer.write_u8(self.spare4);
        writer.write_u8(self.nwk_link_status_period);
        writer.write_u8(self.nwk_router_age_limit);
        writer.write_u8(u8::from(self.nwk_use_multi_cast));
        writer.write_u8(u8::from(self.nwk_is_concentrator));
        writer.write_u8(self.nwk_concentrator_discovery_time);
        writer.write_u8(self.nwk_concentrator_radius);
        writer.write_u8(self.nwk_all_fresh);
        writer.write_u16(self.nwk_manager_addr);
        writer.write_u16(self.nwk_total_transmissions);
        writer.write_u8(self.nwk_update_id);
    }

    fn read(reader: &mut CReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            sequence_num: reader.read_u8()?,
            passive_ack_timeout: reader.read_u8()?,
            max_broadcast_retries: reader.read_u8()?,
            max_children: reader.read_u8()?,
            max_depth: reader.read_u8()?,
            max_routers: reader.read_u8()?,
            dummy_neighbor_table: reader.read_u8()?,
            broadcast_delivery_time: reader.read_u8()?,
            report_constant_cost: reader.read_u8()?,
            route_disc_retries: reader.read_u8()?,
            dummy_routing_table: reader.read_u8()?,
            secure_all_frames: reader.read_u8()?,
            security_level: reader.read_u8()?,
            sym_link: reader.read_u8()?,
            capability_flags: reader.read_u8()?,
            transaction_persistence_time: reader.read_u16()?,
            nwk_protocol_version: reader.read_u8()?,
            route_discovery_time: reader.read_u8()?,
            route_expiry_time: reader.read_u8()?,
            nwk_dev_address: reader.read_u16()?,
            nwk_logical_channel: reader.read_u8()?,
            nwk_coord_address: reader.read_u16()?,
            nwk_coord_ext_address: Eui64(reader.read_bytes()?),
            nwk_pan_id: reader.read_u16()?,
            nwk_state: NwkState::from_u8(reader.read_u8()?),
            channel_list: Channels::from_bits_retain(reader.read_u32()?),
            beacon_order: reader.read_u8()?,
            super_frame_order: reader.read_u8()?,
            scan_duration: reader.read_u8()?,
            batt_life_ext: reader.read_u8()?,
            allocated_router_addresses: reader.read_u32()?,
            allocated_end_device_addresses: reader.read_u32()?,
            node_depth: reader.read_u8()?,
            extended_pan_id: Eui64(reader.read_bytes()?),
            nwk_key_loaded: reader.read_u8()? != 0,
            spare1: NwkKeyDesc::read(reader)?,
            spare2: NwkKeyDesc::read(reader)?,
            spare3: reader.read_u8()?,
            spare4: reader.read_u8()?,
            nwk_link_status_period: reader.read_u8()?,
            nwk_router_age_limit: reader.read_u8()?,
            nwk_use_multi_cast: reader.read_u8()? != 0,
            nwk_is_concentrator: reader.read_u8()? != 0,
            nwk_concentrator_discovery_time: reader.read_u8()?,
            nwk_concentrator_radius: reader.read_u8()?,
            nwk_all_fresh: reader.read_u8()?,
            nwk_manager_addr: reader.read_u16()?,
            nwk_total_transmissions: reader.read_u16()?,
            nwk_update_id: reader.read_u8()?,
        })
    }
}

/// Hashed trust center link key entry
///
/// The key itself is never stored; it is derived from `TCLK_SEED` rotated
/// left by `seed_shift` and XORed with the doubled device IEEE address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TclkDevEntry {
    pub tx_frame_counter: u32,
    pub rx_frame_counter: u32,
    pub ext_addr: Eui64,
    pub key_attributes: KeyAttributes,
    pub key_type: KeyType,
    /// Seed shift for unique keys, NV index offset for install codes
    pub seed_shift_ic_index: u8,
}

impl CStruct for TclkDevEntry {
    const ALIGNMENT: usize = 4;
    const PADDING_BYTE: u8 = 0x00;

    fn write(&self, writer: &mut CWriter) {
        writer.write_u32(self.tx_frame_counter);
        writer.write_u32(self.rx_frame_counter);
        writer.write_bytes(&self.ext_addr.0);
        writer.write_u8(self.key_attributes.as_u8());
        writer.write_u8(self.key_type.as_u8());
        writer.write_u8(self.seed_shift_ic_index);
    }

    fn read(reader: &mut CReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            tx_frame_counter: reader.read_u32()?,
            rx_frame_counter: reader.read_u32()?,
            ext_addr: Eui64(reader.read_bytes()?),
            key_attributes: KeyAttributes::from_u8(reader.read_u8()?),
            key_type: KeyType::from_u8(reader.read_u8()?),
            seed_shift_ic_index: reader.read_u8()?,
        })
    }
}

/// One slot of the coprocessor's address manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrMgrEntry {
    pub user_type: AddrMgrUserType,
    pub nwk_addr: u16,
    pub ext_addr: Eui64,
}

impl CStruct for AddrMgrEntry {
    const ALIGNMENT: usize = 2;

    fn write(&self, writer: &mut CWriter) {
        writer.write_u8(self.user_type.bits());
        writer.write_u16(self.nwk_addr);
        writer.write_bytes(&self.ext_addr.0);
    }

    fn read(reader: &mut CReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            user_type: AddrMgrUserType::from_bits_retain(reader.read_u8()?),
            nwk_addr: reader.read_u16()?,
            ext_addr: Eui64(reader.read_bytes()?),
        })
    }
}

/// Raw APS link key material for keys that are not seed-derivable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApsKeyDataTableEntry {
    pub key: KeyData,
    pub tx_frame_counter: u32,
    pub rx_frame_counter: u32,
}

impl CStruct for ApsKeyDataTableEntry {
    const ALIGNMENT: usize = 4;

    fn write(&self, writer: &mut CWriter) {
        writer.write_bytes(&self.key.0);
        writer.write_u32(self.tx_frame_counter);
        writer.write_u32(self.rx_frame_counter);
    }

    fn read(reader: &mut CReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            key: KeyData(reader.read_bytes()?),
            tx_frame_counter: reader.read_u32()?,
            rx_frame_counter: reader.read_u32()?,
        })
    }
}

/// Pointer entry tying an address manager slot to raw key material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApsLinkKeyTableEntry {
    pub addr_mgr_index: u16,
    pub link_key_nv_id: u16,
    pub authentication_state: AuthenticationOption,
}

impl CStruct for ApsLinkKeyTableEntry {
    const ALIGNMENT: usize = 2;

    fn write(&self, writer: &mut CWriter) {
        writer.write_u16(self.addr_mgr_index);
        writer.write_u16(self.link_key_nv_id);
        writer.write_u8(self.authentication_state.as_u8());
    }

    fn read(reader: &mut CReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            addr_mgr_index: reader.read_u16()?,
            link_key_nv_id: reader.read_u16()?,
            authentication_state: AuthenticationOption::from_u8(reader.read_u8()?),
        })
    }
}

/// Frame counter for one network's security material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NwkSecMaterialDesc {
    pub frame_counter: u32,
    pub extended_pan_id: Eui64,
}

impl CStruct for NwkSecMaterialDesc {
    const ALIGNMENT: usize = 4;

    fn write(&self, writer: &mut CWriter) {
        writer.write_u32(self.frame_counter);
        writer.write_bytes(&self.extended_pan_id.0);
    }

    fn read(reader: &mut CReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            frame_counter: reader.read_u32()?,
            extended_pan_id: Eui64(reader.read_bytes()?),
        })
    }
}

/// Parse the `APS_LINK_KEY_TABLE` NV item
///
/// The table is prefixed by a `u16` entry count and has a static capacity,
/// so live entries are followed by junk that must be tolerated. Entries are
/// packed on every platform.
pub fn decode_aps_link_key_table(
    data: &[u8],
) -> Result<Vec<ApsLinkKeyTableEntry>, DecodeError> {
    let mut buf = data;
    let count = u16::decode(&mut buf)? as usize;

    let mut entries = Vec::with_capacity(count);
    let mut reader = CReader::new(buf, crate::cstruct::Alignment::Unaligned);
    for _ in 0..count {
        entries.push(ApsLinkKeyTableEntry::read(&mut reader)?);
    }
    Ok(entries)
}

/// Serialize the `APS_LINK_KEY_TABLE` NV item without its trailing junk
pub fn encode_aps_link_key_table(entries: &[ApsLinkKeyTableEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    (entries.len() as u16).encode(&mut buf);

    let mut writer = CWriter::new(crate::cstruct::Alignment::Unaligned, 0xFF);
    for entry in entries {
        entry.write(&mut writer);
    }
    buf.extend(writer.finish(1));
    buf
}

/// `associated_devices_t` returned by the UTIL association proxies, always
/// packed in the MT payload (18 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssocDevice {
    pub short_addr: u16,
    pub addr_idx: u16,
    pub node_relation: NodeRelation,
    pub dev_status: u8,
    pub assoc_cnt: u8,
    pub age: u8,
    pub tx_counter: u8,
    pub tx_cost: u8,
    pub rx_lqi: u8,
    pub in_key_seq_num: u8,
    pub in_frm_cntr: u32,
    pub tx_failure: u16,
}

impl AssocDevice {
    /// Slot is unused when the short address is the invalid marker
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.short_addr == 0xFFFF
    }
}

impl Codec for AssocDevice {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.short_addr.encode(buf);
        self.addr_idx.encode(buf);
        self.node_relation.encode(buf);
        self.dev_status.encode(buf);
        self.assoc_cnt.encode(buf);
        self.age.encode(buf);
        self.tx_counter.encode(buf);
        self.tx_cost.encode(buf);
        self.rx_lqi.encode(buf);
        self.in_key_seq_num.encode(buf);
        self.in_frm_cntr.encode(buf);
        self.tx_failure.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            short_addr: u16::decode(buf)?,
            addr_idx: u16::decode(buf)?,
            node_relation: NodeRelation::decode(buf)?,
            dev_status: u8::decode(buf)?,
            assoc_cnt: u8::decode(buf)?,
            age: u8::decode(buf)?,
            tx_counter: u8::decode(buf)?,
            tx_cost: u8::decode(buf)?,
            rx_lqi: u8::decode(buf)?,
            in_key_seq_num: u8::decode(buf)?,
            in_frm_cntr: u32::decode(buf)?,
            tx_failure: u16::decode(buf)?,
        })
    }
}
