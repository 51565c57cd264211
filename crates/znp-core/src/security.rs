//! Security store access for network backup and restore
//!
//! Hashed trust center link keys are not stored per device: the firmware
//! keeps one 16-byte seed and derives each key as
//! `rotate_left(seed, shift) XOR (ieee ‖ ieee)`. Unhashed keys live
//! verbatim in the APS key data table, cross-indexed through the APS link
//! key table and the address manager.

use serde::{Deserialize, Serialize};

use znp_protocol::nvids::{ExNvId, OsalNvId};
use znp_protocol::structs::{
    decode_aps_link_key_table, encode_aps_link_key_table, AddrMgrEntry,
    ApsKeyDataTableEntry, ApsLinkKeyTableEntry, NwkActiveKeyItems, NwkSecMaterialDesc,
    TclkDevEntry,
};
use znp_protocol::types::{
    AddrMgrUserType, AuthenticationOption, Eui64, KeyAttributes, KeyData, KeyType,
};

use crate::error::ControllerError;
use crate::network::{FirmwareGeneration, NetworkInfo};
use crate::nvram::Nvram;
use crate::serde_hex;

/// Safety margin added to frame counters on restore so post-restore
/// transmissions are accepted as fresh
pub const TC_COUNTER_INCREMENT: u32 = 2500;

/// Largest NWK address that can belong to a real device
const LAST_UNICAST_NWK: u16 = 0xFFF7;

const EMPTY_ADDR_MGR_ENTRY: AddrMgrEntry = AddrMgrEntry {
    user_type: AddrMgrUserType::from_bits_retain(0xFF),
    nwk_addr: 0xFFFF,
    ext_addr: Eui64::BROADCAST,
};

/// One neighbor with its address and key material, as carried in a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDevice {
    #[serde(with = "serde_hex::eui64")]
    pub ieee: Eui64,
    pub nwk: u16,

    /// Seed rotation for hashed link keys
    #[serde(default)]
    pub hashed_link_key_shift: Option<u8>,
    #[serde(with = "serde_hex::opt_key_data", default)]
    pub aps_link_key: Option<KeyData>,

    pub tx_counter: u32,
    pub rx_counter: u32,
}

/// Complete network state document for backup and restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBackup {
    pub network: NetworkInfo,
    pub tc_frame_counter: u32,
    #[serde(with = "serde_hex::opt_key_data", default)]
    pub tclk_seed: Option<KeyData>,
    pub devices: Vec<StoredDevice>,
}

fn rotate_left(data: &[u8; 16], n: usize) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = data[(i + n) % 16];
    }
    out
}

fn xor_doubled_ieee(data: &[u8; 16], ieee: Eui64) -> [u8; 16] {
    let mut out = *data;
    for (i, byte) in out.iter_mut().enumerate() {
        *byte ^= ieee.0[i % 8];
    }
    out
}

/// Derive a device's link key from the seed and its shift
#[must_use]
pub fn compute_key(ieee: Eui64, seed: KeyData, shift: u8) -> KeyData {
    KeyData(xor_doubled_ieee(&rotate_left(&seed.0, shift as usize), ieee))
}

/// Recover the seed that a (ieee, key) pair was derived from with the
/// given shift
#[must_use]
pub fn compute_tclk_seed(ieee: Eui64, key: KeyData, shift: u8) -> KeyData {
    let unrotated = xor_doubled_ieee(&key.0, ieee);
    KeyData(rotate_left(&unrotated, (16 - shift as usize % 16) % 16))
}

/// Find the shift under which the key is a rotation of the seed
#[must_use]
pub fn find_key_shift(ieee: Eui64, key: KeyData, seed: KeyData) -> Option<u8> {
    (0x00..=0x0F).find(|&shift| seed == compute_tclk_seed(ieee, key, shift))
}

/// Count how many keys are expressible as rotations of the seed
#[must_use]
pub fn count_seed_matches(pairs: &[(Eui64, KeyData)], seed: KeyData) -> usize {
    pairs
        .iter()
        .filter(|(ieee, key)| find_key_shift(*ieee, *key, seed).is_some())
        .count()
}

/// Pick the seed that maximizes the number of derivable keys, preferring
/// the provided seed on ties
///
/// All rotations of a seed are equivalent, so each pair's zero-shift seed
/// is a sufficient candidate set.
#[must_use]
pub fn select_tclk_seed(
    pairs: &[(Eui64, KeyData)],
    provided: Option<KeyData>,
) -> Option<KeyData> {
    let Some(best) = pairs
        .iter()
        .map(|(ieee, key)| compute_tclk_seed(*ieee, *key, 0))
        .map(|candidate| (count_seed_matches(pairs, candidate), candidate))
        .max_by_key(|(count, _)| *count)
    else {
        return provided;
    };

    if let Some(provided) = provided {
        let provided_count = count_seed_matches(pairs, provided);
        if provided_count >= best.0 {
            return Some(provided);
        }
        tracing::warn!(
            provided = provided_count,
            computed = best.0,
            "provided TCLK seed derives fewer keys than the computed one"
        );
    }

    Some(best.1)
}

/// Read the address manager, whose location differs by generation
pub async fn read_addr_mgr_entries(
    nvram: &Nvram,
    generation: FirmwareGeneration,
) -> Result<Vec<AddrMgrEntry>, ControllerError> {
    if generation.has_extended_nvram() {
        let rows = nvram.read_table(ExNvId::AddrMgr).await?;
        rows.iter().map(|row| nvram.decode_struct(row)).collect()
    } else {
        // One bare array whose size is a firmware compile-time constant
        let raw = nvram.osal_read(OsalNvId::AddrMgr).await?;
        nvram.decode_structs(&raw)
    }
}

async fn read_tclk_entries(
    nvram: &Nvram,
    generation: FirmwareGeneration,
) -> Result<Vec<TclkDevEntry>, ControllerError> {
    let rows = if generation.has_extended_nvram() {
        nvram.read_table(ExNvId::TclkTable).await?
    } else {
        nvram
            .osal_read_table(OsalNvId::LegacyTclkTableStart, OsalNvId::LegacyTclkTableEnd)
            .await?
    };
    rows.iter().map(|row| nvram.decode_struct(row)).collect()
}

/// Unhashed keys: `(ieee, tx counter, rx counter, key)` tuples
async fn read_unhashed_link_keys(
    nvram: &Nvram,
    generation: FirmwareGeneration,
    addr_mgr: &[AddrMgrEntry],
) -> Result<Vec<(Eui64, u32, u32, KeyData)>, ControllerError> {
    let (base, rows) = if generation.has_extended_nvram() {
        (0u16, nvram.read_table(ExNvId::ApsKeyDataTable).await)
    } else {
        (
            OsalNvId::LegacyApsLinkKeyDataStart.id(),
            nvram
                .osal_read_table(
                    OsalNvId::LegacyApsLinkKeyDataStart,
                    OsalNvId::LegacyApsLinkKeyDataEnd,
                )
                .await,
        )
    };

    let rows = match rows {
        Ok(rows) => rows,
        // Z-Stack Home 1.2 refuses to read this data out at all
        Err(ControllerError::Security { .. }) => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };

    let key_data: Vec<ApsKeyDataTableEntry> = rows
        .iter()
        .map(|row| nvram.decode_struct(row))
        .collect::<Result<_, _>>()?;

    // The link key table has a static capacity, so live entries are
    // followed by junk
    let table_raw = nvram.osal_read(OsalNvId::ApsLinkKeyTable).await?;
    let table = decode_aps_link_key_table(&table_raw)?;
    tracing::debug!(entries = table.len(), "read APS link key table");

    let mut keys = Vec::new();
    for entry in table {
        if entry.authentication_state != AuthenticationOption::AuthenticatedCbkc {
            continue;
        }

        let key_index = entry.link_key_nv_id.wrapping_sub(base) as usize;
        let (Some(key_entry), Some(addr_entry)) = (
            key_data.get(key_index),
            addr_mgr.get(entry.addr_mgr_index as usize),
        ) else {
            tracing::warn!(?entry, "APS link key entry points outside its tables");
            continue;
        };

        if !addr_entry.user_type.contains(AddrMgrUserType::SECURITY) {
            tracing::warn!(?entry, "APS link key entry for a non-security device");
            continue;
        }

        keys.push((
            addr_entry.ext_addr,
            key_entry.tx_frame_counter,
            key_entry.rx_frame_counter,
            key_entry.key,
        ));
    }

    Ok(keys)
}

/// Enumerate every joined device together with its key material
pub async fn read_devices(
    nvram: &Nvram,
    generation: FirmwareGeneration,
) -> Result<(Option<KeyData>, Vec<StoredDevice>), ControllerError> {
    let tclk_seed = if generation > FirmwareGeneration::ZStack12 {
        let raw = nvram.osal_read(OsalNvId::TclkSeed).await?;
        Some(KeyData(raw.as_slice().try_into().map_err(|_| {
            ControllerError::InvalidNvData(znp_protocol::codec::DecodeError::Truncated {
                needed: 16,
                actual: raw.len(),
            })
        })?))
    } else {
        None
    };

    let addr_mgr = read_addr_mgr_entries(nvram, generation).await?;
    let mut devices: Vec<StoredDevice> = Vec::new();

    for entry in &addr_mgr {
        if entry.ext_addr == Eui64::ZERO || entry.ext_addr == Eui64::BROADCAST {
            continue;
        }
        if entry.user_type.bits() == 0 {
            // Default entries are placeholders
            continue;
        }
        if !entry
            .user_type
            .intersects(AddrMgrUserType::ASSOC | AddrMgrUserType::SECURITY)
        {
            tracing::warn!(?entry, "ignoring address manager entry of unexpected type");
            continue;
        }
        if entry.nwk_addr > LAST_UNICAST_NWK {
            tracing::warn!(?entry, "ignoring invalid address manager entry");
            continue;
        }

        devices.push(StoredDevice {
            ieee: entry.ext_addr,
            nwk: entry.nwk_addr,
            hashed_link_key_shift: None,
            aps_link_key: None,
            tx_counter: 0,
            rx_counter: 0,
        });
    }

    if let Some(seed) = tclk_seed {
        for entry in read_tclk_entries(nvram, generation).await? {
            if entry.ext_addr == Eui64::ZERO {
                continue;
            }

            let key = compute_key(entry.ext_addr, seed, entry.seed_shift_ic_index);
            let Some(device) = devices.iter_mut().find(|d| d.ieee == entry.ext_addr)
            else {
                tracing::warn!(
                    ieee = %entry.ext_addr,
                    "skipping hashed link key for an unknown device"
                );
                continue;
            };

            device.tx_counter = entry.tx_frame_counter;
            device.rx_counter = entry.rx_frame_counter;
            device.aps_link_key = Some(key);
            device.hashed_link_key_shift = Some(entry.seed_shift_ic_index);
        }
    }

    for (ieee, tx, rx, key) in
        read_unhashed_link_keys(nvram, generation, &addr_mgr).await?
    {
        let Some(device) = devices.iter_mut().find(|d| d.ieee == ieee) else {
            tracing::warn!(%ieee, "skipping unhashed link key for an unknown device");
            continue;
        };

        device.tx_counter = tx;
        device.rx_counter = rx;
        device.aps_link_key = Some(key);
        device.hashed_link_key_shift = None;
    }

    Ok((tclk_seed, devices))
}

async fn write_addr_mgr_entries(
    nvram: &Nvram,
    generation: FirmwareGeneration,
    devices: &[StoredDevice],
) -> Result<(), ControllerError> {
    let entries: Vec<AddrMgrEntry> = devices
        .iter()
        .map(|device| AddrMgrEntry {
            user_type: if device.aps_link_key.is_some() {
                AddrMgrUserType::SECURITY
            } else {
                AddrMgrUserType::ASSOC
            },
            nwk_addr: device.nwk,
            ext_addr: device.ieee,
        })
        .collect();

    if generation.has_extended_nvram() {
        let rows: Vec<Vec<u8>> =
            entries.iter().map(|e| nvram.encode_struct(e)).collect();
        return nvram
            .write_table(
                ExNvId::AddrMgr,
                &rows,
                &nvram.encode_struct(&EMPTY_ADDR_MGR_ENTRY),
            )
            .await;
    }

    // On older firmware the table is one array of fixed, compile-time size
    let old = nvram.osal_read(OsalNvId::AddrMgr).await?;
    let capacity = nvram.decode_structs::<AddrMgrEntry>(&old)?.len();
    if entries.len() > capacity {
        return Err(ControllerError::TableOverflow {
            count: entries.len(),
            capacity,
        });
    }

    let mut full = entries;
    full.resize(capacity, EMPTY_ADDR_MGR_ENTRY);
    nvram
        .osal_write(OsalNvId::AddrMgr, &nvram.encode_structs(&full), false)
        .await
}

/// Write the device and key tables for a restore
///
/// The seed that derives the most keys wins, preferring the provided seed
/// on ties; keys no rotation can express are written verbatim to the APS
/// key data table. Frame counters advance by `counter_increment`.
pub async fn write_devices(
    nvram: &Nvram,
    generation: FirmwareGeneration,
    devices: &[StoredDevice],
    counter_increment: u32,
    provided_seed: Option<KeyData>,
) -> Result<Option<KeyData>, ControllerError> {
    let pairs: Vec<(Eui64, KeyData)> = devices
        .iter()
        .filter_map(|d| d.aps_link_key.map(|key| (d.ieee, key)))
        .collect();
    let tclk_seed = select_tclk_seed(&pairs, provided_seed);

    let mut hashed = Vec::new();
    let mut aps_key_data: Vec<ApsKeyDataTableEntry> = Vec::new();
    let mut link_key_table = Vec::new();

    let link_key_base = if generation.has_extended_nvram() {
        0u16
    } else {
        OsalNvId::LegacyApsLinkKeyDataStart.id()
    };

    for (index, device) in devices.iter().enumerate() {
        let Some(key) = device.aps_link_key else {
            continue;
        };

        let shift = tclk_seed.and_then(|seed| find_key_shift(device.ieee, key, seed));
        if let Some(shift) = shift {
            hashed.push(TclkDevEntry {
                tx_frame_counter: device.tx_counter + counter_increment,
                rx_frame_counter: device.rx_counter,
                ext_addr: device.ieee,
                key_attributes: KeyAttributes::VerifiedKey,
                key_type: KeyType::None,
                seed_shift_ic_index: shift,
            });
        } else {
            aps_key_data.push(ApsKeyDataTableEntry {
                key,
                tx_frame_counter: device.tx_counter + counter_increment,
                rx_frame_counter: device.rx_counter,
            });

            link_key_table.push(ApsLinkKeyTableEntry {
                addr_mgr_index: index as u16,
                link_key_nv_id: link_key_base + (aps_key_data.len() - 1) as u16,
                authentication_state: AuthenticationOption::AuthenticatedCbkc,
            });
        }
    }

    // The new link key table must stay the size of the old one; the count
    // prefix tracks live entries but the capacity is static
    let old_table = nvram.osal_read(OsalNvId::ApsLinkKeyTable).await?;
    let mut new_table = encode_aps_link_key_table(&link_key_table);
    if new_table.len() > old_table.len() {
        return Err(ControllerError::TableOverflow {
            count: link_key_table.len(),
            capacity: (old_table.len().saturating_sub(2)) / 5,
        });
    }
    new_table.resize(old_table.len(), 0x00);

    write_addr_mgr_entries(nvram, generation, devices).await?;
    nvram
        .osal_write(OsalNvId::ApsLinkKeyTable, &new_table, false)
        .await?;

    if let Some(seed) = tclk_seed {
        nvram.osal_write(OsalNvId::TclkSeed, &seed.0, true).await?;
    }

    let tclk_fill = TclkDevEntry {
        tx_frame_counter: 0,
        rx_frame_counter: 0,
        ext_addr: Eui64::ZERO,
        key_attributes: KeyAttributes::DefaultKey,
        key_type: KeyType::None,
        seed_shift_ic_index: 0,
    };
    let aps_key_fill = ApsKeyDataTableEntry {
        key: KeyData([0x00; 16]),
        tx_frame_counter: 0,
        rx_frame_counter: 0,
    };

    let hashed_rows: Vec<Vec<u8>> =
        hashed.iter().map(|e| nvram.encode_struct(e)).collect();
    let key_rows: Vec<Vec<u8>> =
        aps_key_data.iter().map(|e| nvram.encode_struct(e)).collect();

    if generation.has_extended_nvram() {
        nvram
            .write_table(
                ExNvId::TclkTable,
                &hashed_rows,
                &nvram.encode_struct(&tclk_fill),
            )
            .await?;
        nvram
            .write_table(
                ExNvId::ApsKeyDataTable,
                &key_rows,
                &nvram.encode_struct(&aps_key_fill),
            )
            .await?;
    } else {
        nvram
            .osal_write_table(
                OsalNvId::LegacyTclkTableStart,
                OsalNvId::LegacyTclkTableEnd,
                &hashed_rows,
                &nvram.encode_struct(&tclk_fill),
            )
            .await?;
        nvram
            .osal_write_table(
                OsalNvId::LegacyApsLinkKeyDataStart,
                OsalNvId::LegacyApsLinkKeyDataEnd,
                &key_rows,
                &nvram.encode_struct(&aps_key_fill),
            )
            .await?;
    }

    Ok(tclk_seed)
}

/// Read the trust center frame counter; its location moved twice across
/// firmware generations
pub async fn read_tc_frame_counter(
    nvram: &Nvram,
    generation: FirmwareGeneration,
    network: &NetworkInfo,
) -> Result<u32, ControllerError> {
    if generation == FirmwareGeneration::ZStack12 {
        let raw = nvram.osal_read(OsalNvId::NwkKey).await?;
        let key_info: NwkActiveKeyItems = nvram.decode_struct(&raw)?;
        return Ok(key_info.frame_counter);
    }

    let rows = if generation.has_extended_nvram() {
        nvram.read_table(ExNvId::NwkSecMaterialTable).await?
    } else {
        nvram
            .osal_read_table(
                OsalNvId::LegacyNwkSecMaterialTableStart,
                OsalNvId::LegacyNwkSecMaterialTableEnd,
            )
            .await?
    };

    let mut global_entry = None;
    for row in &rows {
        let entry: NwkSecMaterialDesc = nvram.decode_struct(row)?;
        if entry.extended_pan_id == network.extended_pan_id {
            // The entry for the live network always wins
            return Ok(entry.frame_counter);
        }
        if entry.extended_pan_id == Eui64::BROADCAST {
            global_entry = Some(entry);
        }
    }

    global_entry
        .map(|entry| entry.frame_counter)
        .ok_or(ControllerError::NoSecurityMaterial)
}

/// Write the trust center frame counter for the live network
pub async fn write_tc_frame_counter(
    nvram: &Nvram,
    generation: FirmwareGeneration,
    network: &NetworkInfo,
    counter: u32,
) -> Result<(), ControllerError> {
    if generation == FirmwareGeneration::ZStack12 {
        let raw = nvram.osal_read(OsalNvId::NwkKey).await?;
        let mut key_info: NwkActiveKeyItems = nvram.decode_struct(&raw)?;
        key_info.frame_counter = counter;
        return nvram
            .osal_write(OsalNvId::NwkKey, &nvram.encode_struct(&key_info), false)
            .await;
    }

    let entry = NwkSecMaterialDesc {
        frame_counter: counter,
        extended_pan_id: network.extended_pan_id,
    };
    let fill = NwkSecMaterialDesc {
        frame_counter: 0,
        extended_pan_id: Eui64::ZERO,
    };

    // The material tables hold a handful of entries; rewriting them whole
    // is simpler than patching one slot
    let rows = vec![nvram.encode_struct(&entry)];
    if generation.has_extended_nvram() {
        nvram
            .write_table(ExNvId::NwkSecMaterialTable, &rows, &nvram.encode_struct(&fill))
            .await
    } else {
        nvram
            .osal_write_table(
                OsalNvId::LegacyNwkSecMaterialTableStart,
                OsalNvId::LegacyNwkSecMaterialTableEnd,
                &rows,
                &nvram.encode_struct(&fill),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ieee(tail: u8) -> Eui64 {
        Eui64([tail, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
    }

    #[test]
    fn test_rotate_left() {
        let mut data = [0u8; 16];
        data[0] = 0xAA;
        data[1] = 0xBB;

        let rotated = rotate_left(&data, 1);
        assert_eq!(rotated[0], 0xBB);
        assert_eq!(rotated[15], 0xAA);

        assert_eq!(rotate_left(&data, 0), data);
        assert_eq!(rotate_left(&data, 16), data);
    }

    #[test]
    fn test_key_derivation_roundtrip() {
        let seed = KeyData([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB,
            0xCC, 0xDD, 0xEE, 0xFF,
        ]);

        for shift in 0..=15u8 {
            let key = compute_key(ieee(0x01), seed, shift);
            assert_eq!(compute_tclk_seed(ieee(0x01), key, shift), seed);
            assert_eq!(find_key_shift(ieee(0x01), key, seed), Some(shift));
        }
    }

    #[test]
    fn test_seed_recovery_from_derived_keys() {
        let seed = KeyData([0x5A; 16]);
        let shifts = [3u8, 7, 0, 15];
        let pairs: Vec<(Eui64, KeyData)> = shifts
            .iter()
            .enumerate()
            .map(|(i, &shift)| {
                let addr = ieee(i as u8 + 1);
                (addr, compute_key(addr, seed, shift))
            })
            .collect();

        let recovered = select_tclk_seed(&pairs, None).unwrap();

        // Every key must be derivable from the recovered seed with the
        // correct shift, up to rotation equivalence of the seed itself
        assert_eq!(count_seed_matches(&pairs, recovered), pairs.len());
        for ((addr, key), &_shift) in pairs.iter().zip(&shifts) {
            let shift = find_key_shift(*addr, *key, recovered).unwrap();
            assert_eq!(compute_key(*addr, recovered, shift), *key);
        }
    }

    #[test]
    fn test_provided_seed_wins_ties() {
        let seed = KeyData([0x13; 16]);
        let pairs = vec![(ieee(1), compute_key(ieee(1), seed, 4))];

        // Any rotation of the seed derives the same single key, so the
        // provided seed ties with the computed candidate and is kept
        let chosen = select_tclk_seed(&pairs, Some(seed)).unwrap();
        assert_eq!(chosen, seed);
    }

    #[test]
    fn test_unrelated_keys_share_no_seed() {
        let seed_a = KeyData([0x01; 16]);
        let seed_b = KeyData([
            0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE, 0x01, 0x23, 0x45, 0x67,
            0x89, 0xAB, 0xCD, 0xEF,
        ]);
        let pairs = vec![
            (ieee(1), compute_key(ieee(1), seed_a, 0)),
            (ieee(2), compute_key(ieee(2), seed_b, 5)),
        ];

        let chosen = select_tclk_seed(&pairs, None).unwrap();
        assert_eq!(count_seed_matches(&pairs, chosen), 1);
    }
}
