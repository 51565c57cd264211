//! Network state: firmware generation detection, NIB access and repair

use serde::{Deserialize, Serialize};

use znp_protocol::cstruct::{struct_from_bytes, Alignment};
use znp_protocol::nvids::{ExNvId, OsalNvId};
use znp_protocol::structs::{Nib, NwkKeyDesc, TclkDevEntry};
use znp_protocol::types::{Channels, Eui64, KeyData, MtCapabilities, ProtocolError};

use crate::error::ControllerError;
use crate::nvram::Nvram;
use crate::serde_hex;

/// Major Z-Stack generation, feature-detected at startup
///
/// The generations differ in NVRAM layout (struct alignment, extended id
/// space), TX power response encoding and concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FirmwareGeneration {
    ZStack12,
    ZStack30,
    ZStack330,
}

impl FirmwareGeneration {
    /// Struct layout flavor used by this generation
    #[must_use]
    pub fn alignment(self) -> Alignment {
        match self {
            Self::ZStack12 | Self::ZStack30 => Alignment::Unaligned,
            Self::ZStack330 => Alignment::Aligned,
        }
    }

    /// Whether the extended NV id space exists
    #[must_use]
    pub fn has_extended_nvram(self) -> bool {
        self == Self::ZStack330
    }
}

impl std::fmt::Display for FirmwareGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZStack12 => write!(f, "Z-Stack 1.2"),
            Self::ZStack30 => write!(f, "Z-Stack 3.0"),
            Self::ZStack330 => write!(f, "Z-Stack 3.30+"),
        }
    }
}

/// Low-level network identity loaded from NVRAM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(with = "serde_hex::eui64")]
    pub ieee: Eui64,
    pub nwk: u16,
    pub channel: u8,
    #[serde(with = "serde_hex::channels")]
    pub channel_mask: Channels,
    pub pan_id: u16,
    #[serde(with = "serde_hex::eui64")]
    pub extended_pan_id: Eui64,
    pub nwk_update_id: u8,
    pub security_level: u8,
    #[serde(with = "serde_hex::key_data")]
    pub network_key: KeyData,
    pub network_key_seq: u8,
}

/// Feature-detect the firmware generation
///
/// Z-Stack 1.2 lacks the APP_CNF subsystem entirely. 3.0 and 3.30+ are told
/// apart by probing the extended NV space: 3.0 answers an extended read
/// with `CommandNotRecognized`.
pub async fn detect_firmware(
    nvram: &Nvram,
    capabilities: MtCapabilities,
) -> Result<FirmwareGeneration, ControllerError> {
    if !capabilities.contains(MtCapabilities::APP_CNF) {
        return Ok(FirmwareGeneration::ZStack12);
    }

    match nvram.read(ExNvId::TclkTable, 0x0000).await {
        Ok(_) | Err(ControllerError::NvramMissing { .. }) => Ok(FirmwareGeneration::ZStack330),
        Err(ControllerError::Protocol(ProtocolError::CommandNotRecognized { .. })) => {
            Ok(FirmwareGeneration::ZStack30)
        }
        Err(error) => Err(error),
    }
}

/// Load the network identity from the NIB and the active key
///
/// Fails with [`ControllerError::NotOnNetwork`] when the device has not
/// formed or joined a network.
pub async fn load_network_info(
    nvram: &Nvram,
    generation: FirmwareGeneration,
) -> Result<NetworkInfo, ControllerError> {
    if generation != FirmwareGeneration::ZStack12 {
        // Advisory only; the NIB is what actually decides below
        match nvram.osal_read(OsalNvId::BdbNodeIsOnANetwork).await {
            Ok(data) => {
                tracing::debug!(
                    on_network = (data.first() == Some(&1)),
                    "BDB network membership flag"
                );
            }
            Err(ControllerError::NvramMissing { .. }) => {}
            Err(error) => return Err(error),
        }
    }

    let nib: Nib = match nvram.osal_read(OsalNvId::Nib).await {
        Ok(data) => nvram.decode_struct(&data)?,
        Err(ControllerError::NvramMissing { .. }) => return Err(ControllerError::NotOnNetwork),
        Err(error) => return Err(error),
    };

    if nib.nwk_logical_channel == 0 || !nib.nwk_key_loaded {
        return Err(ControllerError::NotOnNetwork);
    }

    let ieee_raw = nvram.osal_read(OsalNvId::ExtAddr).await?;
    let ieee = Eui64(
        ieee_raw
            .as_slice()
            .try_into()
            .map_err(|_| ControllerError::NotOnNetwork)?,
    );

    let key_raw = nvram.osal_read(OsalNvId::NwkActiveKeyInfo).await?;
    let key_desc: NwkKeyDesc = nvram.decode_struct(&key_raw)?;

    Ok(NetworkInfo {
        ieee,
        nwk: nib.nwk_dev_address,
        channel: nib.nwk_logical_channel,
        channel_mask: nib.channel_list,
        pan_id: nib.nwk_pan_id,
        extended_pan_id: nib.extended_pan_id,
        nwk_update_id: nib.nwk_update_id,
        security_level: nib.security_level,
        network_key: key_desc.key,
        network_key_seq: key_desc.key_seq_num,
    })
}

/// Repair NVRAM written with broken alignment
///
/// Some coordinators ship with a NIB that is a few bytes short and TCLK
/// table rows missing their tail padding. Both must be corrected before
/// the structs can be used.
pub async fn fix_misaligned_nvram(
    nvram: &Nvram,
    generation: FirmwareGeneration,
) -> Result<(), ControllerError> {
    if generation != FirmwareGeneration::ZStack330 {
        return Ok(());
    }

    match nvram.osal_read(OsalNvId::Nib).await {
        Err(ControllerError::NvramMissing { .. }) => {}
        Err(error) => return Err(error),
        Ok(data) => {
            if struct_from_bytes::<Nib>(&data, Alignment::Aligned).is_err() {
                tracing::warn!("correcting invalid NIB alignment");

                let mut padded = data;
                padded.extend_from_slice(&[0xFF; 6]);
                let mut nib: Nib = nvram.decode_struct(&padded)?;

                if nib.nwk_update_id == 0xFF {
                    nib.nwk_update_id = 0;
                }
                nvram
                    .osal_write(OsalNvId::Nib, &nvram.encode_struct(&nib), true)
                    .await?;
            }
        }
    }

    let rows = nvram.read_table(ExNvId::TclkTable).await?;
    for (sub_id, data) in rows.into_iter().enumerate() {
        if struct_from_bytes::<TclkDevEntry>(&data, Alignment::Aligned).is_ok() {
            continue;
        }

        tracing::warn!(sub_id, "correcting misaligned TCLK table row");
        let mut padded = data;
        padded.push(0x00);
        let entry: TclkDevEntry = nvram.decode_struct(&padded)?;

        nvram
            .write(
                ExNvId::TclkTable,
                sub_id as u16,
                &nvram.encode_struct(&entry),
                true,
            )
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_ordering() {
        assert!(FirmwareGeneration::ZStack12 < FirmwareGeneration::ZStack30);
        assert!(FirmwareGeneration::ZStack30 < FirmwareGeneration::ZStack330);
        assert_eq!(
            FirmwareGeneration::ZStack330.alignment(),
            Alignment::Aligned
        );
        assert_eq!(
            FirmwareGeneration::ZStack30.alignment(),
            Alignment::Unaligned
        );
    }

    #[test]
    fn test_network_info_serde_roundtrip() {
        let info = NetworkInfo {
            ieee: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
            nwk: 0x0000,
            channel: 15,
            channel_mask: Channels::from_channel_list([15]),
            pan_id: 0xA162,
            extended_pan_id: Eui64([0xDD; 8]),
            nwk_update_id: 0,
            security_level: 5,
            network_key: KeyData([0x42; 16]),
            network_key_seq: 0,
        };

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"0807060504030201\""));
        assert_eq!(serde_json::from_str::<NetworkInfo>(&json).unwrap(), info);
    }
}
