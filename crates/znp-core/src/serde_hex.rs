//! Hex encodings for the backup document
//!
//! Keys and addresses are stored as hex strings so backups stay readable
//! and diffable.

use serde::{Deserialize, Deserializer, Serializer};
use znp_protocol::types::{Eui64, KeyData};

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn from_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("odd-length hex string: {s:?}"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| format!("invalid hex string: {s:?}"))
        })
        .collect()
}

fn array_from_hex<const N: usize>(s: &str) -> Result<[u8; N], String> {
    let bytes = from_hex(s)?;
    bytes
        .try_into()
        .map_err(|_| format!("expected {N} bytes of hex"))
}

pub(crate) mod key_data {
    use super::*;

    pub fn serialize<S: Serializer>(key: &KeyData, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_hex(&key.0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<KeyData, D::Error> {
        let s = String::deserialize(deserializer)?;
        array_from_hex(&s)
            .map(KeyData)
            .map_err(serde::de::Error::custom)
    }
}

pub(crate) mod opt_key_data {
    use super::*;

    pub fn serialize<S: Serializer>(
        key: &Option<KeyData>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => serializer.serialize_some(&to_hex(&key.0)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<KeyData>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| {
            array_from_hex(&s)
                .map(KeyData)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

pub(crate) mod eui64 {
    use super::*;

    pub fn serialize<S: Serializer>(ieee: &Eui64, serializer: S) -> Result<S::Ok, S::Error> {
        // Big-endian hex, matching the Display form without separators
        let reversed: Vec<u8> = ieee.0.iter().rev().copied().collect();
        serializer.serialize_str(&to_hex(&reversed))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Eui64, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut bytes: [u8; 8] =
            array_from_hex(&s.replace(':', "")).map_err(serde::de::Error::custom)?;
        bytes.reverse();
        Ok(Eui64(bytes))
    }
}

pub(crate) mod channels {
    use super::*;
    use znp_protocol::types::Channels;

    pub fn serialize<S: Serializer>(
        channels: &Channels,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(channels.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Channels, D::Error> {
        Ok(Channels::from_bits_retain(u32::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = vec![0x00, 0xAB, 0xFF];
        assert_eq!(to_hex(&bytes), "00abff");
        assert_eq!(from_hex("00abff").unwrap(), bytes);
        assert!(from_hex("0g").is_err());
        assert!(from_hex("abc").is_err());
    }
}
