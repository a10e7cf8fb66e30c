//! Codec for the persisted network-id record.
//!
//! Gateways keep an 8-byte record at a well-known flash address so the
//! network id survives reflashes: a magic word followed by the id. Reading
//! and writing flash is platform glue; this module only interprets the
//! bytes.

use crate::constants::NET_ID_DEFAULT;

/// `"SWRM"` read as a little-endian u32.
pub const CONFIG_MAGIC: u32 = 0x5753_524D;
pub const CONFIG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct StoredConfig {
    pub network_id: u16,
}

impl StoredConfig {
    /// Interprets a flash record. Returns `None` when the magic does not
    /// match (erased or foreign flash contents).
    pub fn parse(bytes: &[u8; CONFIG_LEN]) -> Option<Self> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != CONFIG_MAGIC {
            return None;
        }
        Some(Self { network_id: u16::from_le_bytes([bytes[4], bytes[5]]) })
    }

    pub fn to_bytes(&self) -> [u8; CONFIG_LEN] {
        let mut out = [0u8; CONFIG_LEN];
        out[..4].copy_from_slice(&CONFIG_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.network_id.to_le_bytes());
        out
    }

    /// The network id to run with: the stored one when the record is valid,
    /// the compile-time default otherwise.
    pub fn network_id_or_default(bytes: &[u8; CONFIG_LEN]) -> u16 {
        match Self::parse(bytes) {
            Some(stored) => stored.network_id,
            None => NET_ID_DEFAULT,
        }
    }
}
