//! Provides types and methods for parsing Mari frames.
//!
//! The parser never copies: each payload type wraps the incoming byte slice
//! and exposes little-endian field accessors over it. [`parse`] inspects the
//! type byte and returns the matching variant.
//!
//! # Examples
//!
//! ```
//! use mari_encoding::parser::{parse, PhyPayload, PacketHeader};
//!
//! let bytes = [
//!     0x02, 0x10, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x0d, 0xf0, 0xdd,
//!     0xba, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2a,
//! ];
//! if let Ok(PhyPayload::Data(data)) = parse(&bytes[..]) {
//!     assert_eq!(data.network_id(), 0x1234);
//!     assert_eq!(data.payload(), &[0x2a]);
//! } else {
//!     panic!("failed to parse data frame");
//! }
//! ```

use crate::packet_length::{beacon, data, header, join};
use crate::{BROADCAST_ID, PROTOCOL_VERSION};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error {
    InvalidData,
    InvalidMessageType,
    UnsupportedVersion,
    PayloadTooLong,
}

/// Frame type codes as they appear in the type byte.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum PacketType {
    Beacon = 1,
    JoinRequest = 2,
    JoinResponse = 4,
    Keepalive = 8,
    Data = 16,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(PacketType::Beacon),
            2 => Ok(PacketType::JoinRequest),
            4 => Ok(PacketType::JoinResponse),
            8 => Ok(PacketType::Keepalive),
            16 => Ok(PacketType::Data),
            _ => Err(Error::InvalidMessageType),
        }
    }
}

pub(crate) fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

pub(crate) fn read_u64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// PhyPayload is a type that represents any Mari frame.
#[derive(Debug, PartialEq, Eq)]
pub enum PhyPayload<T> {
    Beacon(BeaconPayload<T>),
    JoinRequest(JoinRequestPayload<T>),
    JoinResponse(JoinResponsePayload<T>),
    Keepalive(KeepalivePayload<T>),
    Data(DataPayload<T>),
}

/// Parses a frame into its tagged representation.
///
/// Returns an error when the buffer is shorter than the layout of its type
/// byte demands, when the type byte is unknown, or when the protocol version
/// does not match [`PROTOCOL_VERSION`].
pub fn parse<T: AsRef<[u8]>>(data: T) -> Result<PhyPayload<T>, Error> {
    let bytes = data.as_ref();
    if bytes.len() < 2 {
        return Err(Error::InvalidData);
    }
    if bytes[header::VERSION_OFF] != PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion);
    }
    match PacketType::try_from(bytes[header::TYPE_OFF])? {
        PacketType::Beacon => Ok(PhyPayload::Beacon(BeaconPayload::new(data)?)),
        PacketType::JoinRequest => Ok(PhyPayload::JoinRequest(JoinRequestPayload::new(data)?)),
        PacketType::JoinResponse => Ok(PhyPayload::JoinResponse(JoinResponsePayload::new(data)?)),
        PacketType::Keepalive => Ok(PhyPayload::Keepalive(KeepalivePayload::new(data)?)),
        PacketType::Data => Ok(PhyPayload::Data(DataPayload::new(data)?)),
    }
}

/// Accessors over the 24-byte common header shared by every non-beacon frame.
pub trait PacketHeader {
    fn as_header_bytes(&self) -> &[u8];

    fn version(&self) -> u8 {
        self.as_header_bytes()[header::VERSION_OFF]
    }

    fn packet_type(&self) -> PacketType {
        // the constructor already validated the type byte
        PacketType::try_from(self.as_header_bytes()[header::TYPE_OFF]).unwrap_or(PacketType::Data)
    }

    fn network_id(&self) -> u16 {
        read_u16(self.as_header_bytes(), header::NETWORK_ID_OFF)
    }

    fn dst(&self) -> u64 {
        read_u64(self.as_header_bytes(), header::DST_OFF)
    }

    fn src(&self) -> u64 {
        read_u64(self.as_header_bytes(), header::SRC_OFF)
    }

    fn rssi(&self) -> i8 {
        self.as_header_bytes()[header::RSSI_OFF] as i8
    }

    fn is_broadcast(&self) -> bool {
        self.dst() == BROADCAST_ID
    }
}

macro_rules! header_payload {
    (
        $(#[$outer:meta])*
        struct $type:ident[$min:expr];
    ) => {
        $(#[$outer])*
        #[derive(Debug, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
        pub struct $type<T>(pub(crate) T);

        impl<T: AsRef<[u8]>> $type<T> {
            /// Creates a new wrapper if the provided data is long enough.
            pub fn new(data: T) -> Result<$type<T>, Error> {
                if data.as_ref().len() < $min {
                    return Err(Error::InvalidData);
                }
                Ok($type(data))
            }

            pub fn inner_ref(&self) -> &T {
                &self.0
            }
        }

        impl<T: AsRef<[u8]>> PacketHeader for $type<T> {
            fn as_header_bytes(&self) -> &[u8] {
                self.0.as_ref()
            }
        }

        impl<T: AsRef<[u8]> + AsMut<[u8]>> $type<T> {
            /// Stamps the receive-time RSSI into the header in place.
            pub fn set_rssi(&mut self, rssi: i8) {
                self.0.as_mut()[header::RSSI_OFF] = rssi as u8;
            }
        }

        impl<T: AsRef<[u8]>> AsRef<[u8]> for $type<T> {
            fn as_ref(&self) -> &[u8] {
                self.0.as_ref()
            }
        }
    };
}

header_payload! {
    /// A join request; carries nothing beyond the common header.
    struct JoinRequestPayload[join::JOIN_REQUEST_LEN];
}

header_payload! {
    /// A join response; the common header plus the assigned cell index.
    struct JoinResponsePayload[join::JOIN_RESPONSE_LEN];
}

header_payload! {
    /// A keepalive; carries nothing beyond the common header.
    struct KeepalivePayload[join::JOIN_REQUEST_LEN];
}

header_payload! {
    /// An application data frame.
    struct DataPayload[data::PAYLOAD_OFF];
}

impl<T: AsRef<[u8]>> JoinResponsePayload<T> {
    /// Index of the uplink cell the gateway assigned to the requester.
    pub fn assigned_cell_index(&self) -> u8 {
        self.0.as_ref()[join::ASSIGNED_CELL_OFF]
    }
}

impl<T: AsRef<[u8]>> DataPayload<T> {
    pub fn payload(&self) -> &[u8] {
        &self.0.as_ref()[data::PAYLOAD_OFF..]
    }
}

/// The stripped beacon view: the first 24 bytes of a beacon frame, without
/// the bloom filter. This is what the scan table stores per sample.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct BeaconHeader<T>(T);

impl<T: AsRef<[u8]>> BeaconHeader<T> {
    pub fn new(data: T) -> Result<BeaconHeader<T>, Error> {
        if data.as_ref().len() < beacon::BEACON_HEADER_LEN {
            return Err(Error::InvalidData);
        }
        Ok(BeaconHeader(data))
    }

    pub fn version(&self) -> u8 {
        self.0.as_ref()[beacon::VERSION_OFF]
    }

    pub fn network_id(&self) -> u16 {
        read_u16(self.0.as_ref(), beacon::NETWORK_ID_OFF)
    }

    pub fn asn(&self) -> u64 {
        read_u64(self.0.as_ref(), beacon::ASN_OFF)
    }

    pub fn src(&self) -> u64 {
        read_u64(self.0.as_ref(), beacon::SRC_OFF)
    }

    pub fn remaining_capacity(&self) -> u8 {
        self.0.as_ref()[beacon::REMAINING_CAPACITY_OFF]
    }

    pub fn active_schedule_id(&self) -> u8 {
        self.0.as_ref()[beacon::ACTIVE_SCHEDULE_ID_OFF]
    }

    #[inline]
    pub fn to_owned(&self) -> BeaconHeader<[u8; beacon::BEACON_HEADER_LEN]> {
        let mut raw = [0u8; beacon::BEACON_HEADER_LEN];
        raw.copy_from_slice(&self.0.as_ref()[..beacon::BEACON_HEADER_LEN]);
        BeaconHeader(raw)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for BeaconHeader<T> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<T: AsRef<[u8]> + Clone> Clone for BeaconHeader<T> {
    fn clone(&self) -> Self {
        BeaconHeader(self.0.clone())
    }
}

impl<T: AsRef<[u8]> + Copy> Copy for BeaconHeader<T> {}

impl Default for BeaconHeader<[u8; beacon::BEACON_HEADER_LEN]> {
    fn default() -> Self {
        BeaconHeader([0u8; beacon::BEACON_HEADER_LEN])
    }
}

/// A full beacon frame: alternative header plus the 128-byte bloom filter.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct BeaconPayload<T>(T);

impl<T: AsRef<[u8]>> BeaconPayload<T> {
    pub fn new(data: T) -> Result<BeaconPayload<T>, Error> {
        if data.as_ref().len() < beacon::BEACON_LEN {
            return Err(Error::InvalidData);
        }
        Ok(BeaconPayload(data))
    }

    /// The stripped header view over the first 24 bytes.
    pub fn header(&self) -> BeaconHeader<&[u8]> {
        BeaconHeader(&self.0.as_ref()[..beacon::BEACON_HEADER_LEN])
    }

    pub fn network_id(&self) -> u16 {
        self.header().network_id()
    }

    pub fn asn(&self) -> u64 {
        self.header().asn()
    }

    pub fn src(&self) -> u64 {
        self.header().src()
    }

    pub fn remaining_capacity(&self) -> u8 {
        self.header().remaining_capacity()
    }

    pub fn active_schedule_id(&self) -> u8 {
        self.header().active_schedule_id()
    }

    pub fn bloom(&self) -> &[u8] {
        &self.0.as_ref()[beacon::BEACON_HEADER_LEN..beacon::BEACON_LEN]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for BeaconPayload<T> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}
