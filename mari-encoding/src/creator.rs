//! Provides types and methods for creating Mari frames.
//!
//! Each creator wraps a caller-provided buffer, stamps the version and type
//! bytes on construction and exposes `set_*` methods for the remaining
//! fields. [`DataCreator::build`] and friends return the finished wire bytes
//! as a slice of the underlying buffer.

use crate::packet_length::{beacon, data, header, join, PACKET_MAX_SIZE};
use crate::parser::{Error, PacketType};
use crate::{BROADCAST_ID, PROTOCOL_VERSION};

fn write_header_prelude(d: &mut [u8], packet_type: PacketType) {
    d[..header::HEADER_LEN].fill(0);
    d[header::VERSION_OFF] = PROTOCOL_VERSION;
    d[header::TYPE_OFF] = packet_type as u8;
    d[header::DST_OFF..header::DST_OFF + 8].copy_from_slice(&BROADCAST_ID.to_le_bytes());
}

macro_rules! impl_header_setters {
    ($type:ident) => {
        impl<D: AsMut<[u8]>> $type<D> {
            pub fn set_network_id(&mut self, network_id: u16) -> &mut Self {
                self.data.as_mut()[header::NETWORK_ID_OFF..header::NETWORK_ID_OFF + 2]
                    .copy_from_slice(&network_id.to_le_bytes());
                self
            }

            pub fn set_dst(&mut self, dst: u64) -> &mut Self {
                self.data.as_mut()[header::DST_OFF..header::DST_OFF + 8]
                    .copy_from_slice(&dst.to_le_bytes());
                self
            }

            pub fn set_src(&mut self, src: u64) -> &mut Self {
                self.data.as_mut()[header::SRC_OFF..header::SRC_OFF + 8]
                    .copy_from_slice(&src.to_le_bytes());
                self
            }
        }
    };
}

/// DataCreator serves for creating the binary representation of a data frame.
///
/// # Example
///
/// ```
/// let mut buffer = [0u8; 255];
/// let mut frame = mari_encoding::creator::DataCreator::new(&mut buffer[..]).unwrap();
/// frame.set_network_id(0x0001).set_src(0xbb).set_dst(0xaa);
/// let len = frame.set_payload(b"hello").unwrap();
/// let bytes = frame.build(len);
/// assert_eq!(bytes.len(), 24 + 5);
/// ```
pub struct DataCreator<D> {
    data: D,
}

impl<D: AsMut<[u8]>> DataCreator<D> {
    pub fn new(mut data: D) -> Result<Self, Error> {
        let d = data.as_mut();
        if d.len() < data::PAYLOAD_OFF {
            return Err(Error::InvalidData);
        }
        write_header_prelude(d, PacketType::Data);
        Ok(Self { data })
    }

    /// Copies the application payload behind the header. Returns the total
    /// frame length to hand to [`DataCreator::build`].
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<usize, Error> {
        if payload.len() > data::PAYLOAD_MAX_LEN {
            return Err(Error::PayloadTooLong);
        }
        let d = self.data.as_mut();
        if d.len() < data::PAYLOAD_OFF + payload.len() {
            return Err(Error::InvalidData);
        }
        d[data::PAYLOAD_OFF..data::PAYLOAD_OFF + payload.len()].copy_from_slice(payload);
        Ok(data::PAYLOAD_OFF + payload.len())
    }

    pub fn build(&mut self, len: usize) -> &[u8] {
        &self.data.as_mut()[..len]
    }
}

impl_header_setters!(DataCreator);

/// JoinRequestCreator serves for creating the binary representation of a
/// join request; the frame is the bare common header.
pub struct JoinRequestCreator<D> {
    data: D,
}

impl<D: AsMut<[u8]>> JoinRequestCreator<D> {
    pub fn new(mut data: D) -> Result<Self, Error> {
        let d = data.as_mut();
        if d.len() < join::JOIN_REQUEST_LEN {
            return Err(Error::InvalidData);
        }
        write_header_prelude(d, PacketType::JoinRequest);
        Ok(Self { data })
    }

    pub fn build(&mut self) -> &[u8] {
        &self.data.as_mut()[..join::JOIN_REQUEST_LEN]
    }
}

impl_header_setters!(JoinRequestCreator);

/// JoinResponseCreator serves for creating the binary representation of a
/// join response: the common header plus the assigned cell index.
pub struct JoinResponseCreator<D> {
    data: D,
}

impl<D: AsMut<[u8]>> JoinResponseCreator<D> {
    pub fn new(mut data: D) -> Result<Self, Error> {
        let d = data.as_mut();
        if d.len() < join::JOIN_RESPONSE_LEN {
            return Err(Error::InvalidData);
        }
        write_header_prelude(d, PacketType::JoinResponse);
        d[join::ASSIGNED_CELL_OFF] = 0;
        Ok(Self { data })
    }

    pub fn set_assigned_cell_index(&mut self, index: u8) -> &mut Self {
        self.data.as_mut()[join::ASSIGNED_CELL_OFF] = index;
        self
    }

    pub fn build(&mut self) -> &[u8] {
        &self.data.as_mut()[..join::JOIN_RESPONSE_LEN]
    }
}

impl_header_setters!(JoinResponseCreator);

/// KeepaliveCreator serves for creating the binary representation of a
/// keepalive; the frame is the bare common header.
pub struct KeepaliveCreator<D> {
    data: D,
}

impl<D: AsMut<[u8]>> KeepaliveCreator<D> {
    pub fn new(mut data: D) -> Result<Self, Error> {
        let d = data.as_mut();
        if d.len() < join::JOIN_REQUEST_LEN {
            return Err(Error::InvalidData);
        }
        write_header_prelude(d, PacketType::Keepalive);
        Ok(Self { data })
    }

    pub fn build(&mut self) -> &[u8] {
        &self.data.as_mut()[..join::JOIN_REQUEST_LEN]
    }
}

impl_header_setters!(KeepaliveCreator);

/// BeaconCreator serves for creating the binary representation of a beacon,
/// using the alternative beacon header layout.
pub struct BeaconCreator<D> {
    data: D,
}

impl<D: AsMut<[u8]>> BeaconCreator<D> {
    pub fn new(mut data: D) -> Result<Self, Error> {
        let d = data.as_mut();
        if d.len() < beacon::BEACON_LEN {
            return Err(Error::InvalidData);
        }
        d[..beacon::BEACON_LEN].fill(0);
        d[beacon::VERSION_OFF] = PROTOCOL_VERSION;
        d[beacon::TYPE_OFF] = PacketType::Beacon as u8;
        Ok(Self { data })
    }

    pub fn set_network_id(&mut self, network_id: u16) -> &mut Self {
        self.data.as_mut()[beacon::NETWORK_ID_OFF..beacon::NETWORK_ID_OFF + 2]
            .copy_from_slice(&network_id.to_le_bytes());
        self
    }

    pub fn set_asn(&mut self, asn: u64) -> &mut Self {
        self.data.as_mut()[beacon::ASN_OFF..beacon::ASN_OFF + 8]
            .copy_from_slice(&asn.to_le_bytes());
        self
    }

    pub fn set_src(&mut self, src: u64) -> &mut Self {
        self.data.as_mut()[beacon::SRC_OFF..beacon::SRC_OFF + 8]
            .copy_from_slice(&src.to_le_bytes());
        self
    }

    pub fn set_remaining_capacity(&mut self, capacity: u8) -> &mut Self {
        self.data.as_mut()[beacon::REMAINING_CAPACITY_OFF] = capacity;
        self
    }

    pub fn set_active_schedule_id(&mut self, id: u8) -> &mut Self {
        self.data.as_mut()[beacon::ACTIVE_SCHEDULE_ID_OFF] = id;
        self
    }

    pub fn set_bloom(&mut self, bloom: &[u8; beacon::BLOOM_LEN]) -> &mut Self {
        self.data.as_mut()[beacon::BEACON_HEADER_LEN..beacon::BEACON_LEN].copy_from_slice(bloom);
        self
    }

    pub fn build(&mut self) -> &[u8] {
        &self.data.as_mut()[..beacon::BEACON_LEN]
    }
}

const _: () = assert!(beacon::BEACON_LEN <= PACKET_MAX_SIZE);
