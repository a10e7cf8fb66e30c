//! Lengths and byte offsets of every field of the Mari over-the-air frames.
//!
//! All multi-byte fields are little-endian on the wire. The beacon uses an
//! alternative header that shares its 24-byte footprint with the common
//! header, so the scan-time "stripped" beacon view is simply the first
//! [`beacon::BEACON_HEADER_LEN`] bytes of a beacon frame.

pub const PACKET_MAX_SIZE: usize = 255;

pub mod header {
    pub const VERSION_OFF: usize = 0;
    pub const TYPE_OFF: usize = 1;
    pub const NETWORK_ID_OFF: usize = 2;
    pub const DST_OFF: usize = 4;
    pub const SRC_OFF: usize = 12;
    pub const RSSI_OFF: usize = 20;
    pub const PAD_LEN: usize = 3;

    pub const HEADER_LEN: usize = RSSI_OFF + 1 + PAD_LEN;
}

pub mod beacon {
    pub const VERSION_OFF: usize = 0;
    pub const TYPE_OFF: usize = 1;
    pub const NETWORK_ID_OFF: usize = 2;
    pub const ASN_OFF: usize = 4;
    pub const SRC_OFF: usize = 12;
    pub const REMAINING_CAPACITY_OFF: usize = 20;
    pub const ACTIVE_SCHEDULE_ID_OFF: usize = 21;
    pub const PAD_LEN: usize = 2;

    pub const BEACON_HEADER_LEN: usize = ACTIVE_SCHEDULE_ID_OFF + 1 + PAD_LEN;
    pub const BLOOM_LEN: usize = 128;
    pub const BEACON_LEN: usize = BEACON_HEADER_LEN + BLOOM_LEN;
}

pub mod join {
    use super::header::HEADER_LEN;

    pub const JOIN_REQUEST_LEN: usize = HEADER_LEN;

    pub const ASSIGNED_CELL_OFF: usize = HEADER_LEN;
    pub const JOIN_RESPONSE_LEN: usize = HEADER_LEN + 1;
}

pub mod data {
    use super::header::HEADER_LEN;
    use super::PACKET_MAX_SIZE;

    pub const PAYLOAD_OFF: usize = HEADER_LEN;
    pub const PAYLOAD_MAX_LEN: usize = PACKET_MAX_SIZE - HEADER_LEN;
}
