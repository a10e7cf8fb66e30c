//! Protocol tunables and the slot phase timings.
//!
//! Timings assume the BLE 2 Mbps PHY with a 255-byte maximum payload. All
//! intra-slot offsets are measured from the slot start timestamp captured at
//! the inter-slot tick.

pub use mari_encoding::packet_length::PACKET_MAX_SIZE;

/// Delay from slot start to the first bit going on air.
pub const TX_OFFSET_US: u32 = 400;
/// Time on air of a maximum-size frame at BLE 2M.
pub const PACKET_TOA_US: u32 = 1020;
/// Slack added on top of the nominal time on air.
pub const TOA_PAD_US: u32 = 120;
/// Longest a transmission may occupy the radio.
pub const TX_MAX_US: u32 = PACKET_TOA_US + TOA_PAD_US;
/// Receivers open early and keep listening this long past `TX_OFFSET_US`.
pub const RX_GUARD_US: u32 = 140;
/// Delay from slot start to enabling receive mode.
pub const RX_OFFSET_US: u32 = TX_OFFSET_US - RX_GUARD_US;
/// Longest a reception may occupy the radio once enabled.
pub const RX_MAX_US: u32 = TX_MAX_US + 2 * RX_GUARD_US;
/// Quiet tail of every slot.
pub const END_GUARD_US: u32 = 240;
/// Whole slot duration.
pub const SLOT_DURATION_US: u32 = TX_OFFSET_US + TX_MAX_US + END_GUARD_US;

/// Measured latency between the peer's transmit dispatch and our
/// start-of-frame capture, used as the drift-correction reference.
pub const CPU_PERIPH_OFFSET_US: u32 = 59;
/// Default calibration for the sync one-shot (CPU plus beacon time on air).
pub const SYNC_CPU_TOA_US: u32 = 541;
/// Default extra correction applied when syncing out of a background scan.
pub const HANDOVER_SYNC_CORRECTION_US: u32 = 206;
/// Largest start-of-frame drift the slot clock will absorb.
pub const DRIFT_MAX_US: i32 = 100;

/// BLE data channels 0..36 used for hopping.
pub const N_DATA_CHANNELS: u64 = 37;
/// Advertising channel used for beacon slots and scanning.
pub const SCAN_CHANNEL: u8 = 37;

pub const N_CELLS_MAX: usize = 149;
pub const MAX_SCAN_LIST: usize = 5;
/// Number of BLE advertising channels tracked per scanned gateway.
pub const N_SCAN_CHANNELS: usize = 3;
/// Scan samples older than this at selection time are ignored.
pub const SCAN_OLD_US: u32 = 500_000;
pub const HANDOVER_RSSI_HYSTERESIS: i8 = 24;
pub const HANDOVER_MIN_INTERVAL_US: u32 = 5_000_000;
pub const BACKOFF_N_MIN: u8 = 4;
pub const BACKOFF_N_MAX: u8 = 6;
/// Nodes fill empty dedicated uplink slots with keepalives.
pub const AUTO_UPLINK_KEEPALIVE: bool = true;
pub const ENABLE_BACKGROUND_SCAN: bool = true;
/// Slotframes without a reception before a membership is considered dead,
/// on both sides of the link.
pub const MAX_SLOTFRAMES_NO_RX: u64 = 5;
/// How long a node stays Synced or Joining without ever joining.
pub const SYNCED_TIMEOUT_US: u32 = 5_000_000;

pub const BLOOM_M: usize = 1024;
pub const BLOOM_K: usize = 2;
pub const BLOOM_SALT: u64 = 0x5bd1e995;

pub const MAX_STATS_CELLS: usize = 256;
pub const TX_QUEUE_SIZE: usize = 32;

/// A node accepting any network id uses this pattern.
pub const NET_ID_PATTERN_ANY: u16 = 0;
/// Network id adopted when no persisted record is found.
pub const NET_ID_DEFAULT: u16 = 0x0001;

/// Duration of one slotframe of `n_cells` slots.
pub const fn slotframe_duration_us(n_cells: usize) -> u32 {
    n_cells as u32 * SLOT_DURATION_US
}

/// Deadline for a join response, measured from the join request going out.
pub const JOINING_TIMEOUT_US: u32 = 3 * SLOT_DURATION_US / 2;

const _: () = assert!(RX_OFFSET_US + RX_MAX_US < SLOT_DURATION_US);
const _: () = assert!(MAX_STATS_CELLS >= N_CELLS_MAX);
