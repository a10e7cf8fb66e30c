//! The association layer: scan-select-join membership state for nodes and
//! the reasons a membership ends.
//!
//! The MAC drives this state machine from slot housekeeping and from
//! received frames; nothing here touches the radio or the timer hardware
//! directly.

use rand_core::RngCore;

use crate::constants::{
    BACKOFF_N_MAX, BACKOFF_N_MIN, HANDOVER_MIN_INTERVAL_US, MAX_SLOTFRAMES_NO_RX,
    NET_ID_PATTERN_ANY, SYNCED_TIMEOUT_US,
};
use crate::timer::elapsed_us;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum AssociationState {
    Idle,
    Scanning,
    Synced,
    Joining,
    Joined,
}

/// Why a membership ended. A closed set; every disconnect carries exactly
/// one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    Handover,
    OutOfSync,
    GatewayFull,
    PeerLostTimeout,
    PeerLostBloom,
    HandoverFailed,
}

/// Outcome of a join-response deadline expiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinTimeoutOutcome {
    /// The gateway still has room: back off harder and retry.
    Retry,
    /// The gateway is full: give the membership up.
    GiveUp,
}

pub(crate) fn rand8(rng: &mut impl RngCore) -> u8 {
    (rng.next_u32() & 0xff) as u8
}

/// `true` when a node configured with `configured` accepts a beacon from
/// network `heard`. The all-zero pattern accepts anything.
pub fn network_id_matches(configured: u16, heard: u16) -> bool {
    configured == NET_ID_PATTERN_ANY || configured == heard
}

pub struct Association {
    state: AssociationState,
    gateway_id: u64,
    network_id: u16,
    synced_ts: u32,
    last_received_from_gw_asn: u64,
    gateway_remaining_capacity: u8,
    gateway_rssi: i8,
    backoff_n: u8,
    backoff_wait: u8,
    join_deadline: u32,
    pending_disconnect: Option<DisconnectReason>,
}

impl Association {
    pub const fn new() -> Self {
        Self {
            state: AssociationState::Idle,
            gateway_id: 0,
            network_id: 0,
            synced_ts: 0,
            last_received_from_gw_asn: 0,
            gateway_remaining_capacity: 0,
            gateway_rssi: i8::MIN,
            backoff_n: BACKOFF_N_MIN,
            backoff_wait: 0,
            join_deadline: 0,
            pending_disconnect: None,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, AssociationState::Joined)
    }

    pub fn gateway_id(&self) -> u64 {
        self.gateway_id
    }

    pub fn network_id(&self) -> u16 {
        self.network_id
    }

    pub fn gateway_rssi(&self) -> i8 {
        self.gateway_rssi
    }

    pub(crate) fn remaining_capacity(&self) -> u8 {
        self.gateway_remaining_capacity
    }

    pub(crate) fn start_scan(&mut self) {
        self.state = AssociationState::Scanning;
        self.gateway_id = 0;
        self.network_id = 0;
        self.gateway_rssi = i8::MIN;
        self.pending_disconnect = None;
    }

    /// Gateways are permanently joined to themselves.
    pub(crate) fn set_self_joined(&mut self, device_id: u64, network_id: u16) {
        self.state = AssociationState::Joined;
        self.gateway_id = device_id;
        self.network_id = network_id;
    }

    pub(crate) fn set_synced(
        &mut self,
        gateway_id: u64,
        network_id: u16,
        remaining_capacity: u8,
        now: u32,
        rng: &mut impl RngCore,
    ) {
        self.state = AssociationState::Synced;
        self.gateway_id = gateway_id;
        self.network_id = network_id;
        self.gateway_remaining_capacity = remaining_capacity;
        self.synced_ts = now;
        self.last_received_from_gw_asn = 0;
        self.pending_disconnect = None;
        self.backoff_n = BACKOFF_N_MIN;
        self.draw_backoff(rng);
    }

    fn draw_backoff(&mut self, rng: &mut impl RngCore) {
        self.backoff_wait = rand8(rng) % (1 << self.backoff_n);
    }

    #[cfg(test)]
    pub(crate) fn backoff_state(&self) -> (u8, u8) {
        (self.backoff_n, self.backoff_wait)
    }

    #[cfg(test)]
    pub(crate) fn test_warp_synced_ts(&mut self, ts: u32) {
        self.synced_ts = ts;
    }

    /// Called once per SharedUplink slot while Synced. Counts the backoff
    /// down; on reaching zero the association moves to Joining and the
    /// caller must put the join request on air.
    pub(crate) fn on_shared_uplink(&mut self, now: u32, joining_timeout_us: u32) -> bool {
        if !matches!(self.state, AssociationState::Synced) {
            return false;
        }
        if self.backoff_wait > 0 {
            self.backoff_wait -= 1;
            return false;
        }
        self.state = AssociationState::Joining;
        self.join_deadline = now.wrapping_add(joining_timeout_us);
        true
    }

    pub(crate) fn join_deadline_passed(&self, now: u32) -> bool {
        matches!(self.state, AssociationState::Joining)
            && crate::timer::delta_us(self.join_deadline, now) >= 0
    }

    /// The join response never came. With capacity left at the gateway the
    /// node widens its backoff window and tries again; against a full
    /// gateway it gives up.
    pub(crate) fn on_join_timeout(&mut self, rng: &mut impl RngCore) -> JoinTimeoutOutcome {
        if self.gateway_remaining_capacity > 0 {
            self.backoff_n = (self.backoff_n + 1).min(BACKOFF_N_MAX);
            self.draw_backoff(rng);
            self.state = AssociationState::Synced;
            JoinTimeoutOutcome::Retry
        } else {
            self.state = AssociationState::Idle;
            JoinTimeoutOutcome::GiveUp
        }
    }

    pub(crate) fn on_join_response(&mut self) {
        self.state = AssociationState::Joined;
    }

    /// Bookkeeping for any frame received from the synced gateway.
    pub(crate) fn record_rx_from_gateway(&mut self, asn: u64) {
        self.last_received_from_gw_asn = asn;
    }

    pub(crate) fn on_beacon_from_gateway(&mut self, asn: u64, rssi: i8, remaining_capacity: u8) {
        self.last_received_from_gw_asn = asn;
        self.gateway_rssi = rssi;
        self.gateway_remaining_capacity = remaining_capacity;
    }

    /// First reason wins; later flags within the same slot are dropped.
    pub(crate) fn flag_disconnect(&mut self, reason: DisconnectReason) {
        if self.pending_disconnect.is_none() {
            self.pending_disconnect = Some(reason);
        }
    }

    pub(crate) fn take_pending_disconnect(&mut self) -> Option<DisconnectReason> {
        self.pending_disconnect.take()
    }

    /// Synced or Joining for too long without ever becoming Joined.
    pub(crate) fn synced_timeout(&self, now: u32) -> bool {
        matches!(self.state, AssociationState::Synced | AssociationState::Joining)
            && elapsed_us(now, self.synced_ts) > SYNCED_TIMEOUT_US
    }

    /// Joined but silent gateway: nothing received for too many slotframes.
    pub(crate) fn gateway_rx_timeout(&self, asn: u64, n_cells: usize) -> bool {
        matches!(self.state, AssociationState::Joined)
            && asn.saturating_sub(self.last_received_from_gw_asn)
                > n_cells as u64 * MAX_SLOTFRAMES_NO_RX
    }

    /// Handovers are rate-limited relative to the last sync.
    pub(crate) fn handover_allowed(&self, now: u32) -> bool {
        matches!(self.state, AssociationState::Joined)
            && elapsed_us(now, self.synced_ts) >= HANDOVER_MIN_INTERVAL_US
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Association {
    fn default() -> Self {
        Self::new()
    }
}
