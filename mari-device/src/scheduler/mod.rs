//! The slot scheduler: owns the active cell table, computes the hopping
//! channel and radio action for every slot, and tracks dedicated uplink
//! assignments and per-slotframe usage statistics.

use crate::bloom::bloom_hashes;
use crate::constants::{
    MAX_SLOTFRAMES_NO_RX, MAX_STATS_CELLS, N_CELLS_MAX, N_DATA_CHANNELS, SCAN_CHANNEL,
};
use crate::radio::RadioAction;
use crate::Role;

pub mod schedules;
pub use schedules::ScheduleDef;

/// Role a slot plays within the slotframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SlotType {
    Beacon,
    SharedUplink,
    Downlink,
    Uplink,
}

/// One entry of the active schedule. Only Uplink cells ever carry an
/// assignment; `bloom_h1`/`bloom_h2` cache the hashes of the assigned id so
/// the filter rebuild never rehashes.
#[derive(Debug, Clone, Copy)]
pub struct Cell {
    pub slot_type: SlotType,
    pub channel_offset: u8,
    pub assigned_node_id: u64,
    pub last_received_asn: u64,
    bloom_h1: u64,
    bloom_h2: u64,
}

impl Cell {
    const fn free(slot_type: SlotType, channel_offset: u8) -> Self {
        Self {
            slot_type,
            channel_offset,
            assigned_node_id: 0,
            last_received_asn: 0,
            bloom_h1: 0,
            bloom_h2: 0,
        }
    }

    fn clear_assignment(&mut self) {
        self.assigned_node_id = 0;
        self.last_received_asn = 0;
        self.bloom_h1 = 0;
        self.bloom_h2 = 0;
    }
}

/// What the MAC needs to know to run one slot.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct SlotInfo {
    pub radio_action: RadioAction,
    pub channel: u8,
    pub slot_type: SlotType,
    pub cell_index: u8,
}

const STATS_WORDS: usize = MAX_STATS_CELLS / 64;

pub struct Scheduler {
    schedule_id: u8,
    n_cells: usize,
    max_nodes: u8,
    cells: [Cell; N_CELLS_MAX],
    assigned_nodes: u8,
    slotframe_count: u32,
    stats_current: [u64; STATS_WORDS],
    stats_last: [u64; STATS_WORDS],
}

impl Scheduler {
    /// Installs the schedule with the given id. Fails when the id is not in
    /// the preloaded catalogue.
    pub fn new(schedule_id: u8) -> Option<Self> {
        let def = schedules::find(schedule_id)?;
        let mut cells = [Cell::free(SlotType::Uplink, 0); N_CELLS_MAX];
        let mut i = 0;
        while i < def.n_cells {
            cells[i] = Cell::free(def.slots[i], i as u8);
            i += 1;
        }
        Some(Self {
            schedule_id,
            n_cells: def.n_cells,
            max_nodes: def.max_nodes(),
            cells,
            assigned_nodes: 0,
            slotframe_count: 0,
            stats_current: [0; STATS_WORDS],
            stats_last: [0; STATS_WORDS],
        })
    }

    /// Replaces the active schedule, dropping all assignments. Used when a
    /// node syncs to a gateway advertising a different table.
    pub fn set_active_schedule(&mut self, schedule_id: u8) -> bool {
        if schedule_id == self.schedule_id {
            self.reset_assignments();
            return true;
        }
        match Self::new(schedule_id) {
            Some(fresh) => {
                *self = fresh;
                true
            }
            None => false,
        }
    }

    pub fn schedule_id(&self) -> u8 {
        self.schedule_id
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn max_nodes(&self) -> u8 {
        self.max_nodes
    }

    pub fn assigned_nodes(&self) -> u8 {
        self.assigned_nodes
    }

    pub fn remaining_capacity(&self) -> u8 {
        self.max_nodes - self.assigned_nodes
    }

    pub fn slotframe_count(&self) -> u32 {
        self.slotframe_count
    }

    pub fn cell(&self, index: u8) -> &Cell {
        &self.cells[index as usize]
    }

    /// Computes the physical channel for a slot: beacon slots pin to the
    /// advertising scan channel, everything else hops over the 37 BLE data
    /// channels keyed on the ASN.
    pub fn compute_channel(
        asn: u64,
        channel_offset: u8,
        slot_type: SlotType,
        fixed_channel: Option<u8>,
    ) -> u8 {
        if let Some(fixed) = fixed_channel {
            return fixed;
        }
        match slot_type {
            SlotType::Beacon => SCAN_CHANNEL,
            _ => ((asn + channel_offset as u64) % N_DATA_CHANNELS) as u8,
        }
    }

    /// Advances to the slot at `asn` and derives what the radio must do in
    /// it. The slotframe counter increments when the table wraps, and the
    /// usage bitmap of the finished pass is snapshotted at the same moment.
    pub fn tick(
        &mut self,
        asn: u64,
        role: Role,
        device_id: u64,
        fixed_channel: Option<u8>,
    ) -> SlotInfo {
        let index = (asn % self.n_cells as u64) as usize;
        if index == 0 && asn != 0 {
            self.slotframe_count = self.slotframe_count.wrapping_add(1);
            self.stats_last = self.stats_current;
            self.stats_current = [0; STATS_WORDS];
        }
        let cell = &self.cells[index];
        let channel = Self::compute_channel(asn, cell.channel_offset, cell.slot_type, fixed_channel);
        let radio_action = match (role, cell.slot_type) {
            (Role::Gateway, SlotType::Beacon | SlotType::Downlink) => RadioAction::Tx,
            (Role::Gateway, SlotType::SharedUplink | SlotType::Uplink) => RadioAction::Rx,
            (Role::Node, SlotType::Beacon | SlotType::Downlink) => RadioAction::Rx,
            (Role::Node, SlotType::SharedUplink) => RadioAction::Tx,
            (Role::Node, SlotType::Uplink) => {
                if cell.assigned_node_id == device_id {
                    RadioAction::Tx
                } else {
                    RadioAction::Sleep
                }
            }
        };
        SlotInfo { radio_action, channel, slot_type: cell.slot_type, cell_index: index as u8 }
    }

    /// Assigns the first free Uplink cell to `node_id`. A node that already
    /// owns a cell (rejoin after a lost response) gets the same cell back
    /// with its liveness refreshed rather than a second one.
    pub fn assign_next_uplink(&mut self, node_id: u64, asn: u64) -> Option<u8> {
        if let Some(existing) = self.find_node_cell(node_id) {
            self.cells[existing as usize].last_received_asn = asn;
            return Some(existing);
        }
        let index = self.cells[..self.n_cells].iter().position(|cell| {
            matches!(cell.slot_type, SlotType::Uplink) && cell.assigned_node_id == 0
        })?;
        let (h1, h2) = bloom_hashes(node_id);
        let cell = &mut self.cells[index];
        cell.assigned_node_id = node_id;
        cell.last_received_asn = asn;
        cell.bloom_h1 = h1;
        cell.bloom_h2 = h2;
        self.assigned_nodes += 1;
        Some(index as u8)
    }

    fn find_node_cell(&self, node_id: u64) -> Option<u8> {
        self.cells[..self.n_cells]
            .iter()
            .position(|cell| cell.assigned_node_id == node_id && node_id != 0)
            .map(|index| index as u8)
    }

    /// Node side: adopt the cell index handed out in a join response.
    pub fn adopt_cell(&mut self, index: u8, node_id: u64, asn: u64) -> bool {
        let Some(cell) = self.cells[..self.n_cells].get_mut(index as usize) else {
            return false;
        };
        if !matches!(cell.slot_type, SlotType::Uplink) {
            return false;
        }
        let (h1, h2) = bloom_hashes(node_id);
        cell.assigned_node_id = node_id;
        cell.last_received_asn = asn;
        cell.bloom_h1 = h1;
        cell.bloom_h2 = h2;
        true
    }

    /// Releases whatever cell `node_id` holds. Returns the freed index.
    pub fn deassign_node(&mut self, node_id: u64) -> Option<u8> {
        let index = self.find_node_cell(node_id)?;
        self.cells[index as usize].clear_assignment();
        self.assigned_nodes = self.assigned_nodes.saturating_sub(1);
        Some(index)
    }

    /// Refreshes the liveness stamp of the cell owned by `node_id`.
    pub fn touch_node(&mut self, node_id: u64, asn: u64) -> bool {
        match self.find_node_cell(node_id) {
            Some(index) => {
                self.cells[index as usize].last_received_asn = asn;
                true
            }
            None => false,
        }
    }

    /// Gateway housekeeping: clears every assignment that has not been heard
    /// from for [`MAX_SLOTFRAMES_NO_RX`] slotframes, reporting each evicted
    /// node id.
    pub fn sweep_expired(&mut self, asn: u64, mut evicted: impl FnMut(u64)) {
        let deadline = self.n_cells as u64 * MAX_SLOTFRAMES_NO_RX;
        for cell in self.cells[..self.n_cells].iter_mut() {
            if cell.assigned_node_id == 0 {
                continue;
            }
            if asn.saturating_sub(cell.last_received_asn) > deadline {
                let node_id = cell.assigned_node_id;
                cell.clear_assignment();
                self.assigned_nodes = self.assigned_nodes.saturating_sub(1);
                evicted(node_id);
            }
        }
    }

    pub fn reset_assignments(&mut self) {
        for cell in self.cells[..self.n_cells].iter_mut() {
            cell.clear_assignment();
        }
        self.assigned_nodes = 0;
    }

    /// Cached hash pairs of every assigned cell, for the bloom rebuild.
    pub fn bloom_hash_pairs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.cells[..self.n_cells]
            .iter()
            .filter(|cell| cell.assigned_node_id != 0)
            .map(|cell| (cell.bloom_h1, cell.bloom_h2))
    }

    /// Copies the assigned node ids into `out`, returning how many fit.
    pub fn nodes(&self, out: &mut [u64]) -> usize {
        let mut count = 0;
        for cell in self.cells[..self.n_cells].iter() {
            if cell.assigned_node_id == 0 {
                continue;
            }
            let Some(slot) = out.get_mut(count) else {
                break;
            };
            *slot = cell.assigned_node_id;
            count += 1;
        }
        count
    }

    /// Marks the slot at `index` as used in the current pass.
    pub fn mark_used(&mut self, index: u8) {
        let index = index as usize;
        self.stats_current[index >> 6] |= 1 << (index & 0x3f);
    }

    /// Usage bitmap of the last complete slotframe pass.
    pub fn usage_bitmap(&self) -> [u8; MAX_STATS_CELLS / 8] {
        let mut out = [0u8; MAX_STATS_CELLS / 8];
        for (word, chunk) in self.stats_last.iter().zip(out.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}
