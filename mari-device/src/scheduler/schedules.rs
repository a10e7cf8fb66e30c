//! The preloaded schedule catalogue.
//!
//! Schedules are static and selected by their one-byte id; the gateway's
//! beacon carries the active id so joining nodes install the same table.
//! Every schedule starts with one Beacon, one SharedUplink and one Downlink
//! cell; the remainder are dedicated Uplink cells, so `max_nodes` is
//! `n_cells - 3`.

use super::SlotType;
use crate::constants::N_CELLS_MAX;

pub struct ScheduleDef {
    pub id: u8,
    pub name: &'static str,
    pub n_cells: usize,
    pub slots: [SlotType; N_CELLS_MAX],
}

impl ScheduleDef {
    pub fn max_nodes(&self) -> u8 {
        let mut count = 0u8;
        for slot in &self.slots[..self.n_cells] {
            if matches!(slot, SlotType::Uplink) {
                count += 1;
            }
        }
        count
    }
}

const fn uplink_heavy(id: u8, name: &'static str, n_cells: usize) -> ScheduleDef {
    assert!(n_cells >= 4 && n_cells <= N_CELLS_MAX);
    let mut slots = [SlotType::Uplink; N_CELLS_MAX];
    slots[0] = SlotType::Beacon;
    slots[1] = SlotType::SharedUplink;
    slots[2] = SlotType::Downlink;
    ScheduleDef { id, name, n_cells, slots }
}

pub const SCHEDULE_MINUSCULE: ScheduleDef = uplink_heavy(1, "minuscule", 6);
pub const SCHEDULE_TINY: ScheduleDef = uplink_heavy(2, "tiny", 17);
pub const SCHEDULE_SMALL: ScheduleDef = uplink_heavy(3, "small", 41);
pub const SCHEDULE_BIG: ScheduleDef = uplink_heavy(4, "big", 101);
pub const SCHEDULE_HUGE: ScheduleDef = uplink_heavy(5, "huge", 149);

pub const ALL_SCHEDULES: [&ScheduleDef; 5] = [
    &SCHEDULE_MINUSCULE,
    &SCHEDULE_TINY,
    &SCHEDULE_SMALL,
    &SCHEDULE_BIG,
    &SCHEDULE_HUGE,
];

pub fn find(id: u8) -> Option<&'static ScheduleDef> {
    ALL_SCHEDULES.iter().find(|def| def.id == id).copied()
}
