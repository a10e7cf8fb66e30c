//! Outbound frame queue.
//!
//! A bounded ring of raw frames fed by the application (or the facade) and
//! drained by the MAC at the start of TX slots, plus a one-slot join packet
//! holder with strict priority on gateway Downlink and node SharedUplink
//! slots.
//!
//! Producers run in thread or event-loop context and spin on the lock flag;
//! the MAC consumer runs in interrupt context, takes one shot at the lock
//! and simply skips the slot on contention (the producer critical section is
//! a bounded copy, so the next slot will get through).

use core::sync::atomic::{AtomicBool, Ordering};

use crate::constants::{PACKET_MAX_SIZE, TX_QUEUE_SIZE};
use crate::scheduler::SlotType;
use crate::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error {
    Full,
    FrameTooLong,
}

#[derive(Clone, Copy)]
pub(crate) struct Frame {
    len: u8,
    bytes: [u8; PACKET_MAX_SIZE],
}

impl Frame {
    const fn empty() -> Self {
        Self { len: 0, bytes: [0; PACKET_MAX_SIZE] }
    }

    fn fill(&mut self, frame: &[u8]) {
        self.bytes[..frame.len()].copy_from_slice(frame);
        self.len = frame.len() as u8;
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

pub struct TxQueue {
    frames: [Frame; TX_QUEUE_SIZE],
    read: usize,
    write: usize,
    lock: AtomicBool,
    join: Frame,
    has_join: bool,
    scratch: Frame,
}

const MASK: usize = TX_QUEUE_SIZE - 1;
const _: () = assert!(TX_QUEUE_SIZE.is_power_of_two());

enum Source {
    Join,
    Ring(usize),
}

impl TxQueue {
    pub const fn new() -> Self {
        Self {
            frames: [Frame::empty(); TX_QUEUE_SIZE],
            read: 0,
            write: 0,
            lock: AtomicBool::new(false),
            join: Frame::empty(),
            has_join: false,
            scratch: Frame::empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.write.wrapping_sub(self.read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a frame. Fails when the ring is full or the frame exceeds the
    /// wire maximum; the caller decides whether that is worth reporting.
    pub fn add(&mut self, frame: &[u8]) -> Result<(), Error> {
        if frame.len() > PACKET_MAX_SIZE {
            return Err(Error::FrameTooLong);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {}
        let result = if self.len() == TX_QUEUE_SIZE {
            Err(Error::Full)
        } else {
            let slot = self.write & MASK;
            self.write = self.write.wrapping_add(1);
            self.frames[slot].fill(frame);
            Ok(())
        };
        self.lock.store(false, Ordering::Release);
        result
    }

    fn try_pop(&mut self) -> Option<usize> {
        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let slot = if self.is_empty() {
            None
        } else {
            let slot = self.read & MASK;
            self.read = self.read.wrapping_add(1);
            Some(slot)
        };
        self.lock.store(false, Ordering::Release);
        slot
    }

    /// Installs the join packet (request on nodes, response on gateways),
    /// replacing any previous one.
    pub fn set_join_packet(&mut self, frame: &[u8]) {
        self.join.fill(frame);
        self.has_join = true;
    }

    pub fn has_join_packet(&self) -> bool {
        self.has_join
    }

    pub fn clear_join_packet(&mut self) {
        self.has_join = false;
    }

    fn next_source(&mut self, slot_type: SlotType, role: Role) -> Option<Source> {
        match (role, slot_type) {
            (Role::Gateway, SlotType::Downlink) => {
                if self.has_join {
                    self.has_join = false;
                    Some(Source::Join)
                } else {
                    self.try_pop().map(Source::Ring)
                }
            }
            (Role::Node, SlotType::SharedUplink) => {
                if self.has_join {
                    self.has_join = false;
                    Some(Source::Join)
                } else {
                    None
                }
            }
            (Role::Node, SlotType::Uplink) => self.try_pop().map(Source::Ring),
            _ => None,
        }
    }

    /// The frame to transmit in the coming slot, honouring the join packet
    /// priority. Beacon and keepalive synthesis happen in the MAC, not here.
    pub fn next(&mut self, slot_type: SlotType, role: Role) -> Option<&[u8]> {
        match self.next_source(slot_type, role)? {
            Source::Join => Some(self.join.as_bytes()),
            Source::Ring(slot) => Some(self.frames[slot].as_bytes()),
        }
    }

    /// Like [`TxQueue::next`], but leaves the frame in the scratch buffer so
    /// the caller can stage it into the radio without holding a borrow on
    /// the ring.
    pub fn stage_next(&mut self, slot_type: SlotType, role: Role) -> Option<usize> {
        match self.next_source(slot_type, role)? {
            Source::Join => self.scratch = self.join,
            Source::Ring(slot) => self.scratch = self.frames[slot],
        }
        Some(self.scratch.len as usize)
    }

    /// Drops everything queued, including the join packet. Called when the
    /// association restarts so stale frames never outlive a membership.
    pub fn reset(&mut self) {
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {}
        self.read = 0;
        self.write = 0;
        self.has_join = false;
        self.lock.store(false, Ordering::Release);
    }

    /// Scratch space for frames synthesised at slot time (beacons,
    /// keepalives). Build into the buffer, then hand the length to
    /// [`TxQueue::scratch_frame`].
    pub fn scratch_buf(&mut self) -> &mut [u8; PACKET_MAX_SIZE] {
        &mut self.scratch.bytes
    }

    pub fn scratch_frame(&mut self, len: usize) -> &[u8] {
        self.scratch.len = len as u8;
        self.scratch.as_bytes()
    }

    #[cfg(test)]
    pub(crate) fn hold_lock_for_test(&self) {
        self.lock.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn release_lock_for_test(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new()
    }
}
