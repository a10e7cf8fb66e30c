//! The Mari facade: owns every protocol component plus the radio, timer and
//! RNG, and routes the two interrupt sources into the MAC engine.
//!
//! Platform glue establishes one instance (typically behind a `static`
//! critical-section cell), forwards the timer compare interrupts to
//! [`Mari::on_timer`], the radio frame edges to [`Mari::on_radio`], and runs
//! [`Mari::event_loop`] from the main loop once per slotframe. Application
//! events are delivered through the callback captured at construction; it
//! runs in interrupt context and must not block.

use rand_core::RngCore;

use mari_encoding::creator::DataCreator;
use mari_encoding::parser;

use crate::association::{Association, AssociationState, DisconnectReason};
use crate::bloom::BloomFilter;
use crate::constants::{
    HANDOVER_SYNC_CORRECTION_US, PACKET_MAX_SIZE, SYNC_CPU_TOA_US,
};
use crate::mac::{Ctx, Mac};
use crate::queue::{self, TxQueue};
use crate::radio::{self, Radio};
use crate::scan::ScanTable;
use crate::scheduler::Scheduler;
use crate::timer::{Alarm, SlotTimer};
use crate::Role;

#[cfg(test)]
mod tests;

/// A payload surfaced to the application, copied out of the radio buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub src: u64,
    pub dst: u64,
    pub rssi: i8,
    pub payload: heapless::Vec<u8, PACKET_MAX_SIZE>,
}

/// Everything the application hears from the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected { gateway_id: u64 },
    Disconnected { gateway_id: u64, reason: DisconnectReason },
    NodeJoined { node_id: u64 },
    NodeLeft { node_id: u64, reason: DisconnectReason },
    NewPacket(ReceivedPacket),
    Keepalive { node_id: u64 },
    Error { reason: DisconnectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error {
    UnknownSchedule,
    NotJoined,
    Queue(queue::Error),
    Encoding(parser::Error),
}

impl From<queue::Error> for Error {
    fn from(e: queue::Error) -> Self {
        Error::Queue(e)
    }
}

impl From<parser::Error> for Error {
    fn from(e: parser::Error) -> Self {
        Error::Encoding(e)
    }
}

/// Static device configuration handed to [`Mari::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub role: Role,
    pub device_id: u64,
    pub network_id: u16,
    pub schedule_id: u8,
    /// Pins every slot to one channel for bring-up; `None` hops normally.
    pub fixed_channel: Option<u8>,
    /// Background-scan for a whole slotframe at a time instead of only
    /// during Sleep slots.
    pub full_bg_scan: bool,
    /// Calibrated CPU-plus-time-on-air offset applied when arming the first
    /// slot tick after a sync.
    pub sync_cpu_toa_us: u32,
    /// Additional calibrated correction for syncs out of a background scan.
    pub handover_correction_us: u32,
}

impl Config {
    pub fn new(role: Role, device_id: u64, network_id: u16, schedule_id: u8) -> Self {
        Self {
            role,
            device_id,
            network_id,
            schedule_id,
            fixed_channel: None,
            full_bg_scan: false,
            sync_cpu_toa_us: SYNC_CPU_TOA_US,
            handover_correction_us: HANDOVER_SYNC_CORRECTION_US,
        }
    }
}

pub struct Mari<R, T, RNG, F>
where
    R: Radio,
    T: SlotTimer,
    RNG: RngCore,
    F: FnMut(Event),
{
    pub(crate) cfg: Config,
    pub(crate) mac: Mac,
    pub(crate) scheduler: Scheduler,
    pub(crate) assoc: Association,
    pub(crate) queue: TxQueue,
    pub(crate) scan: ScanTable,
    pub(crate) bloom: BloomFilter,
    pub(crate) radio: R,
    pub(crate) timer: T,
    pub(crate) rng: RNG,
    pub(crate) event_cb: F,
}

macro_rules! ctx {
    ($self:ident) => {
        &mut Ctx {
            radio: &mut $self.radio,
            timer: &mut $self.timer,
            rng: &mut $self.rng,
            scheduler: &mut $self.scheduler,
            assoc: &mut $self.assoc,
            queue: &mut $self.queue,
            scan: &mut $self.scan,
            bloom: &mut $self.bloom,
            events: &mut $self.event_cb,
            cfg: &$self.cfg,
        }
    };
}

impl<R, T, RNG, F> Mari<R, T, RNG, F>
where
    R: Radio,
    T: SlotTimer,
    RNG: RngCore,
    F: FnMut(Event),
{
    pub fn new(cfg: Config, radio: R, timer: T, rng: RNG, event_cb: F) -> Result<Self, Error> {
        let scheduler = Scheduler::new(cfg.schedule_id).ok_or(Error::UnknownSchedule)?;
        let mut assoc = Association::new();
        if cfg.role == Role::Gateway {
            assoc.set_self_joined(cfg.device_id, cfg.network_id);
        }
        Ok(Self {
            cfg,
            mac: Mac::new(),
            scheduler,
            assoc,
            queue: TxQueue::new(),
            scan: ScanTable::new(),
            bloom: BloomFilter::new(),
            radio,
            timer,
            rng,
            event_cb,
        })
    }

    /// Brings the device up: gateways begin beaconing after a randomised
    /// startup delay of up to one slotframe (spreading colliding boots),
    /// nodes start scanning for a gateway.
    pub fn start(&mut self) {
        let mac = &mut self.mac;
        mac.start(ctx!(self));
    }

    /// Timer compare interrupt entry point.
    pub fn on_timer(&mut self, alarm: Alarm) {
        let mac = &mut self.mac;
        mac.on_timer(alarm, ctx!(self));
    }

    /// Radio interrupt entry point.
    pub fn on_radio(&mut self, event: radio::Event) {
        let mac = &mut self.mac;
        mac.on_radio(event, ctx!(self));
    }

    /// Deferred work, run from the main loop between slots: rebuilds the
    /// membership bloom filter when the assignment set changed. Too slow for
    /// interrupt context, cheap here.
    pub fn event_loop(&mut self) {
        if self.cfg.role == Role::Gateway && self.bloom.is_dirty() {
            self.bloom.rebuild(self.scheduler.bloom_hash_pairs());
        }
    }

    /// Queues an application payload for `dst`. Gateways may address any
    /// node; nodes may only talk to their gateway once joined.
    pub fn tx(&mut self, dst: u64, payload: &[u8]) -> Result<(), Error> {
        let network_id = match self.cfg.role {
            Role::Gateway => self.cfg.network_id,
            Role::Node => {
                if !self.assoc.is_joined() {
                    return Err(Error::NotJoined);
                }
                self.assoc.network_id()
            }
        };
        let mut buf = [0u8; PACKET_MAX_SIZE];
        let mut creator = DataCreator::new(&mut buf[..])?;
        creator.set_network_id(network_id).set_dst(dst).set_src(self.cfg.device_id);
        let len = creator.set_payload(payload)?;
        let frame = creator.build(len);
        self.queue.add(frame)?;
        Ok(())
    }

    /// Node convenience: queue a payload for the synced gateway.
    pub fn node_tx_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        if !self.assoc.is_joined() {
            return Err(Error::NotJoined);
        }
        let gateway_id = self.assoc.gateway_id();
        self.tx(gateway_id, payload)
    }

    pub fn node_is_connected(&self) -> bool {
        self.cfg.role == Role::Node && self.assoc.is_joined()
    }

    pub fn node_gateway_id(&self) -> Option<u64> {
        if self.node_is_connected() {
            Some(self.assoc.gateway_id())
        } else {
            None
        }
    }

    pub fn gateway_count_nodes(&self) -> u8 {
        self.scheduler.assigned_nodes()
    }

    /// Copies the joined node ids into `out`, returning how many fit.
    pub fn gateway_get_nodes(&self, out: &mut [u64]) -> usize {
        self.scheduler.nodes(out)
    }

    pub fn association_state(&self) -> AssociationState {
        self.assoc.state()
    }

    /// ASN of the next slot.
    pub fn asn(&self) -> u64 {
        self.mac.asn()
    }

    pub fn network_id(&self) -> u16 {
        match self.cfg.role {
            Role::Gateway => self.cfg.network_id,
            Role::Node => self.assoc.network_id(),
        }
    }

    pub fn get_radio(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn get_timer(&mut self) -> &mut T {
        &mut self.timer
    }

    /// Snapshot for the host bridge's periodic gateway report.
    #[cfg(feature = "host-bridge")]
    pub fn gateway_info(&self) -> crate::bridge::GatewayInfo {
        crate::bridge::GatewayInfo {
            device_id: self.cfg.device_id,
            network_id: self.cfg.network_id,
            schedule_id: self.scheduler.schedule_id() as u16,
            sched_usage: self.scheduler.usage_bitmap(),
            asn: self.mac.asn(),
            timer: self.timer.now(),
        }
    }
}
