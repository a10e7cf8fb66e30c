//! The slot-level MAC engine.
//!
//! Two interrupt sources drive everything: the high-frequency timer (the
//! periodic inter-slot channel plus the intra-slot one-shots) and the radio
//! frame edges. Each handler runs a short step of the per-slot sequence and
//! returns; between steps the CPU sleeps.
//!
//! The TX side of a slot steps through `ti1` (pick a frame, arm the
//! dispatch and abort one-shots), `ti2` (dispatch), `ti3` (end of frame);
//! the RX side through `ri1` (arm), `ri2` (open the receiver), `ri3`
//! (start of frame), `ri4` (end of frame, packet handling). Every armed
//! one-shot is paired with an abort that forces the radio off, so no slot
//! can wedge the engine.

use rand_core::RngCore;

use mari_encoding::creator::{BeaconCreator, JoinRequestCreator, JoinResponseCreator, KeepaliveCreator};
use mari_encoding::packet_length::{header, join, PACKET_MAX_SIZE};
use mari_encoding::parser::{parse, BeaconPayload, DataPayload, PacketHeader, PacketType, PhyPayload};

use crate::association::{
    network_id_matches, Association, AssociationState, DisconnectReason, JoinTimeoutOutcome,
};
use crate::bloom::{bloom_contains, BloomFilter};
use crate::constants::{
    slotframe_duration_us, AUTO_UPLINK_KEEPALIVE, CPU_PERIPH_OFFSET_US, DRIFT_MAX_US,
    ENABLE_BACKGROUND_SCAN, HANDOVER_RSSI_HYSTERESIS, JOINING_TIMEOUT_US, RX_GUARD_US, RX_MAX_US,
    RX_OFFSET_US, SCAN_CHANNEL, SLOT_DURATION_US, TX_MAX_US, TX_OFFSET_US,
};
use crate::device::{Config, Event, ReceivedPacket};
use crate::queue::TxQueue;
use crate::radio::{self, Radio, RadioAction};
use crate::scan::{ScanTable, SelectedGateway};
use crate::scheduler::{Scheduler, SlotInfo, SlotType};
use crate::timer::{delta_us, elapsed_us, Alarm, SlotTimer};
use crate::Role;

/// Where the engine is within the current slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub(crate) enum SlotState {
    Sleep,
    TxOffset,
    TxData,
    RxOffset,
    RxDataListen,
    RxData,
}

/// Everything the MAC needs from the rest of the stack for one handler run.
/// The facade splits its fields into this to keep the borrows disjoint.
pub(crate) struct Ctx<'a, R: Radio, T: SlotTimer, RNG: RngCore> {
    pub radio: &'a mut R,
    pub timer: &'a mut T,
    pub rng: &'a mut RNG,
    pub scheduler: &'a mut Scheduler,
    pub assoc: &'a mut Association,
    pub queue: &'a mut TxQueue,
    pub scan: &'a mut ScanTable,
    pub bloom: &'a mut BloomFilter,
    pub events: &'a mut dyn FnMut(Event),
    pub cfg: &'a Config,
}

pub(crate) struct Mac {
    state: SlotState,
    /// ASN of the slot that begins at the next inter-slot tick.
    asn: u64,
    /// ASN of the slot currently being run.
    current_asn: u64,
    slot_start_ts: u32,
    current_slot: SlotInfo,
    periodic_installed: bool,
    rx_start_ts: u32,
    // initial scan
    scan_active: bool,
    scan_started_ts: u32,
    scan_frame_start_ts: u32,
    // background scan
    bg_scan_active: bool,
    bg_scan_started_ts: u32,
}

impl Mac {
    pub(crate) fn new() -> Self {
        Self {
            state: SlotState::Sleep,
            asn: 0,
            current_asn: 0,
            slot_start_ts: 0,
            current_slot: SlotInfo {
                radio_action: RadioAction::Sleep,
                channel: 0,
                slot_type: SlotType::Beacon,
                cell_index: 0,
            },
            periodic_installed: false,
            rx_start_ts: 0,
            scan_active: false,
            scan_started_ts: 0,
            scan_frame_start_ts: 0,
            bg_scan_active: false,
            bg_scan_started_ts: 0,
        }
    }

    pub(crate) fn asn(&self) -> u64 {
        self.asn
    }

    pub(crate) fn slot_start_ts(&self) -> u32 {
        self.slot_start_ts
    }

    #[cfg(test)]
    pub(crate) fn in_bg_scan(&self) -> bool {
        self.bg_scan_active
    }

    /// Brings the engine up after init: gateways spread their boot over one
    /// slotframe and then start slotting; nodes go looking for a gateway.
    pub(crate) fn start<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        match ctx.cfg.role {
            Role::Gateway => {
                let window = slotframe_duration_us(ctx.scheduler.n_cells());
                let delay = ctx.rng.next_u32() % window;
                debug!("gateway start in {=u32} us", delay);
                ctx.timer.set_oneshot(Alarm::Scan, delay);
            }
            Role::Node => self.start_scan(ctx),
        }
    }

    // ------------------------------------------------------------------
    // interrupt entry points
    // ------------------------------------------------------------------

    pub(crate) fn on_timer<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        alarm: Alarm,
        ctx: &mut Ctx<R, T, RNG>,
    ) {
        match alarm {
            Alarm::InterSlot => {
                if !self.periodic_installed {
                    ctx.timer.set_periodic(Alarm::InterSlot, SLOT_DURATION_US);
                    self.periodic_installed = true;
                }
                self.new_slot(ctx);
            }
            Alarm::Action => match self.state {
                SlotState::TxOffset => self.ti2(ctx),
                SlotState::RxOffset => self.ri2(ctx),
                _ => {}
            },
            Alarm::Guard => {
                if self.state == SlotState::RxDataListen {
                    self.rie1(ctx);
                }
            }
            Alarm::Abort => match self.state {
                SlotState::TxOffset | SlotState::TxData => self.tie1(ctx),
                SlotState::RxData => self.rie2(ctx),
                _ => {}
            },
            Alarm::Scan => match ctx.cfg.role {
                Role::Gateway => {
                    // startup delay elapsed; first tick installs the periodic
                    self.on_timer(Alarm::InterSlot, ctx);
                }
                Role::Node => {
                    if self.scan_active {
                        self.handle_scan_end(ctx);
                    }
                }
            },
        }
    }

    pub(crate) fn on_radio<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        event: radio::Event,
        ctx: &mut Ctx<R, T, RNG>,
    ) {
        if self.scan_active || self.bg_scan_active {
            match event {
                radio::Event::FrameStarted(ts) => self.scan_frame_start_ts = ts,
                radio::Event::FrameEnded(_) => self.scan_frame_received(ctx),
            }
            return;
        }
        match event {
            radio::Event::FrameStarted(ts) => {
                if self.state == SlotState::RxDataListen {
                    self.ri3(ts, ctx);
                }
            }
            radio::Event::FrameEnded(_) => match self.state {
                SlotState::TxData => self.ti3(ctx),
                SlotState::RxData => self.ri4(ctx),
                _ => {}
            },
        }
    }

    // ------------------------------------------------------------------
    // slot entry
    // ------------------------------------------------------------------

    fn new_slot<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        let now = ctx.timer.now();
        self.slot_start_ts = now;
        self.state = SlotState::Sleep;

        match ctx.cfg.role {
            Role::Gateway => self.gateway_housekeeping(ctx),
            Role::Node => {
                if self.node_housekeeping(ctx) {
                    return;
                }
            }
        }

        // a running full-slotframe background scan keeps the radio until its
        // window closes; the node sits this slot out
        if self.bg_scan_active && ctx.cfg.full_bg_scan {
            if elapsed_us(now, self.bg_scan_started_ts)
                < slotframe_duration_us(ctx.scheduler.n_cells())
            {
                self.advance_slot(ctx);
                return;
            }
            if self.end_bg_scan(ctx) {
                return;
            }
        }

        let slot = self.advance_slot(ctx);

        if self.bg_scan_active && slot.radio_action != RadioAction::Sleep {
            if self.end_bg_scan(ctx) {
                return;
            }
        }

        match slot.radio_action {
            RadioAction::Tx => self.ti1(ctx),
            RadioAction::Rx => self.ri1(ctx),
            RadioAction::Sleep => self.sleep_slot(ctx),
        }
    }

    fn advance_slot<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        ctx: &mut Ctx<R, T, RNG>,
    ) -> SlotInfo {
        let asn = self.asn;
        self.asn += 1;
        self.current_asn = asn;
        let slot = ctx.scheduler.tick(asn, ctx.cfg.role, ctx.cfg.device_id, ctx.cfg.fixed_channel);
        self.current_slot = slot;
        slot
    }

    fn gateway_housekeeping<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        ctx: &mut Ctx<R, T, RNG>,
    ) {
        let asn = self.asn;
        let mut evicted = false;
        let events = &mut *ctx.events;
        ctx.scheduler.sweep_expired(asn, |node_id| {
            evicted = true;
            events(Event::NodeLeft { node_id, reason: DisconnectReason::PeerLostTimeout });
        });
        if evicted {
            ctx.bloom.mark_dirty();
        }
    }

    /// Returns `true` when the node dropped out of slotted operation.
    fn node_housekeeping<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        ctx: &mut Ctx<R, T, RNG>,
    ) -> bool {
        let now = self.slot_start_ts;

        if let Some(reason) = ctx.assoc.take_pending_disconnect() {
            self.disconnect(ctx, reason);
            self.start_scan(ctx);
            return true;
        }

        if ctx.assoc.synced_timeout(now) {
            debug!("synced too long without joining");
            self.stop_slotting(ctx);
            self.start_scan(ctx);
            return true;
        }

        if ctx.assoc.join_deadline_passed(now) {
            match ctx.assoc.on_join_timeout(ctx.rng) {
                JoinTimeoutOutcome::Retry => self.prime_join_request(ctx),
                JoinTimeoutOutcome::GiveUp => {
                    (ctx.events)(Event::Error { reason: DisconnectReason::GatewayFull });
                    self.stop_slotting(ctx);
                    self.start_scan(ctx);
                    return true;
                }
            }
        }

        if ctx.assoc.gateway_rx_timeout(self.asn, ctx.scheduler.n_cells()) {
            self.disconnect(ctx, DisconnectReason::PeerLostTimeout);
            self.start_scan(ctx);
            return true;
        }

        false
    }

    // ------------------------------------------------------------------
    // TX path
    // ------------------------------------------------------------------

    fn ti1<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        let Some(len) = self.stage_tx_frame(ctx) else {
            // nothing to send this slot
            if ctx.cfg.role == Role::Node {
                self.sleep_slot(ctx);
            }
            return;
        };

        ctx.scheduler.mark_used(self.current_slot.cell_index);
        ctx.radio.set_channel(self.current_slot.channel);
        let frame = ctx.queue.scratch_frame(len);
        ctx.radio.tx_prepare(frame);
        ctx.timer.set_oneshot_with_ref(Alarm::Action, self.slot_start_ts, TX_OFFSET_US);
        ctx.timer
            .set_oneshot_with_ref(Alarm::Abort, self.slot_start_ts, TX_OFFSET_US + TX_MAX_US);
        self.state = SlotState::TxOffset;
    }

    /// Picks or synthesises the outgoing frame, leaving it in the queue
    /// scratch buffer. Returns its length.
    fn stage_tx_frame<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        ctx: &mut Ctx<R, T, RNG>,
    ) -> Option<usize> {
        match (ctx.cfg.role, self.current_slot.slot_type) {
            (Role::Gateway, SlotType::Beacon) => self.synthesize_beacon(ctx),
            (Role::Gateway, SlotType::Downlink) | (Role::Node, SlotType::Uplink) => {
                let slot_type = self.current_slot.slot_type;
                if let Some(len) = ctx.queue.stage_next(slot_type, ctx.cfg.role) {
                    return Some(len);
                }
                if ctx.cfg.role == Role::Node && AUTO_UPLINK_KEEPALIVE {
                    return self.synthesize_keepalive(ctx);
                }
                None
            }
            (Role::Node, SlotType::SharedUplink) => {
                if !ctx.assoc.on_shared_uplink(self.slot_start_ts, JOINING_TIMEOUT_US) {
                    return None;
                }
                ctx.queue.stage_next(SlotType::SharedUplink, Role::Node)
            }
            _ => None,
        }
    }

    fn synthesize_beacon<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        ctx: &mut Ctx<R, T, RNG>,
    ) -> Option<usize> {
        let remaining = ctx.scheduler.remaining_capacity();
        let schedule_id = ctx.scheduler.schedule_id();
        let bloom = *ctx.bloom.bytes();
        let mut creator = BeaconCreator::new(&mut ctx.queue.scratch_buf()[..]).ok()?;
        creator
            .set_network_id(ctx.cfg.network_id)
            .set_asn(self.current_asn)
            .set_src(ctx.cfg.device_id)
            .set_remaining_capacity(remaining)
            .set_active_schedule_id(schedule_id)
            .set_bloom(&bloom);
        Some(creator.build().len())
    }

    fn synthesize_keepalive<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        ctx: &mut Ctx<R, T, RNG>,
    ) -> Option<usize> {
        let gateway_id = ctx.assoc.gateway_id();
        let network_id = ctx.assoc.network_id();
        let mut creator = KeepaliveCreator::new(&mut ctx.queue.scratch_buf()[..]).ok()?;
        creator.set_network_id(network_id).set_dst(gateway_id).set_src(ctx.cfg.device_id);
        Some(creator.build().len())
    }

    fn ti2<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        ctx.radio.tx_start();
        self.state = SlotState::TxData;
    }

    fn ti3<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        ctx.timer.cancel(Alarm::Abort);
        ctx.radio.disable();
        self.state = SlotState::Sleep;
    }

    fn tie1<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        warn!("tx stuck, slot aborted");
        ctx.radio.disable();
        self.state = SlotState::Sleep;
    }

    // ------------------------------------------------------------------
    // RX path
    // ------------------------------------------------------------------

    fn ri1<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        ctx.timer.set_oneshot_with_ref(Alarm::Action, self.slot_start_ts, RX_OFFSET_US);
        ctx.timer
            .set_oneshot_with_ref(Alarm::Guard, self.slot_start_ts, TX_OFFSET_US + RX_GUARD_US);
        ctx.timer
            .set_oneshot_with_ref(Alarm::Abort, self.slot_start_ts, RX_OFFSET_US + RX_MAX_US);
        self.state = SlotState::RxOffset;
    }

    fn ri2<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        ctx.radio.set_channel(self.current_slot.channel);
        ctx.radio.rx_start();
        self.state = SlotState::RxDataListen;
    }

    fn ri3<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ts: u32, ctx: &mut Ctx<R, T, RNG>) {
        ctx.timer.cancel(Alarm::Guard);
        self.rx_start_ts = ts;
        ctx.scheduler.mark_used(self.current_slot.cell_index);
        self.state = SlotState::RxData;
    }

    fn rie1<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        ctx.timer.cancel(Alarm::Abort);
        ctx.radio.disable();
        self.state = SlotState::Sleep;
    }

    fn ri4<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        ctx.timer.cancel(Alarm::Abort);
        self.state = SlotState::Sleep;
        if !ctx.radio.pending_rx() {
            ctx.radio.disable();
            return;
        }
        let mut buf = [0u8; PACKET_MAX_SIZE];
        let len = ctx.radio.read(&mut buf);
        let rssi = ctx.radio.rssi();
        ctx.radio.disable();
        self.handle_frame(&mut buf[..len], rssi, ctx);
    }

    fn rie2<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        warn!("rx stuck, slot aborted");
        ctx.radio.disable();
        self.state = SlotState::Sleep;
    }

    // ------------------------------------------------------------------
    // packet handling
    // ------------------------------------------------------------------

    fn handle_frame<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        frame: &mut [u8],
        rssi: i8,
        ctx: &mut Ctx<R, T, RNG>,
    ) {
        // stamp the receive-time RSSI into common-header frames
        if frame.len() >= header::HEADER_LEN
            && frame[header::TYPE_OFF] != PacketType::Beacon as u8
        {
            frame[header::RSSI_OFF] = rssi as u8;
        }
        let payload = match parse(&frame[..]) {
            Ok(payload) => payload,
            Err(e) => {
                trace!("dropped frame: {}", e);
                return;
            }
        };

        // only a joined node trims its clock against the gateway; while
        // merely synced the association leaves on the no-RX timeout instead
        if ctx.cfg.role == Role::Node && ctx.assoc.is_joined() {
            let src = match &payload {
                PhyPayload::Beacon(b) => b.src(),
                PhyPayload::JoinRequest(p) => p.src(),
                PhyPayload::JoinResponse(p) => p.src(),
                PhyPayload::Keepalive(p) => p.src(),
                PhyPayload::Data(p) => p.src(),
            };
            if src == ctx.assoc.gateway_id() {
                self.correct_drift(ctx);
            }
        }

        match payload {
            PhyPayload::Beacon(beacon) => self.handle_beacon(&beacon, rssi, ctx),
            PhyPayload::JoinRequest(request) => {
                if ctx.cfg.role != Role::Gateway
                    || !network_id_matches(ctx.cfg.network_id, request.network_id())
                    || !(request.is_broadcast() || request.dst() == ctx.cfg.device_id)
                {
                    return;
                }
                self.handle_join_request(request.src(), ctx);
            }
            PhyPayload::JoinResponse(response) => {
                if ctx.cfg.role != Role::Node
                    || ctx.assoc.state() != AssociationState::Joining
                    || response.dst() != ctx.cfg.device_id
                    || response.src() != ctx.assoc.gateway_id()
                {
                    return;
                }
                let cell = response.assigned_cell_index();
                if !ctx.scheduler.adopt_cell(cell, ctx.cfg.device_id, self.current_asn) {
                    return;
                }
                ctx.assoc.on_join_response();
                ctx.assoc.record_rx_from_gateway(self.current_asn);
                info!("joined gateway {=u64:x} in cell {=u8}", ctx.assoc.gateway_id(), cell);
                (ctx.events)(Event::Connected { gateway_id: ctx.assoc.gateway_id() });
            }
            PhyPayload::Keepalive(keepalive) => {
                if ctx.cfg.role != Role::Gateway
                    || !network_id_matches(ctx.cfg.network_id, keepalive.network_id())
                    || keepalive.dst() != ctx.cfg.device_id
                {
                    return;
                }
                if ctx.scheduler.touch_node(keepalive.src(), self.current_asn) {
                    (ctx.events)(Event::Keepalive { node_id: keepalive.src() });
                }
            }
            PhyPayload::Data(data) => self.handle_data(&data, rssi, ctx),
        }
    }

    fn handle_beacon<R: Radio, T: SlotTimer, RNG: RngCore, U: AsRef<[u8]>>(
        &mut self,
        beacon: &BeaconPayload<U>,
        rssi: i8,
        ctx: &mut Ctx<R, T, RNG>,
    ) {
        if ctx.cfg.role != Role::Node {
            return;
        }
        if !network_id_matches(ctx.cfg.network_id, beacon.network_id()) {
            return;
        }
        if beacon.src() != ctx.assoc.gateway_id() {
            return;
        }
        ctx.assoc.on_beacon_from_gateway(self.current_asn, rssi, beacon.remaining_capacity());
        if ctx.assoc.is_joined() && !bloom_contains(ctx.cfg.device_id, beacon.bloom()) {
            debug!("evicted from the membership filter");
            ctx.assoc.flag_disconnect(DisconnectReason::PeerLostBloom);
        }
    }

    fn handle_join_request<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        node_id: u64,
        ctx: &mut Ctx<R, T, RNG>,
    ) {
        let Some(cell_index) = ctx.scheduler.assign_next_uplink(node_id, self.current_asn) else {
            debug!("join request from {=u64:x} but schedule is full", node_id);
            (ctx.events)(Event::Error { reason: DisconnectReason::GatewayFull });
            return;
        };
        let mut buf = [0u8; join::JOIN_RESPONSE_LEN];
        if let Ok(mut creator) = JoinResponseCreator::new(&mut buf[..]) {
            creator
                .set_network_id(ctx.cfg.network_id)
                .set_dst(node_id)
                .set_src(ctx.cfg.device_id);
            creator.set_assigned_cell_index(cell_index);
            let frame = creator.build();
            ctx.queue.set_join_packet(frame);
        }
        ctx.bloom.mark_dirty();
        (ctx.events)(Event::NodeJoined { node_id });
    }

    fn handle_data<R: Radio, T: SlotTimer, RNG: RngCore, U: AsRef<[u8]>>(
        &mut self,
        data: &DataPayload<U>,
        rssi: i8,
        ctx: &mut Ctx<R, T, RNG>,
    ) {
        if !network_id_matches(ctx.cfg.network_id, data.network_id()) {
            return;
        }
        if !(data.is_broadcast() || data.dst() == ctx.cfg.device_id) {
            return;
        }
        match ctx.cfg.role {
            Role::Gateway => {
                ctx.scheduler.touch_node(data.src(), self.current_asn);
            }
            Role::Node => {
                if data.src() != ctx.assoc.gateway_id() {
                    return;
                }
                ctx.assoc.record_rx_from_gateway(self.current_asn);
            }
        }
        let mut packet = ReceivedPacket {
            src: data.src(),
            dst: data.dst(),
            rssi,
            payload: heapless::Vec::new(),
        };
        if packet.payload.extend_from_slice(data.payload()).is_err() {
            return;
        }
        (ctx.events)(Event::NewPacket(packet));
    }

    /// Compares the hardware start-of-frame timestamp with where the synced
    /// gateway's transmission should have landed, and nudges the inter-slot
    /// compare channel by the difference. Past the tolerance the node is out
    /// of sync and schedules its own disconnect.
    fn correct_drift<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        let expected = self
            .slot_start_ts
            .wrapping_add(TX_OFFSET_US)
            .wrapping_add(CPU_PERIPH_OFFSET_US);
        let drift = delta_us(expected, self.rx_start_ts);
        if drift.abs() < DRIFT_MAX_US {
            ctx.timer.adjust(Alarm::InterSlot, drift);
        } else {
            debug!("drift {=i32} us, lost sync", drift);
            ctx.assoc.flag_disconnect(DisconnectReason::OutOfSync);
        }
    }

    // ------------------------------------------------------------------
    // sleep slots and background scan
    // ------------------------------------------------------------------

    fn sleep_slot<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        self.state = SlotState::Sleep;
        if ctx.cfg.role == Role::Node
            && ENABLE_BACKGROUND_SCAN
            && ctx.assoc.is_joined()
            && !self.bg_scan_active
        {
            self.bg_scan_active = true;
            self.bg_scan_started_ts = self.slot_start_ts;
            ctx.radio.set_channel(SCAN_CHANNEL);
            ctx.radio.rx_start();
        }
    }

    /// Closes the background scan window and runs the handover decision.
    /// Returns `true` when a handover (or a failed one) took the node out of
    /// slotted operation for this gateway.
    fn end_bg_scan<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) -> bool {
        self.bg_scan_active = false;
        ctx.radio.disable();
        let now = ctx.timer.now();
        let Some(selected) = ctx.scan.select(self.bg_scan_started_ts, now) else {
            return false;
        };
        if selected.gateway_id == ctx.assoc.gateway_id() {
            return false;
        }
        if !ctx.assoc.handover_allowed(now) {
            return false;
        }
        let current_rssi = ctx.assoc.gateway_rssi() as i32;
        if (selected.avg_rssi as i32) < current_rssi + HANDOVER_RSSI_HYSTERESIS as i32 {
            return false;
        }

        info!("handover to gateway {=u64:x}", selected.gateway_id);
        self.disconnect(ctx, DisconnectReason::Handover);
        let now = ctx.timer.now();
        if !self.sync_to_gateway(ctx, now, &selected, ctx.cfg.handover_correction_us) {
            (ctx.events)(Event::Disconnected {
                gateway_id: selected.gateway_id,
                reason: DisconnectReason::HandoverFailed,
            });
            self.start_scan(ctx);
        }
        true
    }

    // ------------------------------------------------------------------
    // scanning and synchronisation
    // ------------------------------------------------------------------

    pub(crate) fn start_scan<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        ctx.assoc.start_scan();
        ctx.scan.clear();
        self.scan_active = true;
        self.bg_scan_active = false;
        self.scan_started_ts = ctx.timer.now();
        ctx.radio.set_channel(SCAN_CHANNEL);
        ctx.radio.rx_start();
        let duration = slotframe_duration_us(ctx.scheduler.n_cells());
        ctx.timer.set_oneshot(Alarm::Scan, duration);
    }

    /// A frame finished while the radio was in a scan window: keep it when
    /// it is an acceptable beacon, then listen again.
    fn scan_frame_received<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        let mut buf = [0u8; PACKET_MAX_SIZE];
        let len = ctx.radio.read(&mut buf);
        let rssi = ctx.radio.rssi();
        if let Ok(PhyPayload::Beacon(beacon)) = parse(&buf[..len]) {
            if network_id_matches(ctx.cfg.network_id, beacon.network_id()) {
                ctx.scan.add(
                    beacon.header().to_owned(),
                    rssi,
                    SCAN_CHANNEL,
                    self.scan_frame_start_ts,
                );
            }
        }
        ctx.radio.rx_start();
    }

    fn handle_scan_end<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        let now = ctx.timer.now();
        self.scan_active = false;
        ctx.radio.disable();
        let synced = match ctx.scan.select(self.scan_started_ts, now) {
            Some(selected) => self.sync_to_gateway(ctx, now, &selected, 0),
            None => false,
        };
        if !synced {
            // nothing usable heard; scan again
            self.scan_active = true;
            self.scan_started_ts = now;
            ctx.radio.set_channel(SCAN_CHANNEL);
            ctx.radio.rx_start();
            let duration = slotframe_duration_us(ctx.scheduler.n_cells());
            ctx.timer.set_oneshot(Alarm::Scan, duration);
        }
    }

    /// Locks on to a scanned gateway: installs its schedule, derives the ASN
    /// and arms the first slot tick at the right distance from the captured
    /// beacon timestamp.
    fn sync_to_gateway<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        ctx: &mut Ctx<R, T, RNG>,
        now: u32,
        selected: &SelectedGateway,
        correction_us: u32,
    ) -> bool {
        let beacon = &selected.info.beacon;
        if !ctx.scheduler.set_active_schedule(beacon.active_schedule_id()) {
            warn!("beacon advertises unknown schedule {=u8}", beacon.active_schedule_id());
            return false;
        }
        ctx.queue.reset();
        ctx.assoc.set_synced(
            selected.gateway_id,
            beacon.network_id(),
            beacon.remaining_capacity(),
            now,
            ctx.rng,
        );
        self.prime_join_request(ctx);

        let elapsed = elapsed_us(now, selected.info.timestamp);
        let mut slots_since = (elapsed / SLOT_DURATION_US) as u64 + 1;
        let remainder = elapsed % SLOT_DURATION_US;
        let mut dispatch_offset = SLOT_DURATION_US - remainder;
        if remainder > SLOT_DURATION_US / 2 {
            // too close to the boundary; aim one slot further out
            slots_since += 1;
            dispatch_offset += SLOT_DURATION_US;
        }
        dispatch_offset =
            dispatch_offset.saturating_sub(ctx.cfg.sync_cpu_toa_us + correction_us).max(1);

        self.scan_active = false;
        self.bg_scan_active = false;
        self.periodic_installed = false;
        self.state = SlotState::Sleep;
        self.asn = beacon.asn() + slots_since;
        ctx.timer.set_oneshot_with_ref(Alarm::InterSlot, now, dispatch_offset);
        info!(
            "synced to gateway {=u64:x}, first slot asn {=u64}",
            selected.gateway_id, self.asn
        );
        true
    }

    fn prime_join_request<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        let mut buf = [0u8; join::JOIN_REQUEST_LEN];
        if let Ok(mut creator) = JoinRequestCreator::new(&mut buf[..]) {
            creator
                .set_network_id(ctx.assoc.network_id())
                .set_dst(ctx.assoc.gateway_id())
                .set_src(ctx.cfg.device_id);
            let frame = creator.build();
            ctx.queue.set_join_packet(frame);
        }
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    /// Emits the disconnect event and leaves slotted operation.
    fn disconnect<R: Radio, T: SlotTimer, RNG: RngCore>(
        &mut self,
        ctx: &mut Ctx<R, T, RNG>,
        reason: DisconnectReason,
    ) {
        let gateway_id = ctx.assoc.gateway_id();
        debug!("disconnected from {=u64:x}", gateway_id);
        (ctx.events)(Event::Disconnected { gateway_id, reason });
        self.stop_slotting(ctx);
    }

    fn stop_slotting<R: Radio, T: SlotTimer, RNG: RngCore>(&mut self, ctx: &mut Ctx<R, T, RNG>) {
        ctx.scheduler.deassign_node(ctx.cfg.device_id);
        ctx.queue.reset();
        ctx.timer.cancel(Alarm::InterSlot);
        ctx.timer.cancel(Alarm::Action);
        ctx.timer.cancel(Alarm::Guard);
        ctx.timer.cancel(Alarm::Abort);
        ctx.radio.disable();
        self.periodic_installed = false;
        self.bg_scan_active = false;
        self.state = SlotState::Sleep;
    }
}
