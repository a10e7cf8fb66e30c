//! Shared helpers for the in-crate protocol tests: a scripted radio, a
//! virtual-time timer and frame builders.

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use rand::rngs::mock::StepRng;

use mari_encoding::creator::{
    BeaconCreator, DataCreator, JoinRequestCreator, JoinResponseCreator, KeepaliveCreator,
};
use mari_encoding::packet_length::beacon::{BEACON_LEN, BLOOM_LEN};
use mari_encoding::packet_length::join::{JOIN_REQUEST_LEN, JOIN_RESPONSE_LEN};

use crate::constants::PACKET_MAX_SIZE;
use crate::device::{Config, Event, Mari};
use crate::radio::{self, Radio};
use crate::timer::{Alarm, SlotTimer};
use crate::Role;

// ---------------------------------------------------------------------
// radio
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TestRadio {
    pub channel: u8,
    pub listening: bool,
    pub staged: Option<Vec<u8>>,
    /// Frames dispatched on air, with the channel they went out on.
    pub sent: Vec<(u8, Vec<u8>)>,
    pub pending: Option<Vec<u8>>,
    pub rssi: i8,
}

impl TestRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `frame` the latched reception; follow up with the frame-edge
    /// events to deliver it.
    pub fn inject(&mut self, frame: &[u8]) {
        self.pending = Some(frame.to_vec());
    }

    pub fn last_sent(&self) -> Option<&(u8, Vec<u8>)> {
        self.sent.last()
    }
}

impl Radio for TestRadio {
    fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    fn tx_prepare(&mut self, frame: &[u8]) {
        self.staged = Some(frame.to_vec());
    }

    fn tx_start(&mut self) {
        if let Some(frame) = self.staged.take() {
            self.sent.push((self.channel, frame));
        }
    }

    fn rx_start(&mut self) {
        self.listening = true;
    }

    fn disable(&mut self) {
        self.listening = false;
    }

    fn rssi(&mut self) -> i8 {
        self.rssi
    }

    fn pending_rx(&mut self) -> bool {
        self.pending.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.pending.take() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                frame.len()
            }
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------
// timer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Armed {
    deadline: u32,
    period: Option<u32>,
}

const N_ALARMS: usize = 5;

fn alarm_index(alarm: Alarm) -> usize {
    match alarm {
        Alarm::InterSlot => 0,
        Alarm::Action => 1,
        Alarm::Guard => 2,
        Alarm::Abort => 3,
        Alarm::Scan => 4,
    }
}

const ALARMS: [Alarm; N_ALARMS] =
    [Alarm::InterSlot, Alarm::Action, Alarm::Guard, Alarm::Abort, Alarm::Scan];

/// A 1 MHz virtual counter whose compare channels fire only when the test
/// asks for the next one.
#[derive(Debug, Default)]
pub struct TestTimer {
    now: u32,
    armed: [Option<Armed>; N_ALARMS],
    /// Every `adjust` call the engine made, in order.
    pub adjustments: Vec<(Alarm, i32)>,
}

impl TestTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self, alarm: Alarm) -> bool {
        self.armed[alarm_index(alarm)].is_some()
    }

    pub fn deadline(&self, alarm: Alarm) -> Option<u32> {
        self.armed[alarm_index(alarm)].map(|armed| armed.deadline)
    }

    /// The armed alarm that would fire next.
    pub fn next_due(&self) -> Option<(Alarm, u32)> {
        let mut best: Option<(Alarm, u32)> = None;
        for alarm in ALARMS {
            if let Some(armed) = self.armed[alarm_index(alarm)] {
                let distance = armed.deadline.wrapping_sub(self.now);
                match best {
                    Some((_, best_distance)) if distance >= best_distance => {}
                    _ => best = Some((alarm, distance)),
                }
            }
        }
        best.map(|(alarm, distance)| (alarm, self.now.wrapping_add(distance)))
    }

    /// Advances the clock to the next armed deadline and reports which
    /// channel fired. Periodic channels re-arm themselves.
    pub fn fire_next(&mut self) -> Option<Alarm> {
        let (alarm, deadline) = self.next_due()?;
        self.now = deadline;
        let index = alarm_index(alarm);
        match self.armed[index] {
            Some(Armed { period: Some(period), .. }) => {
                self.armed[index] =
                    Some(Armed { deadline: deadline.wrapping_add(period), period: Some(period) });
            }
            _ => self.armed[index] = None,
        }
        Some(alarm)
    }
}

impl SlotTimer for TestTimer {
    fn now(&self) -> u32 {
        self.now
    }

    fn set_periodic(&mut self, alarm: Alarm, period_us: u32) {
        self.armed[alarm_index(alarm)] =
            Some(Armed { deadline: self.now.wrapping_add(period_us), period: Some(period_us) });
    }

    fn set_oneshot_with_ref(&mut self, alarm: Alarm, ref_ts: u32, offset_us: u32) {
        self.armed[alarm_index(alarm)] =
            Some(Armed { deadline: ref_ts.wrapping_add(offset_us), period: None });
    }

    fn cancel(&mut self, alarm: Alarm) {
        self.armed[alarm_index(alarm)] = None;
    }

    fn adjust(&mut self, alarm: Alarm, delta_us: i32) {
        if let Some(armed) = &mut self.armed[alarm_index(alarm)] {
            armed.deadline = armed.deadline.wrapping_add(delta_us as u32);
        }
        self.adjustments.push((alarm, delta_us));
    }
}

// ---------------------------------------------------------------------
// device construction and driving
// ---------------------------------------------------------------------

pub type EventLog = Rc<RefCell<Vec<Event>>>;
pub type TestMari<F> = Mari<TestRadio, TestTimer, StepRng, F>;

fn build(cfg: Config) -> (EventLog, TestMari<impl FnMut(Event)>) {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let mari = Mari::new(
        cfg,
        TestRadio::new(),
        TestTimer::new(),
        StepRng::new(0, 0),
        move |event| sink.borrow_mut().push(event),
    )
    .unwrap();
    (log, mari)
}

pub fn test_gateway(device_id: u64, network_id: u16, schedule_id: u8) -> (EventLog, TestMari<impl FnMut(Event)>) {
    build(Config::new(Role::Gateway, device_id, network_id, schedule_id))
}

pub fn test_node(device_id: u64, network_id: u16, schedule_id: u8) -> (EventLog, TestMari<impl FnMut(Event)>) {
    build(Config::new(Role::Node, device_id, network_id, schedule_id))
}

/// Fires the next armed timer channel into the device.
pub fn step<F: FnMut(Event)>(mari: &mut TestMari<F>) -> Option<Alarm> {
    let alarm = mari.get_timer().fire_next()?;
    mari.on_timer(alarm);
    Some(alarm)
}

/// Steps until an inter-slot tick has been processed (the start of a slot).
pub fn step_to_slot_start<F: FnMut(Event)>(mari: &mut TestMari<F>) {
    loop {
        match step(mari) {
            Some(Alarm::InterSlot) => return,
            Some(_) => continue,
            None => panic!("timer went idle before the next slot"),
        }
    }
}

/// Fires the remaining intra-slot alarms without crossing into the next
/// slot.
pub fn finish_slot<F: FnMut(Event)>(mari: &mut TestMari<F>) {
    while let Some((alarm, _)) = mari.get_timer().next_due() {
        if alarm == Alarm::InterSlot || alarm == Alarm::Scan {
            return;
        }
        step(mari);
    }
}

/// Delivers `frame` as a reception with both frame-edge timestamps.
pub fn inject_frame<F: FnMut(Event)>(
    mari: &mut TestMari<F>,
    frame: &[u8],
    rssi: i8,
    start_of_frame_ts: u32,
) {
    mari.get_radio().rssi = rssi;
    mari.get_radio().inject(frame);
    mari.on_radio(radio::Event::FrameStarted(start_of_frame_ts));
    mari.on_radio(radio::Event::FrameEnded(start_of_frame_ts.wrapping_add(500)));
}

// ---------------------------------------------------------------------
// frame builders
// ---------------------------------------------------------------------

pub fn beacon_bytes(
    src: u64,
    asn: u64,
    network_id: u16,
    remaining_capacity: u8,
    schedule_id: u8,
    bloom: &[u8; BLOOM_LEN],
) -> Vec<u8> {
    let mut buf = vec![0u8; BEACON_LEN];
    let mut creator = BeaconCreator::new(&mut buf[..]).unwrap();
    creator
        .set_network_id(network_id)
        .set_asn(asn)
        .set_src(src)
        .set_remaining_capacity(remaining_capacity)
        .set_active_schedule_id(schedule_id)
        .set_bloom(bloom);
    creator.build();
    buf
}

pub fn join_request_bytes(src: u64, dst: u64, network_id: u16) -> Vec<u8> {
    let mut buf = vec![0u8; JOIN_REQUEST_LEN];
    let mut creator = JoinRequestCreator::new(&mut buf[..]).unwrap();
    creator.set_network_id(network_id).set_dst(dst).set_src(src);
    creator.build();
    buf
}

pub fn join_response_bytes(src: u64, dst: u64, network_id: u16, cell_index: u8) -> Vec<u8> {
    let mut buf = vec![0u8; JOIN_RESPONSE_LEN];
    let mut creator = JoinResponseCreator::new(&mut buf[..]).unwrap();
    creator.set_network_id(network_id).set_dst(dst).set_src(src);
    creator.set_assigned_cell_index(cell_index);
    creator.build();
    buf
}

pub fn keepalive_bytes(src: u64, dst: u64, network_id: u16) -> Vec<u8> {
    let mut buf = vec![0u8; JOIN_REQUEST_LEN];
    let mut creator = KeepaliveCreator::new(&mut buf[..]).unwrap();
    creator.set_network_id(network_id).set_dst(dst).set_src(src);
    creator.build();
    buf
}

pub fn data_bytes(src: u64, dst: u64, network_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; PACKET_MAX_SIZE];
    let mut creator = DataCreator::new(&mut buf[..]).unwrap();
    creator.set_network_id(network_id).set_dst(dst).set_src(src);
    let len = creator.set_payload(payload).unwrap();
    creator.build(len);
    buf.truncate(len);
    buf
}
