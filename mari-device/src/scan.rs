//! Table of recently heard gateways.
//!
//! Filled during initial scans and background scans, one entry per gateway
//! with up to one RSSI sample per advertising channel. Selection averages
//! the samples that fall inside the freshness window and picks the loudest
//! gateway.

use mari_encoding::packet_length::beacon::BEACON_HEADER_LEN;
use mari_encoding::parser::BeaconHeader;

use crate::constants::{MAX_SCAN_LIST, N_SCAN_CHANNELS, SCAN_CHANNEL, SCAN_OLD_US};
use crate::timer::{delta_us, elapsed_us};

/// One beacon capture: the stripped (bloom-less) header plus reception
/// metadata.
#[derive(Clone, Copy)]
pub struct ChannelInfo {
    pub rssi: i8,
    pub timestamp: u32,
    pub captured_asn: u64,
    pub beacon: BeaconHeader<[u8; BEACON_HEADER_LEN]>,
}

#[derive(Clone, Copy)]
struct GatewayEntry {
    gateway_id: u64,
    samples: [Option<ChannelInfo>; N_SCAN_CHANNELS],
}

impl GatewayEntry {
    fn latest(&self) -> Option<&ChannelInfo> {
        let mut latest: Option<&ChannelInfo> = None;
        for sample in self.samples.iter().flatten() {
            latest = match latest {
                Some(cur) if delta_us(cur.timestamp, sample.timestamp) <= 0 => Some(cur),
                _ => Some(sample),
            };
        }
        latest
    }
}

/// The gateway selected at the end of a scan window.
#[derive(Clone, Copy)]
pub struct SelectedGateway {
    pub gateway_id: u64,
    pub avg_rssi: i8,
    pub info: ChannelInfo,
}

pub struct ScanTable {
    entries: [Option<GatewayEntry>; MAX_SCAN_LIST],
}

impl ScanTable {
    pub const fn new() -> Self {
        Self { entries: [None; MAX_SCAN_LIST] }
    }

    pub fn clear(&mut self) {
        self.entries = [None; MAX_SCAN_LIST];
    }

    /// Records a beacon capture. An existing entry for the gateway is
    /// refreshed in place; otherwise the first free slot is taken, and when
    /// the table is full the entry whose newest sample is oldest gets
    /// recycled.
    pub fn add(&mut self, beacon: BeaconHeader<[u8; BEACON_HEADER_LEN]>, rssi: i8, channel: u8, timestamp: u32) {
        let sample = ChannelInfo { rssi, timestamp, captured_asn: beacon.asn(), beacon };
        let channel_idx = (channel.saturating_sub(SCAN_CHANNEL) as usize).min(N_SCAN_CHANNELS - 1);
        let gateway_id = beacon.src();

        if let Some(entry) = self
            .entries
            .iter_mut()
            .flatten()
            .find(|entry| entry.gateway_id == gateway_id)
        {
            entry.samples[channel_idx] = Some(sample);
            return;
        }

        let slot = match self.entries.iter().position(|entry| entry.is_none()) {
            Some(free) => free,
            None => self.oldest_entry(timestamp),
        };
        let mut entry = GatewayEntry { gateway_id, samples: [None; N_SCAN_CHANNELS] };
        entry.samples[channel_idx] = Some(sample);
        self.entries[slot] = Some(entry);
    }

    fn oldest_entry(&self, now: u32) -> usize {
        let mut oldest = 0;
        let mut oldest_age = 0u32;
        for (i, entry) in self.entries.iter().enumerate() {
            let Some(entry) = entry else {
                return i;
            };
            let age = match entry.latest() {
                Some(sample) => elapsed_us(now, sample.timestamp),
                None => u32::MAX,
            };
            if age >= oldest_age {
                oldest_age = age;
                oldest = i;
            }
        }
        oldest
    }

    /// Picks the gateway with the highest average RSSI over the samples that
    /// are both inside the scan window and younger than [`SCAN_OLD_US`] at
    /// its end. Ties go to the most recently heard entry.
    pub fn select(&self, scan_started_ts: u32, scan_ended_ts: u32) -> Option<SelectedGateway> {
        let mut best: Option<(i32, u32, SelectedGateway)> = None;

        for entry in self.entries.iter().flatten() {
            let mut sum = 0i32;
            let mut count = 0i32;
            let mut latest: Option<&ChannelInfo> = None;
            for sample in entry.samples.iter().flatten() {
                if !sample_is_fresh(sample.timestamp, scan_started_ts, scan_ended_ts) {
                    continue;
                }
                sum += sample.rssi as i32;
                count += 1;
                latest = match latest {
                    Some(cur) if delta_us(cur.timestamp, sample.timestamp) <= 0 => Some(cur),
                    _ => Some(sample),
                };
            }
            let Some(latest) = latest else {
                continue;
            };
            let avg = sum / count;
            let candidate = SelectedGateway {
                gateway_id: entry.gateway_id,
                avg_rssi: avg as i8,
                info: *latest,
            };
            let replace = match &best {
                None => true,
                Some((best_avg, best_ts, _)) => {
                    avg > *best_avg
                        || (avg == *best_avg && delta_us(*best_ts, latest.timestamp) > 0)
                }
            };
            if replace {
                best = Some((avg, latest.timestamp, candidate));
            }
        }

        best.map(|(_, _, selected)| selected)
    }
}

fn sample_is_fresh(sample_ts: u32, scan_started_ts: u32, scan_ended_ts: u32) -> bool {
    delta_us(scan_started_ts, sample_ts) >= 0
        && delta_us(sample_ts, scan_ended_ts) <= SCAN_OLD_US as i32
}

impl Default for ScanTable {
    fn default() -> Self {
        Self::new()
    }
}
