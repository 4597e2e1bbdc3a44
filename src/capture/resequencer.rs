/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Per-SSRC packet resequencer. Emits a strictly monotonic sample stream
//! with explicit gap records; the emitted sample count (samples plus
//! zero-fill) always equals the RTP timestamp span, bit-exact.

use crate::{
    archive::GapCategory,
    capture::rtp::IqPacket,
    timebase::rtp_delta,
};
use num_complex::Complex;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, warn};

pub const REORDER_WINDOW_PACKETS: usize = 16;

/// How long an out-of-order packet may sit in the reorder window before the
/// stream is forced past it.
pub const REORDER_TIMEOUT: Duration = Duration::from_millis(500);

/// Consecutive impossible timestamps before the stream is re-locked.
const DESYNC_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum SampleChunk {
    Samples {
        rtp_start: u32,
        iq: Vec<Complex<f32>>,
    },
    Gap {
        rtp_start: u32,
        len: u32,
        category: GapCategory,
    },
}

impl SampleChunk {
    pub fn len(&self) -> u32 {
        match self {
            SampleChunk::Samples { iq, .. } => iq.len() as u32,
            SampleChunk::Gap { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResequencerStats {
    pub packets_emitted: u64,
    pub packets_late_dropped: u64,
    pub packets_evicted: u64,
    pub gaps_declared: u64,
    pub desyncs: u64,
}

struct Pending {
    samples: Vec<Complex<f32>>,
    received_at: Duration,
}

pub struct Resequencer {
    /// Wrapped RTP timestamp of the next expected sample.
    expected: Option<u32>,
    /// Unwrapped position of `expected`; keys the reorder window so that
    /// ordering survives the 32-bit wrap.
    expected_upos: u64,
    pending: BTreeMap<u64, Pending>,
    samples_per_packet: u32,
    backward_run: u32,
    stats: ResequencerStats,
}

impl Resequencer {
    pub fn new() -> Self {
        Self {
            expected: None,
            expected_upos: 0,
            pending: BTreeMap::new(),
            samples_per_packet: 0,
            backward_run: 0,
            stats: ResequencerStats::default(),
        }
    }

    pub fn stats(&self) -> ResequencerStats {
        self.stats
    }

    fn window_max_samples(&self) -> i64 {
        REORDER_WINDOW_PACKETS as i64 * self.samples_per_packet.max(1) as i64
    }

    /// Feed one packet; returns the chunks that became emittable.
    pub fn push(&mut self, pkt: IqPacket) -> Vec<SampleChunk> {
        let mut out = Vec::new();
        let n = pkt.samples.len() as u32;

        let Some(expected) = self.expected else {
            // First packet locks the stream position.
            self.expected = Some(pkt.rtp_timestamp.wrapping_add(n));
            // Bias the unwrapped coordinate so reordered predecessors of the
            // very first packet cannot underflow.
            self.expected_upos = (1 << 33) + n as u64;
            self.samples_per_packet = n;
            self.stats.packets_emitted += 1;
            out.push(SampleChunk::Samples {
                rtp_start: pkt.rtp_timestamp,
                iq: pkt.samples,
            });
            return out;
        };

        self.samples_per_packet = n.max(1);
        let delta = rtp_delta(expected, pkt.rtp_timestamp);
        let window = self.window_max_samples();

        if delta == 0 {
            self.backward_run = 0;
            self.emit_packet(pkt.rtp_timestamp, pkt.samples, &mut out);
            self.drain_contiguous(&mut out);
        } else if delta > 0 && delta <= window {
            self.backward_run = 0;
            let upos = self.expected_upos + delta as u64;
            self.pending.insert(
                upos,
                Pending {
                    samples: pkt.samples,
                    received_at: pkt.received_at,
                },
            );
            if self.pending.len() > REORDER_WINDOW_PACKETS {
                self.force_past_oldest(&mut out);
            }
        } else if delta < 0 && -delta <= window {
            // Late packet, emitting it would break monotonicity.
            self.backward_run = 0;
            self.stats.packets_late_dropped += 1;
            debug!("Dropping late packet, {} samples behind", -delta);
        } else if delta > 0 {
            // Timestamp jump beyond the window: declare the loss and move on.
            self.declare_gap(expected, delta as u32, &mut out);
            self.expected = Some(pkt.rtp_timestamp);
            self.expected_upos += delta as u64;
            self.emit_packet(pkt.rtp_timestamp, pkt.samples, &mut out);
            self.drain_contiguous(&mut out);
        } else {
            // Backward jump beyond the window. A restarted source gets a
            // fresh timestamp base, so re-lock after a consistent run.
            self.backward_run += 1;
            self.stats.packets_late_dropped += 1;
            if self.backward_run >= DESYNC_THRESHOLD {
                warn!(
                    "RTP timestamp desync ({} samples backwards), re-locking stream",
                    -delta
                );
                self.stats.desyncs += 1;
                self.pending.clear();
                self.backward_run = 0;
                self.expected = Some(pkt.rtp_timestamp.wrapping_add(n));
                self.expected_upos = (1 << 33) + n as u64;
                self.stats.packets_emitted += 1;
                out.push(SampleChunk::Samples {
                    rtp_start: pkt.rtp_timestamp,
                    iq: pkt.samples,
                });
            }
        }

        out
    }

    /// Time-based eviction; call periodically even when no packets arrive.
    pub fn poll(&mut self, now: Duration) -> Vec<SampleChunk> {
        let mut out = Vec::new();

        loop {
            let expired = self
                .pending
                .first_key_value()
                .is_some_and(|(_, p)| now.saturating_sub(p.received_at) >= REORDER_TIMEOUT);
            if !expired {
                break;
            }
            self.stats.packets_evicted += 1;
            self.force_past_oldest(&mut out);
        }

        out
    }

    /// Drains everything still buffered, declaring the holes. Used on
    /// shutdown so the minute writer sees the full sample span.
    pub fn flush(&mut self) -> Vec<SampleChunk> {
        let mut out = Vec::new();
        while !self.pending.is_empty() {
            self.force_past_oldest(&mut out);
        }
        out
    }

    fn emit_packet(&mut self, rtp_start: u32, iq: Vec<Complex<f32>>, out: &mut Vec<SampleChunk>) {
        let n = iq.len() as u32;
        self.stats.packets_emitted += 1;
        self.expected = Some(rtp_start.wrapping_add(n));
        self.expected_upos += n as u64;
        out.push(SampleChunk::Samples { rtp_start, iq });
    }

    fn declare_gap(&mut self, rtp_start: u32, len: u32, out: &mut Vec<SampleChunk>) {
        self.stats.gaps_declared += 1;
        debug!("Declaring network-loss gap of {len} samples at RTP {rtp_start}");
        out.push(SampleChunk::Gap {
            rtp_start,
            len,
            category: GapCategory::NetworkLoss,
        });
    }

    /// Declare the hole up to the oldest buffered packet, then emit it and
    /// any run that became contiguous.
    fn force_past_oldest(&mut self, out: &mut Vec<SampleChunk>) {
        let Some((&upos, _)) = self.pending.first_key_value() else {
            return;
        };
        let expected = self.expected.expect("pending implies a locked stream");
        let hole = (upos - self.expected_upos) as u32;
        if hole > 0 {
            self.declare_gap(expected, hole, out);
            self.expected = Some(expected.wrapping_add(hole));
            self.expected_upos += hole as u64;
        }
        self.drain_contiguous(out);
    }

    fn drain_contiguous(&mut self, out: &mut Vec<SampleChunk>) {
        while let Some(entry) = self.pending.first_entry() {
            let upos = *entry.key();
            if upos < self.expected_upos {
                // Superseded by a gap declaration.
                entry.remove();
                self.stats.packets_late_dropped += 1;
                continue;
            }
            if upos != self.expected_upos {
                break;
            }
            let pending = entry.remove();
            let rtp_start = self.expected.expect("pending implies a locked stream");
            self.emit_packet(rtp_start, pending.samples, out);
        }
    }
}

impl Default for Resequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SPP: u32 = 320;

    fn pkt(ts: u32, at_ms: u64) -> IqPacket {
        pkt_n(ts, SPP, at_ms)
    }

    fn pkt_n(ts: u32, n: u32, at_ms: u64) -> IqPacket {
        IqPacket {
            ssrc: 1,
            rtp_timestamp: ts,
            sequence: 0,
            payload_type: 97,
            samples: vec![Complex::new(1.0, -1.0); n as usize],
            received_at: Duration::from_millis(at_ms),
        }
    }

    fn total_span(chunks: &[SampleChunk]) -> u32 {
        chunks.iter().map(SampleChunk::len).sum()
    }

    #[test]
    fn in_order_stream_passes_through() {
        let mut rs = Resequencer::new();
        let mut emitted = Vec::new();
        for i in 0..10u32 {
            emitted.extend(rs.push(pkt(1_000 + i * SPP, i as u64)));
        }
        assert_eq!(10 * SPP, total_span(&emitted));
        assert!(emitted.iter().all(|c| matches!(c, SampleChunk::Samples { .. })));
    }

    #[test]
    fn swapped_packets_are_reordered() {
        let mut rs = Resequencer::new();
        let mut emitted = Vec::new();
        emitted.extend(rs.push(pkt(0, 0)));
        emitted.extend(rs.push(pkt(2 * SPP, 1)));
        assert_eq!(SPP, total_span(&emitted));
        emitted.extend(rs.push(pkt(SPP, 2)));
        assert_eq!(3 * SPP, total_span(&emitted));
        let starts: Vec<u32> = emitted
            .iter()
            .map(|c| match c {
                SampleChunk::Samples { rtp_start, .. } => *rtp_start,
                SampleChunk::Gap { rtp_start, .. } => *rtp_start,
            })
            .collect();
        assert_eq!(vec![0, SPP, 2 * SPP], starts);
    }

    #[test]
    fn late_packet_is_dropped() {
        let mut rs = Resequencer::new();
        rs.push(pkt(SPP, 0));
        rs.push(pkt(2 * SPP, 1));
        let emitted = rs.push(pkt(0, 2));
        assert!(emitted.is_empty());
        assert_eq!(1, rs.stats().packets_late_dropped);
    }

    #[test]
    fn dropped_burst_becomes_one_exact_gap() {
        let mut rs = Resequencer::new();
        let mut emitted = Vec::new();
        emitted.extend(rs.push(pkt(0, 0)));
        // Packets 1..=20 lost: 20 * 320 = 6400 samples.
        emitted.extend(rs.push(pkt(21 * SPP, 1)));
        let gaps: Vec<_> = emitted
            .iter()
            .filter_map(|c| match c {
                SampleChunk::Gap { rtp_start, len, category } => {
                    Some((*rtp_start, *len, *category))
                }
                _ => None,
            })
            .collect();
        assert_eq!(vec![(SPP, 6_400, GapCategory::NetworkLoss)], gaps);
        assert_eq!(22 * SPP, total_span(&emitted));
    }

    #[test]
    fn wraparound_continues_without_false_gap() {
        let start = u32::MAX - 16_000 + 1;
        let mut rs = Resequencer::new();
        let mut emitted = Vec::new();
        // 100 packets of 320 samples carry the stream across the wrap.
        for i in 0..100u32 {
            emitted.extend(rs.push(pkt(start.wrapping_add(i * SPP), i as u64)));
        }
        assert_eq!(100 * SPP, total_span(&emitted));
        assert!(emitted.iter().all(|c| matches!(c, SampleChunk::Samples { .. })));
        assert_eq!(0, rs.stats().gaps_declared);
    }

    #[test]
    fn window_overflow_forces_the_stream_forward() {
        let mut rs = Resequencer::new();
        let mut emitted = Vec::new();
        emitted.extend(rs.push(pkt(0, 0)));
        // Packet at SPP never arrives; everything after lands in the window.
        for i in 2..=(REORDER_WINDOW_PACKETS as u32 + 2) {
            emitted.extend(rs.push(pkt(i * SPP, i as u64)));
        }
        let span = total_span(&emitted);
        // The hole was declared as a gap and the buffered run emitted.
        assert!(span > SPP);
        assert!(
            emitted
                .iter()
                .any(|c| matches!(c, SampleChunk::Gap { len, .. } if *len == SPP))
        );
    }

    #[test]
    fn eviction_by_age_declares_the_hole() {
        let mut rs = Resequencer::new();
        let mut emitted = Vec::new();
        emitted.extend(rs.push(pkt(0, 0)));
        emitted.extend(rs.push(pkt(2 * SPP, 10)));
        assert_eq!(SPP, total_span(&emitted));

        emitted.extend(rs.poll(Duration::from_millis(10) + REORDER_TIMEOUT));
        assert_eq!(3 * SPP, total_span(&emitted));
        assert_eq!(1, rs.stats().packets_evicted);
    }

    #[test]
    fn flush_drains_pending_with_gap() {
        let mut rs = Resequencer::new();
        rs.push(pkt(0, 0));
        rs.push(pkt(3 * SPP, 1));
        let emitted = rs.flush();
        assert_eq!(3 * SPP, total_span(&emitted));
        assert!(matches!(
            emitted[0],
            SampleChunk::Gap { len, .. } if len == 2 * SPP
        ));
    }

    #[test]
    fn sample_count_is_preserved_under_loss_and_reorder() {
        let mut rs = Resequencer::new();
        let mut emitted = Vec::new();
        // 0..50 with 10 swapped pairs and packets 13, 27, 28 dropped.
        let mut order: Vec<u32> = (0..50).filter(|i| ![13, 27, 28].contains(i)).collect();
        for i in (1..order.len() - 1).step_by(5) {
            order.swap(i, i + 1);
        }
        for (k, i) in order.iter().enumerate() {
            emitted.extend(rs.push(pkt(i * SPP, k as u64)));
        }
        emitted.extend(rs.flush());
        assert_eq!(50 * SPP, total_span(&emitted));
    }
}
