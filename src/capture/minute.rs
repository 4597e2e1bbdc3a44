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

//! Minute accumulation. A minute is `sample_rate × 60` samples against the
//! RTP clock, nothing else; the wall clock plays no part in deciding when a
//! buffer is full. The only permissible short input is the final flush on
//! shutdown, which pads the tail and marks it recorder-offline.

use crate::{
    archive::{Gap, GapCategory},
    capture::resequencer::SampleChunk,
    timebase::rtp_add,
};
use num_complex::Complex;
use tracing::debug;

/// One completed minute, before provenance (anchor, tone snapshot) is
/// attached by the capture actor.
#[derive(Debug, Clone)]
pub struct FinishedMinute {
    pub rtp_start: u32,
    pub iq: Vec<Complex<f32>>,
    pub gaps: Vec<Gap>,
    pub packets_received: u32,
    pub packets_expected: u32,
}

pub struct MinuteAccumulator {
    target: usize,
    samples_per_packet: u32,
    rtp_start: Option<u32>,
    buf: Vec<Complex<f32>>,
    gaps: Vec<Gap>,
    packets_received: u32,
}

impl MinuteAccumulator {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            target: sample_rate as usize * 60,
            samples_per_packet: 0,
            rtp_start: None,
            buf: Vec::new(),
            gaps: Vec::new(),
            packets_received: 0,
        }
    }

    pub fn fill(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.rtp_start.is_none()
    }

    /// RTP index the next pushed chunk must start at, once locked.
    pub fn next_rtp(&self) -> Option<u32> {
        self.rtp_start.map(|start| rtp_add(start, self.buf.len() as i64))
    }

    /// Append one resequencer chunk. `reclassify` rewrites the category of
    /// gap chunks (network-loss becomes source-silence while the SDR daemon
    /// reports itself not producing). Returns every minute that completed.
    pub fn push(
        &mut self,
        chunk: SampleChunk,
        reclassify: Option<GapCategory>,
    ) -> Vec<FinishedMinute> {
        match chunk {
            SampleChunk::Samples { rtp_start, iq } => {
                self.samples_per_packet = (iq.len() as u32).max(self.samples_per_packet);
                self.packets_received += 1;
                self.append(rtp_start, &iq, None)
            }
            SampleChunk::Gap {
                rtp_start,
                len,
                category,
            } => {
                let category = match (category, reclassify) {
                    (GapCategory::NetworkLoss, Some(other)) => other,
                    (cat, _) => cat,
                };
                self.append_zeros(rtp_start, len, category)
            }
        }
    }

    /// Final flush on shutdown: pad the remainder of the minute with zeros
    /// marked recorder-offline. Returns `None` if nothing was buffered.
    pub fn finalize(&mut self) -> Option<FinishedMinute> {
        if self.buf.is_empty() {
            return None;
        }

        let pad = self.target - self.buf.len();
        if pad > 0 {
            let at = self.next_rtp().expect("non-empty buffer is locked");
            debug!("Padding final minute with {pad} recorder-offline samples");
            self.record_gap(at, pad as u32, GapCategory::RecorderOffline);
            self.buf.extend(std::iter::repeat_n(Complex::new(0.0, 0.0), pad));
        }

        Some(self.take_finished())
    }

    fn append(
        &mut self,
        rtp_start: u32,
        iq: &[Complex<f32>],
        zero_category: Option<GapCategory>,
    ) -> Vec<FinishedMinute> {
        if self.rtp_start.is_none() {
            self.rtp_start = Some(rtp_start);
        }

        let mut finished = Vec::new();
        let mut offset = 0usize;

        while offset < iq.len() {
            let room = self.target - self.buf.len();
            let take = room.min(iq.len() - offset);

            if let Some(category) = zero_category {
                let at = rtp_add(rtp_start, offset as i64);
                self.record_gap(at, take as u32, category);
            }
            self.buf.extend_from_slice(&iq[offset..offset + take]);
            offset += take;

            if self.buf.len() == self.target {
                finished.push(self.take_finished());
            }
        }

        finished
    }

    fn append_zeros(
        &mut self,
        rtp_start: u32,
        len: u32,
        category: GapCategory,
    ) -> Vec<FinishedMinute> {
        // Gap runs can span several minutes; reuse the splitting of
        // `append` with a zero block per segment.
        let mut finished = Vec::new();
        let mut emitted = 0u32;

        while emitted < len {
            let room = (self.target - self.buf.len()) as u32;
            let take = room.min(len - emitted).max(1);
            let zeros = vec![Complex::new(0.0, 0.0); take as usize];
            finished.extend(self.append(
                rtp_add(rtp_start, emitted as i64),
                &zeros,
                Some(category),
            ));
            emitted += take;
        }

        finished
    }

    fn record_gap(&mut self, rtp_index: u32, len: u32, category: GapCategory) {
        // Coalesce adjacent runs of the same category.
        if let Some(last) = self.gaps.last_mut()
            && last.category == category
            && rtp_add(last.rtp_index, last.len as i64) == rtp_index
        {
            last.len += len;
            return;
        }
        self.gaps.push(Gap {
            rtp_index,
            len,
            category,
        });
    }

    fn take_finished(&mut self) -> FinishedMinute {
        let rtp_start = self.rtp_start.expect("finished buffer is locked");
        let iq = std::mem::take(&mut self.buf);
        let gaps = std::mem::take(&mut self.gaps);
        let packets_received = self.packets_received;

        let spp = self.samples_per_packet.max(1);
        let packets_expected = (self.target as u32).div_ceil(spp);

        self.rtp_start = Some(rtp_add(rtp_start, self.target as i64));
        self.packets_received = 0;

        FinishedMinute {
            rtp_start,
            iq,
            gaps,
            packets_received,
            packets_expected,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SR: u32 = 200;
    const TARGET: usize = SR as usize * 60;
    const SPP: u32 = 40;

    fn samples(rtp_start: u32, n: u32) -> SampleChunk {
        SampleChunk::Samples {
            rtp_start,
            iq: vec![Complex::new(0.5, -0.5); n as usize],
        }
    }

    fn gap(rtp_start: u32, len: u32) -> SampleChunk {
        SampleChunk::Gap {
            rtp_start,
            len,
            category: GapCategory::NetworkLoss,
        }
    }

    #[test]
    fn flushes_exactly_at_target_length() {
        let mut acc = MinuteAccumulator::new(SR);
        let mut finished = Vec::new();
        let packets = TARGET as u32 / SPP;
        for i in 0..packets {
            finished.extend(acc.push(samples(1_000 + i * SPP, SPP), None));
        }
        assert_eq!(1, finished.len());
        let minute = &finished[0];
        assert_eq!(TARGET, minute.iq.len());
        assert_eq!(1_000, minute.rtp_start);
        assert_eq!(packets, minute.packets_received);
        assert!(minute.gaps.is_empty());
        assert_eq!(0, acc.fill());
    }

    #[test]
    fn straddling_packet_is_split_across_minutes() {
        let mut acc = MinuteAccumulator::new(SR);
        let mut finished = Vec::new();
        // Fill all but 10 samples, then push a 40-sample packet.
        finished.extend(acc.push(samples(0, TARGET as u32 - 10), None));
        finished.extend(acc.push(samples(TARGET as u32 - 10, SPP), None));
        assert_eq!(1, finished.len());
        assert_eq!(TARGET, finished[0].iq.len());
        assert_eq!(30, acc.fill());
        assert_eq!(Some(TARGET as u32 + 30), acc.next_rtp());
    }

    #[test]
    fn successive_minutes_advance_rtp_start_by_one_minute() {
        let mut acc = MinuteAccumulator::new(SR);
        let mut finished = Vec::new();
        for i in 0..(2 * TARGET as u32 / SPP) {
            finished.extend(acc.push(samples(i * SPP, SPP), None));
        }
        assert_eq!(2, finished.len());
        assert_eq!(
            finished[0].rtp_start.wrapping_add(TARGET as u32),
            finished[1].rtp_start
        );
    }

    #[test]
    fn gap_accounting_balances_the_minute() {
        let mut acc = MinuteAccumulator::new(SR);
        let mut finished = Vec::new();
        finished.extend(acc.push(samples(0, 10 * SPP), None));
        finished.extend(acc.push(gap(10 * SPP, 20 * SPP), None));
        let rest_start = 30 * SPP;
        let rest = (TARGET as u32 - rest_start) / SPP;
        for i in 0..rest {
            finished.extend(acc.push(samples(rest_start + i * SPP, SPP), None));
        }
        assert_eq!(1, finished.len());
        let minute = &finished[0];
        let gap_sum: u32 = minute.gaps.iter().map(|g| g.len).sum();
        assert_eq!(
            TARGET as u32,
            gap_sum + minute.packets_received * SPP
        );
        assert_eq!(1, minute.gaps.len());
        assert_eq!(20 * SPP, minute.gaps[0].len);
    }

    #[test]
    fn multi_minute_gap_is_split_per_archive() {
        let mut acc = MinuteAccumulator::new(SR);
        let mut finished = Vec::new();
        finished.extend(acc.push(samples(0, SPP), None));
        // A gap spanning the rest of this minute and the whole next one.
        finished.extend(acc.push(gap(SPP, 2 * TARGET as u32 - SPP), None));
        assert_eq!(2, finished.len());
        assert!(finished.iter().all(|m| m.iq.len() == TARGET));
        assert_eq!(TARGET as u32 - SPP, finished[0].gaps[0].len);
        assert_eq!(TARGET as u32, finished[1].gaps[0].len);
        assert_eq!(TARGET as u32, finished[1].gaps[0].rtp_index);
    }

    #[test]
    fn source_silence_reclassification_applies() {
        let mut acc = MinuteAccumulator::new(SR);
        acc.push(samples(0, SPP), None);
        acc.push(gap(SPP, SPP), Some(GapCategory::SourceSilence));
        let minute = {
            let mut finished = Vec::new();
            for i in 2..(TARGET as u32 / SPP) {
                finished.extend(acc.push(samples(i * SPP, SPP), None));
            }
            finished.remove(0)
        };
        assert_eq!(GapCategory::SourceSilence, minute.gaps[0].category);
    }

    #[test]
    fn final_flush_pads_with_recorder_offline() {
        let mut acc = MinuteAccumulator::new(SR);
        // 20 seconds of samples, then shutdown.
        acc.push(samples(5_000, 20 * SR), None);
        let minute = acc.finalize().expect("partial minute");
        assert_eq!(TARGET, minute.iq.len());
        let tail = minute.gaps.last().expect("pad gap");
        assert_eq!(GapCategory::RecorderOffline, tail.category);
        assert_eq!(40 * SR, tail.len);
        assert_eq!(rtp_add(5_000, (20 * SR) as i64), tail.rtp_index);
        assert!(minute.iq[TARGET - 1].norm() == 0.0);
    }

    #[test]
    fn finalize_of_empty_accumulator_is_none() {
        let mut acc = MinuteAccumulator::new(SR);
        assert!(acc.finalize().is_none());
    }

    #[test]
    fn zero_only_minute_reports_zero_packets() {
        let mut acc = MinuteAccumulator::new(SR);
        let finished = acc.push(gap(0, TARGET as u32), None);
        assert_eq!(1, finished.len());
        assert_eq!(0, finished[0].packets_received);
        assert_eq!(TARGET as u32, finished[0].gaps[0].len);
    }
}
