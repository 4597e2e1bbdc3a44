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

//! WWV/WWVH 100 Hz time-code analysis.
//!
//! The time code is pulse-width keyed, one bit per second, and fully
//! deterministic for a given UTC minute, which makes it a template for
//! cross-correlation. Two co-channel transmitters produce two correlation
//! peaks separated by their differential propagation delay; fitting both
//! time-shifted templates jointly by least squares recovers the per-station
//! amplitudes.

use crate::{
    dsp::{goertzel_power, parabolic_peak},
    station::BCD_SUBCARRIER_HZ,
};
use chrono::{DateTime, Datelike, Timelike, Utc};
use num_complex::Complex;

/// Resolution of the subcarrier power track and of the template.
pub const FRAME_RATE_HZ: f64 = 1_000.0;

/// The 100 Hz pulse starts this far into its second.
const PULSE_START_OFFSET_S: f64 = 0.03;

/// Correlation search range. Covers any terrestrial first-hop delay with
/// margin.
const MAX_LAG_MS: usize = 80;

/// Minimum separation between the two fitted peaks.
const MIN_PEAK_SEPARATION_MS: f64 = 3.0;

/// Secondary peak acceptance relative to the primary.
const SECOND_PEAK_MIN_RATIO: f64 = 0.2;

/// A dual fit must explain this much more template-aligned energy than the
/// best single fit before a second station is claimed. The shifted
/// templates are nearly collinear, so a lone station plus noise easily
/// "improves" by a fraction of a percent.
const PAIR_IMPROVEMENT: f64 = 1.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pulse {
    /// Second 0 carries the minute marker tone, no subcarrier.
    Off,
    Zero,
    One,
    Marker,
}

impl Pulse {
    fn duration_s(&self) -> f64 {
        match self {
            Pulse::Off => 0.0,
            Pulse::Zero => 0.17,
            Pulse::One => 0.47,
            Pulse::Marker => 0.77,
        }
    }
}

fn bit(value: u32, weight: u32) -> Pulse {
    if value & weight != 0 { Pulse::One } else { Pulse::Zero }
}

/// The 60 pulses of one minute of time code.
fn time_code(minute: DateTime<Utc>) -> [Pulse; 60] {
    let mut code = [Pulse::Zero; 60];

    code[0] = Pulse::Off;
    for p in [9, 19, 29, 39, 49, 59] {
        code[p] = Pulse::Marker;
    }

    let min = minute.minute();
    let hour = minute.hour();
    let doy = minute.ordinal();
    let year = minute.year().rem_euclid(100) as u32;

    // Year units, seconds 4..=7.
    for (i, w) in [1u32, 2, 4, 8].iter().enumerate() {
        code[4 + i] = bit(year % 10, *w);
    }
    // Minutes: units at 10..=13, tens at 15..=17.
    for (i, w) in [1u32, 2, 4, 8].iter().enumerate() {
        code[10 + i] = bit(min % 10, *w);
    }
    for (i, w) in [1u32, 2, 4].iter().enumerate() {
        code[15 + i] = bit(min / 10, *w);
    }
    // Hours: units at 20..=23, tens at 25..=26.
    for (i, w) in [1u32, 2, 4, 8].iter().enumerate() {
        code[20 + i] = bit(hour % 10, *w);
    }
    for (i, w) in [1u32, 2].iter().enumerate() {
        code[25 + i] = bit(hour / 10, *w);
    }
    // Day of year: units 30..=33, tens 35..=38, hundreds 40..=41.
    for (i, w) in [1u32, 2, 4, 8].iter().enumerate() {
        code[30 + i] = bit(doy % 10, *w);
    }
    for (i, w) in [1u32, 2, 4, 8].iter().enumerate() {
        code[35 + i] = bit(doy / 10 % 10, *w);
    }
    for (i, w) in [1u32, 2].iter().enumerate() {
        code[40 + i] = bit(doy / 100, *w);
    }
    // Year tens, seconds 51..=54.
    for (i, w) in [1u32, 2, 4, 8].iter().enumerate() {
        code[51 + i] = bit(year / 10, *w);
    }

    code
}

/// On/off subcarrier profile of one minute-aligned span at the track frame
/// rate.
pub fn template_track(minute: DateTime<Utc>, len: usize) -> Vec<f64> {
    let code = time_code(minute);
    let mut track = vec![0.0f64; len];

    for (second, pulse) in code.iter().enumerate() {
        let from = (second as f64 + PULSE_START_OFFSET_S) * FRAME_RATE_HZ;
        let to = from + pulse.duration_s() * FRAME_RATE_HZ;
        let from = from as usize;
        let to = (to as usize).min(len);
        for v in track.iter_mut().take(to).skip(from) {
            *v = 1.0;
        }
    }

    track
}

/// Template for a span that starts anywhere inside a minute. Archives are
/// keyed by RTP, not by UTC minute boundaries, so the expected code is the
/// tail of one minute followed by the head of the next.
pub fn template_for_span(start: DateTime<Utc>, len: usize) -> Vec<f64> {
    use chrono::{DurationRound, TimeDelta};

    let Ok(minute_start) = start.duration_trunc(TimeDelta::minutes(1)) else {
        return vec![0.0; len];
    };
    let offset_frames = ((start - minute_start).num_milliseconds() as f64
        * FRAME_RATE_HZ
        / 1_000.0)
        .round() as usize;

    let frames_per_minute = (60.0 * FRAME_RATE_HZ) as usize;
    let mut track = Vec::with_capacity(len);
    let mut minute = minute_start;
    let mut cursor = offset_frames;
    let mut current = template_track(minute, frames_per_minute);

    while track.len() < len {
        if cursor >= frames_per_minute {
            cursor -= frames_per_minute;
            minute += TimeDelta::minutes(1);
            current = template_track(minute, frames_per_minute);
        }
        let take = (frames_per_minute - cursor).min(len - track.len());
        track.extend_from_slice(&current[cursor..cursor + take]);
        cursor += take;
    }

    track
}

/// 100 Hz subcarrier power at the track frame rate, from the AM envelope.
pub fn subcarrier_track(iq: &[Complex<f32>], sample_rate: u32) -> Vec<f64> {
    let sr = sample_rate as f64;
    let hop = ((sr / FRAME_RATE_HZ) as usize).max(1);
    // Two subcarrier cycles per analysis window.
    let win = ((sr * 2.0 / BCD_SUBCARRIER_HZ) as usize).max(2);

    let env: Vec<f64> = iq.iter().map(|s| s.norm() as f64).collect();
    if env.len() < win {
        return Vec::new();
    }

    (0..(env.len() - win) / hop)
        .map(|k| goertzel_power(&env[k * hop..k * hop + win], sr, BCD_SUBCARRIER_HZ))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrPeak {
    pub delay_ms: f64,
    pub amplitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BcdAnalysis {
    /// Up to two fitted peaks, ordered by increasing delay.
    pub peaks: Vec<CorrPeak>,
    /// Normalised correlation of the strongest peak, in [0, 1].
    pub quality: f64,
}

impl BcdAnalysis {
    pub fn earliest(&self) -> Option<CorrPeak> {
        self.peaks.first().copied()
    }

    pub fn latest(&self) -> Option<CorrPeak> {
        self.peaks.last().copied()
    }
}

fn zero_mean(x: &[f64]) -> Vec<f64> {
    let mean = x.iter().sum::<f64>() / x.len().max(1) as f64;
    x.iter().map(|v| v - mean).collect()
}

fn dot_lagged(template: &[f64], signal: &[f64], lag: usize) -> f64 {
    let n = template.len().min(signal.len().saturating_sub(lag));
    (0..n).map(|i| template[i] * signal[i + lag]).sum()
}

/// Correlates the subcarrier power track against the expected template and
/// jointly fits up to two time-shifted copies of it by least squares.
///
/// The pulse autocorrelation is broad compared to terrestrial differential
/// delays, so two co-channel stations do not produce two separable local
/// maxima. Instead, delay pairs within the expected separation window are
/// scanned and the pair explaining the most template-aligned energy wins.
/// `expected_sep_ms` narrows the separation scan when geography predicts
/// the differential delay.
pub fn analyse(
    track: &[f64],
    span_start: DateTime<Utc>,
    expected_sep_ms: Option<f64>,
) -> Option<BcdAnalysis> {
    if track.len() < (FRAME_RATE_HZ as usize) * 10 {
        return None;
    }

    let template = template_for_span(span_start, track.len());
    let t = zero_mean(&template);
    let x = zero_mean(track);

    let t_norm = t.iter().map(|v| v * v).sum::<f64>().sqrt();
    let x_norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();
    if t_norm < 1e-12 || x_norm < 1e-12 {
        return None;
    }

    // Template-signal products for every lag, template autocorrelation for
    // every separation. Everything below is O(1) per candidate pair.
    let r: Vec<f64> = (0..=MAX_LAG_MS)
        .map(|lag| dot_lagged(&t, &x, lag))
        .collect();
    let g: Vec<f64> = (0..=MAX_LAG_MS)
        .map(|shift| dot_lagged(&t, &t, shift))
        .collect();

    let (best_lag, best_r) = r
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    let quality = best_r / (t_norm * x_norm);
    if quality <= 0.0 {
        return None;
    }

    let refine = if best_lag > 0 && best_lag < MAX_LAG_MS {
        parabolic_peak(r[best_lag - 1], r[best_lag], r[best_lag + 1])
    } else {
        0.0
    };
    let single_energy = best_r * best_r / g[0];

    // Candidate separations: the geographic prediction ± a small window, or
    // a full scan when no prediction is available.
    let separations: Vec<usize> = match expected_sep_ms {
        Some(sep) => {
            let sep = sep.abs().round() as i64;
            (sep - 3..=sep + 3)
                .filter(|&s| s >= MIN_PEAK_SEPARATION_MS as i64 && s <= MAX_LAG_MS as i64 / 2)
                .map(|s| s as usize)
                .collect()
        }
        None => (MIN_PEAK_SEPARATION_MS as usize..=40).collect(),
    };

    let mut best_pair: Option<(usize, usize, f64, f64, f64)> = None;
    for &sep in &separations {
        let g11 = g[0];
        let g12 = g[sep];
        let det = g11 * g11 - g12 * g12;
        if det <= 1e-9 * g11 * g11 {
            continue;
        }
        for d1 in 0..=(MAX_LAG_MS - sep) {
            let d2 = d1 + sep;
            let a1 = (g11 * r[d1] - g12 * r[d2]) / det;
            let a2 = (g11 * r[d2] - g12 * r[d1]) / det;
            if a1 < 0.0 || a2 < 0.0 {
                continue;
            }
            let energy = a1 * r[d1] + a2 * r[d2];
            if best_pair.is_none_or(|(_, _, _, _, e)| energy > e) {
                best_pair = Some((d1, d2, a1, a2, energy));
            }
        }
    }

    let peaks = match best_pair {
        Some((d1, d2, a1, a2, energy))
            if energy > single_energy * PAIR_IMPROVEMENT
                && a1.min(a2) >= SECOND_PEAK_MIN_RATIO * a1.max(a2) =>
        {
            vec![
                CorrPeak {
                    delay_ms: d1 as f64,
                    amplitude: a1,
                },
                CorrPeak {
                    delay_ms: d2 as f64,
                    amplitude: a2,
                },
            ]
        }
        _ => vec![CorrPeak {
            delay_ms: best_lag as f64 + refine,
            amplitude: (best_r / g[0]).max(0.0),
        }],
    };

    Some(BcdAnalysis { peaks, quality })
}
