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

//! Tone detection on the AM envelope of the baseband.
//!
//! Startup mode locates the per-station second-zero minute marker in a long
//! initialisation buffer and reports its onset relative to the *buffer
//! start*, which is what anchors UTC to the RTP sample index. Per-minute
//! mode measures marker, station-ID and tick powers over one archive.

use crate::{
    dsp::{db, envelope, goertzel_power, hann, parabolic_peak},
    station::{STATION_ID_TONE_HZ, Station},
};
use num_complex::Complex;
use rustfft::FftPlanner;
use tracing::debug;

/// Noise floor guard band, chosen away from every scheduled tone.
const GUARD_BAND_HZ: (f64, f64) = (825.0, 875.0);

/// Analysis hop and window for envelope tone power tracking.
const HOP_MS: f64 = 1.0;
const WIN_MS: f64 = 8.0;

/// One detected tone burst. Onset is seconds from the start of the
/// analysis buffer, never from its centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneDetection {
    pub station: Station,
    pub tone_hz: f64,
    pub onset_offset_s: f64,
    pub duration_s: f64,
    pub peak_power_db: f64,
    pub snr_db: f64,
}

/// Result of the startup scan over the initialisation buffer.
#[derive(Debug, Clone, Default)]
pub struct StartupScan {
    pub detections: Vec<ToneDetection>,
    pub power_1000_db: f64,
    pub power_1200_db: f64,
    /// Onset difference WWVH − WWV in milliseconds, when both markers were
    /// found within a plausible co-channel delay.
    pub diff_delay_ms: Option<f64>,
}

impl StartupScan {
    /// The detection to anchor on: strongest accepted marker.
    pub fn best(&self) -> Option<&ToneDetection> {
        self.detections
            .iter()
            .max_by(|a, b| a.snr_db.total_cmp(&b.snr_db))
    }
}

/// Envelope tone power series at 1 kHz frame rate.
fn power_track(env: &[f64], sample_rate: f64, freq: f64) -> Vec<f64> {
    let hop = ((sample_rate * HOP_MS / 1_000.0) as usize).max(1);
    let win = ((sample_rate * WIN_MS / 1_000.0) as usize).max(2);
    if env.len() < win {
        return Vec::new();
    }
    (0..(env.len() - win) / hop)
        .map(|k| goertzel_power(&env[k * hop..k * hop + win], sample_rate, freq))
        .collect()
}

fn hop_seconds(sample_rate: f64) -> f64 {
    ((sample_rate * HOP_MS / 1_000.0) as usize).max(1) as f64 / sample_rate
}

/// Matched filter for one station's minute marker over the power track.
fn detect_marker(
    env: &[f64],
    sample_rate: f64,
    station: Station,
    snr_floor_db: f64,
) -> Option<ToneDetection> {
    let freq = station.marker_tone_hz();
    let track = power_track(env, sample_rate, freq);
    let hop_s = hop_seconds(sample_rate);
    let burst_frames = (station.marker_duration_s() / hop_s).round() as usize;
    if track.len() < 2 * burst_frames || burst_frames == 0 {
        return None;
    }

    // Boxcar matched filter via prefix sums.
    let mut prefix = Vec::with_capacity(track.len() + 1);
    prefix.push(0.0f64);
    for &p in &track {
        prefix.push(prefix.last().copied().unwrap_or(0.0) + p);
    }
    let windows = track.len() - burst_frames;
    let score =
        |t: usize| -> f64 { prefix[t + burst_frames] - prefix[t] };

    let mut best_t = 0;
    let mut best = f64::MIN;
    for t in 0..windows {
        let s = score(t);
        if s > best {
            best = s;
            best_t = t;
        }
    }

    let total: f64 = prefix[track.len()];
    let in_burst_mean = best / burst_frames as f64;
    let out_mean = (total - best) / (track.len() - burst_frames) as f64;
    let snr_db = db(in_burst_mean) - db(out_mean);
    if snr_db < snr_floor_db {
        return None;
    }

    // Duration from the half-power run around the strongest frame.
    let lo = best_t;
    let hi = (best_t + burst_frames).min(track.len());
    let (peak_rel, peak_power) = track[lo..hi]
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    let peak_frame = lo + peak_rel;
    let half = peak_power / 2.0;
    let mut first = peak_frame;
    while first > 0 && track[first - 1] > half {
        first -= 1;
    }
    let mut last = peak_frame;
    while last + 1 < track.len() && track[last + 1] > half {
        last += 1;
    }
    let duration_s = (last - first + 1) as f64 * hop_s;

    let (dur_lo, dur_hi) = station.marker_duration_band_s();
    if duration_s < dur_lo || duration_s > dur_hi {
        debug!(
            "Rejecting {station} marker: duration {duration_s:.3} s outside [{dur_lo:.3}, {dur_hi:.3}]"
        );
        return None;
    }

    // Sub-frame onset refinement on the matched-filter response.
    let refine = if best_t > 0 && best_t + 1 < windows {
        parabolic_peak(score(best_t - 1), score(best_t), score(best_t + 1))
    } else {
        0.0
    };
    let onset_offset_s = (best_t as f64 + refine) * hop_s;

    Some(ToneDetection {
        station,
        tone_hz: freq,
        onset_offset_s,
        duration_s,
        peak_power_db: db(peak_power),
        snr_db,
    })
}

/// Whether the channel's rate can resolve the audio tones at all. Narrow
/// carrier taps cannot and skip tone detection entirely.
pub fn supports_tones(sample_rate: u32) -> bool {
    sample_rate as f64 >= 2.0 * 1_300.0
}

/// Startup / anchor mode over the initialisation buffer.
pub fn startup_scan(
    iq: &[Complex<f32>],
    sample_rate: u32,
    stations: &[Station],
    snr_floor_db: f64,
) -> StartupScan {
    if !supports_tones(sample_rate) || iq.is_empty() {
        return StartupScan::default();
    }

    let sr = sample_rate as f64;
    let env = envelope(iq);

    let mut scan = StartupScan {
        power_1000_db: db(mean_power(&env, sr, 1_000.0)),
        power_1200_db: db(mean_power(&env, sr, 1_200.0)),
        ..StartupScan::default()
    };

    for &station in stations {
        if let Some(detection) = detect_marker(&env, sr, station, snr_floor_db) {
            debug!(
                "{station} marker at +{:.4} s, snr {:.1} dB",
                detection.onset_offset_s, detection.snr_db
            );
            scan.detections.push(detection);
        }
    }

    let wwv = scan
        .detections
        .iter()
        .find(|d| d.station == Station::Wwv)
        .copied();
    let wwvh = scan
        .detections
        .iter()
        .find(|d| d.station == Station::Wwvh)
        .copied();
    if let (Some(v), Some(h)) = (wwv, wwvh) {
        let diff_ms = (h.onset_offset_s - v.onset_offset_s) * 1_000.0;
        // Anything beyond a few tens of ms is a different minute's marker,
        // not differential propagation.
        if diff_ms.abs() <= 50.0 {
            scan.diff_delay_ms = Some(diff_ms);
        }
    }

    scan
}

fn mean_power(env: &[f64], sample_rate: f64, freq: f64) -> f64 {
    let track = power_track(env, sample_rate, freq);
    if track.is_empty() {
        0.0
    } else {
        track.iter().sum::<f64>() / track.len() as f64
    }
}

/// Per-minute tone measurements over one archive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinuteTones {
    pub wwv_marker_db: f64,
    pub wwvh_marker_db: f64,
    pub id_440_db: f64,
    pub noise_floor_db: f64,
    pub wwv_marker_snr_db: f64,
    pub wwvh_marker_snr_db: f64,
    pub id_440_snr_db: f64,
    pub wwv_tick_snr_db: f64,
    pub wwvh_tick_snr_db: f64,
}

/// Welch-averaged one-sided power spectrum of the envelope with 1 Hz bins,
/// Hann windowed, one-second segments. Signal and noise estimates share
/// this resolution and window so noise subtraction stays consistent.
fn welch_psd(env: &[f64], sample_rate: usize) -> Vec<f64> {
    let seg = sample_rate;
    let segments = env.len() / seg;
    let mut psd = vec![0.0f64; seg / 2];
    if segments == 0 {
        return psd;
    }

    let window = hann(seg);
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(seg);
    let mut buf = vec![Complex::new(0.0f64, 0.0); seg];

    for s in 0..segments {
        for i in 0..seg {
            buf[i] = Complex::new(env[s * seg + i] * window[i], 0.0);
        }
        fft.process(&mut buf);
        for (i, v) in buf.iter().take(seg / 2).enumerate() {
            psd[i] += v.norm_sqr();
        }
    }

    let norm = (segments * seg * seg) as f64;
    for v in &mut psd {
        *v /= norm;
    }
    psd
}

fn peak_near(psd: &[f64], freq: f64) -> f64 {
    let centre = freq.round() as usize;
    let lo = centre.saturating_sub(2);
    let hi = (centre + 2).min(psd.len().saturating_sub(1));
    psd[lo..=hi].iter().copied().fold(0.0, f64::max)
}

fn guard_band_floor(psd: &[f64]) -> f64 {
    let lo = GUARD_BAND_HZ.0 as usize;
    let hi = (GUARD_BAND_HZ.1 as usize).min(psd.len().saturating_sub(1));
    if hi <= lo {
        return 0.0;
    }
    psd[lo..=hi].iter().sum::<f64>() / (hi - lo + 1) as f64
}

/// Tick search window within each second, and a quiet reference region.
const TICK_SEARCH_MS: usize = 60;
const TICK_NOISE_FROM_MS: usize = 400;
const TICK_NOISE_TO_MS: usize = 600;

fn tick_snr(frames: &[&[f64]], sample_rate: f64, freq: f64) -> f64 {
    let hop = ((sample_rate * HOP_MS / 1_000.0) as usize).max(1);
    let win = ((sample_rate * WIN_MS / 1_000.0) as usize).max(2);
    let seg = frames.first().map(|f| f.len()).unwrap_or(0);
    if seg < TICK_NOISE_TO_MS * hop || frames.is_empty() {
        return 0.0;
    }

    let window_peak = |x: &[f64], from_ms: usize, to_ms: usize| -> (f64, f64) {
        let mut peak = 0.0f64;
        let mut acc = 0.0f64;
        let mut count = 0usize;
        let mut t = from_ms * hop;
        while t + win <= (to_ms * hop).min(x.len()) {
            let p = goertzel_power(&x[t..t + win], sample_rate, freq);
            peak = peak.max(p);
            acc += p;
            count += 1;
            t += hop;
        }
        (peak, acc / count.max(1) as f64)
    };

    // Coherent: average the 60 aligned seconds first, then measure.
    let mut coherent = vec![0.0f64; seg];
    for frame in frames {
        for (i, &v) in frame.iter().enumerate() {
            coherent[i] += v;
        }
    }
    for v in &mut coherent {
        *v /= frames.len() as f64;
    }
    let (c_peak, _) = window_peak(&coherent, 0, TICK_SEARCH_MS);
    let (_, c_noise) = window_peak(&coherent, TICK_NOISE_FROM_MS, TICK_NOISE_TO_MS);
    let coherent_snr = db(c_peak) - db(c_noise);

    // Incoherent: measure each second, then average the powers.
    let mut i_peak = 0.0f64;
    let mut i_noise = 0.0f64;
    for frame in frames {
        let (p, _) = window_peak(frame, 0, TICK_SEARCH_MS);
        let (_, n) = window_peak(frame, TICK_NOISE_FROM_MS, TICK_NOISE_TO_MS);
        i_peak += p;
        i_noise += n;
    }
    i_peak /= frames.len() as f64;
    i_noise /= frames.len() as f64;
    let incoherent_snr = db(i_peak) - db(i_noise);

    coherent_snr.max(incoherent_snr)
}

/// Per-minute mode: marker, station-ID and tick measurements for one
/// archive's worth of samples.
pub fn minute_scan(iq: &[Complex<f32>], sample_rate: u32) -> MinuteTones {
    let sr = sample_rate as usize;
    let env = envelope(iq);

    let psd = welch_psd(&env, sr);
    let noise = guard_band_floor(&psd);
    let noise_db = db(noise);

    let p1000 = peak_near(&psd, 1_000.0);
    let p1200 = peak_near(&psd, 1_200.0);
    let p440 = peak_near(&psd, STATION_ID_TONE_HZ);

    let frames: Vec<&[f64]> = env.chunks_exact(sr).collect();
    let srf = sample_rate as f64;

    MinuteTones {
        wwv_marker_db: db(p1000),
        wwvh_marker_db: db(p1200),
        id_440_db: db(p440),
        noise_floor_db: noise_db,
        wwv_marker_snr_db: db(p1000) - noise_db,
        wwvh_marker_snr_db: db(p1200) - noise_db,
        id_440_snr_db: db(p440) - noise_db,
        wwv_tick_snr_db: tick_snr(&frames, srf, 1_000.0),
        wwvh_tick_snr_db: tick_snr(&frames, srf, 1_200.0),
    }
}
