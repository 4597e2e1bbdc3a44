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

//! Shared signal primitives for the tone, time-code and decimation chains.

pub mod bcd;
pub mod decimate;
pub mod tone;

use num_complex::Complex;

pub const POWER_FLOOR: f64 = 1e-20;

pub fn db(power: f64) -> f64 {
    10.0 * power.max(POWER_FLOOR).log10()
}

pub fn hann(len: usize) -> Vec<f64> {
    if len <= 1 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| {
            let x = std::f64::consts::PI * i as f64 / (len - 1) as f64;
            x.sin() * x.sin()
        })
        .collect()
}

/// AM envelope of the complex baseband, mean removed so that carrier power
/// does not leak into every tone bin.
pub fn envelope(iq: &[Complex<f32>]) -> Vec<f64> {
    let mut env: Vec<f64> = iq.iter().map(|s| s.norm() as f64).collect();
    let mean = env.iter().sum::<f64>() / env.len().max(1) as f64;
    for v in &mut env {
        *v -= mean;
    }
    env
}

/// Single-bin DFT power of a real signal, the classic Goertzel recurrence.
pub fn goertzel_power(x: &[f64], sample_rate: f64, freq: f64) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let w = 2.0 * std::f64::consts::PI * freq / sample_rate;
    let coeff = 2.0 * w.cos();
    let mut s0;
    let mut s1 = 0.0f64;
    let mut s2 = 0.0f64;
    for &v in x {
        s0 = v + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    let power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
    // Normalise so a unit-amplitude tone measures 0.25 regardless of length.
    power / (x.len() as f64 * x.len() as f64)
}

/// Sub-sample peak refinement by parabolic interpolation over three points.
/// Returns the offset of the true peak from the centre point, in (−0.5, 0.5).
pub fn parabolic_peak(ym1: f64, y0: f64, yp1: f64) -> f64 {
    let denom = ym1 - 2.0 * y0 + yp1;
    if denom.abs() < 1e-30 {
        return 0.0;
    }
    let offset = 0.5 * (ym1 - yp1) / denom;
    offset.clamp(-0.5, 0.5)
}
