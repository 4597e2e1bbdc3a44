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

//! Multi-stage anti-aliased decimation to the product rate.
//!
//! Every stage is an order-8 Butterworth low-pass (four cascaded biquad
//! sections) with its passband edge at 0.4 × the post-stage Nyquist,
//! followed by an integer downsample. A stage is a pure function of
//! (input rate, factor), so wide channels and narrow carrier taps get
//! identical filters wherever their chains pass through the same rate.

use crate::error::{ConfigError, ConfigResult};
use num_complex::Complex;

/// Butterworth Q values for an order-8 cascade of second-order sections.
const BUTTERWORTH_8_Q: [f64; 4] = [0.509_80, 0.601_34, 0.899_98, 2.562_91];

/// Largest downsample factor a single stage may take.
const MAX_STAGE_FACTOR: u32 = 16;

/// One biquad section, RBJ cookbook low-pass, transposed direct form II.
/// Coefficients are real, so I and Q see the same filter.
#[derive(Debug, Clone)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    s1: Complex<f64>,
    s2: Complex<f64>,
}

impl Biquad {
    fn lowpass(sample_rate: f64, cutoff: f64, q: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * cutoff / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);

        let a0 = 1.0 + alpha;
        Self {
            b0: (1.0 - cos_w0) / 2.0 / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: (1.0 - cos_w0) / 2.0 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
            s1: Complex::new(0.0, 0.0),
            s2: Complex::new(0.0, 0.0),
        }
    }

    #[inline]
    fn step(&mut self, x: Complex<f64>) -> Complex<f64> {
        let y = x * self.b0 + self.s1;
        self.s1 = x * self.b1 - y * self.a1 + self.s2;
        self.s2 = x * self.b2 - y * self.a2;
        y
    }
}

struct Stage {
    factor: usize,
    sections: Vec<Biquad>,
    phase: usize,
}

impl Stage {
    fn new(input_rate: u32, factor: u32) -> Self {
        let output_nyquist = input_rate as f64 / factor as f64 / 2.0;
        let cutoff = 0.4 * output_nyquist;
        let sections = BUTTERWORTH_8_Q
            .iter()
            .map(|&q| Biquad::lowpass(input_rate as f64, cutoff, q))
            .collect();
        Self {
            factor: factor as usize,
            sections,
            phase: 0,
        }
    }

    fn process(&mut self, input: &[Complex<f32>], out: &mut Vec<Complex<f32>>) {
        for &sample in input {
            let mut acc = Complex::new(sample.re as f64, sample.im as f64);
            for section in &mut self.sections {
                acc = section.step(acc);
            }
            if self.phase == 0 {
                out.push(Complex::new(acc.re as f32, acc.im as f32));
            }
            self.phase += 1;
            if self.phase == self.factor {
                self.phase = 0;
            }
        }
    }
}

/// Factors the total ratio into per-stage ratios, preferring 10 and never
/// exceeding 16 per stage. 16 kHz → 10 S/s becomes 10 · 10 · 16, i.e.
/// 16 kHz → 1.6 kHz → 160 Hz → 10 Hz.
pub fn plan_factors(input_rate: u32, output_rate: u32) -> ConfigResult<Vec<u32>> {
    if output_rate == 0 || input_rate % output_rate != 0 {
        return Err(ConfigError::Invalid(format!(
            "cannot decimate {input_rate} Hz to {output_rate} Hz: not an integer ratio"
        )));
    }

    let mut ratio = input_rate / output_rate;
    let mut factors = Vec::new();
    while ratio > 1 {
        let factor = if ratio % 10 == 0 {
            10
        } else {
            match (2..=MAX_STAGE_FACTOR).rev().find(|f| ratio % f == 0) {
                Some(f) => f,
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "cannot decimate {input_rate} Hz to {output_rate} Hz: residual ratio {ratio} has no stage factor ≤ {MAX_STAGE_FACTOR}"
                    )));
                }
            }
        };
        factors.push(factor);
        ratio /= factor;
    }

    Ok(factors)
}

pub struct Decimator {
    stages: Vec<Stage>,
    output_rate: u32,
}

impl Decimator {
    pub fn new(input_rate: u32, output_rate: u32) -> ConfigResult<Self> {
        let factors = plan_factors(input_rate, output_rate)?;
        let mut stages = Vec::with_capacity(factors.len());
        let mut rate = input_rate;
        for factor in factors {
            stages.push(Stage::new(rate, factor));
            rate /= factor;
        }
        Ok(Self {
            stages,
            output_rate,
        })
    }

    pub fn expected_per_minute(&self) -> usize {
        self.output_rate as usize * 60
    }

    /// Streams one block through every stage. Filter state and downsample
    /// phase carry across calls, so fractional stage outputs buffer between
    /// minutes by construction.
    pub fn process(&mut self, iq: &[Complex<f32>]) -> Vec<Complex<f32>> {
        let mut current: Vec<Complex<f32>> = Vec::new();
        let mut first = true;
        for stage in &mut self.stages {
            let mut next = Vec::with_capacity(
                (if first { iq.len() } else { current.len() }) / stage.factor + 1,
            );
            if first {
                stage.process(iq, &mut next);
                first = false;
            } else {
                stage.process(&current, &mut next);
            }
            current = next;
        }
        if first {
            // No stages: input rate already equals the output rate.
            current.extend_from_slice(iq);
        }
        current
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn factor_plan_matches_the_canonical_chain() {
        assert_eq!(vec![10, 10, 16], plan_factors(16_000, 10).expect("plan"));
        assert_eq!(vec![10, 2], plan_factors(200, 10).expect("plan"));
        assert_eq!(vec![10, 10, 8], plan_factors(8_000, 10).expect("plan"));
        assert!(plan_factors(16_000, 7).is_err());
        assert!(plan_factors(170, 10).is_err());
    }

    #[test]
    fn identical_rates_need_no_stages() {
        let mut d = Decimator::new(10, 10).expect("plan");
        let iq = vec![Complex::new(0.5f32, -0.5); 600];
        assert_eq!(600, d.process(&iq).len());
    }

    fn tone(sample_rate: f64, freq: f64, seconds: f64) -> Vec<Complex<f32>> {
        let n = (sample_rate * seconds) as usize;
        (0..n)
            .map(|i| {
                let phi = 2.0 * PI * freq * i as f64 / sample_rate;
                Complex::new(phi.cos() as f32, phi.sin() as f32)
            })
            .collect()
    }

    fn rms_tail(x: &[Complex<f32>], skip: usize) -> f64 {
        let tail = &x[skip.min(x.len())..];
        (tail.iter().map(|s| s.norm_sqr() as f64).sum::<f64>() / tail.len().max(1) as f64).sqrt()
    }

    #[test]
    fn output_length_is_exact_per_minute() {
        let mut d = Decimator::new(1_000, 10).expect("plan");
        for _ in 0..3 {
            let minute = tone(1_000.0, 1.0, 60.0);
            assert_eq!(600, d.process(&minute).len());
            assert_eq!(600, d.expected_per_minute());
        }
    }

    #[test]
    fn straddled_blocks_preserve_total_count() {
        let mut d = Decimator::new(1_000, 10).expect("plan");
        let signal = tone(1_000.0, 1.0, 60.0);
        let mut total = 0;
        for chunk in signal.chunks(7_777) {
            total += d.process(chunk).len();
        }
        assert_eq!(600, total);
    }

    #[test]
    fn passband_tone_survives() {
        let mut d = Decimator::new(1_000, 10).expect("plan");
        let out = d.process(&tone(1_000.0, 1.0, 60.0));
        // Skip the filter transient, then expect near-unity amplitude.
        let rms = rms_tail(&out, 100);
        assert!((rms - 1.0).abs() < 0.12, "passband rms {rms}");
    }

    #[test]
    fn stopband_tone_is_attenuated_at_least_60_db() {
        let mut d = Decimator::new(1_000, 10).expect("plan");
        let out = d.process(&tone(1_000.0, 40.0, 60.0));
        let rms = rms_tail(&out, 100);
        assert!(rms < 1e-3, "stopband rms {rms}");
    }

    #[test]
    fn negative_frequencies_are_filtered_symmetrically() {
        let mut d = Decimator::new(1_000, 10).expect("plan");
        let out = d.process(&tone(1_000.0, -40.0, 60.0));
        assert!(rms_tail(&out, 100) < 1e-3);
    }

    #[test]
    fn shared_rate_stages_are_identical_across_origins() {
        // A wide chain passing 160 Hz and a narrow chain entering at
        // 160 Hz must decimate the final stage identically.
        let wide = plan_factors(16_000, 10).expect("plan");
        let narrow = plan_factors(160, 10).expect("plan");
        assert_eq!(wide.last(), narrow.last());
    }
}
