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

//! Per-minute co-channel discrimination: which of WWV and WWVH dominates
//! the channel. Four independent evidences vote under per-minute weights;
//! peak labelling defers to geography, never to an assumed arrival order.

use crate::{
    analytics::geodesy::DelayPrediction,
    config::{DiscriminationConfig, EvidenceWeights},
    dsp::{bcd::BcdAnalysis, tone::MinuteTones},
    station::Station,
};
use serde::Serialize;
use std::fmt::{self, Display};

/// Minimum per-minute marker SNR (dB) below which a tone is "absent".
const PRESENCE_SNR_DB: f64 = 3.0;

/// Station-ID tone acceptance threshold.
const ID_SNR_DB: f64 = 6.0;

/// Normalisation scale: an evidence of this many dB saturates towards ±1.
const EVIDENCE_SCALE_DB: f64 = 6.0;

/// Verdict margins.
const BALANCED_MARGIN: f64 = 0.10;
const LOW_CONFIDENCE_MARGIN: f64 = 0.15;
const HIGH_CONFIDENCE_MARGIN: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Dominant {
    Wwv,
    Wwvh,
    Balanced,
    None,
}

impl Display for Dominant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dominant::Wwv => write!(f, "WWV"),
            Dominant::Wwvh => write!(f, "WWVH"),
            Dominant::Balanced => write!(f, "BALANCED"),
            Dominant::None => write!(f, "NONE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Med,
    High,
}

impl Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Med => write!(f, "med"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// The raw per-evidence values, positive towards WWV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvidenceScores {
    pub power_ratio_db: f64,
    pub tick_ratio_db: f64,
    pub bcd_ratio_db: Option<f64>,
    pub station_id_db: Option<f64>,
    /// Earliest BCD peak delay minus its geographic prediction.
    pub toa_offset_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub dominant: Dominant,
    pub confidence: Confidence,
    pub scores: EvidenceScores,
    pub weights: EvidenceWeights,
    pub integration_window_s: u32,
}

/// Everything the vote needs about one archived minute.
#[derive(Debug, Clone)]
pub struct MinuteEvidence {
    pub minute_of_hour: u32,
    pub tones: MinuteTones,
    pub bcd: Option<BcdAnalysis>,
    pub prediction: DelayPrediction,
    pub completeness_percent: f64,
}

fn squash(db: f64) -> f64 {
    (db / EVIDENCE_SCALE_DB).tanh()
}

fn weights_for_minute(minute: u32, config: &DiscriminationConfig) -> EvidenceWeights {
    if minute == 1 || minute == 2 {
        config.weights_id_minutes
    } else if config.bcd_favoured_minutes.contains(&minute) {
        config.weights_bcd_minutes
    } else {
        config.weights_standard
    }
}

/// BCD evidence from the fitted peaks. With two peaks the geographic
/// labelling decides which amplitude belongs to which station; with one,
/// the measured delay is attributed to whichever predicted delay is
/// closer.
fn bcd_evidence(
    analysis: &BcdAnalysis,
    prediction: &DelayPrediction,
) -> (Option<f64>, Option<f64>) {
    let labels = prediction.labels();

    match (analysis.earliest(), analysis.latest()) {
        (Some(early), Some(late)) if analysis.peaks.len() == 2 => {
            let (wwv_amp, wwvh_amp) = if labels.early == Station::Wwv {
                (early.amplitude, late.amplitude)
            } else {
                (late.amplitude, early.amplitude)
            };
            let ratio_db = 10.0 * (wwv_amp.max(1e-12) / wwvh_amp.max(1e-12)).log10();
            let expected = if labels.early == Station::Wwv {
                prediction.delay_to_wwv_ms
            } else {
                prediction.delay_to_wwvh_ms
            };
            let toa = Some(early.delay_ms - expected);
            (Some(ratio_db), toa)
        }
        (Some(only), _) => {
            let to_wwv = (only.delay_ms - prediction.delay_to_wwv_ms).abs();
            let to_wwvh = (only.delay_ms - prediction.delay_to_wwvh_ms).abs();
            let magnitude = 8.0 * analysis.quality.clamp(0.0, 1.0);
            if to_wwv <= to_wwvh {
                (
                    Some(magnitude),
                    Some(only.delay_ms - prediction.delay_to_wwv_ms),
                )
            } else {
                (
                    Some(-magnitude),
                    Some(only.delay_ms - prediction.delay_to_wwvh_ms),
                )
            }
        }
        _ => (None, None),
    }
}

pub fn discriminate(evidence: &MinuteEvidence, config: &DiscriminationConfig) -> Verdict {
    let tones = &evidence.tones;
    let weights = weights_for_minute(evidence.minute_of_hour, config);

    let (bcd_ratio_db, toa_offset_ms) = match &evidence.bcd {
        Some(analysis) => bcd_evidence(analysis, &evidence.prediction),
        None => (None, None),
    };

    // Station-ID tone: 440 Hz in minute 1 is WWVH, in minute 2 WWV.
    let station_id_db = match evidence.minute_of_hour {
        1 | 2 if tones.id_440_snr_db >= ID_SNR_DB => {
            let sign = if evidence.minute_of_hour == 2 { 1.0 } else { -1.0 };
            Some(sign * tones.id_440_snr_db)
        }
        _ => None,
    };

    let scores = EvidenceScores {
        power_ratio_db: tones.wwv_marker_db - tones.wwvh_marker_db,
        tick_ratio_db: tones.wwv_tick_snr_db - tones.wwvh_tick_snr_db,
        bcd_ratio_db,
        station_id_db,
        toa_offset_ms,
    };

    // A dead minute discriminates to NONE, never to a coin flip.
    let any_presence = tones.wwv_marker_snr_db >= PRESENCE_SNR_DB
        || tones.wwvh_marker_snr_db >= PRESENCE_SNR_DB
        || evidence
            .bcd
            .as_ref()
            .is_some_and(|analysis| analysis.quality > 0.2);
    if evidence.completeness_percent <= 0.0 || !any_presence {
        return Verdict {
            dominant: Dominant::None,
            confidence: Confidence::Low,
            scores,
            weights,
            integration_window_s: config.window_s,
        };
    }

    let mut acc = 0.0f64;
    let mut total_weight = 0.0f64;

    let marker_score = squash(scores.power_ratio_db);
    acc += weights.markers as f64 * marker_score;
    total_weight += weights.markers as f64;

    let tick_score = squash(scores.tick_ratio_db);
    acc += weights.ticks as f64 * tick_score;
    total_weight += weights.ticks as f64;

    let bcd_score = scores.bcd_ratio_db.map(squash);
    if let Some(score) = bcd_score {
        acc += weights.bcd as f64 * score;
        total_weight += weights.bcd as f64;
    }

    if let Some(id_db) = scores.station_id_db {
        acc += weights.station_id as f64 * squash(id_db);
        total_weight += weights.station_id as f64;
    }

    let combined = if total_weight > 0.0 {
        acc / total_weight
    } else {
        0.0
    };

    let dominant = if combined > BALANCED_MARGIN {
        Dominant::Wwv
    } else if combined < -BALANCED_MARGIN {
        Dominant::Wwvh
    } else {
        Dominant::Balanced
    };

    // Confidence from the agreement of the three continuous evidences and
    // the winning margin.
    let continuous = [Some(marker_score), Some(tick_score), bcd_score];
    let known: Vec<f64> = continuous.into_iter().flatten().collect();
    let all_agree = known.len() == 3
        && (known.iter().all(|&s| s > 0.0) || known.iter().all(|&s| s < 0.0));
    let conflict = known.iter().any(|&s| s > 0.05) && known.iter().any(|&s| s < -0.05);

    let margin = combined.abs();
    let confidence = if conflict || margin < LOW_CONFIDENCE_MARGIN {
        Confidence::Low
    } else if all_agree && margin >= HIGH_CONFIDENCE_MARGIN {
        Confidence::High
    } else {
        Confidence::Med
    };

    Verdict {
        dominant,
        confidence,
        scores,
        weights,
        integration_window_s: config.window_s,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dsp::bcd::CorrPeak;

    fn quiet_tones() -> MinuteTones {
        MinuteTones {
            wwv_marker_db: -60.0,
            wwvh_marker_db: -60.0,
            id_440_db: -60.0,
            noise_floor_db: -60.0,
            wwv_marker_snr_db: 0.0,
            wwvh_marker_snr_db: 0.0,
            id_440_snr_db: 0.0,
            wwv_tick_snr_db: 0.0,
            wwvh_tick_snr_db: 0.0,
        }
    }

    fn midwest() -> DelayPrediction {
        DelayPrediction::for_receiver(41.9, -93.6)
    }

    fn wwv_tones() -> MinuteTones {
        MinuteTones {
            wwv_marker_db: -10.0,
            wwvh_marker_db: -25.0,
            id_440_db: -50.0,
            noise_floor_db: -40.0,
            wwv_marker_snr_db: 30.0,
            wwvh_marker_snr_db: 15.0,
            id_440_snr_db: 0.0,
            wwv_tick_snr_db: 18.0,
            wwvh_tick_snr_db: 4.0,
        }
    }

    fn dual_bcd(early_amp: f64, late_amp: f64) -> BcdAnalysis {
        BcdAnalysis {
            peaks: vec![
                CorrPeak {
                    delay_ms: 4.0,
                    amplitude: early_amp,
                },
                CorrPeak {
                    delay_ms: 21.0,
                    amplitude: late_amp,
                },
            ],
            quality: 0.8,
        }
    }

    #[test]
    fn all_zero_minute_is_none() {
        let evidence = MinuteEvidence {
            minute_of_hour: 17,
            tones: quiet_tones(),
            bcd: None,
            prediction: midwest(),
            completeness_percent: 0.0,
        };
        let verdict = discriminate(&evidence, &DiscriminationConfig::default());
        assert_eq!(Dominant::None, verdict.dominant);
    }

    #[test]
    fn strong_wwv_minute_is_high_confidence() {
        let evidence = MinuteEvidence {
            minute_of_hour: 17,
            tones: wwv_tones(),
            bcd: Some(dual_bcd(1.0, 0.2)),
            prediction: midwest(),
            completeness_percent: 100.0,
        };
        let verdict = discriminate(&evidence, &DiscriminationConfig::default());
        assert_eq!(Dominant::Wwv, verdict.dominant);
        assert_eq!(Confidence::High, verdict.confidence);
        assert!(verdict.scores.bcd_ratio_db.expect("bcd") > 4.0);
        assert_eq!(60, verdict.integration_window_s);
    }

    #[test]
    fn geography_labels_the_early_peak() {
        // Midwest receiver: the early peak is WWV. A stronger early peak
        // therefore reads positive (towards WWV).
        let evidence = MinuteEvidence {
            minute_of_hour: 0,
            tones: wwv_tones(),
            bcd: Some(dual_bcd(1.0, 0.3)),
            prediction: midwest(),
            completeness_percent: 100.0,
        };
        let verdict = discriminate(&evidence, &DiscriminationConfig::default());
        assert_eq!(Dominant::Wwv, verdict.dominant);

        // Pacific receiver: the early peak is WWVH, the same amplitudes now
        // read negative.
        let pacific = MinuteEvidence {
            minute_of_hour: 0,
            tones: quiet_tones(),
            bcd: Some(dual_bcd(1.0, 0.3)),
            prediction: DelayPrediction::for_receiver(21.31, -157.86),
            completeness_percent: 100.0,
        };
        let verdict = discriminate(&pacific, &DiscriminationConfig::default());
        assert!(verdict.scores.bcd_ratio_db.expect("bcd") < 0.0);
    }

    #[test]
    fn indistinguishable_bcd_peaks_are_balanced_low() {
        let mut tones = quiet_tones();
        tones.wwv_marker_snr_db = 10.0;
        tones.wwvh_marker_snr_db = 10.0;
        let evidence = MinuteEvidence {
            minute_of_hour: 0,
            tones,
            bcd: Some(dual_bcd(0.8, 0.8)),
            prediction: midwest(),
            completeness_percent: 100.0,
        };
        let verdict = discriminate(&evidence, &DiscriminationConfig::default());
        assert_eq!(Dominant::Balanced, verdict.dominant);
        assert_eq!(Confidence::Low, verdict.confidence);
    }

    #[test]
    fn id_tone_dominates_minute_two() {
        let mut tones = quiet_tones();
        // Weak pro-WWVH continuous evidence, strong 440 Hz in minute 2.
        tones.wwv_marker_snr_db = 8.0;
        tones.wwvh_marker_snr_db = 10.0;
        tones.wwv_marker_db = -21.0;
        tones.wwvh_marker_db = -19.0;
        tones.id_440_snr_db = 20.0;
        let evidence = MinuteEvidence {
            minute_of_hour: 2,
            tones,
            bcd: None,
            prediction: midwest(),
            completeness_percent: 100.0,
        };
        let verdict = discriminate(&evidence, &DiscriminationConfig::default());
        assert_eq!(Dominant::Wwv, verdict.dominant);
        assert_eq!(Some(20.0), verdict.scores.station_id_db);
    }

    #[test]
    fn conflicting_evidence_is_low_confidence() {
        let mut tones = wwv_tones();
        // Ticks say WWVH while markers say WWV.
        tones.wwv_tick_snr_db = 2.0;
        tones.wwvh_tick_snr_db = 16.0;
        let evidence = MinuteEvidence {
            minute_of_hour: 17,
            tones,
            bcd: Some(dual_bcd(0.9, 0.5)),
            prediction: midwest(),
            completeness_percent: 100.0,
        };
        let verdict = discriminate(&evidence, &DiscriminationConfig::default());
        assert_eq!(Confidence::Low, verdict.confidence);
    }
}
