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

//! The analytics engine. A separate process from capture; the archive
//! directory is the only contract between them. Each channel gets one
//! reader actor that polls for new archives, re-derives or adopts time
//! anchors, and fans the minute out to decimation, tone detection and
//! discrimination. Reprocessing an archive reproduces its outputs.

pub mod discriminator;
pub mod geodesy;
pub mod products;

use crate::{
    archive::MinuteArchive,
    config::{ChannelConfig, Config},
    dsp::{bcd, decimate::Decimator, tone},
    error::{RecorderError, RecorderResult},
    timebase::{AnchorCell, AnchorSource, TimeSnap},
};
use chrono::{DateTime, TimeDelta, Utc};
use discriminator::{MinuteEvidence, Verdict};
use geodesy::DelayPrediction;
use products::{DecimatedMinute, ProductWriter};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{select, time::interval};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-channel runtime state: the most recent anchor and the set of
/// archives already processed. Corruption forces a cold start, archives
/// stay authoritative.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyticsState {
    anchor: Option<TimeSnap>,
    processed: BTreeSet<String>,
}

impl AnalyticsState {
    fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "Analytics state {} is corrupt ({e}), cold-starting channel",
                        path.to_string_lossy()
                    );
                    AnalyticsState::default()
                }
            },
            Err(_) => AnalyticsState::default(),
        }
    }

    fn save(&self, path: &Path) -> RecorderResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

pub async fn start_analytics(
    subsys: &SubsystemHandle,
    config: Config,
) -> RecorderResult<()> {
    for channel in &config.channels {
        let actor = AnalyticsActor::new(&config, channel)?;
        let name = format!("analytics-{}", channel.id);
        subsys.start(SubsystemBuilder::new(name, move |s| actor.run(s)));
    }
    Ok(())
}

struct AnalyticsActor {
    channel: ChannelConfig,
    archive_dir: PathBuf,
    state_path: PathBuf,
    state: AnalyticsState,
    anchor: AnchorCell,
    anchor_half_life: Duration,
    decimator: Decimator,
    output_rate: u32,
    products: ProductWriter,
    prediction: DelayPrediction,
    discrimination: crate::config::DiscriminationConfig,
}

impl AnalyticsActor {
    fn new(config: &Config, channel: &ChannelConfig) -> RecorderResult<Self> {
        let archive_dir = config.data.root.join(&channel.id);
        let state_path = archive_dir.join("analytics-state.json");
        let state = AnalyticsState::load(&state_path);

        let anchor = AnchorCell::new();
        if let Some(snap) = state.anchor {
            // A restart demotes the carried anchor; a fresh tone-locked one
            // supersedes it as soon as an archive provides it.
            anchor.adopt(TimeSnap {
                source: AnchorSource::CarriedFromPreviousArchive,
                ..snap
            });
        }

        Ok(Self {
            channel: channel.clone(),
            archive_dir,
            state_path,
            state,
            anchor,
            anchor_half_life: Duration::from_secs(config.timing.anchor_half_life_s as u64),
            decimator: Decimator::new(channel.sample_rate, config.decimation.output_rate)?,
            output_rate: config.decimation.output_rate,
            products: ProductWriter::new(&config.data.root, &channel.id, channel.centre_hz),
            prediction: DelayPrediction::for_receiver(
                config.station.receiver_lat,
                config.station.receiver_lon,
            ),
            discrimination: config.discrimination.clone(),
        })
    }

    #[instrument(skip(self, subsys), fields(channel = %self.channel.id))]
    async fn run(mut self, subsys: SubsystemHandle) -> RecorderResult<()> {
        info!(
            "Analytics for channel '{}' watching {}",
            self.channel.id,
            self.archive_dir.to_string_lossy()
        );

        let mut tick = interval(POLL_INTERVAL);
        loop {
            select! {
                _ = tick.tick() => {
                    if let Err(e) = self.poll() {
                        warn!("Archive poll failed: {e}");
                    }
                }
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        info!("Analytics for channel '{}' stopped.", self.channel.id);
        Ok(())
    }

    /// One poll cycle: pick up archives not yet processed, oldest first.
    fn poll(&mut self) -> RecorderResult<()> {
        let mut fresh = Vec::new();
        let entries = match std::fs::read_dir(&self.archive_dir) {
            Ok(it) => it,
            // The capture side may not have created the directory yet.
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with("_iq.giq") && !self.state.processed.contains(&name) {
                fresh.push(name);
            }
        }
        fresh.sort();

        for name in fresh {
            self.process_archive(&name)?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(channel = %self.channel.id))]
    fn process_archive(&mut self, name: &str) -> RecorderResult<()> {
        let path = self.archive_dir.join(name);
        let archive = match MinuteArchive::read_from(&path) {
            Ok(it) => it,
            Err(e) => {
                // A truncated or foreign file never becomes readable by
                // polling it again.
                warn!("Skipping unreadable archive {name}: {e}");
                self.state.processed.insert(name.to_owned());
                self.state.save(&self.state_path)?;
                return Ok(());
            }
        };

        if let Some(embedded) = archive.time_snap {
            self.anchor.adopt(embedded);
        }

        let (verdict, minute_utc, tones) = self.analyse_minute(&archive);
        match self.emit(&archive, minute_utc, &tones, &verdict) {
            Ok(()) => {}
            // The minute is recorded with the fault noted; it must not wedge
            // the poll loop.
            Err(RecorderError::DecimationUnderflow(msg)) => {
                warn!("Decimation fault on {name}: {msg}");
            }
            Err(e) => return Err(e),
        }

        self.state.processed.insert(name.to_owned());
        self.state.anchor = self.anchor.snapshot();
        self.state.save(&self.state_path)?;

        debug!(
            "Processed {name}: {} ({})",
            verdict.dominant, verdict.confidence
        );
        Ok(())
    }

    fn analyse_minute(
        &mut self,
        archive: &MinuteArchive,
    ) -> (Verdict, DateTime<Utc>, tone::MinuteTones) {
        let minute_utc = archive
            .start_utc()
            .or_else(|| self.anchor.snapshot().map(|s| {
                s.sample_utc(archive.rtp_start, archive.sample_rate)
            }))
            .unwrap_or_else(Utc::now);

        let tone_capable = tone::supports_tones(archive.sample_rate);
        let tones = if tone_capable {
            tone::minute_scan(&archive.iq, archive.sample_rate)
        } else {
            quiet_tones()
        };

        let bcd = if tone_capable && self.channel.stations.iter().any(|s| s.has_bcd()) {
            let track = bcd::subcarrier_track(&archive.iq, archive.sample_rate);
            bcd::analyse(&track, minute_utc, Some(self.prediction.differential_ms()))
        } else {
            None
        };

        // The minute of the hour decides the evidence weights; take the
        // minute this archive mostly covers.
        let minute_of_hour =
            chrono::Timelike::minute(&(minute_utc + TimeDelta::seconds(30)));

        let evidence = MinuteEvidence {
            minute_of_hour,
            tones,
            bcd,
            prediction: self.prediction,
            completeness_percent: archive.completeness_percent(),
        };
        let verdict = discriminator::discriminate(&evidence, &self.discrimination);

        (verdict, minute_utc, tones)
    }

    fn emit(
        &mut self,
        archive: &MinuteArchive,
        minute_utc: DateTime<Utc>,
        tones: &tone::MinuteTones,
        verdict: &Verdict,
    ) -> RecorderResult<()> {
        if self.products.seen(minute_utc) {
            debug!("Minute {minute_utc} already emitted, skipping products");
            return Ok(());
        }

        let decimated = self.decimator.process(&archive.iq);
        let expected = self.decimator.expected_per_minute();
        if decimated.len() != expected {
            return Err(RecorderError::DecimationUnderflow(format!(
                "minute produced {} of {expected} samples",
                decimated.len()
            )));
        }

        let snap = self.anchor.snapshot();
        let confidence = snap
            .map(|s| s.confidence_at(minute_utc, self.anchor_half_life))
            .unwrap_or(0.0);

        self.products.append_decimated(&DecimatedMinute {
            minute_utc,
            channel_id: archive.channel_id.clone(),
            centre_freq: archive.centre_freq,
            rtp_start: archive.rtp_start,
            output_rate: self.output_rate,
            iq: decimated,
            anchor_source: snap.map(|s| s.source),
            anchor_confidence: confidence,
            completeness_percent: archive.completeness_percent(),
            gap_count: archive.gaps.len() as u32,
        })?;

        self.products.append_minute_row(
            &products::MinuteQuality {
                minute_utc,
                completeness_percent: archive.completeness_percent(),
                gap_count: archive.gaps.len() as u32,
                anchor_source: snap.map(|s| s.source),
                anchor_confidence: confidence,
            },
            tones,
            verdict,
        )?;
        self.products.append_discrimination_row(minute_utc, verdict)?;
        self.products.mark_seen(minute_utc);

        Ok(())
    }
}

fn quiet_tones() -> tone::MinuteTones {
    tone::MinuteTones {
        wwv_marker_db: f64::NEG_INFINITY,
        wwvh_marker_db: f64::NEG_INFINITY,
        id_440_db: f64::NEG_INFINITY,
        noise_floor_db: f64::NEG_INFINITY,
        wwv_marker_snr_db: 0.0,
        wwvh_marker_snr_db: 0.0,
        id_440_snr_db: 0.0,
        wwv_tick_snr_db: 0.0,
        wwvh_tick_snr_db: 0.0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        archive::{Gap, GapCategory},
        station::Station,
    };
    use chrono::TimeZone;
    use num_complex::Complex;

    fn test_config(root: &Path) -> Config {
        let yaml = format!(
            r#"
multicast:
  group: 239.1.2.3
  port: 5004
  payloadTypes: [97]
data:
  root: {}
station:
  receiverLat: 41.9
  receiverLon: -93.6
channels:
  - id: wwv10
    ssrc: 0xdeadbeef
    centreHz: 10000000.0
    sampleRate: 200
    stations: [WWV, WWVH]
"#,
            root.to_string_lossy()
        );
        serde_yaml::from_str(&yaml).expect("config")
    }

    fn snap() -> TimeSnap {
        let utc = Utc.with_ymd_and_hms(2025, 8, 1, 14, 37, 0).single().expect("ts");
        TimeSnap {
            rtp_index: 0,
            utc,
            source: AnchorSource::ToneLocked,
            station: Some(Station::Wwv),
            confidence: 0.9,
            established_at: utc,
        }
    }

    fn archive(minute_index: u32) -> MinuteArchive {
        let n = 200 * 60;
        MinuteArchive {
            channel_id: "wwv10".to_owned(),
            rtp_ssrc: 0xdead_beef,
            rtp_start: minute_index * n as u32,
            sample_rate: 200,
            centre_freq: 10e6,
            iq: vec![Complex::new(0.5, -0.25); n],
            gaps: vec![Gap {
                rtp_index: minute_index * n as u32 + 100,
                len: 80,
                category: GapCategory::NetworkLoss,
            }],
            packets_received: 298,
            packets_expected: 300,
            time_snap: Some(snap()),
            tone_snapshot: None,
        }
    }

    #[test]
    fn processing_is_idempotent_and_tracked_in_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let channel = config.channels[0].clone();

        let archive_dir = dir.path().join("wwv10");
        let a = archive(0);
        let written = a
            .write_to_dir(&archive_dir, Utc::now())
            .expect("write archive");
        let name = written
            .file_name()
            .expect("name")
            .to_string_lossy()
            .to_string();

        let mut actor = AnalyticsActor::new(&config, &channel).expect("actor");
        actor.poll().expect("poll");

        assert!(actor.state.processed.contains(&name));
        let product = actor.products.decimated_path(snap().utc);
        let day = products::read_decimated_day(&product).expect("read");
        assert_eq!(1, day.len());
        assert_eq!(600, day[0].iq.len());

        // A second poll must not duplicate any product row.
        actor.poll().expect("poll");
        let day = products::read_decimated_day(&product).expect("read");
        assert_eq!(1, day.len());

        // A fresh actor (restart) reloads the processed set from disk.
        let actor2 = AnalyticsActor::new(&config, &channel).expect("actor");
        assert!(actor2.state.processed.contains(&name));
        let carried = actor2.anchor.snapshot().expect("carried anchor");
        assert_eq!(AnchorSource::CarriedFromPreviousArchive, carried.source);
    }

    #[test]
    fn narrow_channel_minute_discriminates_none_but_decimates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let channel = config.channels[0].clone();
        let mut actor = AnalyticsActor::new(&config, &channel).expect("actor");

        let a = archive(0);
        let (verdict, minute_utc, _) = actor.analyse_minute(&a);
        assert_eq!(discriminator::Dominant::None, verdict.dominant);
        assert_eq!(snap().utc, minute_utc);
    }

    #[test]
    fn corrupt_state_cold_starts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let channel = config.channels[0].clone();
        let state_path = dir.path().join("wwv10").join("analytics-state.json");
        std::fs::create_dir_all(state_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&state_path, b"{ not json").expect("write");

        let actor = AnalyticsActor::new(&config, &channel).expect("actor");
        assert!(actor.state.processed.is_empty());
        assert!(actor.anchor.snapshot().is_none());
    }

    #[test]
    fn unreadable_archive_is_skipped_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let channel = config.channels[0].clone();
        let archive_dir = dir.path().join("wwv10");
        std::fs::create_dir_all(&archive_dir).expect("mkdir");
        std::fs::write(archive_dir.join("19700101T000000Z_10000000_iq.giq"), b"junk")
            .expect("write");

        let mut actor = AnalyticsActor::new(&config, &channel).expect("actor");
        actor.poll().expect("poll");
        assert!(
            actor
                .state
                .processed
                .contains("19700101T000000Z_10000000_iq.giq")
        );
    }
}
