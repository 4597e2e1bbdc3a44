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

//! Daily analytic products, all append-only for the UTC day.
//!
//! The decimated I/Q product reuses the archive container idea as
//! successive gzip members, one per minute, so an append never rewrites
//! earlier minutes and a crashed append loses at most the trailing member.

use crate::{
    analytics::discriminator::Verdict,
    dsp::tone::MinuteTones,
    error::{RecorderError, RecorderResult},
    timebase::AnchorSource,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use flate2::{Compression, read::MultiGzDecoder, write::GzEncoder};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

const DECIMATED_MAGIC: &[u8; 4] = b"GIQD";

/// One minute of decimated product with its quality metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DecimatedMinute {
    pub minute_utc: DateTime<Utc>,
    pub channel_id: String,
    pub centre_freq: f64,
    pub rtp_start: u32,
    pub output_rate: u32,
    pub iq: Vec<Complex<f32>>,
    pub anchor_source: Option<AnchorSource>,
    pub anchor_confidence: f32,
    pub completeness_percent: f64,
    pub gap_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct DecimatedHeader {
    format: String,
    channel_id: String,
    minute_utc: DateTime<Utc>,
    centre_freq: f64,
    rtp_start: u32,
    output_rate: u32,
    iq_len: u64,
    timing_source: Option<String>,
    timing_confidence: f32,
    completeness_percent: f64,
    gap_count: u32,
}

/// Per-minute quality columns shared by the metrics table and the product
/// metadata.
#[derive(Debug, Clone, Copy)]
pub struct MinuteQuality {
    pub minute_utc: DateTime<Utc>,
    pub completeness_percent: f64,
    pub gap_count: u32,
    pub anchor_source: Option<AnchorSource>,
    pub anchor_confidence: f32,
}

/// Append-only product writer for one channel. Each minute appears at most
/// once per day across all three outputs.
pub struct ProductWriter {
    dir: PathBuf,
    channel_id: String,
    centre_freq: f64,
    written: HashSet<i64>,
}

impl ProductWriter {
    pub fn new(data_root: &Path, channel_id: &str, centre_freq: f64) -> Self {
        Self {
            dir: data_root.join(channel_id).join("products"),
            channel_id: channel_id.to_owned(),
            centre_freq,
            written: HashSet::new(),
        }
    }

    fn day(&self, utc: DateTime<Utc>) -> String {
        utc.format("%Y%m%d").to_string()
    }

    pub fn decimated_path(&self, utc: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{}T000000Z_{}_iq_10hz.giqd",
            self.day(utc),
            self.centre_freq.round() as i64
        ))
    }

    pub fn minutes_table_path(&self, utc: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}_{}_minutes.csv", self.day(utc), self.channel_id))
    }

    pub fn discrimination_table_path(&self, utc: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_discrimination.csv",
            self.day(utc),
            self.channel_id
        ))
    }

    /// Whether this minute has already been emitted in this process.
    pub fn seen(&self, minute_utc: DateTime<Utc>) -> bool {
        self.written.contains(&minute_utc.timestamp())
    }

    pub fn mark_seen(&mut self, minute_utc: DateTime<Utc>) {
        self.written.insert(minute_utc.timestamp());
    }

    #[instrument(skip(self, minute), fields(channel = %self.channel_id))]
    pub fn append_decimated(&mut self, minute: &DecimatedMinute) -> RecorderResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.decimated_path(minute.minute_utc);

        let header = DecimatedHeader {
            format: "grape-iq-10hz/1".to_owned(),
            channel_id: minute.channel_id.clone(),
            minute_utc: minute.minute_utc,
            centre_freq: minute.centre_freq,
            rtp_start: minute.rtp_start,
            output_rate: minute.output_rate,
            iq_len: minute.iq.len() as u64,
            timing_source: minute.anchor_source.map(|s| s.as_str().to_owned()),
            timing_confidence: minute.anchor_confidence,
            completeness_percent: minute.completeness_percent,
            gap_count: minute.gap_count,
        };
        let header = serde_json::to_vec(&header)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
        gz.write_all(DECIMATED_MAGIC)?;
        gz.write_u32::<LittleEndian>(header.len() as u32)?;
        gz.write_all(&header)?;
        for sample in &minute.iq {
            gz.write_f32::<LittleEndian>(sample.re)?;
            gz.write_f32::<LittleEndian>(sample.im)?;
        }
        gz.finish()?;

        debug!("Appended decimated minute {}", minute.minute_utc);
        Ok(path)
    }

    fn append_csv_row(&self, path: &Path, header: &str, row: &str) -> RecorderResult<()> {
        fs::create_dir_all(&self.dir)?;
        let fresh = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if fresh {
            writeln!(file, "{header}")?;
        }
        writeln!(file, "{row}")?;
        Ok(())
    }

    #[instrument(skip_all, fields(channel = %self.channel_id, minute = %quality.minute_utc))]
    pub fn append_minute_row(
        &mut self,
        quality: &MinuteQuality,
        tones: &MinuteTones,
        verdict: &Verdict,
    ) -> RecorderResult<()> {
        let header = "timestamp_utc,channel,completeness_percent,gap_count,anchor_source,\
             anchor_confidence,wwv_marker_db,wwvh_marker_db,id_440_db,noise_floor_db,\
             dominant,confidence";
        let row = format!(
            "{},{},{:.2},{},{},{:.3},{:.2},{:.2},{:.2},{:.2},{},{}",
            quality.minute_utc.format("%Y-%m-%dT%H:%M:%SZ"),
            self.channel_id,
            quality.completeness_percent,
            quality.gap_count,
            quality.anchor_source.map(|s| s.as_str()).unwrap_or("none"),
            quality.anchor_confidence,
            tones.wwv_marker_db,
            tones.wwvh_marker_db,
            tones.id_440_db,
            tones.noise_floor_db,
            verdict.dominant,
            verdict.confidence,
        );
        self.append_csv_row(&self.minutes_table_path(quality.minute_utc), header, &row)
    }

    #[instrument(skip_all, fields(channel = %self.channel_id, minute = %minute_utc))]
    pub fn append_discrimination_row(
        &mut self,
        minute_utc: DateTime<Utc>,
        verdict: &Verdict,
    ) -> RecorderResult<()> {
        let header = "timestamp_utc,channel,dominant,confidence,power_ratio_db,bcd_ratio_db,\
             tick_ratio_db,toa_offset_ms,method_weights_json,integration_window_s";
        let weights_json = serde_json::to_string(&verdict.weights)?;
        let row = format!(
            "{},{},{},{},{:.2},{},{:.2},{},\"{}\",{}",
            minute_utc.format("%Y-%m-%dT%H:%M:%SZ"),
            self.channel_id,
            verdict.dominant,
            verdict.confidence,
            verdict.scores.power_ratio_db,
            verdict
                .scores
                .bcd_ratio_db
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
            verdict.scores.tick_ratio_db,
            verdict
                .scores
                .toa_offset_ms
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
            weights_json.replace('"', "\"\""),
            verdict.integration_window_s,
        );
        self.append_csv_row(&self.discrimination_table_path(minute_utc), header, &row)
    }
}

/// Reads every minute member of a daily decimated product.
pub fn read_decimated_day(path: &Path) -> RecorderResult<Vec<DecimatedMinute>> {
    let file = File::open(path)?;
    let mut reader = MultiGzDecoder::new(BufReader::new(file));

    let mut minutes = Vec::new();
    loop {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if &magic != DECIMATED_MAGIC {
            warn!("Skipping decimated product with bad member magic");
            return Err(RecorderError::StateCorrupt(format!(
                "bad decimated member magic in {}",
                path.to_string_lossy()
            )));
        }

        let header_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut header_buf = vec![0u8; header_len];
        reader.read_exact(&mut header_buf)?;
        let header: DecimatedHeader = serde_json::from_slice(&header_buf)?;

        let mut iq = Vec::with_capacity(header.iq_len as usize);
        for _ in 0..header.iq_len {
            let re = reader.read_f32::<LittleEndian>()?;
            let im = reader.read_f32::<LittleEndian>()?;
            iq.push(Complex::new(re, im));
        }

        minutes.push(DecimatedMinute {
            minute_utc: header.minute_utc,
            channel_id: header.channel_id,
            centre_freq: header.centre_freq,
            rtp_start: header.rtp_start,
            output_rate: header.output_rate,
            iq,
            anchor_source: header.timing_source.as_deref().and_then(AnchorSource::parse),
            anchor_confidence: header.timing_confidence,
            completeness_percent: header.completeness_percent,
            gap_count: header.gap_count,
        });
    }

    Ok(minutes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        analytics::{discriminator, discriminator::MinuteEvidence, geodesy::DelayPrediction},
        config::DiscriminationConfig,
        dsp::tone::MinuteTones,
    };
    use chrono::TimeZone;

    fn minute(i: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_754_006_400 + i * 60, 0).single().expect("ts")
    }

    fn decimated(i: i64) -> DecimatedMinute {
        DecimatedMinute {
            minute_utc: minute(i),
            channel_id: "wwv10".to_owned(),
            centre_freq: 10e6,
            rtp_start: (i as u32) * 960_000,
            output_rate: 10,
            iq: vec![Complex::new(i as f32, -(i as f32)); 600],
            anchor_source: Some(AnchorSource::ToneLocked),
            anchor_confidence: 0.9,
            completeness_percent: 99.33,
            gap_count: 1,
        }
    }

    fn tones() -> MinuteTones {
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

    fn verdict() -> Verdict {
        let evidence = MinuteEvidence {
            minute_of_hour: 17,
            tones: tones(),
            bcd: None,
            prediction: DelayPrediction::for_receiver(41.9, -93.6),
            completeness_percent: 100.0,
        };
        discriminator::discriminate(&evidence, &DiscriminationConfig::default())
    }

    #[test]
    fn decimated_appends_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = ProductWriter::new(dir.path(), "wwv10", 10e6);

        let path = writer.append_decimated(&decimated(0)).expect("append");
        writer.append_decimated(&decimated(1)).expect("append");
        writer.append_decimated(&decimated(2)).expect("append");

        let day = read_decimated_day(&path).expect("read");
        assert_eq!(3, day.len());
        assert_eq!(600, day[1].iq.len());
        assert_eq!(minute(1), day[1].minute_utc);
        assert_eq!(Some(AnchorSource::ToneLocked), day[1].anchor_source);
        assert!((day[2].completeness_percent - 99.33).abs() < 1e-9);
    }

    #[test]
    fn all_minutes_of_one_day_share_one_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ProductWriter::new(dir.path(), "wwv10", 10e6);
        assert_eq!(
            writer.decimated_path(minute(0)),
            writer.decimated_path(minute(100))
        );
        // Next UTC day, next file.
        assert_ne!(
            writer.decimated_path(minute(0)),
            writer.decimated_path(minute(60 * 24))
        );
    }

    #[test]
    fn csv_tables_get_one_header_and_appended_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = ProductWriter::new(dir.path(), "wwv10", 10e6);
        let v = verdict();

        for i in 0..3 {
            let quality = MinuteQuality {
                minute_utc: minute(i),
                completeness_percent: 99.33,
                gap_count: 1,
                anchor_source: Some(AnchorSource::ToneLocked),
                anchor_confidence: 0.9,
            };
            writer
                .append_minute_row(&quality, &tones(), &v)
                .expect("row");
            writer
                .append_discrimination_row(minute(i), &v)
                .expect("row");
        }

        let minutes = fs::read_to_string(writer.minutes_table_path(minute(0))).expect("read");
        let lines: Vec<&str> = minutes.lines().collect();
        assert_eq!(4, lines.len());
        assert!(lines[0].starts_with("timestamp_utc,channel,"));
        assert!(lines[1].contains("wwv10"));
        assert!(lines[1].contains("WWV"));

        let detail =
            fs::read_to_string(writer.discrimination_table_path(minute(0))).expect("read");
        let lines: Vec<&str> = detail.lines().collect();
        assert_eq!(4, lines.len());
        assert!(lines[1].contains("integration_window_s") || lines[1].ends_with(",60"));
        assert!(lines[1].contains("markers"));
    }

    #[test]
    fn seen_tracking_deduplicates_minutes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = ProductWriter::new(dir.path(), "wwv10", 10e6);
        assert!(!writer.seen(minute(5)));
        writer.mark_seen(minute(5));
        assert!(writer.seen(minute(5)));
        assert!(!writer.seen(minute(6)));
    }
}
