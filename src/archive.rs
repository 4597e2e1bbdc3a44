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

//! The immutable one-minute archive and its on-disk container.
//!
//! A `.giq` file is a gzip stream wrapping a `GIQ1` magic, a little-endian
//! u32 header length, a JSON header naming every metadata field, and the
//! interleaved f32 little-endian I/Q block. Writes go to a temporary name
//! and are renamed into place, readers never observe partial files.

use crate::{
    error::{ArchiveError, ArchiveResult},
    station::Station,
    timebase::{AnchorSource, TimeSnap},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

const MAGIC: &[u8; 4] = b"GIQ1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapCategory {
    NetworkLoss,
    SourceSilence,
    RecorderOffline,
}

impl GapCategory {
    pub fn as_u8(&self) -> u8 {
        match self {
            GapCategory::NetworkLoss => 0,
            GapCategory::SourceSilence => 1,
            GapCategory::RecorderOffline => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(GapCategory::NetworkLoss),
            1 => Some(GapCategory::SourceSilence),
            2 => Some(GapCategory::RecorderOffline),
            _ => None,
        }
    }
}

/// An unbroken run of zero-injected samples and why it is there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub rtp_index: u32,
    pub len: u32,
    pub category: GapCategory,
}

/// Tone powers measured by the startup scan, carried in every archive of
/// the session for provenance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSnapshot {
    pub tone_power_1000_db: f32,
    pub tone_power_1200_db: f32,
    pub wwvh_diff_delay_ms: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinuteArchive {
    pub channel_id: String,
    pub rtp_ssrc: u32,
    pub rtp_start: u32,
    pub sample_rate: u32,
    pub centre_freq: f64,
    pub iq: Vec<Complex<f32>>,
    pub gaps: Vec<Gap>,
    pub packets_received: u32,
    pub packets_expected: u32,
    pub time_snap: Option<TimeSnap>,
    pub tone_snapshot: Option<ToneSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    format: String,
    channel_id: String,
    rtp_ssrc: u32,
    rtp_start: u32,
    sample_rate: i32,
    centre_freq: f64,
    iq_len: u64,
    iq_encoding: String,
    gaps_rtp: Vec<u32>,
    gaps_len: Vec<u32>,
    gaps_cat: Vec<u8>,
    packets_recv: u32,
    packets_expected: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_snap_rtp: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_snap_utc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_snap_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_snap_station: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_snap_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_snap_established: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tone_power_1000_db: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tone_power_1200_db: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wwvh_diff_delay_ms: Option<f32>,
}

fn epoch_f64(utc: DateTime<Utc>) -> f64 {
    utc.timestamp() as f64 + utc.timestamp_subsec_nanos() as f64 / 1e9
}

fn utc_from_epoch_f64(epoch: f64) -> DateTime<Utc> {
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - secs as f64) * 1e9).round() as u32;
    Utc.timestamp_opt(secs, nanos.min(999_999_999))
        .single()
        .unwrap_or_default()
}

impl MinuteArchive {
    pub fn samples_expected(&self) -> usize {
        self.sample_rate as usize * 60
    }

    /// Gaps whose zero-fill lies inside this minute. A recorder-offline
    /// annotation from a previous session points before `rtp_start` and is
    /// provenance only, its samples are not part of this archive.
    pub fn in_window_gaps(&self) -> impl Iterator<Item = &Gap> {
        let len = self.iq.len() as i64;
        self.gaps.iter().filter(move |g| {
            let offset = crate::timebase::rtp_delta(self.rtp_start, g.rtp_index);
            (0..len).contains(&offset)
        })
    }

    /// Fraction of the minute actually received, in percent.
    pub fn completeness_percent(&self) -> f64 {
        let total = self.iq.len() as f64;
        let lost: f64 = self.in_window_gaps().map(|g| g.len as f64).sum();
        if total == 0.0 {
            0.0
        } else {
            (total - lost) / total * 100.0
        }
    }

    /// UTC of `iq[0]` under the embedded anchor, if any.
    pub fn start_utc(&self) -> Option<DateTime<Utc>> {
        self.time_snap
            .map(|snap| snap.sample_utc(self.rtp_start, self.sample_rate))
    }

    /// File name, `YYYYMMDDTHHMMSSZ_<centre_freq_hz>_iq.giq`, timestamped
    /// with the UTC the anchor implies for `rtp_start` rounded to the
    /// nearest second.
    pub fn file_name(&self, fallback_utc: DateTime<Utc>) -> String {
        let utc = self.start_utc().unwrap_or(fallback_utc);
        archive_file_name(utc, self.centre_freq)
    }

    fn to_header(&self) -> Header {
        Header {
            format: "grape-iq/1".to_owned(),
            channel_id: self.channel_id.clone(),
            rtp_ssrc: self.rtp_ssrc,
            rtp_start: self.rtp_start,
            sample_rate: self.sample_rate as i32,
            centre_freq: self.centre_freq,
            iq_len: self.iq.len() as u64,
            iq_encoding: "complex64le".to_owned(),
            gaps_rtp: self.gaps.iter().map(|g| g.rtp_index).collect(),
            gaps_len: self.gaps.iter().map(|g| g.len).collect(),
            gaps_cat: self.gaps.iter().map(|g| g.category.as_u8()).collect(),
            packets_recv: self.packets_received,
            packets_expected: self.packets_expected,
            time_snap_rtp: self.time_snap.map(|s| s.rtp_index),
            time_snap_utc: self.time_snap.map(|s| epoch_f64(s.utc)),
            time_snap_source: self.time_snap.map(|s| s.source.as_str().to_owned()),
            time_snap_station: self
                .time_snap
                .and_then(|s| s.station)
                .map(|s| s.to_string()),
            time_snap_confidence: self.time_snap.map(|s| s.confidence),
            time_snap_established: self.time_snap.map(|s| epoch_f64(s.established_at)),
            tone_power_1000_db: self.tone_snapshot.map(|t| t.tone_power_1000_db),
            tone_power_1200_db: self.tone_snapshot.map(|t| t.tone_power_1200_db),
            wwvh_diff_delay_ms: self.tone_snapshot.and_then(|t| t.wwvh_diff_delay_ms),
        }
    }

    pub fn encode<W: Write>(&self, writer: W) -> ArchiveResult<()> {
        let header = serde_json::to_vec(&self.to_header())?;

        let mut gz = GzEncoder::new(writer, Compression::default());
        gz.write_all(MAGIC)?;
        gz.write_u32::<LittleEndian>(header.len() as u32)?;
        gz.write_all(&header)?;
        for sample in &self.iq {
            gz.write_f32::<LittleEndian>(sample.re)?;
            gz.write_f32::<LittleEndian>(sample.im)?;
        }
        gz.finish()?;

        Ok(())
    }

    pub fn decode<R: Read>(reader: R) -> ArchiveResult<Self> {
        let mut gz = GzDecoder::new(reader);

        let mut magic = [0u8; 4];
        gz.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ArchiveError::BadMagic);
        }

        let header_len = gz.read_u32::<LittleEndian>()? as usize;
        let mut header_buf = vec![0u8; header_len];
        gz.read_exact(&mut header_buf)?;
        let header: Header = serde_json::from_slice(&header_buf)?;

        let mut iq = Vec::with_capacity(header.iq_len as usize);
        for _ in 0..header.iq_len {
            let re = gz.read_f32::<LittleEndian>()?;
            let im = gz.read_f32::<LittleEndian>()?;
            iq.push(Complex::new(re, im));
        }

        let gaps = header
            .gaps_rtp
            .iter()
            .zip(header.gaps_len.iter())
            .zip(header.gaps_cat.iter())
            .map(|((&rtp_index, &len), &cat)| Gap {
                rtp_index,
                len,
                category: GapCategory::from_u8(cat).unwrap_or(GapCategory::NetworkLoss),
            })
            .collect();

        let time_snap = match (
            header.time_snap_rtp,
            header.time_snap_utc,
            header.time_snap_source,
        ) {
            (Some(rtp_index), Some(utc), Some(source)) => {
                let utc = utc_from_epoch_f64(utc);
                Some(TimeSnap {
                    rtp_index,
                    utc,
                    source: AnchorSource::parse(&source).unwrap_or(AnchorSource::NtpWallClock),
                    station: header.time_snap_station.as_deref().and_then(|s| match s {
                        "WWV" => Some(Station::Wwv),
                        "WWVH" => Some(Station::Wwvh),
                        "CHU" => Some(Station::Chu),
                        _ => None,
                    }),
                    confidence: header.time_snap_confidence.unwrap_or(0.0),
                    established_at: header
                        .time_snap_established
                        .map(utc_from_epoch_f64)
                        .unwrap_or(utc),
                })
            }
            _ => None,
        };

        let tone_snapshot = match (header.tone_power_1000_db, header.tone_power_1200_db) {
            (Some(tone_power_1000_db), Some(tone_power_1200_db)) => Some(ToneSnapshot {
                tone_power_1000_db,
                tone_power_1200_db,
                wwvh_diff_delay_ms: header.wwvh_diff_delay_ms,
            }),
            _ => None,
        };

        Ok(MinuteArchive {
            channel_id: header.channel_id,
            rtp_ssrc: header.rtp_ssrc,
            rtp_start: header.rtp_start,
            sample_rate: header.sample_rate as u32,
            centre_freq: header.centre_freq,
            iq,
            gaps,
            packets_received: header.packets_recv,
            packets_expected: header.packets_expected,
            time_snap,
            tone_snapshot,
        })
    }

    /// Write to `dir`, atomically, and return the final path.
    #[instrument(skip(self), fields(channel = %self.channel_id, rtp_start = self.rtp_start))]
    pub fn write_to_dir(&self, dir: &Path, fallback_utc: DateTime<Utc>) -> ArchiveResult<PathBuf> {
        fs::create_dir_all(dir)?;

        let final_path = dir.join(self.file_name(fallback_utc));
        let tmp_path = final_path.with_extension("giq.tmp");

        let file = File::create(&tmp_path)?;
        self.encode(BufWriter::new(file))?;
        fs::rename(&tmp_path, &final_path)?;

        debug!("Archive written to {}", final_path.to_string_lossy());
        Ok(final_path)
    }

    pub fn read_from(path: &Path) -> ArchiveResult<Self> {
        let file = File::open(path)?;
        let archive = Self::decode(BufReader::new(file))?;

        let expected = archive.samples_expected();
        if archive.iq.len() != expected {
            return Err(ArchiveError::LengthMismatch {
                expected,
                actual: archive.iq.len(),
            });
        }

        Ok(archive)
    }
}

pub fn archive_file_name(utc: DateTime<Utc>, centre_freq: f64) -> String {
    let rounded = utc_round_to_second(utc);
    format!(
        "{}_{}_iq.giq",
        rounded.format("%Y%m%dT%H%M%SZ"),
        centre_freq.round() as i64
    )
}

pub fn utc_round_to_second(utc: DateTime<Utc>) -> DateTime<Utc> {
    let secs = utc.timestamp();
    let nanos = utc.timestamp_subsec_nanos();
    let rounded = if nanos >= 500_000_000 { secs + 1 } else { secs };
    Utc.timestamp_opt(rounded, 0).single().unwrap_or(utc)
}
