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

//! The sample clock of the transmitting station is the timing authority.
//! Everything in here converts between the 32-bit RTP sample index and UTC
//! through a single anchor per channel; the wall clock only ever seeds a
//! low-confidence anchor or sanity-bounds one.

use crate::{
    error::{SystemClockError, SystemClockResult},
    station::Station,
};
use chrono::{DateTime, TimeDelta, Utc};
use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    sync::Mutex,
    time::Duration,
};
use tokio::{select, time::interval};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, instrument, warn};

pub const U32_WRAP: u64 = 1 << 32;

/// Signed 32-bit RTP timestamp difference `to − from`. An apparent negative
/// difference of magnitude ≥ 2³¹ is forward motion past the wrap.
pub fn rtp_delta(from: u32, to: u32) -> i64 {
    to.wrapping_sub(from) as i32 as i64
}

pub fn rtp_add(base: u32, delta: i64) -> u32 {
    base.wrapping_add(delta as u32)
}

/// Monotonic receive instant, independent of NTP steps.
pub fn monotonic_now() -> SystemClockResult<Duration> {
    let mut tp = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { clock_gettime(CLOCK_MONOTONIC, &mut tp) } == -1 {
        Err(SystemClockError("could not get system time".to_owned()))
    } else {
        Ok(Duration::new(tp.tv_sec as u64, tp.tv_nsec as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnchorSource {
    NtpWallClock,
    CarriedFromPreviousArchive,
    ToneLocked,
}

impl AnchorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorSource::ToneLocked => "tone-locked",
            AnchorSource::NtpWallClock => "ntp-wall-clock",
            AnchorSource::CarriedFromPreviousArchive => "carried-from-previous-archive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tone-locked" => Some(AnchorSource::ToneLocked),
            "ntp-wall-clock" => Some(AnchorSource::NtpWallClock),
            "carried-from-previous-archive" => Some(AnchorSource::CarriedFromPreviousArchive),
            _ => None,
        }
    }
}

impl Display for AnchorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable pairing of one RTP sample index with one UTC instant.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSnap {
    pub rtp_index: u32,
    pub utc: DateTime<Utc>,
    pub source: AnchorSource,
    pub station: Option<Station>,
    pub confidence: f32,
    pub established_at: DateTime<Utc>,
}

impl TimeSnap {
    /// UTC of sample `rtp_index`, extrapolated along the sample clock with
    /// wrap-safe subtraction. Exact to the nanosecond for any |Δ| < 2³¹.
    pub fn sample_utc(&self, rtp_index: u32, sample_rate: u32) -> DateTime<Utc> {
        let delta = rtp_delta(self.rtp_index, rtp_index);
        let nanos = div_round(delta as i128 * 1_000_000_000, sample_rate as i128);
        self.utc + TimeDelta::nanoseconds(nanos as i64)
    }

    /// Confidence at `now`, decayed linearly from the establishment value:
    /// half the initial confidence after one half-life, zero after two.
    pub fn confidence_at(&self, now: DateTime<Utc>, half_life: Duration) -> f32 {
        let elapsed = (now - self.established_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let decay = 1.0 - elapsed.as_secs_f64() / (2.0 * half_life.as_secs_f64());
        self.confidence * decay.clamp(0.0, 1.0) as f32
    }

    fn rank(&self) -> u8 {
        match self.source {
            AnchorSource::NtpWallClock => 0,
            AnchorSource::CarriedFromPreviousArchive => 1,
            AnchorSource::ToneLocked => 2,
        }
    }
}

fn div_round(n: i128, d: i128) -> i128 {
    if (n < 0) == (d < 0) {
        (n + d / 2) / d
    } else {
        (n - d / 2) / d
    }
}

/// The single authoritative anchor of one channel. The tone detector writes,
/// the minute writer and analytics read snapshots. Within a session at most
/// one anchor is authoritative at a time.
#[derive(Debug)]
pub struct AnchorCell {
    inner: Mutex<Option<TimeSnap>>,
}

impl Default for AnchorCell {
    fn default() -> Self {
        Self::new()
    }
}

impl AnchorCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Replace the current anchor if the candidate wins under the
    /// supersession rules. Returns whether the candidate was adopted.
    pub fn adopt(&self, candidate: TimeSnap) -> bool {
        let mut inner = self.inner.lock().expect("anchor cell poisoned");

        let adopt = match &*inner {
            None => true,
            Some(current) => {
                if candidate.rank() > current.rank() {
                    candidate.confidence >= 0.5
                } else {
                    candidate.source == AnchorSource::ToneLocked
                        && current.source == AnchorSource::ToneLocked
                        && candidate.confidence >= current.confidence
                        && candidate.established_at > current.established_at
                }
            }
        };

        if adopt {
            debug!(
                "Adopting anchor: rtp={} utc={} source={} confidence={:.2}",
                candidate.rtp_index, candidate.utc, candidate.source, candidate.confidence
            );
            *inner = Some(candidate);
        }

        adopt
    }

    pub fn snapshot(&self) -> Option<TimeSnap> {
        *self.inner.lock().expect("anchor cell poisoned")
    }

    /// Drop the anchor. Only valid on recorder restart, every session
    /// starts anchorless.
    pub fn invalidate(&self) {
        *self.inner.lock().expect("anchor cell poisoned") = None;
    }
}

const TIME_ERROR: libc::c_int = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpStatus {
    pub synchronized: bool,
    pub max_error_us: u64,
}

impl NtpStatus {
    pub fn unsynchronized() -> Self {
        Self {
            synchronized: false,
            max_error_us: u64::MAX,
        }
    }
}

/// Kernel clock discipline state via adjtimex(2), read-only (modes = 0).
pub fn probe_ntp() -> SystemClockResult<NtpStatus> {
    let mut buf: libc::timex = unsafe { std::mem::zeroed() };
    let state = unsafe { libc::adjtimex(&mut buf) };
    if state == -1 {
        return Err(SystemClockError("adjtimex failed".to_owned()));
    }
    Ok(NtpStatus {
        synchronized: state != TIME_ERROR,
        max_error_us: buf.maxerror as u64,
    })
}

/// Process-wide NTP status cache. Components read the cache instead of
/// re-probing the kernel.
#[derive(Debug)]
pub struct NtpStatusCache {
    status: Mutex<NtpStatus>,
}

impl Default for NtpStatusCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NtpStatusCache {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(NtpStatus::unsynchronized()),
        }
    }

    pub fn get(&self) -> NtpStatus {
        *self.status.lock().expect("ntp cache poisoned")
    }

    fn set(&self, status: NtpStatus) {
        *self.status.lock().expect("ntp cache poisoned") = status;
    }

    /// A low-confidence wall-clock anchor for `rtp_index` right now. Used
    /// until the tone detector locks, and as fallback on tone-dead channels.
    pub fn wall_clock_anchor(&self, rtp_index: u32) -> TimeSnap {
        let status = self.get();
        let now = Utc::now();
        let confidence = if status.synchronized { 0.5 } else { 0.1 };
        TimeSnap {
            rtp_index,
            utc: now,
            source: AnchorSource::NtpWallClock,
            station: None,
            confidence,
            established_at: now,
        }
    }

    #[instrument(skip(self, subsys))]
    pub async fn run(&self, subsys: SubsystemHandle, poll_interval: Duration) {
        let mut tick = interval(poll_interval);
        info!("NTP status poller started.");

        loop {
            select! {
                _ = tick.tick() => match probe_ntp() {
                    Ok(status) => {
                        debug!("NTP status: synchronized={} maxerror={} µs", status.synchronized, status.max_error_us);
                        self.set(status);
                    }
                    Err(e) => warn!("Could not probe NTP status: {e}"),
                },
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        info!("NTP status poller stopped.");
    }
}
