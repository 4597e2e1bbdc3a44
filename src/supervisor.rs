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

//! Capture-process supervision: owns the channel registry and the NTP
//! status cache, starts the capture subsystems and keeps a concise health
//! line per channel. Recoverable faults never exit the process.

use crate::{
    capture::{self, ChannelState, ChannelStatus, HealthRegistry},
    config::Config,
    error::RecorderResult,
    timebase::NtpStatusCache,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::{select, time::interval};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument, warn};

const NTP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Health colour per channel, derived from its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Green,
    Yellow,
    Red,
}

pub fn health_of(status: &ChannelStatus, now: DateTime<Utc>, grace: Duration) -> Health {
    match status.state {
        ChannelState::Failed => Health::Red,
        ChannelState::Stalled => Health::Red,
        ChannelState::Receiving => {
            let fresh = status
                .last_flush_utc
                .map(|t| now - t < chrono::TimeDelta::seconds(90 + grace.as_secs() as i64))
                .unwrap_or(true);
            if fresh && !status.sdr_health_stale {
                Health::Green
            } else {
                Health::Yellow
            }
        }
        _ => Health::Yellow,
    }
}

pub fn format_health(id: &str, status: &ChannelStatus, now: DateTime<Utc>) -> String {
    let last_flush = status
        .last_flush_utc
        .map(|t| t.format("%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "never".to_owned());
    let anchor = match (status.anchor_source, status.anchor_established_at) {
        (Some(source), Some(established)) => {
            let age = (now - established).num_seconds().max(0);
            format!("{source} (age {age} s)")
        }
        _ => "none".to_owned(),
    };
    format!(
        "{id}: {} | last minute {last_flush} | completeness {:.2}% | anchor {anchor} | restarts {}",
        status.state, status.completeness_percent, status.restarts
    )
}

/// Starts everything the capture process runs: NTP poller, receive socket,
/// per-channel capture and the health reporter.
#[instrument(skip_all)]
pub async fn start(subsys: &SubsystemHandle, config: Config) -> RecorderResult<()> {
    let registry: HealthRegistry = Arc::new(DashMap::new());
    let ntp = Arc::new(NtpStatusCache::new());

    let ntp_task = ntp.clone();
    subsys.start(SubsystemBuilder::new("ntp-poller", move |s| async move {
        ntp_task.run(s, NTP_POLL_INTERVAL).await;
        Ok::<(), crate::error::RecorderError>(())
    }));

    capture::start_capture(subsys, config.clone(), registry.clone(), ntp).await?;

    let health_interval = Duration::from_secs(config.supervisor.health_interval_s as u64);
    let grace = config.supervisor.receive_grace;
    subsys.start(SubsystemBuilder::new("health", move |s| {
        health_loop(s, registry, health_interval, grace)
    }));

    Ok(())
}

async fn health_loop(
    subsys: SubsystemHandle,
    registry: HealthRegistry,
    period: Duration,
    grace: Duration,
) -> RecorderResult<()> {
    let mut tick = interval(period);
    loop {
        select! {
            _ = tick.tick() => {
                let now = Utc::now();
                for entry in registry.iter() {
                    let line = format_health(entry.key(), entry.value(), now);
                    match health_of(entry.value(), now, grace) {
                        Health::Green => info!("health {line}"),
                        Health::Yellow | Health::Red => warn!("health {line}"),
                    }
                }
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::timebase::AnchorSource;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 15, 0, 0).single().expect("ts")
    }

    fn receiving_status() -> ChannelStatus {
        ChannelStatus {
            state: ChannelState::Receiving,
            last_flush_utc: Some(now() - chrono::TimeDelta::seconds(30)),
            completeness_percent: 99.33,
            anchor_source: Some(AnchorSource::ToneLocked),
            anchor_established_at: Some(now() - chrono::TimeDelta::minutes(10)),
            sdr_health_stale: false,
            restarts: 0,
        }
    }

    #[test]
    fn fresh_receiving_channel_is_green() {
        let grace = Duration::from_secs(10);
        assert_eq!(Health::Green, health_of(&receiving_status(), now(), grace));
    }

    #[test]
    fn stale_sdr_health_goes_yellow() {
        let grace = Duration::from_secs(10);
        let mut status = receiving_status();
        status.sdr_health_stale = true;
        assert_eq!(Health::Yellow, health_of(&status, now(), grace));
    }

    #[test]
    fn stale_flush_goes_yellow_and_stall_goes_red() {
        let grace = Duration::from_secs(10);
        let mut status = receiving_status();
        status.last_flush_utc = Some(now() - chrono::TimeDelta::minutes(10));
        assert_eq!(Health::Yellow, health_of(&status, now(), grace));

        status.state = ChannelState::Stalled;
        assert_eq!(Health::Red, health_of(&status, now(), grace));

        status.state = ChannelState::Failed;
        assert_eq!(Health::Red, health_of(&status, now(), grace));
    }

    #[test]
    fn health_line_reads_like_a_status_report() {
        let line = format_health("wwv10", &receiving_status(), now());
        assert!(line.contains("wwv10: receiving"));
        assert!(line.contains("completeness 99.33%"));
        assert!(line.contains("tone-locked (age 600 s)"));
    }
}
