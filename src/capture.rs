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

//! The capture engine: one receive task per multicast socket, one capture
//! session per channel. Packets are routed by SSRC into bounded queues;
//! queue overflow is counted and surfaces as network-loss, never as silent
//! sample loss. Sessions are anchorless at birth; the startup tone scan
//! promotes the wall-clock anchor to a tone-locked one.

pub mod minute;
pub mod resequencer;
pub mod rtp;

use crate::{
    archive::{Gap, GapCategory, MinuteArchive, ToneSnapshot},
    config::{ChannelConfig, Config},
    dsp::tone,
    error::{RecorderError, RecorderResult},
    socket::create_rx_socket,
    timebase::{AnchorCell, AnchorSource, NtpStatusCache, TimeSnap, monotonic_now, rtp_add},
};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use minute::{FinishedMinute, MinuteAccumulator};
use num_complex::Complex;
use resequencer::{Resequencer, SampleChunk};
use rtp::{IqPacket, parse_packet};
use serde::Deserialize;
use std::{
    collections::HashMap,
    fmt::{self, Display},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadSchedulePolicy,
    set_thread_priority_and_policy, thread_native_id,
};
use tokio::{
    runtime, select,
    sync::mpsc,
    task::spawn_blocking,
    time::timeout,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

/// Per-channel packet queue depth. At 20 ms packets this buffers several
/// seconds, which also covers the startup tone scan running inline.
const PACKET_QUEUE_DEPTH: usize = 256;

const WRITE_RETRIES: u32 = 3;
const WRITE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Starting,
    Receiving,
    Stalled,
    Draining,
    Stopped,
    Failed,
}

impl Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Starting => write!(f, "starting"),
            ChannelState::Receiving => write!(f, "receiving"),
            ChannelState::Stalled => write!(f, "stalled"),
            ChannelState::Draining => write!(f, "draining"),
            ChannelState::Stopped => write!(f, "stopped"),
            ChannelState::Failed => write!(f, "failed"),
        }
    }
}

/// What the supervisor's health line reports per channel.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub last_flush_utc: Option<DateTime<Utc>>,
    pub completeness_percent: f64,
    pub anchor_source: Option<AnchorSource>,
    pub anchor_established_at: Option<DateTime<Utc>>,
    pub sdr_health_stale: bool,
    pub restarts: u32,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Starting,
            last_flush_utc: None,
            completeness_percent: 0.0,
            anchor_source: None,
            anchor_established_at: None,
            sdr_health_stale: false,
            restarts: 0,
        }
    }
}

pub type HealthRegistry = Arc<dashmap::DashMap<String, ChannelStatus>>;

/// SDR daemon heartbeat as published on the status group: the producing
/// flag applies to the SSRCs listed in that heartbeat.
#[derive(Debug, Deserialize)]
struct SdrHeartbeat {
    producing: bool,
    ssrc: Vec<u32>,
}

/// Cached SDR daemon health per SSRC, written by the status listener and
/// read by every capture session. One daemon may carry channels in
/// different states, so nothing here is global.
#[derive(Debug, Default)]
pub struct SdrHealth {
    inner: Mutex<HashMap<u32, (Duration, bool)>>,
}

impl SdrHealth {
    pub fn note(&self, ssrcs: &[u32], producing: bool, at: Duration) {
        let mut inner = self.inner.lock().expect("sdr health poisoned");
        for &ssrc in ssrcs {
            inner.insert(ssrc, (at, producing));
        }
    }

    /// `Some(false)` means the daemon said it is not producing this SSRC;
    /// `None` means its heartbeat is stale or the SSRC was never reported.
    pub fn producing(&self, ssrc: u32, now: Duration, stale: Duration) -> Option<bool> {
        let (at, producing) = *self
            .inner
            .lock()
            .expect("sdr health poisoned")
            .get(&ssrc)?;
        if now.saturating_sub(at) > stale {
            None
        } else {
            Some(producing)
        }
    }
}

/// Starts the receive task, the optional SDR status listener and one
/// capture channel subsystem per configured channel.
#[instrument(skip_all)]
pub async fn start_capture(
    subsys: &SubsystemHandle,
    config: Config,
    registry: HealthRegistry,
    ntp: Arc<NtpStatusCache>,
) -> RecorderResult<()> {
    let sdr = Arc::new(SdrHealth::default());

    let mut senders = HashMap::new();
    for channel in &config.channels {
        let (tx, rx) = mpsc::channel(PACKET_QUEUE_DEPTH);
        senders.insert(channel.ssrc, tx);

        let capture = ChannelCapture::new(&config, channel, rx, registry.clone(), ntp.clone(), sdr.clone());
        let name = format!("capture-{}", channel.id);
        subsys.start(SubsystemBuilder::new(name, move |s| capture.run(s)));
    }

    let multicast = config.multicast.clone();
    let payload_types = multicast.payload_types.clone();
    subsys.start(SubsystemBuilder::new("rx-socket", move |s| {
        receive_task(s, multicast, payload_types, senders)
    }));

    if let Some(sdr_config) = config.sdr.clone() {
        let sdr = sdr.clone();
        subsys.start(SubsystemBuilder::new("sdr-status", move |s| {
            status_loop(s, sdr_config, sdr)
        }));
    }

    Ok(())
}

pub fn set_realtime_priority() {
    let pid = thread_native_id();
    if let Err(e) = set_thread_priority_and_policy(
        pid,
        ThreadPriority::Max,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        warn!("Could not set thread priority: {e}");
    } else {
        info!("Successfully set real time priority for thread {pid}.");
    }
}

/// Hosts the receive loop on a dedicated real-time thread with its own
/// current-thread runtime, so kernel scheduling of the socket drain is
/// independent of the worker pool.
async fn receive_task(
    subsys: SubsystemHandle,
    multicast: crate::config::MulticastConfig,
    payload_types: Vec<u8>,
    senders: HashMap<u32, mpsc::Sender<IqPacket>>,
) -> RecorderResult<()> {
    let rx_thread = spawn_blocking(move || {
        set_realtime_priority();
        let rx_thread_runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("rx-thread")
            .build()?;
        rx_thread_runtime.block_on(receive_loop(subsys, multicast, payload_types, senders))
    });

    match rx_thread.await {
        Ok(result) => result,
        Err(e) => Err(RecorderError::SocketFailure(format!(
            "receive thread terminated abnormally: {e}"
        ))),
    }
}

/// One receive loop per multicast socket. Never blocks on downstream
/// processing: full channel queues count the packet as dropped and the
/// resulting timestamp hole becomes a network-loss gap.
async fn receive_loop(
    subsys: SubsystemHandle,
    multicast: crate::config::MulticastConfig,
    payload_types: Vec<u8>,
    senders: HashMap<u32, mpsc::Sender<IqPacket>>,
) -> RecorderResult<()> {
    let socket = create_rx_socket(multicast.group, multicast.port, multicast.interface_ip)?;
    let mut buf = [0u8; 65_535];

    let mut malformed = 0u64;
    let mut rejected_pt = 0u64;
    let mut unknown_ssrc = 0u64;
    let mut overflow = 0u64;

    info!("RX socket listening on {}:{}", multicast.group, multicast.port);

    loop {
        select! {
            received = timeout(Duration::from_secs(1), socket.recv_from(&mut buf)) => {
                match received {
                    Ok(Ok((len, _addr))) => {
                        let now = monotonic_now()?;
                        match parse_packet(&buf[..len], &payload_types, now) {
                            Ok(pkt) => match senders.get(&pkt.ssrc) {
                                Some(tx) => {
                                    if tx.try_send(pkt).is_err() {
                                        overflow += 1;
                                        debug!("Channel queue full, packet dropped ({overflow} total)");
                                    }
                                }
                                None => {
                                    unknown_ssrc += 1;
                                    debug!("Packet for unknown SSRC ({unknown_ssrc} total)");
                                }
                            },
                            Err(rtp::PacketFault::Malformed) => {
                                malformed += 1;
                                debug!("Malformed RTP packet ({malformed} total)");
                            }
                            Err(fault) => {
                                rejected_pt += 1;
                                debug!("Rejected packet: {fault:?} ({rejected_pt} total)");
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        return Err(RecorderError::SocketFailure(e.to_string()));
                    }
                    // Idle socket; stall detection lives with the channels.
                    Err(_) => {}
                }
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    info!("RX socket stopped.");
    Ok(())
}

async fn status_loop(
    subsys: SubsystemHandle,
    config: crate::config::SdrStatusConfig,
    sdr: Arc<SdrHealth>,
) -> RecorderResult<()> {
    let socket = create_rx_socket(
        config.status_group,
        config.status_port,
        std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
    )?;
    let mut buf = [0u8; 8_192];

    info!(
        "SDR status listener on {}:{}",
        config.status_group, config.status_port
    );

    loop {
        select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => match serde_json::from_slice::<SdrHeartbeat>(&buf[..len]) {
                    Ok(beat) => sdr.note(&beat.ssrc, beat.producing, monotonic_now()?),
                    Err(e) => debug!("Unparseable SDR heartbeat: {e}"),
                },
                Err(e) => return Err(RecorderError::SocketFailure(e.to_string())),
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    Ok(())
}

/// Everything a capture session needs about its channel, separate from the
/// packet queue so sessions can borrow it while the queue is polled.
struct ChannelParams {
    channel: ChannelConfig,
    archive_dir: PathBuf,
    startup_samples: usize,
    snr_floor_db: f64,
    receive_grace: Duration,
    flush_timeout: Duration,
    sdr_configured: bool,
    sdr_stale: Duration,
    registry: HealthRegistry,
    ntp: Arc<NtpStatusCache>,
    sdr: Arc<SdrHealth>,
}

impl ChannelParams {
    fn update_status(&self, f: impl FnOnce(&mut ChannelStatus)) {
        let mut entry = self
            .registry
            .entry(self.channel.id.clone())
            .or_default();
        f(&mut entry);
    }
}

/// Long-lived per-channel wrapper: runs capture sessions and applies the
/// bounded restart policy. A restart starts a new session, and every
/// session starts anchorless.
struct ChannelCapture {
    params: ChannelParams,
    max_restarts_per_hour: u32,
    rx: mpsc::Receiver<IqPacket>,
}

impl ChannelCapture {
    fn new(
        config: &Config,
        channel: &ChannelConfig,
        rx: mpsc::Receiver<IqPacket>,
        registry: HealthRegistry,
        ntp: Arc<NtpStatusCache>,
        sdr: Arc<SdrHealth>,
    ) -> Self {
        Self {
            params: ChannelParams {
                channel: channel.clone(),
                archive_dir: config.data.root.join(&channel.id),
                startup_samples: config.timing.startup_buffer_s as usize
                    * channel.sample_rate as usize,
                snr_floor_db: config.timing.detection_snr_floor_db as f64,
                receive_grace: config.supervisor.receive_grace,
                flush_timeout: config.supervisor.flush_timeout,
                sdr_configured: config.sdr.is_some(),
                sdr_stale: Duration::from_secs(
                    config.sdr.as_ref().map(|s| s.stale_seconds).unwrap_or(15) as u64,
                ),
                registry,
                ntp,
                sdr,
            },
            max_restarts_per_hour: config.supervisor.max_restarts_per_hour,
            rx,
        }
    }

    async fn run(mut self, subsys: SubsystemHandle) -> RecorderResult<()> {
        let mut restarts: Vec<DateTime<Utc>> = Vec::new();

        loop {
            let mut session = CaptureSession::new(&self.params);
            let result = session.run(&subsys, &mut self.rx).await;

            match result {
                Ok(()) => {
                    self.params.update_status(|s| s.state = ChannelState::Stopped);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Capture session for '{}' failed: {e}",
                        self.params.channel.id
                    );
                    let now = Utc::now();
                    restarts.retain(|t| now - *t < TimeDelta::hours(1));
                    restarts.push(now);
                    self.params.update_status(|s| {
                        s.state = ChannelState::Failed;
                        s.restarts = restarts.len() as u32;
                    });

                    if restarts.len() as u32 > self.max_restarts_per_hour {
                        warn!(
                            "Channel '{}' exceeded {} restarts per hour, staying failed",
                            self.params.channel.id, self.max_restarts_per_hour
                        );
                        subsys.on_shutdown_requested().await;
                        return Ok(());
                    }

                    let backoff = Duration::from_secs(5 << restarts.len().min(6));
                    info!(
                        "Restarting channel '{}' in {backoff:?} (restart {} this hour)",
                        self.params.channel.id,
                        restarts.len()
                    );
                    select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = subsys.on_shutdown_requested() => return Ok(()),
                    }
                }
            }
        }
    }
}

/// One capture session: lives from (re)start to shutdown or failure.
struct CaptureSession<'a> {
    owner: &'a ChannelParams,
    anchor: AnchorCell,
    resequencer: Resequencer,
    accumulator: MinuteAccumulator,
    startup_buffer: Vec<Complex<f32>>,
    startup_buffer_rtp: Option<u32>,
    scan_done: bool,
    tone_snapshot: Option<ToneSnapshot>,
    first_flush_done: bool,
    state: ChannelState,
}

impl<'a> CaptureSession<'a> {
    fn new(owner: &'a ChannelParams) -> Self {
        Self {
            owner,
            anchor: AnchorCell::new(),
            resequencer: Resequencer::new(),
            accumulator: MinuteAccumulator::new(owner.channel.sample_rate),
            startup_buffer: Vec::new(),
            startup_buffer_rtp: None,
            scan_done: !tone::supports_tones(owner.channel.sample_rate),
            tone_snapshot: None,
            first_flush_done: false,
            state: ChannelState::Starting,
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            info!("Channel '{}': {} → {state}", self.owner.channel.id, self.state);
            self.state = state;
            let snap = self.anchor.snapshot();
            self.owner.update_status(|s| {
                s.state = state;
                s.anchor_source = snap.map(|a| a.source);
                s.anchor_established_at = snap.map(|a| a.established_at);
            });
        }
    }

    #[instrument(skip_all, fields(channel = %self.owner.channel.id))]
    async fn run(
        &mut self,
        subsys: &SubsystemHandle,
        rx: &mut mpsc::Receiver<IqPacket>,
    ) -> RecorderResult<()> {
        self.set_state(ChannelState::Starting);

        loop {
            select! {
                received = timeout(self.owner.receive_grace, rx.recv()) => match received {
                    Ok(Some(pkt)) => {
                        self.set_state(ChannelState::Receiving);
                        self.on_packet(pkt).await?;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        if self.state == ChannelState::Receiving {
                            self.set_state(ChannelState::Stalled);
                        }
                        let chunks = self.resequencer.poll(monotonic_now()?);
                        self.consume(chunks).await?;
                    }
                },
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        self.drain().await
    }

    async fn on_packet(&mut self, pkt: IqPacket) -> RecorderResult<()> {
        // The wall clock seeds a low-confidence anchor until the tone scan
        // locks; it stays a sanity bound afterwards.
        if self.anchor.snapshot().is_none() {
            self.anchor
                .adopt(self.owner.ntp.wall_clock_anchor(pkt.rtp_timestamp));
        }

        let now = pkt.received_at;
        let mut chunks = self.resequencer.push(pkt);
        chunks.extend(self.resequencer.poll(now));
        self.consume(chunks).await
    }

    async fn consume(&mut self, chunks: Vec<SampleChunk>) -> RecorderResult<()> {
        let reclassify = match self.owner.sdr.producing(
            self.owner.channel.ssrc,
            monotonic_now()?,
            self.owner.sdr_stale,
        ) {
            Some(false) => Some(GapCategory::SourceSilence),
            _ => None,
        };

        for chunk in chunks {
            self.feed_startup_buffer(&chunk);

            let finished = self.accumulator.push(chunk, reclassify);
            for minute in finished {
                self.flush_minute(minute).await?;
            }
        }

        if !self.scan_done && self.startup_buffer.len() >= self.owner.startup_samples {
            self.run_startup_scan();
        }

        Ok(())
    }

    fn feed_startup_buffer(&mut self, chunk: &SampleChunk) {
        if self.scan_done {
            return;
        }
        match chunk {
            SampleChunk::Samples { rtp_start, iq } => {
                if self.startup_buffer_rtp.is_none() {
                    self.startup_buffer_rtp = Some(*rtp_start);
                }
                self.startup_buffer.extend_from_slice(iq);
            }
            SampleChunk::Gap { rtp_start, len, .. } => {
                if self.startup_buffer_rtp.is_none() {
                    self.startup_buffer_rtp = Some(*rtp_start);
                }
                self.startup_buffer
                    .extend(std::iter::repeat_n(Complex::new(0.0, 0.0), *len as usize));
            }
        }
    }

    /// Runs the startup tone scan and, on success, promotes the anchor to
    /// tone-locked. Anchor UTC is the scan's onset relative to the *buffer
    /// start*, snapped to the minute the wall clock says it is.
    fn run_startup_scan(&mut self) {
        self.scan_done = true;
        let buffer_rtp = match self.startup_buffer_rtp {
            Some(it) => it,
            None => return,
        };

        let scan = tone::startup_scan(
            &self.startup_buffer,
            self.owner.channel.sample_rate,
            &self.owner.channel.stations,
            self.owner.snr_floor_db,
        );

        self.tone_snapshot = Some(ToneSnapshot {
            tone_power_1000_db: scan.power_1000_db as f32,
            tone_power_1200_db: scan.power_1200_db as f32,
            wwvh_diff_delay_ms: scan.diff_delay_ms.map(|v| v as f32),
        });

        let Some(detection) = scan.best() else {
            info!(
                "Channel '{}': no anchor tone found in startup buffer",
                self.owner.channel.id
            );
            self.startup_buffer = Vec::new();
            return;
        };

        let Some(wall) = self.anchor.snapshot() else {
            self.startup_buffer = Vec::new();
            return;
        };

        let sr = self.owner.channel.sample_rate;
        let onset_samples = (detection.onset_offset_s * sr as f64).round() as i64;
        let onset_rtp = rtp_add(buffer_rtp, onset_samples);
        let onset_wall = wall.sample_utc(onset_rtp, sr);

        // The marker rings at second zero; the wall clock only picks which
        // minute that was.
        let minute_utc = round_to_minute(onset_wall);
        let confidence = (0.5 + detection.snr_db / 40.0).clamp(0.5, 0.99) as f32;

        let candidate = TimeSnap {
            rtp_index: onset_rtp,
            utc: minute_utc,
            source: AnchorSource::ToneLocked,
            station: Some(detection.station),
            confidence,
            established_at: Utc::now(),
        };
        if self.anchor.adopt(candidate) {
            info!(
                "Channel '{}': tone-locked anchor from {} marker, snr {:.1} dB, wall offset {:.1} ms",
                self.owner.channel.id,
                detection.station,
                detection.snr_db,
                (onset_wall - minute_utc).num_milliseconds()
            );
        }

        self.startup_buffer = Vec::new();
    }

    async fn flush_minute(&mut self, minute: FinishedMinute) -> RecorderResult<()> {
        let snap = self.anchor.snapshot();

        let mut gaps = minute.gaps;
        if !self.first_flush_done {
            self.first_flush_done = true;
            if let Some(annotation) =
                self.offline_annotation(&snap, minute.rtp_start)
            {
                gaps.insert(0, annotation);
            }
        }

        let archive = MinuteArchive {
            channel_id: self.owner.channel.id.clone(),
            rtp_ssrc: self.owner.channel.ssrc,
            rtp_start: minute.rtp_start,
            sample_rate: self.owner.channel.sample_rate,
            centre_freq: self.owner.channel.centre_hz,
            iq: minute.iq,
            gaps,
            packets_received: minute.packets_received,
            packets_expected: minute.packets_expected,
            time_snap: snap,
            tone_snapshot: self.tone_snapshot,
        };

        let completeness = archive.completeness_percent();
        let flushed_utc = archive.start_utc().unwrap_or_else(Utc::now);
        let dir = self.owner.archive_dir.clone();
        let archive = Arc::new(archive);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let archive_clone = Arc::clone(&archive);
            let dir_clone = dir.clone();
            let write = spawn_blocking(move || {
                archive_clone.write_to_dir(&dir_clone, Utc::now())
            });

            match timeout(self.owner.flush_timeout, write).await {
                Ok(Ok(Ok(path))) => {
                    debug!("Flushed minute to {}", path.to_string_lossy());
                    break;
                }
                Ok(Ok(Err(e))) if attempt <= WRITE_RETRIES => {
                    warn!("Archive write failed (attempt {attempt}): {e}, retrying");
                    tokio::time::sleep(WRITE_BACKOFF * attempt).await;
                }
                Ok(Ok(Err(e))) => {
                    return Err(RecorderError::ArchiveWriteFailure(e));
                }
                Ok(Err(join)) => {
                    return Err(RecorderError::ArchiveWriteFailure(
                        std::io::Error::other(join.to_string()).into(),
                    ));
                }
                Err(_) => {
                    return Err(RecorderError::ArchiveWriteFailure(
                        std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "archive flush timed out",
                        )
                        .into(),
                    ));
                }
            }
        }

        let sdr_health_stale = self.owner.sdr_configured
            && self
                .owner
                .sdr
                .producing(
                    self.owner.channel.ssrc,
                    monotonic_now()?,
                    self.owner.sdr_stale,
                )
                .is_none();
        self.owner.update_status(|s| {
            s.last_flush_utc = Some(flushed_utc);
            s.completeness_percent = completeness;
            s.anchor_source = snap.map(|a| a.source);
            s.anchor_established_at = snap.map(|a| a.established_at);
            s.sdr_health_stale = sdr_health_stale;
        });

        Ok(())
    }

    /// The recorder-offline discontinuity between this session and the most
    /// recent archive of a previous one, from the archive-to-archive
    /// timestamp difference.
    fn offline_annotation(&self, snap: &Option<TimeSnap>, rtp_start: u32) -> Option<Gap> {
        let snap = snap.as_ref()?;
        let latest = latest_archive_utc(&self.owner.archive_dir)?;
        let prev_end = latest + TimeDelta::seconds(60);
        let this_start = snap.sample_utc(rtp_start, self.owner.channel.sample_rate);

        let stoppage = (this_start - prev_end).num_milliseconds();
        if stoppage <= 0 {
            return None;
        }
        let samples = (stoppage as f64 / 1_000.0 * self.owner.channel.sample_rate as f64)
            .round()
            .min(u32::MAX as f64) as u32;

        info!(
            "Channel '{}': recorder was offline for {:.1} s ({samples} samples)",
            self.owner.channel.id,
            stoppage as f64 / 1_000.0
        );
        Some(Gap {
            rtp_index: rtp_start.wrapping_sub(samples),
            len: samples,
            category: GapCategory::RecorderOffline,
        })
    }

    /// Graceful drain: complete the resequencer, pad the open minute and
    /// flush it marked recorder-offline.
    async fn drain(&mut self) -> RecorderResult<()> {
        self.set_state(ChannelState::Draining);

        let chunks = self.resequencer.flush();
        self.consume(chunks).await?;

        if let Some(minute) = self.accumulator.finalize() {
            self.flush_minute(minute).await?;
        }

        self.set_state(ChannelState::Stopped);
        Ok(())
    }
}

fn round_to_minute(utc: DateTime<Utc>) -> DateTime<Utc> {
    let secs = utc.timestamp() as f64 + utc.timestamp_subsec_nanos() as f64 / 1e9;
    let minute = (secs / 60.0).round() as i64 * 60;
    Utc.timestamp_opt(minute, 0).single().unwrap_or(utc)
}

/// UTC of the newest archive in `dir`, from its file name.
fn latest_archive_utc(dir: &std::path::Path) -> Option<DateTime<Utc>> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut latest: Option<String> = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with("_iq.giq") && latest.as_ref().is_none_or(|l| &name > l) {
            latest = Some(name);
        }
    }
    parse_archive_utc(&latest?)
}

fn parse_archive_utc(file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name.split('_').next()?;
    let naive =
        chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%SZ").ok()?;
    Some(naive.and_utc())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn archive_names_parse_back_to_utc() {
        let utc = parse_archive_utc("20250801T143700Z_10000000_iq.giq").expect("parse");
        assert_eq!(
            Utc.with_ymd_and_hms(2025, 8, 1, 14, 37, 0).single().expect("ts"),
            utc
        );
        assert!(parse_archive_utc("not-an-archive.txt").is_none());
    }

    #[test]
    fn round_to_minute_snaps_both_ways() {
        let base = Utc.with_ymd_and_hms(2025, 8, 1, 14, 37, 0).single().expect("ts");
        assert_eq!(base, round_to_minute(base + TimeDelta::seconds(12)));
        assert_eq!(base, round_to_minute(base - TimeDelta::seconds(25)));
        assert_eq!(
            base + TimeDelta::minutes(1),
            round_to_minute(base + TimeDelta::seconds(42))
        );
    }

    #[test]
    fn stale_sdr_heartbeat_reads_as_unknown() {
        let sdr = SdrHealth::default();
        let stale = Duration::from_secs(15);
        assert_eq!(None, sdr.producing(1, Duration::from_secs(100), stale));

        sdr.note(&[1], true, Duration::from_secs(100));
        assert_eq!(Some(true), sdr.producing(1, Duration::from_secs(110), stale));
        assert_eq!(None, sdr.producing(1, Duration::from_secs(200), stale));

        sdr.note(&[1], false, Duration::from_secs(210));
        assert_eq!(Some(false), sdr.producing(1, Duration::from_secs(212), stale));
    }

    #[test]
    fn sdr_health_is_tracked_per_ssrc() {
        let sdr = SdrHealth::default();
        let stale = Duration::from_secs(15);
        let now = Duration::from_secs(100);

        // One daemon, two channels in different states.
        sdr.note(&[1, 2], true, now);
        sdr.note(&[2], false, now + Duration::from_secs(1));

        let at = now + Duration::from_secs(2);
        assert_eq!(Some(true), sdr.producing(1, at, stale));
        assert_eq!(Some(false), sdr.producing(2, at, stale));
        // An SSRC the daemon never reported stays unknown.
        assert_eq!(None, sdr.producing(3, at, stale));
    }

    #[test]
    fn restart_gap_is_annotated_recorder_offline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sr = 200u32;
        // The previous session's last archive covered 14:35:00..14:36:00;
        // the new session's first minute starts 80 s later at 14:37:20.
        std::fs::write(
            dir.path().join("20250801T143500Z_10000000_iq.giq"),
            b"x",
        )
        .expect("write");

        let params = ChannelParams {
            channel: ChannelConfig {
                id: "wwv10".to_owned(),
                ssrc: 1,
                centre_hz: 10e6,
                sample_rate: sr,
                stations: vec![crate::station::Station::Wwv],
            },
            archive_dir: dir.path().to_path_buf(),
            startup_samples: 0,
            snr_floor_db: 6.0,
            receive_grace: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(30),
            sdr_configured: false,
            sdr_stale: Duration::from_secs(15),
            registry: Arc::new(dashmap::DashMap::new()),
            ntp: Arc::new(NtpStatusCache::new()),
            sdr: Arc::new(SdrHealth::default()),
        };
        let session = CaptureSession::new(&params);

        let anchor_utc = Utc
            .with_ymd_and_hms(2025, 8, 1, 14, 37, 20)
            .single()
            .expect("ts");
        let snap = Some(TimeSnap {
            rtp_index: 5_000,
            utc: anchor_utc,
            source: AnchorSource::ToneLocked,
            station: Some(crate::station::Station::Wwv),
            confidence: 0.9,
            established_at: anchor_utc,
        });

        let gap = session.offline_annotation(&snap, 5_000).expect("gap");
        assert_eq!(GapCategory::RecorderOffline, gap.category);
        // 80 s of stoppage at 200 S/s.
        assert_eq!(80 * sr, gap.len);
        assert_eq!(5_000u32.wrapping_sub(80 * sr), gap.rtp_index);

        // No previous archive, no annotation.
        let empty = tempfile::tempdir().expect("tempdir");
        let mut params2 = params;
        params2.archive_dir = empty.path().to_path_buf();
        let session2 = CaptureSession::new(&params2);
        assert!(session2.offline_annotation(&snap, 5_000).is_none());
    }

    #[test]
    fn latest_archive_is_found_by_name_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in [
            "20250801T143500Z_10000000_iq.giq",
            "20250801T143700Z_10000000_iq.giq",
            "20250801T143600Z_10000000_iq.giq",
            "analytics-state.json",
        ] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }
        let latest = latest_archive_utc(dir.path()).expect("latest");
        assert_eq!(
            Utc.with_ymd_and_hms(2025, 8, 1, 14, 37, 0).single().expect("ts"),
            latest
        );
    }
}
