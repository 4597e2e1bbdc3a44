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

use crate::{
    error::{ConfigError, ConfigResult},
    station::Station,
};
use clap::Parser;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{info, instrument};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "GRAPE_RECORDER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppConfig {
    pub name: String,
    pub instance: InstanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "grape-recorder".to_owned(),
            instance: InstanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: gethostname().to_string_lossy().to_string(),
        }
    }
}

/// One logical tap on one frequency. The SSRC ties the channel to the RTP
/// stream emitted by the SDR daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChannelConfig {
    pub id: String,
    pub ssrc: u32,
    pub centre_hz: f64,
    pub sample_rate: u32,
    pub stations: Vec<Station>,
}

impl ChannelConfig {
    pub fn samples_per_minute(&self) -> usize {
        self.sample_rate as usize * 60
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MulticastConfig {
    pub group: IpAddr,
    pub port: u16,
    /// RTP payload types accepted on this group. Nothing is inferred from
    /// traffic; packets with other payload types are counted and dropped.
    pub payload_types: Vec<u8>,
    #[serde(default = "default_interface_ip")]
    pub interface_ip: IpAddr,
}

fn default_interface_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SdrStatusConfig {
    pub status_group: IpAddr,
    pub status_port: u16,
    #[serde(default = "default_sdr_stale")]
    pub stale_seconds: u32,
}

fn default_sdr_stale() -> u32 {
    15
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DataConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimingConfig {
    #[serde(default = "default_startup_buffer")]
    pub startup_buffer_s: u32,
    #[serde(default = "default_snr_floor")]
    pub detection_snr_floor_db: f32,
    #[serde(default = "default_anchor_half_life")]
    pub anchor_half_life_s: u32,
}

fn default_startup_buffer() -> u32 {
    120
}

fn default_snr_floor() -> f32 {
    6.0
}

fn default_anchor_half_life() -> u32 {
    900
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_buffer_s: default_startup_buffer(),
            detection_snr_floor_db: default_snr_floor(),
            anchor_half_life_s: default_anchor_half_life(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DecimationConfig {
    #[serde(default = "default_output_rate")]
    pub output_rate: u32,
}

fn default_output_rate() -> u32 {
    10
}

impl Default for DecimationConfig {
    fn default() -> Self {
        Self {
            output_rate: default_output_rate(),
        }
    }
}

/// Relative weights of the four discrimination evidences for one class of
/// minute.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EvidenceWeights {
    pub markers: f32,
    pub ticks: f32,
    pub bcd: f32,
    pub station_id: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiscriminationConfig {
    #[serde(default = "default_window")]
    pub window_s: u32,
    #[serde(default = "default_weights_standard")]
    pub weights_standard: EvidenceWeights,
    #[serde(default = "default_weights_bcd")]
    pub weights_bcd_minutes: EvidenceWeights,
    #[serde(default = "default_weights_id")]
    pub weights_id_minutes: EvidenceWeights,
    #[serde(default = "default_bcd_minutes")]
    pub bcd_favoured_minutes: Vec<u32>,
}

fn default_window() -> u32 {
    60
}

fn default_weights_standard() -> EvidenceWeights {
    EvidenceWeights {
        markers: 10.0,
        ticks: 5.0,
        bcd: 5.0,
        station_id: 0.0,
    }
}

fn default_weights_bcd() -> EvidenceWeights {
    EvidenceWeights {
        markers: 2.0,
        ticks: 5.0,
        bcd: 10.0,
        station_id: 0.0,
    }
}

fn default_weights_id() -> EvidenceWeights {
    EvidenceWeights {
        markers: 2.0,
        ticks: 2.0,
        bcd: 2.0,
        station_id: 10.0,
    }
}

fn default_bcd_minutes() -> Vec<u32> {
    vec![0, 8, 9, 10, 29, 30]
}

impl Default for DiscriminationConfig {
    fn default() -> Self {
        Self {
            window_s: default_window(),
            weights_standard: default_weights_standard(),
            weights_bcd_minutes: default_weights_bcd(),
            weights_id_minutes: default_weights_id(),
            bcd_favoured_minutes: default_bcd_minutes(),
        }
    }
}

/// Receiver site coordinates, used to predict propagation delay for peak
/// labelling.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StationSiteConfig {
    pub receiver_lat: f64,
    pub receiver_lon: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts_per_hour: u32,
    #[serde(default = "default_health_interval")]
    pub health_interval_s: u32,
    #[serde(default = "default_grace", with = "serde_millis")]
    pub receive_grace: Duration,
    #[serde(default = "default_flush_timeout", with = "serde_millis")]
    pub flush_timeout: Duration,
}

fn default_max_restarts() -> u32 {
    6
}

fn default_health_interval() -> u32 {
    30
}

fn default_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_flush_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts_per_hour: default_max_restarts(),
            health_interval_s: default_health_interval(),
            receive_grace: default_grace(),
            flush_timeout: default_flush_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "AppConfig::default")]
    pub app: AppConfig,
    pub multicast: MulticastConfig,
    #[serde(default)]
    pub sdr: Option<SdrStatusConfig>,
    pub data: DataConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub decimation: DecimationConfig,
    #[serde(default)]
    pub discrimination: DiscriminationConfig,
    pub station: StationSiteConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    #[instrument]
    pub async fn load() -> ConfigResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let config = Config::load_from_file(args.config.as_deref()).await?;
        config.validate()?;

        Ok(config)
    }

    #[instrument]
    async fn load_from_file(path: Option<&Path>) -> ConfigResult<Config> {
        let path = path.unwrap_or_else(|| {
            Path::new(if cfg!(debug_assertions) {
                "./config-dev.yaml"
            } else {
                "/etc/grape-recorder/config.yaml"
            })
        });

        let content = fs::read_to_string(&path).await?;
        let config = serde_yaml::from_str(&content)?;
        info!("Config loaded from {}", path.to_string_lossy());
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.channels.is_empty() {
            return Err(ConfigError::Invalid("no channels configured".to_owned()));
        }

        for (i, a) in self.channels.iter().enumerate() {
            if a.sample_rate == 0 {
                return Err(ConfigError::Invalid(format!(
                    "channel '{}': sample rate must not be zero",
                    a.id
                )));
            }
            if a.sample_rate % self.decimation.output_rate != 0 {
                return Err(ConfigError::Invalid(format!(
                    "channel '{}': sample rate {} is not an integer multiple of the decimation output rate {}",
                    a.id, a.sample_rate, self.decimation.output_rate
                )));
            }
            for b in &self.channels[i + 1..] {
                if a.ssrc == b.ssrc {
                    return Err(ConfigError::Invalid(format!(
                        "channels '{}' and '{}' share SSRC {:#010x}",
                        a.id, b.id, a.ssrc
                    )));
                }
                if a.id == b.id {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate channel id '{}'",
                        a.id
                    )));
                }
            }
        }

        if self.multicast.payload_types.is_empty() {
            return Err(ConfigError::Invalid(
                "multicast.payloadTypes must not be empty".to_owned(),
            ));
        }

        let lat = self.station.receiver_lat;
        let lon = self.station.receiver_lon;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(ConfigError::Invalid(format!(
                "receiver coordinates out of range: {lat}, {lon}"
            )));
        }

        Ok(())
    }

    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.app.name, self.app.instance.name)
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    const MINIMAL: &str = r#"
multicast:
  group: 239.1.2.3
  port: 5004
  payloadTypes: [97]
data:
  root: /tmp/grape
station:
  receiverLat: 41.9
  receiverLon: -93.6
channels:
  - id: wwv10
    ssrc: 0xdeadbeef
    centreHz: 10000000.0
    sampleRate: 16000
    stations: [WWV, WWVH]
"#;

    #[test]
    fn minimal_config_parses_and_validates() {
        let config = parse(MINIMAL).expect("should parse");
        config.validate().expect("should validate");
        assert_eq!(config.timing.startup_buffer_s, 120);
        assert_eq!(config.decimation.output_rate, 10);
        assert_eq!(config.discrimination.window_s, 60);
        assert_eq!(config.channels[0].samples_per_minute(), 960_000);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let yaml = format!("{MINIMAL}\nuploader:\n  url: http://example.com\n");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn duplicate_ssrc_is_rejected() {
        let yaml = MINIMAL.replace(
            "channels:",
            r#"channels:
  - id: other
    ssrc: 0xdeadbeef
    centreHz: 5000000.0
    sampleRate: 16000
    stations: [WWV]
"#,
        );
        let config = parse(&yaml).expect("should parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn indivisible_sample_rate_is_rejected() {
        let yaml = MINIMAL.replace("sampleRate: 16000", "sampleRate: 16001");
        let config = parse(&yaml).expect("should parse");
        assert!(config.validate().is_err());
    }
}
