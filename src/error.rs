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

use miette::Diagnostic;
use rtp_rs::RtpReaderError;
use std::{fmt::Display, io};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing_subscriber::{filter::ParseError, util::TryInitError};

/// Process exit codes, see the operator documentation.
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_IO: i32 = 3;
pub const EXIT_SUBSYSTEM: i32 = 4;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug, Diagnostic)]
#[error("system clock error: {0}")]
pub struct SystemClockError(pub String);

pub type SystemClockResult<T> = Result<T, SystemClockError>;

#[derive(Error, Debug, Diagnostic)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("not an IQ archive (bad magic)")]
    BadMagic,
    #[error("archive header error: {0}")]
    HeaderError(#[from] serde_json::Error),
    #[error("archive sample count mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[derive(Error, Debug, Diagnostic)]
pub enum RecorderError {
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("socket failure: {0}")]
    SocketFailure(String),
    #[error("received malformed RTP data: {0:?}")]
    MalformedPacket(#[from] WrappedRtpError),
    #[error("SDR daemon is unhealthy: {0}")]
    SdrUnhealthy(String),
    #[error("time anchor is stale (age {age_s:.0} s)")]
    AnchorStale { age_s: f64 },
    #[error("decimator underflow: {0}")]
    DecimationUnderflow(String),
    #[error("archive write failure: {0}")]
    ArchiveWriteFailure(ArchiveError),
    #[error("archive read failure: {0}")]
    ArchiveReadFailure(ArchiveError),
    #[error("runtime state is corrupt: {0}")]
    StateCorrupt(String),
    #[error("shutdown requested")]
    ShutdownRequested,
    #[error("system clock error: {0}")]
    SystemClockError(#[from] SystemClockError),
    #[error("JSON serde error: {0}")]
    JsonSerdeError(#[from] serde_json::Error),
    #[error("tracing init error: {0}")]
    TryInitError(#[from] TryInitError),
    #[error("tracing config parse error: {0}")]
    ParseError(#[from] ParseError),
    #[error("internal channel closed")]
    ChannelClosed(#[from] oneshot::error::RecvError),
}

impl RecorderError {
    /// The exit code a binary should terminate with if this error reaches
    /// its top level.
    pub fn exit_code(&self) -> i32 {
        match self {
            RecorderError::ConfigError(_) => EXIT_CONFIG,
            RecorderError::IoError(_)
            | RecorderError::SocketFailure(_)
            | RecorderError::ArchiveWriteFailure(_)
            | RecorderError::ArchiveReadFailure(_) => EXIT_IO,
            _ => EXIT_SUBSYSTEM,
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub struct WrappedRtpError(pub RtpReaderError);

impl Display for WrappedRtpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

pub type RecorderResult<T> = Result<T, RecorderError>;
