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

//! Time-standard station identities and their on-air signal parameters.
//! All timing here is transmitter-side nominal; the receive chain measures
//! deviations from it, it never corrects them.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The 100 Hz subcarrier that carries the BCD time code on WWV and WWVH.
pub const BCD_SUBCARRIER_HZ: f64 = 100.0;

/// Station identification tone, present only in specific minutes.
pub const STATION_ID_TONE_HZ: f64 = 440.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Station {
    Wwv,
    Wwvh,
    Chu,
}

impl Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Station::Wwv => write!(f, "WWV"),
            Station::Wwvh => write!(f, "WWVH"),
            Station::Chu => write!(f, "CHU"),
        }
    }
}

impl Station {
    /// The per-station marker tone used both for the second-zero minute
    /// marker and for per-minute station power measurements.
    pub fn marker_tone_hz(&self) -> f64 {
        match self {
            Station::Wwv | Station::Chu => 1_000.0,
            Station::Wwvh => 1_200.0,
        }
    }

    /// Nominal duration of the minute marker burst.
    pub fn marker_duration_s(&self) -> f64 {
        match self {
            Station::Wwv | Station::Wwvh => 0.8,
            Station::Chu => 0.5,
        }
    }

    /// Tolerance band on the detected marker duration. Detections outside
    /// the band are rejected as anchor candidates.
    pub fn marker_duration_band_s(&self) -> (f64, f64) {
        let nominal = self.marker_duration_s();
        (nominal * 0.75, nominal * 1.25)
    }

    /// Duration of the once-per-second tick.
    pub fn tick_duration_s(&self) -> f64 {
        match self {
            Station::Wwv | Station::Wwvh => 0.005,
            Station::Chu => 0.3,
        }
    }

    /// The minute of the hour in which the station transmits its 440 Hz
    /// identification tone, if it does.
    pub fn station_id_minute(&self) -> Option<u32> {
        match self {
            Station::Wwv => Some(2),
            Station::Wwvh => Some(1),
            Station::Chu => None,
        }
    }

    /// Whether the station modulates the 100 Hz BCD time code.
    pub fn has_bcd(&self) -> bool {
        matches!(self, Station::Wwv | Station::Wwvh)
    }

    /// Transmitter coordinates (degrees): Fort Collins CO, Kauai HI,
    /// Ottawa ON.
    pub fn location(&self) -> (f64, f64) {
        match self {
            Station::Wwv => (40.6778, -105.0461),
            Station::Wwvh => (21.9881, -159.7631),
            Station::Chu => (45.2947, -75.7577),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn marker_tones_distinguish_the_co_channel_pair() {
        assert_eq!(1_000.0, Station::Wwv.marker_tone_hz());
        assert_eq!(1_200.0, Station::Wwvh.marker_tone_hz());
    }

    #[test]
    fn id_minutes_are_disjoint() {
        assert_eq!(Some(2), Station::Wwv.station_id_minute());
        assert_eq!(Some(1), Station::Wwvh.station_id_minute());
        assert_eq!(None, Station::Chu.station_id_minute());
    }

    #[test]
    fn config_names_round_trip() {
        let s: Station = serde_yaml::from_str("WWVH").expect("should parse");
        assert_eq!(Station::Wwvh, s);
        assert_eq!(
            "WWV",
            serde_yaml::to_string(&Station::Wwv)
                .expect("should serialize")
                .trim()
        );
    }
}
