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

//! Great-circle propagation delay prediction. The closer transmitter's
//! correlation peak arrives first; nothing here assumes WWV leads.

use crate::station::Station;

const EARTH_RADIUS_KM: f64 = 6_371.0;
const SPEED_OF_LIGHT_KM_S: f64 = 299_792.458;

pub fn great_circle_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// First-hop propagation delay from a station to the receiver, free-space
/// speed of light over the great circle.
pub fn delay_ms(station: Station, receiver_lat: f64, receiver_lon: f64) -> f64 {
    let (lat, lon) = station.location();
    great_circle_km(lat, lon, receiver_lat, receiver_lon) / SPEED_OF_LIGHT_KM_S * 1_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakLabels {
    pub early: Station,
    pub late: Station,
}

/// Labels two stations by predicted arrival order. Symmetric: swapping the
/// arguments swaps nothing but the tuple positions.
pub fn label_peaks(a: (Station, f64), b: (Station, f64)) -> PeakLabels {
    if a.1 <= b.1 {
        PeakLabels {
            early: a.0,
            late: b.0,
        }
    } else {
        PeakLabels {
            early: b.0,
            late: a.0,
        }
    }
}

/// Expected delays for the co-channel pair at one receiver site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayPrediction {
    pub delay_to_wwv_ms: f64,
    pub delay_to_wwvh_ms: f64,
}

impl DelayPrediction {
    pub fn for_receiver(receiver_lat: f64, receiver_lon: f64) -> Self {
        Self {
            delay_to_wwv_ms: delay_ms(Station::Wwv, receiver_lat, receiver_lon),
            delay_to_wwvh_ms: delay_ms(Station::Wwvh, receiver_lat, receiver_lon),
        }
    }

    pub fn labels(&self) -> PeakLabels {
        label_peaks(
            (Station::Wwv, self.delay_to_wwv_ms),
            (Station::Wwvh, self.delay_to_wwvh_ms),
        )
    }

    /// |delay(WWVH) − delay(WWV)|, the expected correlation peak split.
    pub fn differential_ms(&self) -> f64 {
        (self.delay_to_wwvh_ms - self.delay_to_wwv_ms).abs()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_distance_fort_collins_to_kauai() {
        let (wwv_lat, wwv_lon) = Station::Wwv.location();
        let (wwvh_lat, wwvh_lon) = Station::Wwvh.location();
        let km = great_circle_km(wwv_lat, wwv_lon, wwvh_lat, wwvh_lon);
        assert!((km - 5_300.0).abs() < 200.0, "distance {km} km");
    }

    #[test]
    fn midwest_receiver_hears_wwv_first() {
        let prediction = DelayPrediction::for_receiver(41.9, -93.6);
        assert!(prediction.delay_to_wwv_ms < prediction.delay_to_wwvh_ms);
        let labels = prediction.labels();
        assert_eq!(Station::Wwv, labels.early);
        assert_eq!(Station::Wwvh, labels.late);
        // A midwest site is ~1000 km from Fort Collins, ~6300 km from Kauai.
        assert!(prediction.delay_to_wwv_ms > 2.0 && prediction.delay_to_wwv_ms < 5.0);
        assert!(prediction.delay_to_wwvh_ms > 18.0 && prediction.delay_to_wwvh_ms < 23.0);
    }

    #[test]
    fn pacific_receiver_hears_wwvh_first() {
        // Honolulu.
        let prediction = DelayPrediction::for_receiver(21.31, -157.86);
        assert_eq!(Station::Wwvh, prediction.labels().early);
    }

    #[test]
    fn labelling_is_symmetric_under_swap() {
        let a = (Station::Wwv, 4.2);
        let b = (Station::Wwvh, 20.9);
        assert_eq!(label_peaks(a, b), label_peaks(b, a));
    }
}
