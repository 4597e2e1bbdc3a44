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

//! Continuous HF capture and analysis of time-standard stations (WWV,
//! WWVH, CHU) for the GRAPE ionospheric research network.
//!
//! Two engines share nothing but the archive directory: the capture engine
//! ingests multicast RTP I/Q from an SDR daemon into immutable one-minute
//! archives with RTP-referenced timing, and the analytics engine derives
//! UTC anchors, decimated products and per-minute station discrimination
//! from those archives.

pub mod analytics;
pub mod archive;
pub mod capture;
pub mod config;
pub mod dsp;
pub mod error;
pub mod socket;
pub mod station;
pub mod supervisor;
pub mod telemetry;
pub mod timebase;
