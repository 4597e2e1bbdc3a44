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

use num_complex::Complex;
use rtp_rs::RtpReader;
use std::time::Duration;

/// One validated RTP datagram carrying interleaved signed 16-bit big-endian
/// I/Q pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct IqPacket {
    pub ssrc: u32,
    pub rtp_timestamp: u32,
    pub sequence: u16,
    pub payload_type: u8,
    pub samples: Vec<Complex<f32>>,
    /// Monotonic receive instant, used for reorder-window aging only.
    pub received_at: Duration,
}

/// Per-packet faults are counted, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFault {
    Malformed,
    PayloadTypeRejected(u8),
    OddPayloadLength(usize),
}

const BYTES_PER_SAMPLE: usize = 4;
const I16_SCALE: f32 = 1.0 / 32_768.0;

/// Validates one datagram and decodes its payload. The payload type must be
/// on the configured acceptlist; nothing is inferred from traffic.
pub fn parse_packet(
    data: &[u8],
    payload_types: &[u8],
    received_at: Duration,
) -> Result<IqPacket, PacketFault> {
    let rtp = RtpReader::new(data).map_err(|_| PacketFault::Malformed)?;

    let payload_type = rtp.payload_type();
    if !payload_types.contains(&payload_type) {
        return Err(PacketFault::PayloadTypeRejected(payload_type));
    }

    let payload = rtp.payload();
    if payload.is_empty() || payload.len() % BYTES_PER_SAMPLE != 0 {
        return Err(PacketFault::OddPayloadLength(payload.len()));
    }

    let samples = payload
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| {
            let re = i16::from_be_bytes([chunk[0], chunk[1]]) as f32 * I16_SCALE;
            let im = i16::from_be_bytes([chunk[2], chunk[3]]) as f32 * I16_SCALE;
            Complex::new(re, im)
        })
        .collect();

    Ok(IqPacket {
        ssrc: rtp.ssrc(),
        rtp_timestamp: rtp.timestamp(),
        sequence: rtp.sequence_number().into(),
        payload_type,
        samples,
        received_at,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn rtp_datagram(seq: u16, ts: u32, ssrc: u32, pt: u8, samples: &[(i16, i16)]) -> Vec<u8> {
        let mut data = vec![0u8; 12 + samples.len() * 4];
        data[0] = 0x80;
        data[1] = pt & 0x7f;
        data[2..4].copy_from_slice(&seq.to_be_bytes());
        data[4..8].copy_from_slice(&ts.to_be_bytes());
        data[8..12].copy_from_slice(&ssrc.to_be_bytes());
        for (i, (re, im)) in samples.iter().enumerate() {
            data[12 + i * 4..14 + i * 4].copy_from_slice(&re.to_be_bytes());
            data[14 + i * 4..16 + i * 4].copy_from_slice(&im.to_be_bytes());
        }
        data
    }

    #[test]
    fn decodes_big_endian_pairs() {
        let data = rtp_datagram(7, 1_000, 42, 97, &[(16_384, -16_384), (0, 32_767)]);
        let pkt = parse_packet(&data, &[97], Duration::ZERO).expect("parse");
        assert_eq!(42, pkt.ssrc);
        assert_eq!(1_000, pkt.rtp_timestamp);
        assert_eq!(7, pkt.sequence);
        assert_eq!(2, pkt.samples.len());
        assert!((pkt.samples[0].re - 0.5).abs() < 1e-6);
        assert!((pkt.samples[0].im + 0.5).abs() < 1e-6);
    }

    #[test]
    fn rejects_unlisted_payload_type() {
        let data = rtp_datagram(7, 1_000, 42, 96, &[(0, 0)]);
        assert_eq!(
            Err(PacketFault::PayloadTypeRejected(96)),
            parse_packet(&data, &[97], Duration::ZERO)
        );
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(
            Err(PacketFault::Malformed),
            parse_packet(&[0x80, 97, 0], &[97], Duration::ZERO)
        );
    }

    #[test]
    fn rejects_ragged_payload() {
        let mut data = rtp_datagram(7, 1_000, 42, 97, &[(0, 0)]);
        data.push(0xff);
        assert_eq!(
            Err(PacketFault::OddPayloadLength(5)),
            parse_packet(&data, &[97], Duration::ZERO)
        );
    }
}
