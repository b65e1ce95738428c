//! Audio RTP packetization (G.711, RFC 3551).

use super::rtp::{RtpHeader, RTP_HEADER_SIZE};

/// Samples per packet: 20 ms at 8 kHz.
pub const SAMPLES_PER_PACKET: usize = 160;

/// Packetizer for G.711 byte streams (PCMU/PCMA: one byte per sample,
/// timestamp advances by one per sample).
#[derive(Debug, Default)]
pub struct AudioPacketizer {
    /// Set on the first packet after a gap (start of a talkspurt,
    /// RFC 3551 §4.1).
    talkspurt: bool,
}

impl AudioPacketizer {
    pub fn new() -> Self {
        Self { talkspurt: true }
    }

    /// Split a sample buffer into RTP packets of [`SAMPLES_PER_PACKET`].
    ///
    /// The header's timestamp is advanced by the chunk size after each
    /// packet, so consecutive calls produce a continuous sample clock.
    pub fn packetize(&mut self, header: &mut RtpHeader, samples: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut offset = 0;

        while offset < samples.len() {
            let end = (offset + SAMPLES_PER_PACKET).min(samples.len());
            let chunk = &samples[offset..end];

            let hdr = header.write(self.talkspurt);
            self.talkspurt = false;

            let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(chunk);
            packets.push(packet);

            let ts = header.timestamp().wrapping_add(chunk.len() as u32);
            header.set_timestamp(ts);
            offset = end;
        }

        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_160_sample_packets() {
        let mut p = AudioPacketizer::new();
        let mut h = RtpHeader::new(0, 0x1111, 0, 1000);
        let samples = vec![0x55u8; 400];
        let packets = p.packetize(&mut h, &samples);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 12 + 160);
        assert_eq!(packets[2].len(), 12 + 80);
    }

    #[test]
    fn timestamp_advances_per_sample() {
        let mut p = AudioPacketizer::new();
        let mut h = RtpHeader::new(0, 0x1111, 0, 1000);
        let packets = p.packetize(&mut h, &[0u8; 320]);
        let ts: Vec<u32> = packets
            .iter()
            .map(|pk| u32::from_be_bytes([pk[4], pk[5], pk[6], pk[7]]))
            .collect();
        assert_eq!(ts, vec![1000, 1160]);
        assert_eq!(h.timestamp(), 1320);
    }

    #[test]
    fn marker_only_on_first_packet() {
        let mut p = AudioPacketizer::new();
        let mut h = RtpHeader::new(0, 0x1111, 0, 0);
        let packets = p.packetize(&mut h, &[0u8; 480]);
        let markers: Vec<bool> = packets.iter().map(|pk| pk[1] & 0x80 != 0).collect();
        assert_eq!(markers, vec![true, false, false]);

        // Subsequent buffers are part of the same talkspurt.
        let more = p.packetize(&mut h, &[0u8; 160]);
        assert_eq!(more[0][1] & 0x80, 0);
    }
}
