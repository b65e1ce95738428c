use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Size of the fixed RTP header (no CSRCs, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA: u64 = 2_208_988_800;

/// Generic RTP fixed header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// One instance lives on each track of each session. It manages:
/// - **Sequence number**: 16-bit, random start, wrapping — incremented on
///   every packet.
/// - **Timestamp**: 32-bit, random start; the owning channel sets it per
///   access unit before packetizing.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    /// Create header state with explicit SSRC, sequence, and timestamp.
    pub fn new(pt: u8, ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            pt,
            ssrc,
            sequence,
            timestamp,
        }
    }

    /// Create header state with random SSRC and random initial sequence
    /// number and timestamp, per RFC 3550 §5.1.
    pub fn with_random_state(pt: u8) -> Self {
        let mut rng = rand::rng();
        let ssrc = rng.random::<u32>();
        tracing::debug!(pt, ssrc = format_args!("{:#010X}", ssrc), "RTP track state created");
        Self {
            pt,
            ssrc,
            sequence: rng.random::<u16>(),
            timestamp: rng.random::<u32>(),
        }
    }

    /// Next sequence number (the one the next [`write`](Self::write) uses).
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Current RTP timestamp.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Set the timestamp for the packets of the next access unit.
    pub fn set_timestamp(&mut self, ts: u32) {
        self.timestamp = ts;
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit (RFC 3550 §5.1) is set on the last RTP packet of an
    /// access unit (RFC 6184 §5.1).
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_SIZE] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | self.pt;

        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// Decoded fields of an RTP fixed header, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeaderFields {
    pub version: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeaderFields {
    /// Parse the 12-byte fixed header from the front of `packet`.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: packet[0] >> 6,
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7F,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        })
    }
}

/// RTCP packet type codes (RFC 3550 §12.1).
const RTCP_PT_SR: u8 = 200;
const RTCP_PT_SDES: u8 = 202;
const RTCP_PT_BYE: u8 = 203;

/// Build an RTCP Sender Report with no report blocks (RFC 3550 §6.4.1).
pub fn build_sender_report(
    ssrc: u32,
    ntp: (u32, u32),
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(28);
    buf.push(2 << 6); // V=2, P=0, RC=0
    buf.push(RTCP_PT_SR);
    buf.extend_from_slice(&6u16.to_be_bytes()); // length: 6 words after header
    buf.extend_from_slice(&ssrc.to_be_bytes());
    buf.extend_from_slice(&ntp.0.to_be_bytes());
    buf.extend_from_slice(&ntp.1.to_be_bytes());
    buf.extend_from_slice(&rtp_timestamp.to_be_bytes());
    buf.extend_from_slice(&packet_count.to_be_bytes());
    buf.extend_from_slice(&octet_count.to_be_bytes());
    buf
}

/// Build an RTCP SDES packet with a single CNAME chunk (RFC 3550 §6.5).
pub fn build_sdes(ssrc: u32, cname: &str) -> Vec<u8> {
    let cname = &cname.as_bytes()[..cname.len().min(255)];

    // Chunk: SSRC, item type 1 (CNAME), length, value, null terminator,
    // padded to a 32-bit boundary.
    let mut chunk = Vec::with_capacity(4 + 2 + cname.len() + 4);
    chunk.extend_from_slice(&ssrc.to_be_bytes());
    chunk.push(1);
    chunk.push(cname.len() as u8);
    chunk.extend_from_slice(cname);
    chunk.push(0);
    while chunk.len() % 4 != 0 {
        chunk.push(0);
    }

    let mut buf = Vec::with_capacity(4 + chunk.len());
    buf.push((2 << 6) | 1); // V=2, P=0, SC=1
    buf.push(RTCP_PT_SDES);
    buf.extend_from_slice(&((chunk.len() / 4) as u16).to_be_bytes());
    buf.extend_from_slice(&chunk);
    buf
}

/// Build an RTCP BYE packet (RFC 3550 §6.6).
pub fn build_bye(ssrcs: &[u32], reason: Option<&str>) -> Vec<u8> {
    let mut body: Vec<u8> = ssrcs.iter().flat_map(|s| s.to_be_bytes()).collect();

    if let Some(reason) = reason {
        let reason = &reason.as_bytes()[..reason.len().min(255)];
        body.push(reason.len() as u8);
        body.extend_from_slice(reason);
        while body.len() % 4 != 0 {
            body.push(0);
        }
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.push((2 << 6) | (ssrcs.len() as u8 & 0x1F));
    buf.push(RTCP_PT_BYE);
    buf.extend_from_slice(&((body.len() / 4) as u16).to_be_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Current wall clock as a 64-bit NTP timestamp: (seconds since 1900,
/// 2^-32 fractional seconds).
pub fn ntp_timestamp() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let sec = (now.as_secs() + NTP_UNIX_DELTA) as u32;
    let frac = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (sec, frac as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 0, 0)
    }

    #[test]
    fn version_is_2() {
        let mut h = make_header();
        let buf = h.write(false);
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        let no_marker = h.write(false);
        assert_eq!(no_marker[1] & 0x80, 0);

        let with_marker = h.write(true);
        assert_eq!(with_marker[1] & 0x80, 0x80);
    }

    #[test]
    fn pack_unpack_round_trip() {
        let mut h = RtpHeader::new(96, 0x12345678, 4660, 0);
        h.set_timestamp(0xCAFEBABE);
        let buf = h.write(true);
        let fields = RtpHeaderFields::parse(&buf).unwrap();
        assert_eq!(
            fields,
            RtpHeaderFields {
                version: 2,
                marker: true,
                payload_type: 96,
                sequence: 4660,
                timestamp: 0xCAFEBABE,
                ssrc: 0x12345678,
            }
        );
    }

    #[test]
    fn sequence_increments_and_wraps() {
        let mut h = RtpHeader::new(96, 1, u16::MAX, 0);
        let buf = h.write(false);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);

        let buf = h.write(false);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 0);
        assert_eq!(h.sequence(), 1);
    }

    #[test]
    fn timestamp_wraps_at_u32() {
        let mut h = make_header();
        h.set_timestamp(u32::MAX);
        let buf = h.write(false);
        let fields = RtpHeaderFields::parse(&buf).unwrap();
        assert_eq!(fields.timestamp, u32::MAX);
        h.set_timestamp(u32::MAX.wrapping_add(3000));
        assert_eq!(h.timestamp(), 2999);
    }

    #[test]
    fn random_state_differs() {
        let h1 = RtpHeader::with_random_state(96);
        let h2 = RtpHeader::with_random_state(96);
        assert_ne!(h1.ssrc, h2.ssrc);
    }

    #[test]
    fn sender_report_layout() {
        let sr = build_sender_report(0x11223344, (100, 200), 90_000, 42, 9000);
        assert_eq!(sr.len(), 28);
        assert_eq!(sr[0] >> 6, 2);
        assert_eq!(sr[1], 200);
        assert_eq!(u16::from_be_bytes([sr[2], sr[3]]), 6);
        assert_eq!(u32::from_be_bytes([sr[4], sr[5], sr[6], sr[7]]), 0x11223344);
        assert_eq!(u32::from_be_bytes([sr[20], sr[21], sr[22], sr[23]]), 42);
        assert_eq!(u32::from_be_bytes([sr[24], sr[25], sr[26], sr[27]]), 9000);
    }

    #[test]
    fn sdes_is_word_aligned() {
        for name in ["a", "abcd", "camrtsp@host"] {
            let sdes = build_sdes(0x01020304, name);
            assert_eq!(sdes.len() % 4, 0, "cname {:?}", name);
            assert_eq!(sdes[1], 202);
        }
    }

    #[test]
    fn bye_with_reason_is_word_aligned() {
        let bye = build_bye(&[0xAABBCCDD], Some("teardown"));
        assert_eq!(bye.len() % 4, 0);
        assert_eq!(bye[1], 203);
        assert_eq!(bye[0] & 0x1F, 1);
    }

    #[test]
    fn ntp_timestamp_is_after_2020() {
        let (sec, _) = ntp_timestamp();
        // 2020-01-01 in NTP seconds.
        assert!(sec > 3_786_825_600);
    }
}
