//! Media-plane types: RTP packing, H.264 framing, audio packetization.

pub mod audio;
pub mod h264;
pub mod rtp;

use bytes::Bytes;

/// RTP payload type for H.264 (dynamic range, RFC 6184 convention).
pub const PAYLOAD_TYPE_H264: u8 = 96;
/// RTP payload type for G.711 μ-law (static, RFC 3551).
pub const PAYLOAD_TYPE_PCMU: u8 = 0;
/// RTP payload type for G.711 A-law (static, RFC 3551).
pub const PAYLOAD_TYPE_PCMA: u8 = 8;
/// RTP payload type for AAC (dynamic).
pub const PAYLOAD_TYPE_AAC: u8 = 97;

/// RTP clock rate for H.264 video (RFC 6184 §8.2.1: always 90 kHz).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Audio codecs a stream can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// G.711 μ-law, 8 kHz.
    Pcmu,
    /// G.711 A-law, 8 kHz.
    Pcma,
    /// AAC (mpeg4-generic). Advertised in SDP only; RFC 3640
    /// packetization is not implemented.
    Aac,
}

impl AudioCodec {
    pub fn payload_type(self) -> u8 {
        match self {
            AudioCodec::Pcmu => PAYLOAD_TYPE_PCMU,
            AudioCodec::Pcma => PAYLOAD_TYPE_PCMA,
            AudioCodec::Aac => PAYLOAD_TYPE_AAC,
        }
    }

    pub fn clock_rate(self) -> u32 {
        match self {
            AudioCodec::Pcmu | AudioCodec::Pcma => 8000,
            AudioCodec::Aac => 44100,
        }
    }

    pub fn sdp_name(self) -> &'static str {
        match self {
            AudioCodec::Pcmu => "PCMU",
            AudioCodec::Pcma => "PCMA",
            AudioCodec::Aac => "mpeg4-generic",
        }
    }
}

/// One decoded picture's worth of NAL units, as handed from the H.264
/// framer to the sessions.
///
/// Invariants:
/// - at most one VCL slice; non-VCL NALs (AUD, SEI, SPS, PPS) precede it;
/// - all RTP packets produced from one access unit share one timestamp;
/// - the marker bit is set only on the last packet of the last NAL.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// NAL units in decode order, raw bytes without start codes.
    pub nals: Vec<Bytes>,
    /// True when the slice NAL is type 5 (IDR).
    pub is_idr: bool,
    /// Presentation timestamp in the 90 kHz RTP clock.
    pub pts_90khz: u64,
}

/// A frame travelling through a session's delivery mailbox.
#[derive(Debug, Clone)]
pub enum MediaFrame {
    /// A complete H.264 access unit.
    Video(AccessUnit),
    /// A chunk of raw audio samples (μ-law bytes for PCMU).
    Audio(Bytes),
    /// Late-join parameter sets, sent once when a session starts playing
    /// so the decoder is configured before the first access unit arrives.
    Preamble { sps: Bytes, pps: Bytes },
}
