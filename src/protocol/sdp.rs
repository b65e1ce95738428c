//! SDP session description generation (RFC 4566).
//!
//! Produces the body of DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                   ← protocol version
//! o=- <sid> <ver> IN IP4 <addr>         ← origin
//! s=<stream-id>                         ← session name
//! c=IN IP4 0.0.0.0                      ← connection (ports come from SETUP)
//! t=0 0                                 ← timing (live stream)
//! a=tool:camrtsp
//! a=control:*
//! a=range:npt=0-
//! m=video 0 RTP/AVP 96                  ← media description
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1;profile-level-id=..;sprop-parameter-sets=..
//! a=control:trackID=0
//! [m=audio 0 RTP/AVP <pt> ...]          ← when the stream carries audio
//! ```
//!
//! The `sprop-parameter-sets` attribute carries the stream's current SPS
//! and PPS so decoders configure themselves before the first packet; the
//! server refuses to DESCRIBE (503) until both are known.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::media::{AudioCodec, PAYLOAD_TYPE_H264, VIDEO_CLOCK_RATE};

/// Inputs for one stream's session description.
pub struct SdpParams<'a> {
    /// Stream identifier, used as the SDP session name.
    pub stream_id: &'a str,
    /// Server address for the origin line.
    pub server_ip: &'a str,
    /// Origin session id / version (bumped when SPS/PPS change).
    pub origin_id: u64,
    pub origin_version: u64,
    /// Current parameter sets, raw bytes without start codes.
    pub sps: &'a [u8],
    pub pps: &'a [u8],
    /// Audio track, when the stream carries one.
    pub audio: Option<AudioCodec>,
}

/// Generate the SDP session description for a DESCRIBE response.
pub fn generate_sdp(p: &SdpParams<'_>) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o=- {} {} IN IP4 {}",
        p.origin_id, p.origin_version, p.server_ip
    ));
    sdp.push(format!("s={}", p.stream_id));
    sdp.push("c=IN IP4 0.0.0.0".to_string());
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:camrtsp".to_string());
    sdp.push("a=control:*".to_string());
    sdp.push("a=range:npt=0-".to_string());

    sdp.push(format!("m=video 0 RTP/AVP {}", PAYLOAD_TYPE_H264));
    sdp.push(format!(
        "a=rtpmap:{} H264/{}",
        PAYLOAD_TYPE_H264, VIDEO_CLOCK_RATE
    ));
    sdp.push(format!(
        "a=fmtp:{} packetization-mode=1;profile-level-id={};sprop-parameter-sets={},{}",
        PAYLOAD_TYPE_H264,
        profile_level_id(p.sps),
        BASE64.encode(p.sps),
        BASE64.encode(p.pps),
    ));
    sdp.push("a=control:trackID=0".to_string());

    if let Some(audio) = p.audio {
        let pt = audio.payload_type();
        sdp.push(format!("m=audio 0 RTP/AVP {}", pt));
        sdp.push(format!(
            "a=rtpmap:{} {}/{}",
            pt,
            audio.sdp_name(),
            audio.clock_rate()
        ));
        if audio == AudioCodec::Aac {
            sdp.push(format!(
                "a=fmtp:{} streamtype=5;profile-level-id=1;mode=AAC-hbr;\
                 sizelength=13;indexlength=3;indexdeltalength=3",
                pt
            ));
        }
        sdp.push("a=control:trackID=1".to_string());
    }

    format!("{}\r\n", sdp.join("\r\n"))
}

/// H.264 `profile-level-id`: the three bytes after the SPS NAL header
/// (profile_idc, constraint flags, level_idc), hex-encoded.
fn profile_level_id(sps: &[u8]) -> String {
    if sps.len() >= 4 {
        format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3])
    } else {
        // Baseline 3.1, matching the encoder defaults.
        "42001f".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1F, 0x8C, 0x8D];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    fn params<'a>(audio: Option<AudioCodec>) -> SdpParams<'a> {
        SdpParams {
            stream_id: "cam2",
            server_ip: "192.168.1.100",
            origin_id: 1234567890,
            origin_version: 1,
            sps: SPS,
            pps: PPS,
            audio,
        }
    }

    #[test]
    fn video_only_sdp() {
        let sdp = generate_sdp(&params(None));
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("o=- 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=cam2\r\n"));
        assert!(sdp.contains("c=IN IP4 0.0.0.0\r\n"));
        assert!(sdp.contains("t=0 0\r\n"));
        assert!(sdp.contains("a=control:*\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("a=control:trackID=0\r\n"));
        assert!(!sdp.contains("m=audio"));
        assert!(sdp.ends_with("\r\n"));

        // rtpmap must precede fmtp (RFC 6184 §8.2.1), media attrs follow m=.
        let rtpmap_idx = sdp.find("a=rtpmap").unwrap();
        let fmtp_idx = sdp.find("a=fmtp").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(m_idx < rtpmap_idx && rtpmap_idx < fmtp_idx);
    }

    #[test]
    fn fmtp_carries_parameter_sets() {
        let sdp = generate_sdp(&params(None));
        let fmtp = sdp
            .lines()
            .find(|l| l.starts_with("a=fmtp:96"))
            .expect("fmtp line");
        assert!(fmtp.contains("packetization-mode=1"));
        // profile-level-id = hex of SPS bytes 1..4
        assert!(fmtp.contains("profile-level-id=42001f"), "{}", fmtp);
        let sprop = format!(
            "sprop-parameter-sets={},{}",
            BASE64.encode(SPS),
            BASE64.encode(PPS)
        );
        assert!(fmtp.contains(&sprop), "{}", fmtp);
    }

    #[test]
    fn audio_track_appended() {
        let sdp = generate_sdp(&params(Some(AudioCodec::Pcmu)));
        assert!(sdp.contains("m=audio 0 RTP/AVP 0\r\n"));
        assert!(sdp.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(sdp.contains("a=control:trackID=1\r\n"));

        let video_idx = sdp.find("m=video").unwrap();
        let audio_idx = sdp.find("m=audio").unwrap();
        assert!(video_idx < audio_idx);
    }

    #[test]
    fn short_sps_falls_back_to_baseline_pli() {
        let mut p = params(None);
        p.sps = &[0x67];
        let sdp = generate_sdp(&p);
        assert!(sdp.contains("profile-level-id=42001f"));
    }
}
