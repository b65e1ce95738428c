//! H.264 elementary-stream framing and RTP packetization (RFC 6184).
//!
//! Three pieces, in stream order:
//!
//! 1. [`AnnexBSplitter`] — turns a raw byte stream (ffmpeg stdout) into
//!    individual NAL units, stripping `00 00 00 01` / `00 00 01` start
//!    codes and holding partial trailing data between reads.
//! 2. [`AccessUnitAssembler`] — groups NALs into access units on AUD and
//!    VCL boundaries, so every picture goes out under a single RTP
//!    timestamp with a single marker bit.
//! 3. [`H264Packetizer`] — emits RTP packets per NAL: single NAL unit
//!    packets up to the MTU payload, FU-A fragments beyond it
//!    (packetization-mode 1).

use bytes::{Bytes, BytesMut};

use super::rtp::{RtpHeader, RTP_HEADER_SIZE};
use super::AccessUnit;

/// Maximum RTP payload per packet. NALs above this are FU-A fragmented.
pub const MTU_PAYLOAD: usize = 1400;

pub const NAL_TYPE_NON_IDR: u8 = 1;
pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SEI: u8 = 6;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
pub const NAL_TYPE_AUD: u8 = 9;
const NAL_TYPE_FU_A: u8 = 28;

/// NAL unit type from the first payload byte.
pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

/// Whether a NAL type is a VCL slice (coded picture data).
pub fn is_vcl(ty: u8) -> bool {
    (1..=5).contains(&ty)
}

/// Incremental Annex-B start-code splitter.
///
/// Feed arbitrary chunks from the encoder's stdout; complete NAL units
/// (without start codes) come back as they close. Data before the first
/// start code is discarded; a trailing partial NAL stays buffered until
/// the next start code (or [`flush`](Self::flush)).
#[derive(Debug, Default)]
pub struct AnnexBSplitter {
    buf: BytesMut,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every NAL unit completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut nals = Vec::new();

        loop {
            let Some((first_pos, first_len)) = find_start_code(&self.buf, 0) else {
                // No start code at all; keep only enough bytes to detect
                // one spanning the next chunk.
                if self.buf.len() > 3 {
                    let keep = self.buf.len() - 3;
                    let _ = self.buf.split_to(keep);
                }
                return nals;
            };

            if first_pos > 0 {
                let _ = self.buf.split_to(first_pos);
                continue;
            }

            let payload_start = first_len;
            let Some((next_pos, _)) = find_start_code(&self.buf, payload_start) else {
                return nals;
            };

            let mut nal = self.buf.split_to(next_pos);
            let _ = nal.split_to(payload_start);
            if !nal.is_empty() {
                nals.push(nal.freeze());
            }
        }
    }

    /// Flush the trailing partial NAL (stream end).
    pub fn flush(&mut self) -> Option<Bytes> {
        let (pos, len) = find_start_code(&self.buf, 0)?;
        let mut nal = self.buf.split_off(pos);
        let _ = nal.split_to(len);
        self.buf.clear();
        if nal.is_empty() {
            None
        } else {
            Some(nal.freeze())
        }
    }
}

/// Find the next Annex-B start code at or after `from`.
///
/// Returns `(position, length)` where length is 3 or 4. A zero byte
/// immediately preceding `00 00 01` (and at or after `from`) is folded
/// into a 4-byte code.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > from && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Groups NAL units into access units.
///
/// An access unit closes when:
/// - an AUD (type 9) arrives while NALs are pending, or
/// - a VCL slice is already pending and the next NAL is another VCL slice
///   or a non-VCL NAL that opens the next unit (SPS, PPS, SEI, AUD).
///
/// The unit's timestamp is the PTS supplied with its first VCL NAL.
#[derive(Debug, Default)]
pub struct AccessUnitAssembler {
    pending: Vec<Bytes>,
    has_vcl: bool,
    is_idr: bool,
    pts_90khz: u64,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a NAL unit; returns the access unit it completed, if any.
    ///
    /// `pts_90khz` is the source clock at which this NAL was read; it is
    /// recorded for the unit when its first VCL slice arrives.
    pub fn push(&mut self, nal: Bytes, pts_90khz: u64) -> Option<AccessUnit> {
        let ty = nal_type(&nal);

        let boundary = !self.pending.is_empty()
            && (ty == NAL_TYPE_AUD
                || (self.has_vcl
                    && (is_vcl(ty)
                        || matches!(ty, NAL_TYPE_SPS | NAL_TYPE_PPS | NAL_TYPE_SEI))));

        let finished = if boundary { self.take() } else { None };

        if is_vcl(ty) && !self.has_vcl {
            self.has_vcl = true;
            self.is_idr = ty == NAL_TYPE_IDR;
            self.pts_90khz = pts_90khz;
        }
        self.pending.push(nal);

        finished
    }

    /// Emit whatever is pending (source shutdown or restart).
    pub fn take(&mut self) -> Option<AccessUnit> {
        if self.pending.is_empty() {
            return None;
        }
        let au = AccessUnit {
            nals: std::mem::take(&mut self.pending),
            is_idr: self.is_idr,
            pts_90khz: self.pts_90khz,
        };
        self.has_vcl = false;
        self.is_idr = false;
        Some(au)
    }
}

/// Prepend cached SPS/PPS to an IDR access unit when it lacks them.
///
/// Decoders that join mid-stream can then resync on every keyframe even
/// when the encoder emitted parameter sets only once. A leading AUD stays
/// in front.
pub fn inject_parameter_sets(au: &mut AccessUnit, sps: &Bytes, pps: &Bytes) {
    if !au.is_idr {
        return;
    }
    let has_sps = au.nals.iter().any(|n| nal_type(n) == NAL_TYPE_SPS);
    let has_pps = au.nals.iter().any(|n| nal_type(n) == NAL_TYPE_PPS);
    if has_sps && has_pps {
        return;
    }

    let at = usize::from(au.nals.first().map(|n| nal_type(n)) == Some(NAL_TYPE_AUD));
    if !has_pps {
        au.nals.insert(at, pps.clone());
    }
    if !has_sps {
        au.nals.insert(at, sps.clone());
    }
}

/// H.264 RTP packetizer (RFC 6184, packetization-mode 1).
///
/// Stateless apart from the MTU; sequence numbers, timestamps, and SSRC
/// live in the per-track [`RtpHeader`] passed to each call.
#[derive(Debug)]
pub struct H264Packetizer {
    mtu: usize,
}

impl Default for H264Packetizer {
    fn default() -> Self {
        Self { mtu: MTU_PAYLOAD }
    }
}

impl H264Packetizer {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    /// Packetize a full access unit.
    ///
    /// All packets carry the header's current timestamp; the marker bit is
    /// set only on the final packet of the final NAL.
    pub fn packetize_au(&self, header: &mut RtpHeader, nals: &[Bytes]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        for (i, nal) in nals.iter().enumerate() {
            let is_last = i == nals.len() - 1;
            packets.append(&mut self.packetize_nal(header, nal, is_last));
        }
        packets
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    /// Uses FU-A fragmentation (RFC 6184 §5.8) for NALs exceeding the MTU.
    pub fn packetize_nal(
        &self,
        header: &mut RtpHeader,
        nal_unit: &[u8],
        is_last_nal: bool,
    ) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.mtu {
            let hdr = header.write(is_last_nal);
            let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
        } else {
            let nal_header = nal_unit[0];
            let ty = nal_header & 0x1F;
            let nri = nal_header & 0x60;

            let fu_indicator = nri | NAL_TYPE_FU_A;
            let payload = &nal_unit[1..];

            let max_fragment = self.mtu - 2; // FU indicator + FU header
            let mut offset = 0usize;
            let mut first = true;

            while offset < payload.len() {
                let remaining = payload.len() - offset;
                let last_fragment = remaining <= max_fragment;
                let chunk_size = std::cmp::min(max_fragment, remaining);
                let chunk = &payload[offset..offset + chunk_size];

                let start_bit = if first { 0x80 } else { 0x00 };
                let end_bit = if last_fragment { 0x40 } else { 0x00 };
                let fu_header = start_bit | end_bit | ty;

                let marker = is_last_nal && last_fragment;
                let hdr = header.write(marker);

                let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + 2 + chunk.len());
                packet.extend_from_slice(&hdr);
                packet.push(fu_indicator);
                packet.push(fu_header);
                packet.extend_from_slice(chunk);
                packets.push(packet);

                offset += chunk_size;
                first = false;
            }

            tracing::trace!(
                nal_type = ty,
                nal_size = nal_unit.len(),
                fragments = packets.len(),
                "FU-A fragmented NAL unit"
            );
        }

        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    // --- Annex-B splitting ---

    #[test]
    fn split_two_nals_4byte_sc() {
        let mut s = AnnexBSplitter::new();
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE]);
        let nals = s.push(&data);
        assert_eq!(nals, vec![b(&[0x67, 0x42])]);
        assert_eq!(s.flush(), Some(b(&[0x68, 0xCE])));
    }

    #[test]
    fn split_mixed_start_codes() {
        let mut s = AnnexBSplitter::new();
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xAA]);
        let nals = s.push(&data);
        assert_eq!(nals, vec![b(&[0x67, 0x42]), b(&[0x68, 0xCE])]);
        assert_eq!(s.flush(), Some(b(&[0x65, 0xAA])));
    }

    #[test]
    fn split_across_chunk_boundary() {
        let mut s = AnnexBSplitter::new();
        assert!(s.push(&[0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0, 0]).is_empty());
        // The held-back zeros turn out to start the next code.
        let nals = s.push(&[0, 1, 0x41, 0x99]);
        assert_eq!(nals, vec![b(&[0x65, 0xAA, 0xBB])]);
        assert_eq!(s.flush(), Some(b(&[0x41, 0x99])));
    }

    #[test]
    fn split_discards_leading_garbage() {
        let mut s = AnnexBSplitter::new();
        let nals = s.push(&[0xDE, 0xAD, 0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68]);
        assert_eq!(nals, vec![b(&[0x67, 0x42])]);
    }

    #[test]
    fn split_no_start_code() {
        let mut s = AnnexBSplitter::new();
        assert!(s.push(&[0xFF, 0xFE, 0xFD]).is_empty());
        assert_eq!(s.flush(), None);
    }

    // --- Access-unit assembly ---

    #[test]
    fn aud_closes_previous_unit() {
        let mut a = AccessUnitAssembler::new();
        assert!(a.push(b(&[0x09, 0xF0]), 0).is_none());
        assert!(a.push(b(&[0x65, 0x01]), 1000).is_none());
        let au = a.push(b(&[0x09, 0xF0]), 2000).expect("AUD closes unit");
        assert_eq!(au.nals.len(), 2);
        assert!(au.is_idr);
        assert_eq!(au.pts_90khz, 1000);
    }

    #[test]
    fn vcl_followed_by_vcl_closes_unit() {
        let mut a = AccessUnitAssembler::new();
        assert!(a.push(b(&[0x41, 0x01]), 0).is_none());
        let au = a.push(b(&[0x41, 0x02]), 3000).expect("second slice closes first");
        assert_eq!(au.nals, vec![b(&[0x41, 0x01])]);
        assert!(!au.is_idr);
        assert_eq!(au.pts_90khz, 0);
    }

    #[test]
    fn sps_after_slice_closes_unit() {
        let mut a = AccessUnitAssembler::new();
        assert!(a.push(b(&[0x65, 0x01]), 500).is_none());
        let au = a.push(b(&[0x67, 0x42]), 1500).unwrap();
        assert!(au.is_idr);
        // SPS starts the next unit, preceding its slice.
        let au2 = a.push(b(&[0x68, 0xCE]), 1500);
        assert!(au2.is_none());
        assert!(a.push(b(&[0x65, 0x02]), 1500).is_none());
        let au3 = a.push(b(&[0x09, 0xF0]), 2500).unwrap();
        assert_eq!(au3.nals.len(), 3);
        assert!(au3.is_idr);
    }

    #[test]
    fn non_vcl_preamble_stays_with_slice() {
        let mut a = AccessUnitAssembler::new();
        assert!(a.push(b(&[0x09, 0xF0]), 0).is_none());
        assert!(a.push(b(&[0x67, 0x42]), 0).is_none());
        assert!(a.push(b(&[0x68, 0xCE]), 0).is_none());
        assert!(a.push(b(&[0x65, 0x01]), 0).is_none());
        let au = a.push(b(&[0x09, 0xF0]), 3000).unwrap();
        assert_eq!(au.nals.len(), 4);
        assert!(au.is_idr);
    }

    // --- Parameter-set injection ---

    #[test]
    fn inject_prepends_missing_sets_after_aud() {
        let sps = b(&[0x67, 0x42, 0x00, 0x1F]);
        let pps = b(&[0x68, 0xCE, 0x3C, 0x80]);
        let mut au = AccessUnit {
            nals: vec![b(&[0x09, 0xF0]), b(&[0x65, 0x01])],
            is_idr: true,
            pts_90khz: 0,
        };
        inject_parameter_sets(&mut au, &sps, &pps);
        let types: Vec<u8> = au.nals.iter().map(|n| nal_type(n)).collect();
        assert_eq!(types, vec![9, 7, 8, 5]);
    }

    #[test]
    fn inject_skips_when_already_present() {
        let sps = b(&[0x67, 0x42]);
        let pps = b(&[0x68, 0xCE]);
        let mut au = AccessUnit {
            nals: vec![sps.clone(), pps.clone(), b(&[0x65, 0x01])],
            is_idr: true,
            pts_90khz: 0,
        };
        inject_parameter_sets(&mut au, &sps, &pps);
        assert_eq!(au.nals.len(), 3);
    }

    #[test]
    fn inject_ignores_non_idr() {
        let sps = b(&[0x67, 0x42]);
        let pps = b(&[0x68, 0xCE]);
        let mut au = AccessUnit {
            nals: vec![b(&[0x41, 0x01])],
            is_idr: false,
            pts_90khz: 0,
        };
        inject_parameter_sets(&mut au, &sps, &pps);
        assert_eq!(au.nals.len(), 1);
    }

    // --- Packetization ---

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 0, 0)
    }

    #[test]
    fn small_nal_single_packet() {
        let p = H264Packetizer::default();
        let mut h = make_header();
        let packets = p.packetize_nal(&mut h, &[0x65, 0xAA, 0xBB, 0xCC], true);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12 + 4);
        assert_eq!(packets[0][1] & 0x80, 0x80); // marker
        assert_eq!(packets[0][12], 0x65); // NAL header included
    }

    #[test]
    fn fu_a_5000_byte_idr() {
        // 5000-byte NAL with header 0x65 at MTU 1400 must produce exactly
        // ceil(4999 / 1398) = 4 fragments.
        let p = H264Packetizer::default();
        let mut h = make_header();
        let mut nal = vec![0x65];
        nal.extend(std::iter::repeat(0xAB).take(4999));
        let packets = p.packetize_nal(&mut h, &nal, true);
        assert_eq!(packets.len(), 4);

        let fu_headers: Vec<u8> = packets.iter().map(|p| p[13]).collect();
        assert_eq!(fu_headers, vec![0x85, 0x05, 0x05, 0x45]);
        for packet in &packets {
            assert_eq!(packet[12], 0x7C); // FU indicator: NRI of 0x65 | 28
        }
        // Marker only on the last fragment.
        assert!(packets[..3].iter().all(|p| p[1] & 0x80 == 0));
        assert_eq!(packets[3][1] & 0x80, 0x80);
    }

    #[test]
    fn fu_a_reassembles_to_original() {
        let p = H264Packetizer::default();
        let mut h = make_header();
        let mut nal = vec![0x61];
        nal.extend((0..3000u32).map(|i| (i % 251) as u8));
        let packets = p.packetize_nal(&mut h, &nal, false);
        assert!(packets.len() > 1);

        let mut rebuilt = Vec::new();
        let fu_indicator = packets[0][12];
        let first_fu_header = packets[0][13];
        rebuilt.push((fu_indicator & 0xE0) | (first_fu_header & 0x1F));
        for packet in &packets {
            rebuilt.extend_from_slice(&packet[14..]);
        }
        assert_eq!(rebuilt, nal);

        // Exactly one S bit, exactly one E bit, first and last.
        let starts: Vec<usize> = packets
            .iter()
            .enumerate()
            .filter(|(_, p)| p[13] & 0x80 != 0)
            .map(|(i, _)| i)
            .collect();
        let ends: Vec<usize> = packets
            .iter()
            .enumerate()
            .filter(|(_, p)| p[13] & 0x40 != 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(starts, vec![0]);
        assert_eq!(ends, vec![packets.len() - 1]);
    }

    #[test]
    fn au_single_marker_on_last_packet() {
        let p = H264Packetizer::default();
        let mut h = make_header();
        let mut big = vec![0x65];
        big.extend(std::iter::repeat(0x11).take(3000));
        let nals = vec![b(&[0x09, 0xF0]), b(&[0x67, 0x42]), b(&[0x68, 0xCE]), b(&big)];
        let packets = p.packetize_au(&mut h, &nals);

        let markers: Vec<bool> = packets.iter().map(|p| p[1] & 0x80 != 0).collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert!(markers.last().unwrap());

        // All packets of the unit share the timestamp, sequence strictly
        // increments.
        let ts: Vec<u32> = packets
            .iter()
            .map(|p| u32::from_be_bytes([p[4], p[5], p[6], p[7]]))
            .collect();
        assert!(ts.windows(2).all(|w| w[0] == w[1]));
        let seq: Vec<u16> = packets
            .iter()
            .map(|p| u16::from_be_bytes([p[2], p[3]]))
            .collect();
        assert!(seq.windows(2).all(|w| w[1] == w[0].wrapping_add(1)));
    }

    #[test]
    fn empty_nal_no_packets() {
        let p = H264Packetizer::default();
        let mut h = make_header();
        assert!(p.packetize_nal(&mut h, &[], true).is_empty());
    }
}
