//! Per-track RTP channels: negotiated transport plus wire counters.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::media::h264::H264Packetizer;
use crate::media::rtp::{self, RtpHeader};
use crate::protocol::TransportSpec;

/// Write half of the RTSP TCP connection, shared between the request loop
/// (responses) and interleaved media senders. The mutex serializes all
/// writes on the connection.
pub type SharedTcpWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Track identifiers inside a session, matching the SDP control URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// `trackID=0`
    Video,
    /// `trackID=1`
    Audio,
}

impl TrackKind {
    pub fn track_id(self) -> u8 {
        match self {
            TrackKind::Video => 0,
            TrackKind::Audio => 1,
        }
    }
}

/// How packets for one track leave the server.
enum ChannelTransport {
    /// RTP/RTCP over a dedicated UDP socket pair.
    Udp {
        rtp_socket: UdpSocket,
        rtcp_socket: UdpSocket,
        server_rtp_port: u16,
        server_rtcp_port: u16,
        peer_rtp: SocketAddr,
        peer_rtcp: SocketAddr,
    },
    /// `$`-framed packets inside the RTSP TCP connection (RFC 2326 §10.12).
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
        writer: SharedTcpWriter,
    },
}

/// One negotiated media track of a session.
///
/// Owns the transport endpoints, the RTP header state (random SSRC,
/// sequence, timestamp), and the counters the RTCP Sender Report needs.
pub struct RtpChannel {
    pub track: TrackKind,
    pub header: RtpHeader,
    transport: ChannelTransport,
    pub packet_count: u32,
    pub octet_count: u32,
    /// Timestamp of the session's first access unit on this track.
    base_ts: u32,
    /// Source PTS the base timestamp is anchored to.
    first_pts: Option<u64>,
    last_ts: u32,
}

impl RtpChannel {
    /// Create a channel for the negotiated transport.
    ///
    /// For UDP, binds a fresh even/odd server port pair and targets the
    /// client's `client_port` pair at `peer_ip`. For interleaved TCP the
    /// connection's shared writer is used.
    pub async fn new(
        track: TrackKind,
        payload_type: u8,
        spec: &TransportSpec,
        peer_ip: IpAddr,
        tcp_writer: SharedTcpWriter,
    ) -> Result<Self> {
        let transport = match spec {
            TransportSpec::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let (rtp_socket, rtcp_socket, server_rtp_port, server_rtcp_port) =
                    bind_udp_pair().await?;
                ChannelTransport::Udp {
                    rtp_socket,
                    rtcp_socket,
                    server_rtp_port,
                    server_rtcp_port,
                    peer_rtp: SocketAddr::new(peer_ip, *client_rtp_port),
                    peer_rtcp: SocketAddr::new(peer_ip, *client_rtcp_port),
                }
            }
            TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => ChannelTransport::Interleaved {
                rtp_channel: *rtp_channel,
                rtcp_channel: *rtcp_channel,
                writer: tcp_writer,
            },
        };

        let header = RtpHeader::with_random_state(payload_type);
        let base_ts = header.timestamp();

        Ok(Self {
            track,
            header,
            transport,
            packet_count: 0,
            octet_count: 0,
            base_ts,
            first_pts: None,
            last_ts: base_ts,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// Server UDP port pair, for the SETUP `Transport` response.
    pub fn server_ports(&self) -> Option<(u16, u16)> {
        match &self.transport {
            ChannelTransport::Udp {
                server_rtp_port,
                server_rtcp_port,
                ..
            } => Some((*server_rtp_port, *server_rtcp_port)),
            ChannelTransport::Interleaved { .. } => None,
        }
    }

    /// RTP timestamp for the PLAY `RTP-Info` header.
    pub fn rtp_info_timestamp(&self) -> u32 {
        if self.first_pts.is_some() {
            self.last_ts
        } else {
            self.base_ts
        }
    }

    /// Compute and set the RTP timestamp for an access unit with the given
    /// source PTS (90 kHz).
    ///
    /// The first unit anchors the session's random base timestamp to the
    /// source clock; later units advance by PTS difference, so the wire
    /// clock never drifts from the source. A backwards PTS jump (source
    /// restart) re-anchors one nominal frame ahead of the last timestamp
    /// to keep the sequence non-decreasing.
    pub fn stamp_access_unit(&mut self, pts_90khz: u64) -> u32 {
        let ts = match self.first_pts {
            None => {
                self.first_pts = Some(pts_90khz);
                self.base_ts
            }
            Some(first) if pts_90khz < first => {
                self.base_ts = self.last_ts.wrapping_add(3600);
                self.first_pts = Some(pts_90khz);
                self.base_ts
            }
            Some(first) => self.base_ts.wrapping_add((pts_90khz - first) as u32),
        };
        self.last_ts = ts;
        self.header.set_timestamp(ts);
        ts
    }

    /// Send one RTP packet on this channel's transport.
    ///
    /// UDP send failures are logged at debug and the packet is dropped;
    /// a TCP write failure is returned so the caller can stop the session.
    pub async fn send_rtp(&mut self, packet: &[u8]) -> Result<()> {
        match &self.transport {
            ChannelTransport::Udp {
                rtp_socket,
                peer_rtp,
                ..
            } => {
                if let Err(e) = rtp_socket.send_to(packet, peer_rtp).await {
                    tracing::debug!(peer = %peer_rtp, error = %e, "UDP RTP send failed, dropping packet");
                    return Ok(());
                }
            }
            ChannelTransport::Interleaved {
                rtp_channel,
                writer,
                ..
            } => {
                write_interleaved(writer, *rtp_channel, packet).await?;
            }
        }
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self
            .octet_count
            .wrapping_add(packet.len().saturating_sub(rtp::RTP_HEADER_SIZE) as u32);
        Ok(())
    }

    /// Send an RTCP packet on the channel's RTCP leg.
    async fn send_rtcp(&self, packet: &[u8]) -> Result<()> {
        match &self.transport {
            ChannelTransport::Udp {
                rtcp_socket,
                peer_rtcp,
                ..
            } => {
                if let Err(e) = rtcp_socket.send_to(packet, peer_rtcp).await {
                    tracing::debug!(peer = %peer_rtcp, error = %e, "UDP RTCP send failed");
                }
                Ok(())
            }
            ChannelTransport::Interleaved {
                rtcp_channel,
                writer,
                ..
            } => write_interleaved(writer, *rtcp_channel, packet).await,
        }
    }

    /// Emit an RTCP Sender Report with the current counters, compounded
    /// with an SDES CNAME chunk per RFC 3550 §6.1.
    pub async fn send_sender_report(&mut self) -> Result<()> {
        let mut report = rtp::build_sender_report(
            self.header.ssrc,
            rtp::ntp_timestamp(),
            self.header.timestamp(),
            self.packet_count,
            self.octet_count,
        );
        report.extend_from_slice(&rtp::build_sdes(
            self.header.ssrc,
            &format!("camrtsp@{:08x}", self.header.ssrc),
        ));
        self.send_rtcp(&report).await
    }

    /// Emit an RTCP BYE (session teardown).
    pub async fn send_bye(&self) -> Result<()> {
        let bye = rtp::build_bye(&[self.header.ssrc], Some("teardown"));
        self.send_rtcp(&bye).await
    }

    /// Send cached SPS and PPS as two single-NAL packets one tick behind
    /// the current timestamp, marker clear.
    ///
    /// This is the late-join preamble: a client that starts playing
    /// mid-stream receives decoder parameters before (in RTP time) any
    /// slice it will see.
    pub async fn send_parameter_sets(
        &mut self,
        packetizer: &H264Packetizer,
        sps: &Bytes,
        pps: &Bytes,
    ) -> Result<()> {
        let preamble_ts = self.header.timestamp().wrapping_sub(1);
        let restore_ts = self.header.timestamp();
        self.header.set_timestamp(preamble_ts);

        let mut packets = packetizer.packetize_nal(&mut self.header, sps, false);
        packets.extend(packetizer.packetize_nal(&mut self.header, pps, false));
        for packet in &packets {
            self.send_rtp(packet).await?;
        }

        self.header.set_timestamp(restore_ts);
        Ok(())
    }
}

/// Frame a packet for the interleaved transport and write it out:
/// `0x24`, channel id, u16 BE length, payload (RFC 2326 §10.12).
async fn write_interleaved(writer: &SharedTcpWriter, channel: u8, packet: &[u8]) -> Result<()> {
    let mut framed = Vec::with_capacity(4 + packet.len());
    framed.push(0x24);
    framed.push(channel);
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);

    let mut guard = writer.lock().await;
    guard.write_all(&framed).await?;
    Ok(())
}

/// Bind an even/odd UDP port pair for RTP/RTCP (RFC 3550 §11).
async fn bind_udp_pair() -> Result<(UdpSocket, UdpSocket, u16, u16)> {
    for _ in 0..16 {
        let probe = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let port = probe.local_addr()?.port();
        let rtp_port = if port % 2 == 0 { port } else { port + 1 };
        if rtp_port == 0 || rtp_port == u16::MAX {
            continue;
        }

        let rtp_socket = if rtp_port == port {
            probe
        } else {
            match UdpSocket::bind(("0.0.0.0", rtp_port)).await {
                Ok(s) => s,
                Err(_) => continue,
            }
        };
        match UdpSocket::bind(("0.0.0.0", rtp_port + 1)).await {
            Ok(rtcp_socket) => {
                tracing::trace!(rtp_port, rtcp_port = rtp_port + 1, "allocated server port pair");
                return Ok((rtp_socket, rtcp_socket, rtp_port, rtp_port + 1));
            }
            Err(_) => continue,
        }
    }
    Err(crate::error::RtspError::Io(std::io::Error::other(
        "could not allocate an even/odd UDP port pair",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_pair_is_even_odd() {
        let (_rtp, _rtcp, rtp_port, rtcp_port) = bind_udp_pair().await.unwrap();
        assert_eq!(rtp_port % 2, 0);
        assert_eq!(rtcp_port, rtp_port + 1);
    }

    #[tokio::test]
    async fn stamp_anchors_then_advances() {
        let mut ch = test_channel(5000).await;
        let t0 = ch.stamp_access_unit(90_000);
        assert_eq!(t0, 5000);
        let t1 = ch.stamp_access_unit(93_600);
        assert_eq!(t1, 5000 + 3600);
        let t2 = ch.stamp_access_unit(97_200);
        assert_eq!(t2, 5000 + 7200);
    }

    #[tokio::test]
    async fn stamp_reanchors_on_backwards_pts() {
        let mut ch = test_channel(1000).await;
        ch.stamp_access_unit(90_000);
        let before = ch.stamp_access_unit(180_000);
        // Source restarted; PTS jumped back below the anchor.
        let after = ch.stamp_access_unit(0);
        assert_eq!(after, before.wrapping_add(3600));
        // And keeps advancing from the new anchor.
        assert_eq!(ch.stamp_access_unit(3600), after.wrapping_add(3600));
    }

    #[tokio::test]
    async fn stamp_is_monotonic_across_u32_wrap() {
        let mut ch = test_channel(u32::MAX - 100).await;
        let t0 = ch.stamp_access_unit(0);
        let t1 = ch.stamp_access_unit(200);
        assert_eq!(t0, u32::MAX - 100);
        assert_eq!(t1, 99); // wrapped
    }

    async fn test_channel(base_ts: u32) -> RtpChannel {
        let mut ch = RtpChannel::new(
            TrackKind::Video,
            96,
            &TransportSpec::Udp {
                client_rtp_port: 40000,
                client_rtcp_port: 40001,
            },
            "127.0.0.1".parse().unwrap(),
            dummy_writer().await,
        )
        .await
        .unwrap();
        ch.header = RtpHeader::new(96, 1, 0, base_ts);
        ch.base_ts = base_ts;
        ch.last_ts = base_ts;
        ch
    }

    async fn dummy_writer() -> SharedTcpWriter {
        // A connected-but-idle loopback stream; never written to in these
        // tests.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _ = listener.accept().await.unwrap();
        let (_r, w) = client.into_split();
        Arc::new(Mutex::new(w))
    }
}
