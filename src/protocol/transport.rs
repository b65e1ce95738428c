//! RTSP `Transport` header parsing and serialization (RFC 2326 §12.39).

use crate::error::{Result, RtspError};

/// Requested lower transport for RTP delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    /// `RTP/AVP;unicast;client_port=P1-P2` — RTP over UDP to the client's
    /// even/odd port pair.
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    /// `RTP/AVP/TCP;unicast;interleaved=C1-C2` — RTP embedded in the RTSP
    /// TCP connection, `$`-framed with the given channel identifiers.
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl TransportSpec {
    /// Parse a client `Transport` header value.
    ///
    /// Only unicast RTP/AVP (UDP) and RTP/AVP/TCP (interleaved) are
    /// accepted; anything else (multicast, unknown profiles) returns
    /// [`RtspError::UnsupportedTransport`] so the caller can answer 461.
    ///
    /// ```
    /// use camrtsp::protocol::transport::TransportSpec;
    ///
    /// let t = TransportSpec::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(t, TransportSpec::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 });
    ///
    /// let t = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
    /// assert_eq!(t, TransportSpec::Interleaved { rtp_channel: 0, rtcp_channel: 1 });
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        let mut is_tcp = false;
        let mut multicast = false;
        let mut client_ports: Option<(u16, u16)> = None;
        let mut interleaved: Option<(u8, u8)> = None;

        for part in header.split(';') {
            let part = part.trim();
            if part.eq_ignore_ascii_case("RTP/AVP") || part.eq_ignore_ascii_case("RTP/AVP/UDP") {
                is_tcp = false;
            } else if part.eq_ignore_ascii_case("RTP/AVP/TCP") {
                is_tcp = true;
            } else if part.eq_ignore_ascii_case("multicast") {
                multicast = true;
            } else if let Some(ports) = part.strip_prefix("client_port=") {
                client_ports = parse_pair::<u16>(ports);
            } else if let Some(chans) = part.strip_prefix("interleaved=") {
                interleaved = parse_pair::<u8>(chans);
            }
        }

        if multicast {
            return Err(RtspError::UnsupportedTransport(header.to_string()));
        }

        if is_tcp || interleaved.is_some() {
            let (rtp_channel, rtcp_channel) = interleaved.unwrap_or((0, 1));
            return Ok(TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            });
        }

        match client_ports {
            Some((client_rtp_port, client_rtcp_port)) => Ok(TransportSpec::Udp {
                client_rtp_port,
                client_rtcp_port,
            }),
            None => Err(RtspError::UnsupportedTransport(header.to_string())),
        }
    }

    /// Build the server's `Transport` response value, echoing the client
    /// parameters and completing them with `server_port` (UDP) and `ssrc`.
    pub fn response_header(&self, server_ports: Option<(u16, u16)>, ssrc: u32) -> String {
        match self {
            TransportSpec::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let (server_rtp, server_rtcp) = server_ports.unwrap_or((0, 0));
                format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X}",
                    client_rtp_port, client_rtcp_port, server_rtp, server_rtcp, ssrc
                )
            }
            TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={:08X}",
                rtp_channel, rtcp_channel, ssrc
            ),
        }
    }

    /// Whether this is the TCP-interleaved mode.
    pub fn is_interleaved(&self) -> bool {
        matches!(self, TransportSpec::Interleaved { .. })
    }
}

fn parse_pair<T: std::str::FromStr>(s: &str) -> Option<(T, T)> {
    let mut it = s.split('-');
    let a = it.next()?.trim().parse().ok()?;
    let b = it.next()?.trim().parse().ok()?;
    Some((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp() {
        let t = TransportSpec::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            t,
            TransportSpec::Udp {
                client_rtp_port: 5000,
                client_rtcp_port: 5001
            }
        );
    }

    #[test]
    fn parse_interleaved() {
        let t = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
        assert_eq!(
            t,
            TransportSpec::Interleaved {
                rtp_channel: 2,
                rtcp_channel: 3
            }
        );
    }

    #[test]
    fn parse_tcp_without_channels_defaults_0_1() {
        let t = TransportSpec::parse("RTP/AVP/TCP;unicast").unwrap();
        assert_eq!(
            t,
            TransportSpec::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1
            }
        );
    }

    #[test]
    fn parse_udp_without_ports_rejected() {
        assert!(TransportSpec::parse("RTP/AVP;unicast").is_err());
    }

    #[test]
    fn parse_multicast_rejected() {
        assert!(TransportSpec::parse("RTP/AVP;multicast;client_port=5000-5001").is_err());
    }

    #[test]
    fn udp_response_round_trips() {
        let t = TransportSpec::parse("RTP/AVP;unicast;client_port=40000-40001").unwrap();
        let hdr = t.response_header(Some((6000, 6001)), 0xDEADBEEF);
        assert_eq!(
            hdr,
            "RTP/AVP;unicast;client_port=40000-40001;server_port=6000-6001;ssrc=DEADBEEF"
        );
        // The serialized form parses back to the same client-side spec.
        assert_eq!(TransportSpec::parse(&hdr).unwrap(), t);
    }

    #[test]
    fn interleaved_response_round_trips() {
        let t = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        let hdr = t.response_header(None, 0x01020304);
        assert_eq!(hdr, "RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=01020304");
        assert_eq!(TransportSpec::parse(&hdr).unwrap(), t);
    }
}
