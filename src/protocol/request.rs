use crate::error::{ParseErrorKind, RtspError};

/// Maximum accepted size of a single RTSP request (headers + body).
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2; names keep their
/// received case for output.
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/cam2/trackID=0`).
    pub uri: String,
    /// Protocol version (always `RTSP/1.0` after a successful parse).
    pub version: String,
    /// Headers as ordered (name, value) pairs.
    pub headers: Vec<(String, String)>,
    /// Request body, sized by `Content-Length`.
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Parse an RTSP request from its header text and body bytes.
    ///
    /// `raw` must contain the request line, all headers, and the trailing
    /// blank line; the connection loop reads `body` separately based on
    /// `Content-Length`. Returns [`RtspError::Parse`] on malformed input,
    /// with [`ParseErrorKind::UnsupportedVersion`] reserved for a version
    /// other than RTSP/1.0 so the caller can answer 505.
    pub fn parse(raw: &str, body: Vec<u8>) -> crate::error::Result<Self> {
        if raw.len() + body.len() > MAX_REQUEST_SIZE {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::TooLarge,
            });
        }

        let mut lines = raw.lines();

        let request_line = lines.next().ok_or(RtspError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();

        if parts.len() != 3 {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != "RTSP/1.0" {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::UnsupportedVersion,
            });
        }

        let mut headers = Vec::new();

        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            headers.push((name, value));
        }

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body,
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17). The response must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session ID from the `Session` header, stripped of any
    /// `;timeout=...` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://localhost:8554/cam1 RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw, Vec::new()).unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://localhost:8554/cam1");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("1"));
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:8554/cam1/trackID=0 RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let req = RtspRequest::parse(raw, Vec::new()).unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.cseq(), Some("3"));
        assert_eq!(
            req.get_header("Transport"),
            Some("RTP/AVP;unicast;client_port=8000-8001")
        );
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse("", Vec::new()).is_err());
    }

    #[test]
    fn parse_invalid_request_line() {
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n", Vec::new()).is_err());
    }

    #[test]
    fn parse_rejects_rtsp_2() {
        let raw = "OPTIONS * RTSP/2.0\r\nCSeq: 1\r\n\r\n";
        let err = RtspRequest::parse(raw, Vec::new()).unwrap_err();
        match err {
            RtspError::Parse {
                kind: ParseErrorKind::UnsupportedVersion,
            } => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw, Vec::new()).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("cseq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn session_id_strips_timeout_suffix() {
        let raw = "PLAY rtsp://h/cam1 RTSP/1.0\r\nCSeq: 4\r\nSession: 0AF3D29CB81E4410;timeout=60\r\n\r\n";
        let req = RtspRequest::parse(raw, Vec::new()).unwrap();
        assert_eq!(req.session_id(), Some("0AF3D29CB81E4410"));
    }

    #[test]
    fn oversized_request_rejected() {
        let raw = "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let body = vec![0u8; MAX_REQUEST_SIZE];
        assert!(RtspRequest::parse(raw, body).is_err());
    }
}
