//! Error types for the RTSP server.

use std::fmt;

/// Errors that can occur across the server stack.
///
/// Variants map to specific failure modes:
///
/// - **Protocol**: [`Parse`](Self::Parse),
///   [`UnsupportedTransport`](Self::UnsupportedTransport) — translated to
///   400/505/461 by the request loop.
/// - **Transport**: [`Io`](Self::Io) — socket failures; dropped per-packet
///   on UDP, fatal for the session on TCP.
/// - **Source**: [`Source`](Self::Source) — ffmpeg died or stalled;
///   recoverable via restart with backoff.
/// - **Fatal**: [`Bind`](Self::Bind) — listener could not come up,
///   [`Config`](Self::Config) — unusable configuration.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Transport header requested a mode the server does not provide
    /// (anything other than unicast RTP/AVP or RTP/AVP/TCP).
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// The media source (ffmpeg child) failed.
    #[error("source error: {0}")]
    Source(String),

    /// The configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The RTSP listener could not bind; the server does not come up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// Protocol version other than RTSP/1.0.
    UnsupportedVersion,
    /// Request exceeded the 64 KiB size cap.
    TooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::UnsupportedVersion => write!(f, "unsupported version"),
            Self::TooLarge => write!(f, "request too large"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
