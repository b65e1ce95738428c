//! # camrtsp — native RTSP server for surveillance cameras
//!
//! Transcodes camera feeds (typically MJPEG) to H.264 with an ffmpeg
//! child process and serves them over RTSP/RTP to standard clients such
//! as Synology Surveillance Station, VLC, and ffplay. Both UDP and
//! TCP-interleaved transports are supported, with an optional G.711 audio
//! track captured from ALSA.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, session lifecycle, transport negotiation, interleaving |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | Packet headers, SSRC generation, Sender Reports |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Session descriptions for DESCRIBE responses |
//! | [RFC 6184](https://tools.ietf.org/html/rfc6184) | H.264 RTP payload | NAL packetization, FU-A fragmentation, sprop-parameter-sets |
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  integration — wiring, start/stop, status      │
//! ├────────────────────────────────────────────────┤
//! │  server      — listener, request loop, auth    │
//! │  stream      — mounts, SPS/PPS cache, fanout   │
//! ├────────────────────────────────────────────────┤
//! │  session     — state machine, RTP channels,    │
//! │                per-session delivery task       │
//! │  source      — ffmpeg transcoder + watchdog,   │
//! │                ALSA audio capture              │
//! ├────────────────────────────────────────────────┤
//! │  protocol    — RTSP parsing, Transport, SDP    │
//! │  media       — RTP/RTCP packing, H.264 framing │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Data plane: source → H.264 framer → stream fanout → every playing
//! session's bounded mailbox → packetizer → UDP socket or `$`-framed TCP.
//!
//! Control plane: one cooperative task per TCP connection parses requests
//! and mutates sessions; the registry and session map are the only shared
//! state, guarded by short-lived locks never held across an await.

pub mod config;
pub mod error;
pub mod integration;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;
pub mod source;
pub mod stream;

pub use config::Config;
pub use error::{Result, RtspError};
pub use server::RtspServer;
pub use session::{Session, SessionManager, SessionState};
pub use stream::{StreamConfig, StreamRegistry};
