//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! A session is the server-side state created by SETUP and destroyed by
//! TEARDOWN, idle timeout, or connection drop. It tracks:
//!
//! - A unique session ID (16 hex digits, returned in the `Session` header).
//! - The playback state: Init -> Ready -> Playing (PAUSE returns to Ready).
//! - One [`RtpChannel`] per negotiated track (video, optionally audio).
//! - A timeout (default 60 s, RFC 2326 §12.37) — the client must send a
//!   request (e.g. GET_PARAMETER) before it expires.
//!
//! Media reaches a session through a bounded mailbox: the stream registry
//! enqueues frames with [`Session::deliver`], and a per-session task drains
//! the mailbox, packetizes, and writes to the negotiated transport. A slow
//! client fills its own mailbox and loses whole access units; it never
//! blocks the producer or other sessions.

pub mod channel;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::audio::AudioPacketizer;
use crate::media::h264::H264Packetizer;
use crate::media::MediaFrame;
use crate::protocol::TransportSpec;
pub use channel::{RtpChannel, SharedTcpWriter, TrackKind};

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Bound on a session's delivery mailbox, counted in frames. Overflow
/// drops whole access units for that session only.
pub const SEND_QUEUE_CAPACITY: usize = 128;

/// RTCP Sender Report period.
const SENDER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no transport negotiated yet.
    Init,
    /// At least one track SETUP; not delivering.
    Ready,
    /// Media is being delivered.
    Playing,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::Ready => "READY",
            SessionState::Playing => "PLAYING",
        }
    }
}

/// State shared between a [`Session`] and its delivery task.
struct SessionShared {
    id: String,
    state: RwLock<SessionState>,
    channels: tokio::sync::Mutex<Vec<RtpChannel>>,
}

/// A single RTSP session.
///
/// Created during SETUP, destroyed by TEARDOWN, idle timeout, or TCP
/// disconnect. Interior mutability allows shared references from the
/// control plane while the delivery task runs.
pub struct Session {
    shared: Arc<SessionShared>,
    /// Resolved stream identifier — always the registry's stream_id, never
    /// the raw URL text the client sent. The fanout matches on this.
    pub stream_id: String,
    /// Peer address of the RTSP connection (UDP tracks target its IP).
    pub client_addr: SocketAddr,
    tx: mpsc::Sender<MediaFrame>,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    pub timeout_secs: u64,
    dropped_frames: AtomicU64,
}

impl Session {
    /// Create a session and spawn its delivery task.
    fn new(id: String, stream_id: String, client_addr: SocketAddr) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let shared = Arc::new(SessionShared {
            id: id.clone(),
            state: RwLock::new(SessionState::Init),
            channels: tokio::sync::Mutex::new(Vec::new()),
        });

        tokio::spawn(delivery_loop(shared.clone(), rx));

        Arc::new(Session {
            shared,
            stream_id,
            client_addr,
            tx,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            dropped_frames: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    /// Transition to a new playback state.
    pub fn set_state(&self, state: SessionState) {
        let mut guard = self.shared.state.write();
        tracing::debug!(
            session_id = %self.shared.id,
            old_state = (*guard).name(),
            new_state = state.name(),
            "state transition"
        );
        *guard = state;
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    /// Record client activity (any request on the session).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Whether the idle timeout has elapsed since the last activity.
    pub fn is_expired(&self) -> bool {
        self.last_activity.lock().elapsed() > Duration::from_secs(self.timeout_secs)
    }

    /// Format the `Session` response header value per RFC 2326 §12.37,
    /// e.g. `"0AF3D29CB81E4410;timeout=60"`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.shared.id, self.timeout_secs)
    }

    /// Negotiate a track: allocate its [`RtpChannel`] and return the
    /// server port pair (UDP only) and SSRC for the Transport response.
    ///
    /// A repeated SETUP for the same track replaces the old channel.
    pub async fn add_channel(
        &self,
        track: TrackKind,
        payload_type: u8,
        spec: &TransportSpec,
        tcp_writer: SharedTcpWriter,
    ) -> Result<(Option<(u16, u16)>, u32)> {
        let channel = RtpChannel::new(
            track,
            payload_type,
            spec,
            self.client_addr.ip(),
            tcp_writer,
        )
        .await?;
        let server_ports = channel.server_ports();
        let ssrc = channel.ssrc();

        let mut channels = self.shared.channels.lock().await;
        channels.retain(|c| c.track != track);
        channels.push(channel);
        drop(channels);

        if self.state() == SessionState::Init {
            self.set_state(SessionState::Ready);
        }
        Ok((server_ports, ssrc))
    }

    /// Build the PLAY `RTP-Info` header value for all negotiated tracks.
    pub async fn rtp_info(&self, base_url: &str) -> String {
        let channels = self.shared.channels.lock().await;
        channels
            .iter()
            .map(|c| {
                format!(
                    "url={}/trackID={};seq={};rtptime={}",
                    base_url,
                    c.track.track_id(),
                    c.header.sequence(),
                    c.rtp_info_timestamp()
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Enqueue a frame for delivery. Best-effort: when the mailbox is
    /// full the whole frame is dropped and counted, so one slow client
    /// never stalls the producer or its peers.
    pub fn deliver(&self, frame: MediaFrame) {
        if !self.is_playing() {
            return;
        }
        if self.tx.try_send(frame).is_err() {
            let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(
                session_id = %self.shared.id,
                dropped,
                "send queue full, dropped access unit"
            );
        }
    }

    /// Total frames dropped due to mailbox overflow.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Drains one session's mailbox: packetizes frames, writes RTP, and emits
/// periodic Sender Reports. Ends when every mailbox sender is gone
/// (teardown paths) or the TCP transport fails.
async fn delivery_loop(shared: Arc<SessionShared>, mut rx: mpsc::Receiver<MediaFrame>) {
    let video_packetizer = H264Packetizer::default();
    let mut audio_packetizer = AudioPacketizer::new();
    let mut sr_timer = tokio::time::interval(SENDER_REPORT_INTERVAL);
    sr_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if *shared.state.read() != SessionState::Playing {
                    continue;
                }
                if let Err(e) =
                    send_frame(&shared, &video_packetizer, &mut audio_packetizer, frame).await
                {
                    tracing::debug!(session_id = %shared.id, error = %e, "transport write failed, stopping delivery");
                    break;
                }
            }
            _ = sr_timer.tick() => {
                if *shared.state.read() != SessionState::Playing {
                    continue;
                }
                let mut channels = shared.channels.lock().await;
                for ch in channels.iter_mut() {
                    if ch.send_sender_report().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let channels = shared.channels.lock().await;
    for ch in channels.iter() {
        let _ = ch.send_bye().await;
    }
    tracing::debug!(session_id = %shared.id, "delivery task ended");
}

async fn send_frame(
    shared: &SessionShared,
    video_packetizer: &H264Packetizer,
    audio_packetizer: &mut AudioPacketizer,
    frame: MediaFrame,
) -> Result<()> {
    let mut channels = shared.channels.lock().await;
    match frame {
        MediaFrame::Video(au) => {
            let Some(ch) = channels.iter_mut().find(|c| c.track == TrackKind::Video) else {
                return Ok(());
            };
            ch.stamp_access_unit(au.pts_90khz);
            let packets = video_packetizer.packetize_au(&mut ch.header, &au.nals);
            for packet in &packets {
                ch.send_rtp(packet).await?;
            }
        }
        MediaFrame::Audio(samples) => {
            let Some(ch) = channels.iter_mut().find(|c| c.track == TrackKind::Audio) else {
                return Ok(());
            };
            let packets = audio_packetizer.packetize(&mut ch.header, &samples);
            for packet in &packets {
                ch.send_rtp(packet).await?;
            }
        }
        MediaFrame::Preamble { sps, pps } => {
            let Some(ch) = channels.iter_mut().find(|c| c.track == TrackKind::Video) else {
                return Ok(());
            };
            ch.send_parameter_sets(video_packetizer, &sps, &pps).await?;
        }
    }
    Ok(())
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock`; lookups happen on every request and
/// every fanout pass, so read performance matters. Never held across an
/// await point.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session bound to the given resolved stream and register it.
    ///
    /// IDs are 16 hex digits from an OS-seeded RNG; on the (negligible)
    /// chance of a collision a fresh ID is drawn.
    pub fn create(&self, stream_id: &str, client_addr: SocketAddr) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = format!("{:016X}", rand::rng().random::<u64>());
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Session::new(id.clone(), stream_id.to_string(), client_addr);
        sessions.insert(id.clone(), session.clone());
        let total = sessions.len();
        drop(sessions);

        tracing::debug!(session_id = %id, stream_id, total_sessions = total, "session created");
        session
    }

    /// Look up a session by ID, refreshing its activity timestamp.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().get(id).cloned();
        if let Some(s) = &session {
            s.touch();
        }
        session
    }

    /// Remove and return a session (TEARDOWN, sweep, disconnect).
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            let total = self.sessions.read().len();
            tracing::debug!(session_id = %id, total_sessions = total, "session removed");
        }
        removed
    }

    /// Sessions whose idle timeout has elapsed.
    pub fn expired(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_expired())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// All session IDs (shutdown path).
    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let mgr = SessionManager::new();
        let session = mgr.create("cam1", peer());
        assert_eq!(session.id().len(), 16);
        assert!(session.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(session.state(), SessionState::Init);
        assert_eq!(session.stream_id, "cam1");

        let found = mgr.get(session.id()).expect("lookup");
        assert_eq!(found.id(), session.id());
        assert!(mgr.get("DEADBEEFDEADBEEF").is_none());
    }

    #[tokio::test]
    async fn remove_drops_session() {
        let mgr = SessionManager::new();
        let session = mgr.create("cam1", peer());
        let id = session.id().to_string();
        assert!(mgr.remove(&id).is_some());
        assert!(mgr.get(&id).is_none());
        assert!(mgr.remove(&id).is_none());
    }

    #[tokio::test]
    async fn session_header_has_timeout() {
        let mgr = SessionManager::new();
        let session = mgr.create("cam1", peer());
        let value = session.session_header_value();
        assert!(value.ends_with(";timeout=60"), "{}", value);
    }

    #[tokio::test]
    async fn deliver_ignored_when_not_playing() {
        let mgr = SessionManager::new();
        let session = mgr.create("cam1", peer());
        session.deliver(MediaFrame::Audio(bytes::Bytes::from_static(&[0u8; 160])));
        assert_eq!(session.dropped_frames(), 0);
        // Still in INIT; nothing was queued, nothing dropped.
        assert_eq!(session.state(), SessionState::Init);
    }

    #[tokio::test]
    async fn expired_after_timeout() {
        let mgr = SessionManager::new();
        let session = mgr.create("cam1", peer());
        assert!(!session.is_expired());
        *session.last_activity.lock() = Instant::now() - Duration::from_secs(61);
        assert!(session.is_expired());
        assert_eq!(mgr.expired().len(), 1);
        session.touch();
        assert!(mgr.expired().is_empty());
    }
}
