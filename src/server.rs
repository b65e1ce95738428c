//! RTSP server: TCP listener, per-connection request loop, method dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::media::{MediaFrame, PAYLOAD_TYPE_H264};
use crate::protocol::request::MAX_REQUEST_SIZE;
use crate::protocol::{sdp, RtspRequest, RtspResponse, TransportSpec};
use crate::session::{SessionManager, SessionState, SharedTcpWriter, TrackKind};
use crate::stream::{self, StreamRegistry};

/// Idle-session sweep period.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Methods advertised in the OPTIONS `Public` header.
const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

const AUTH_REALM: &str = "camrtsp";

/// The RTSP control-plane server.
///
/// The session manager and stream registry are shared with the
/// integration layer, which wires camera sources into the registry and
/// tears everything down on shutdown.
pub struct RtspServer {
    bind_addr: String,
    sessions: SessionManager,
    streams: StreamRegistry,
    credentials: Option<(String, String)>,
}

impl RtspServer {
    pub fn new(
        bind_addr: &str,
        sessions: SessionManager,
        streams: StreamRegistry,
        credentials: Option<(String, String)>,
    ) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            sessions,
            streams,
            credentials,
        }
    }

    /// Bind the listening socket.
    ///
    /// A bind failure is fatal — it surfaces to the integration layer and
    /// the server never comes up. Everything after binding is handled
    /// per-connection.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| RtspError::Bind {
                addr: self.bind_addr.clone(),
                source: e,
            })?;
        tracing::info!(addr = %self.bind_addr, "RTSP server listening");
        Ok(listener)
    }

    /// Bind and serve until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections on an already-bound listener until `shutdown`
    /// flips to true.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let sweeper = tokio::spawn(sweep_loop(
            self.sessions.clone(),
            self.streams.clone(),
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                Connection::handle(server, socket, peer).await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "TCP accept error"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        sweeper.abort();
        tracing::info!("RTSP server stopped");
    }
}

/// Expire idle sessions and release their stream subscriptions.
async fn sweep_loop(
    sessions: SessionManager,
    streams: StreamRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = shutdown.changed() => return,
        }
        for session in sessions.expired() {
            tracing::info!(session_id = %session.id(), "session expired, tearing down");
            streams.unsubscribe_all(session.id());
            sessions.remove(session.id());
        }
    }
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    server: Arc<RtspServer>,
    reader: BufReader<OwnedReadHalf>,
    writer: SharedTcpWriter,
    peer: SocketAddr,
    /// Server-side IP of this connection, advertised in SDP origin lines.
    local_ip: String,
    /// Session IDs created on this connection, cleaned up on disconnect.
    session_ids: Vec<String>,
    /// Session to subscribe to its stream once the current response has
    /// been written. Media (preamble, access units) must not reach an
    /// interleaved connection ahead of the PLAY response.
    subscribe_after_response: Option<Arc<crate::session::Session>>,
}

impl Connection {
    async fn handle(server: Arc<RtspServer>, socket: tokio::net::TcpStream, peer: SocketAddr) {
        tracing::info!(%peer, "client connected");
        let local_ip = socket
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| "0.0.0.0".to_string());
        let (read_half, write_half) = socket.into_split();

        let mut conn = Connection {
            server,
            reader: BufReader::new(read_half),
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            peer,
            local_ip,
            session_ids: Vec::new(),
            subscribe_after_response: None,
        };

        let reason = conn.run().await;
        conn.cleanup();
        tracing::info!(%peer, reason, "client disconnected");
    }

    /// Request/response loop. Returns the reason for exiting.
    ///
    /// Read and write errors here are the normal way clients leave
    /// (hard-close, reset); they tear down this connection's sessions and
    /// never propagate further.
    async fn run(&mut self) -> &'static str {
        loop {
            let first = match self.reader.read_u8().await {
                Ok(b) => b,
                Err(_) => return "connection closed by client",
            };

            // Interleaved data from the client ('$'-framed, usually RTCP
            // receiver reports): length-framed, read and discarded.
            if first == 0x24 {
                if self.discard_interleaved().await.is_err() {
                    return "read error in interleaved frame";
                }
                continue;
            }

            let text = match self.read_request_text(first).await {
                Ok(Some(text)) => text,
                Ok(None) => return "connection closed by client",
                Err(_) => return "read error",
            };
            if text.trim().is_empty() {
                continue;
            }

            let body = match self.read_body(&text).await {
                Ok(body) => body,
                Err(_) => return "read error in body",
            };

            let response = match RtspRequest::parse(&text, body) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );
                    self.dispatch(&request).await
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "unparseable request");
                    let status = match e {
                        RtspError::Parse {
                            kind: ParseErrorKind::UnsupportedVersion,
                        } => 505,
                        _ => 400,
                    };
                    RtspResponse::new(status).add_header("CSeq", cseq_of(&text).unwrap_or("0"))
                }
            };

            tracing::debug!(peer = %self.peer, status = response.status_code, "response");
            let bytes = response.serialize();
            {
                let mut writer = self.writer.lock().await;
                if writer.write_all(bytes.as_bytes()).await.is_err() {
                    return "write error";
                }
            }

            if let Some(session) = self.subscribe_after_response.take() {
                self.start_fanout(session);
            }
        }
    }

    /// Subscribe a now-playing session to its stream and queue the
    /// late-join parameter-set preamble.
    fn start_fanout(&self, session: Arc<crate::session::Session>) {
        if let Some(config) = self.server.streams.get_by_stream_id(&session.stream_id) {
            config.subscribe(session.clone());
            if let Some((sps, pps)) = config.parameter_sets() {
                session.deliver(MediaFrame::Preamble { sps, pps });
            }
        }
    }

    /// Read one `$`-framed packet (channel byte + u16 length + payload)
    /// and throw it away.
    async fn discard_interleaved(&mut self) -> std::io::Result<()> {
        let _channel = self.reader.read_u8().await?;
        let len = self.reader.read_u16().await? as usize;
        let mut sink = vec![0u8; len];
        self.reader.read_exact(&mut sink).await?;
        Ok(())
    }

    /// Read request line + headers up to the blank line. `first` is the
    /// already-consumed first byte of the request line.
    async fn read_request_text(&mut self, first: u8) -> std::io::Result<Option<String>> {
        let mut text = String::new();
        text.push(first as char);

        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(None);
            }
            text.push_str(&line);
            if line == "\r\n" || line == "\n" {
                return Ok(Some(text));
            }
            if text.len() > MAX_REQUEST_SIZE {
                return Err(std::io::Error::other("request exceeds size cap"));
            }
        }
    }

    /// Read the request body, sized by the `Content-Length` header.
    async fn read_body(&mut self, header_text: &str) -> std::io::Result<Vec<u8>> {
        let length = header_text
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        if length == 0 {
            return Ok(Vec::new());
        }
        if length > MAX_REQUEST_SIZE {
            return Err(std::io::Error::other("body exceeds size cap"));
        }
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        Ok(body)
    }

    async fn dispatch(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        // Everything except OPTIONS requires credentials when configured.
        if request.method != "OPTIONS" {
            if let Err(response) = self.check_auth(request, cseq) {
                return response;
            }
        }

        match request.method.as_str() {
            "OPTIONS" => RtspResponse::ok()
                .add_header("CSeq", cseq)
                .add_header("Public", PUBLIC_METHODS),
            "DESCRIBE" => self.handle_describe(cseq, request).await,
            "SETUP" => self.handle_setup(cseq, request).await,
            "PLAY" => self.handle_play(cseq, request).await,
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" | "SET_PARAMETER" => self.handle_keepalive(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::new(501).add_header("CSeq", cseq)
            }
        }
    }

    /// Validate Basic credentials; on failure produce the 401 challenge.
    fn check_auth(
        &self,
        request: &RtspRequest,
        cseq: &str,
    ) -> std::result::Result<(), RtspResponse> {
        let Some((user, pass)) = &self.server.credentials else {
            return Ok(());
        };

        let authorized = request
            .get_header("Authorization")
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| BASE64.decode(encoded.trim()).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|creds| {
                let (u, p) = creds.split_once(':')?;
                Some(u == user && p == pass)
            })
            .unwrap_or(false);

        if authorized {
            Ok(())
        } else {
            tracing::debug!(peer = %self.peer, "rejecting unauthenticated request");
            Err(RtspResponse::new(401).add_header("CSeq", cseq).add_header(
                "WWW-Authenticate",
                &format!("Basic realm=\"{}\"", AUTH_REALM),
            ))
        }
    }

    async fn handle_describe(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(config) = self.server.streams.resolve_from_uri(&request.uri) else {
            tracing::debug!(uri = %request.uri, "DESCRIBE for unknown mount");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        // Without parameter sets the SDP would lack sprop-parameter-sets,
        // and clients cache descriptions; refuse until the encoder has
        // produced them.
        let Some((sps, pps)) = config.parameter_sets() else {
            tracing::debug!(stream_id = %config.stream_id, "DESCRIBE before SPS/PPS known");
            return RtspResponse::new(503)
                .add_header("CSeq", cseq)
                .add_header("Retry-After", "2");
        };

        let sdp = sdp::generate_sdp(&sdp::SdpParams {
            stream_id: &config.stream_id,
            server_ip: &self.local_ip,
            origin_id: 0,
            origin_version: config.sdp_version(),
            sps: &sps,
            pps: &pps,
            audio: config.audio,
        });

        let content_base = if request.uri.ends_with('/') {
            request.uri.clone()
        } else {
            format!("{}/", request.uri)
        };
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &content_base)
            .with_body(sdp)
    }

    async fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let spec = match TransportSpec::parse(transport_header) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(%cseq, transport_header, error = %e, "unusable Transport header");
                return RtspResponse::new(461).add_header("CSeq", cseq);
            }
        };

        let Some(config) = self.server.streams.resolve_from_uri(&request.uri) else {
            tracing::debug!(uri = %request.uri, "SETUP for unknown mount");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let (track, payload_type) = match stream::track_id_from_uri(&request.uri) {
            Some(1) => match config.audio {
                Some(codec) => (TrackKind::Audio, codec.payload_type()),
                None => {
                    tracing::debug!(stream_id = %config.stream_id, "SETUP for absent audio track");
                    return RtspResponse::not_found().add_header("CSeq", cseq);
                }
            },
            _ => (TrackKind::Video, PAYLOAD_TYPE_H264),
        };

        // Aggregate setup: a Session header continues an existing session,
        // otherwise a new one is created. The session stores the RESOLVED
        // stream_id — the fanout routes on it, not on the URL text the
        // client sent.
        let session = match request.session_id() {
            Some(id) => match self.server.sessions.get(id) {
                Some(session) => session,
                None => {
                    return RtspResponse::session_not_found().add_header("CSeq", cseq);
                }
            },
            None => {
                let session = self.server.sessions.create(&config.stream_id, self.peer);
                self.session_ids.push(session.id().to_string());
                session
            }
        };

        let (server_ports, ssrc) = match session
            .add_channel(track, payload_type, &spec, self.writer.clone())
            .await
        {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(error = %e, "failed to allocate RTP channel");
                return RtspResponse::new(500).add_header("CSeq", cseq);
            }
        };

        tracing::info!(
            session_id = %session.id(),
            stream_id = %config.stream_id,
            uri = %request.uri,
            track = track.track_id(),
            interleaved = spec.is_interleaved(),
            "track set up"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &spec.response_header(server_ports, ssrc))
            .add_header("Session", &session.session_header_value())
    }

    async fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.lookup_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if session.state() == SessionState::Init {
            return RtspResponse::new(455)
                .add_header("CSeq", cseq)
                .add_header("Allow", "SETUP, TEARDOWN");
        }

        let base_url = request
            .uri
            .split("/trackID=")
            .next()
            .unwrap_or(&request.uri)
            .trim_end_matches('/');
        let rtp_info = session.rtp_info(base_url).await;

        session.set_state(SessionState::Playing);
        // Subscription happens after the PLAY response is on the wire, so
        // interleaved media cannot jump ahead of it.
        self.subscribe_after_response = Some(session.clone());
        tracing::info!(session_id = %session.id(), stream_id = %session.stream_id, "session playing");

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.lookup_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if session.state() == SessionState::Init {
            return RtspResponse::new(455).add_header("CSeq", cseq);
        }

        session.set_state(SessionState::Ready);
        self.server.streams.unsubscribe_all(session.id());
        tracing::info!(session_id = %session.id(), "session paused");

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.lookup_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        let id = session.id().to_string();
        self.server.streams.unsubscribe_all(&id);
        self.server.sessions.remove(&id);
        self.session_ids.retain(|owned| owned != &id);
        tracing::info!(session_id = %id, "session terminated via TEARDOWN");

        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// GET_PARAMETER / SET_PARAMETER with an empty body is the standard
    /// keepalive (RFC 2326 §10.8); the lookup refreshes `last_activity`.
    fn handle_keepalive(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let mut response = RtspResponse::ok().add_header("CSeq", cseq);
        if let Some(session) = self.lookup_session(request) {
            response = response.add_header("Session", &session.session_header_value());
        }
        response
    }

    fn lookup_session(&self, request: &RtspRequest) -> Option<Arc<crate::session::Session>> {
        self.server.sessions.get(request.session_id()?)
    }

    /// Remove sessions owned by this connection and their subscriptions.
    fn cleanup(&self) {
        for id in &self.session_ids {
            self.server.streams.unsubscribe_all(id);
            self.server.sessions.remove(id);
        }
        if !self.session_ids.is_empty() {
            tracing::info!(
                peer = %self.peer,
                removed = self.session_ids.len(),
                "cleaned up sessions on disconnect"
            );
        }
    }
}

fn cseq_of(header_text: &str) -> Option<&str> {
    header_text.lines().find_map(|l| {
        let (name, value) = l.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("cseq")
            .then(|| value.trim())
    })
}
