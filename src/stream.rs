//! Stream registry: mount paths, parameter-set cache, subscriber fanout.
//!
//! One [`StreamConfig`] exists per camera stream. Several mount paths may
//! resolve to the same stream (`cam2`, `stream`, ...); sessions always
//! store the resolved `stream_id`, never the URL text the client sent,
//! so the fanout cannot be broken by alias mismatches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::media::h264::inject_parameter_sets;
use crate::media::{AccessUnit, AudioCodec, MediaFrame};
use crate::session::Session;

/// Cached H.264 parameter sets for a stream, raw bytes without start codes.
#[derive(Debug, Default, Clone)]
pub struct ParameterSets {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    pub fn complete(&self) -> Option<(Bytes, Bytes)> {
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => Some((sps.clone(), pps.clone())),
            _ => None,
        }
    }
}

/// One camera stream as served over RTSP.
///
/// Holds the codec description, the latest SPS/PPS from the encoder, and
/// the set of sessions currently playing. Created at startup for each
/// configured camera; lives until shutdown or camera removal.
pub struct StreamConfig {
    /// Stable stream identifier (`cam<N>`); what sessions route on.
    pub stream_id: String,
    /// Human-readable camera name (SDP consumers see the stream_id).
    pub name: String,
    /// URL paths that resolve to this stream.
    pub mount_paths: Vec<String>,
    /// Audio track carried alongside the H.264 video, when enabled.
    pub audio: Option<AudioCodec>,
    params: RwLock<ParameterSets>,
    /// Bumped whenever SPS/PPS change, so DESCRIBE regenerates the SDP
    /// (origin version) instead of serving a stale cached description.
    sdp_version: AtomicU64,
    subscribers: RwLock<HashMap<String, Arc<Session>>>,
}

impl StreamConfig {
    pub fn new(stream_id: &str, name: &str, mount_paths: Vec<String>, audio: Option<AudioCodec>) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            name: name.to_string(),
            mount_paths,
            audio,
            params: RwLock::new(ParameterSets::default()),
            sdp_version: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        })
    }

    /// Latest parameter sets, when both are known.
    pub fn parameter_sets(&self) -> Option<(Bytes, Bytes)> {
        self.params.read().complete()
    }

    /// SDP origin version; changes whenever the parameter sets do.
    pub fn sdp_version(&self) -> u64 {
        self.sdp_version.load(Ordering::Relaxed)
    }

    /// Record an SPS observed in the source stream.
    ///
    /// Returns true when this completed a previously-incomplete (SPS, PPS)
    /// pair — the caller then announces the preamble to playing sessions.
    pub fn update_sps(&self, sps: Bytes) -> bool {
        self.update_params(|p| p.sps = Some(sps))
    }

    /// Record a PPS observed in the source stream.
    pub fn update_pps(&self, pps: Bytes) -> bool {
        self.update_params(|p| p.pps = Some(pps))
    }

    fn update_params(&self, apply: impl FnOnce(&mut ParameterSets)) -> bool {
        let mut params = self.params.write();
        let was_complete = params.complete().is_some();
        apply(&mut params);
        let now_complete = params.complete().is_some();
        drop(params);

        self.sdp_version.fetch_add(1, Ordering::Relaxed);
        now_complete && !was_complete
    }

    /// Subscribe a playing session to this stream (called during PLAY).
    pub fn subscribe(&self, session: Arc<Session>) {
        let id = session.id().to_string();
        let inserted = self
            .subscribers
            .write()
            .insert(id.clone(), session)
            .is_none();
        if inserted {
            tracing::debug!(stream_id = %self.stream_id, session_id = %id, "session subscribed");
        }
    }

    /// Unsubscribe a session (PAUSE, TEARDOWN, disconnect, sweep).
    pub fn unsubscribe(&self, session_id: &str) {
        if self.subscribers.write().remove(session_id).is_some() {
            tracing::debug!(stream_id = %self.stream_id, session_id, "session unsubscribed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn subscribers(&self) -> Vec<Arc<Session>> {
        self.subscribers.read().values().cloned().collect()
    }

    /// Fan an access unit out to every playing subscriber.
    ///
    /// IDR units get the cached SPS/PPS prepended first, so decoders can
    /// resync at any keyframe regardless of when they joined. Delivery is
    /// best-effort per session; a full mailbox drops the unit for that
    /// session only.
    pub fn broadcast_video(&self, mut au: AccessUnit) {
        if au.is_idr {
            if let Some((sps, pps)) = self.parameter_sets() {
                inject_parameter_sets(&mut au, &sps, &pps);
            }
        }
        for session in self.subscribers() {
            session.deliver(MediaFrame::Video(au.clone()));
        }
    }

    /// Fan raw audio samples out to every playing subscriber.
    pub fn broadcast_audio(&self, samples: Bytes) {
        for session in self.subscribers() {
            session.deliver(MediaFrame::Audio(samples.clone()));
        }
    }

    /// Push the (SPS, PPS) preamble to all currently playing sessions.
    /// Used when parameter sets first become available after clients have
    /// already started playing, and after a source restart.
    pub fn announce_parameter_sets(&self) {
        let Some((sps, pps)) = self.parameter_sets() else {
            return;
        };
        for session in self.subscribers() {
            session.deliver(MediaFrame::Preamble {
                sps: sps.clone(),
                pps: pps.clone(),
            });
        }
    }
}

/// Registry of streams, keyed by mount path.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    mounts: Arc<RwLock<HashMap<String, Arc<StreamConfig>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream under all of its mount paths.
    pub fn register(&self, config: Arc<StreamConfig>) {
        let mut mounts = self.mounts.write();
        for path in &config.mount_paths {
            mounts.insert(path.clone(), config.clone());
        }
        tracing::info!(
            stream_id = %config.stream_id,
            mounts = ?config.mount_paths,
            "stream registered"
        );
    }

    /// Remove a stream from every mount path that points to it.
    pub fn unregister(&self, stream_id: &str) -> Option<Arc<StreamConfig>> {
        let mut mounts = self.mounts.write();
        let found = mounts
            .values()
            .find(|c| c.stream_id == stream_id)
            .cloned()?;
        mounts.retain(|_, c| c.stream_id != stream_id);
        tracing::info!(stream_id, "stream unregistered");
        Some(found)
    }

    /// Look up a stream by exact mount path.
    pub fn get(&self, mount_path: &str) -> Option<Arc<StreamConfig>> {
        self.mounts.read().get(mount_path).cloned()
    }

    /// Look up a stream by its stable identifier.
    pub fn get_by_stream_id(&self, stream_id: &str) -> Option<Arc<StreamConfig>> {
        self.mounts
            .read()
            .values()
            .find(|c| c.stream_id == stream_id)
            .cloned()
    }

    /// Resolve an RTSP request URI to a stream.
    ///
    /// The mount path is matched exactly; an unknown path resolves to
    /// nothing and the caller answers 404. Streams that should be
    /// reachable under several names list them as aliases.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<StreamConfig>> {
        self.get(mount_path_from_uri(uri))
    }

    /// Unsubscribe a session from every stream (disconnect cleanup).
    pub fn unsubscribe_all(&self, session_id: &str) {
        for config in self.mounts.read().values() {
            config.unsubscribe(session_id);
        }
    }

    /// Distinct registered streams.
    pub fn streams(&self) -> Vec<Arc<StreamConfig>> {
        let mut seen = Vec::new();
        let mut out: Vec<Arc<StreamConfig>> = Vec::new();
        for config in self.mounts.read().values() {
            if !seen.contains(&config.stream_id) {
                seen.push(config.stream_id.clone());
                out.push(config.clone());
            }
        }
        out
    }
}

/// Extract the mount path from an RTSP request URI.
///
/// `rtsp://host:8554/cam2/trackID=0` → `cam2`
/// `rtsp://host:8554/cam2`           → `cam2`
/// `/cam2`                           → `cam2`
/// `*` stays `*` and never matches a mount.
pub fn mount_path_from_uri(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash + 1..],
            None => "",
        }
    } else {
        uri.trim_start_matches('/')
    };

    let path = match path.find("/trackID=") {
        Some(pos) => &path[..pos],
        None => path,
    };
    path.trim_end_matches('/').trim_start_matches('/')
}

/// Extract the numeric track id from a SETUP URI, when present.
pub fn track_id_from_uri(uri: &str) -> Option<u8> {
    let idx = uri.find("trackID=")?;
    uri[idx + "trackID=".len()..]
        .split(['/', '?'])
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_path_extraction() {
        assert_eq!(mount_path_from_uri("rtsp://localhost:8554/cam2"), "cam2");
        assert_eq!(
            mount_path_from_uri("rtsp://localhost:8554/cam2/trackID=0"),
            "cam2"
        );
        assert_eq!(mount_path_from_uri("/cam2"), "cam2");
        assert_eq!(mount_path_from_uri("rtsp://10.0.0.1:8554"), "");
        assert_eq!(mount_path_from_uri("*"), "*");
    }

    #[test]
    fn track_id_extraction() {
        assert_eq!(track_id_from_uri("rtsp://h/cam2/trackID=0"), Some(0));
        assert_eq!(track_id_from_uri("rtsp://h/cam2/trackID=1"), Some(1));
        assert_eq!(track_id_from_uri("rtsp://h/cam2"), None);
    }

    #[test]
    fn alias_resolves_to_same_stream() {
        let registry = StreamRegistry::new();
        let config = StreamConfig::new(
            "cam2",
            "Garage",
            vec!["cam2".to_string(), "stream".to_string()],
            None,
        );
        registry.register(config);

        let a = registry.resolve_from_uri("rtsp://h:8554/cam2").unwrap();
        let b = registry.resolve_from_uri("rtsp://h:8554/stream").unwrap();
        assert_eq!(a.stream_id, "cam2");
        assert_eq!(b.stream_id, "cam2");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_path_never_resolves() {
        let registry = StreamRegistry::new();
        registry.register(StreamConfig::new("cam1", "Cam", vec!["cam1".into()], None));
        // Even with a single registered stream, unknown paths are not
        // guessed — clients get 404.
        assert!(registry.resolve_from_uri("rtsp://h/anything").is_none());
        assert!(registry.resolve_from_uri("rtsp://h/cam1").is_some());

        registry.register(StreamConfig::new("cam2", "Cam2", vec!["cam2".into()], None));
        assert!(registry.resolve_from_uri("rtsp://h/anything").is_none());
        assert!(registry.resolve_from_uri("rtsp://h/cam2").is_some());
    }

    #[test]
    fn unregister_removes_all_mounts() {
        let registry = StreamRegistry::new();
        registry.register(StreamConfig::new(
            "cam1",
            "Cam",
            vec!["cam1".into(), "alias".into()],
            None,
        ));
        assert!(registry.unregister("cam1").is_some());
        assert!(registry.get("cam1").is_none());
        assert!(registry.get("alias").is_none());
        assert!(registry.unregister("cam1").is_none());
    }

    #[test]
    fn parameter_set_completion_reported_once() {
        let config = StreamConfig::new("cam1", "Cam", vec!["cam1".into()], None);
        let v0 = config.sdp_version();
        assert!(!config.update_sps(Bytes::from_static(&[0x67, 0x42])));
        assert!(config.update_pps(Bytes::from_static(&[0x68, 0xCE])));
        // A repeated SPS does not re-announce completion but does bump the
        // SDP version.
        assert!(!config.update_sps(Bytes::from_static(&[0x67, 0x43])));
        assert!(config.sdp_version() > v0);
        let (sps, _pps) = config.parameter_sets().unwrap();
        assert_eq!(&sps[..], &[0x67, 0x43]);
    }
}
