//! Wiring layer: cameras → sources → stream registry → RTSP server.
//!
//! [`start`] builds the process-wide singletons (session manager, stream
//! registry, server), registers every configured camera, spawns its
//! transcoder (and audio capture when enabled), and binds the listener.
//! [`Integration::stop`] reverses all of it: sources get SIGTERM then
//! SIGKILL, sessions are torn down, the listener closes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{CameraConfig, Config, ServerSettings};
use crate::error::{Result, RtspError};
use crate::media::AudioCodec;
use crate::server::RtspServer;
use crate::session::SessionManager;
use crate::source::{self, SourceHandle};
use crate::stream::{StreamConfig, StreamRegistry};

/// Running server plus everything needed to take it down again.
pub struct Integration {
    settings: ServerSettings,
    sessions: SessionManager,
    streams: StreamRegistry,
    sources: HashMap<String, Vec<SourceHandle>>,
    encoder: String,
    audio_device: Option<String>,
    shutdown: watch::Sender<bool>,
    server_task: JoinHandle<()>,
}

/// Snapshot of the server for status displays.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub running: bool,
    pub listen: String,
    pub port: u16,
    pub streams: Vec<String>,
    pub sessions: usize,
}

/// Start the RTSP server and all camera sources.
///
/// Fails fast when the listener cannot bind; camera sources that fail to
/// start keep retrying on their own and do not block startup.
pub async fn start(config: Config) -> Result<Integration> {
    let settings = config.server.clone();
    if !settings.enabled {
        return Err(RtspError::Config("server disabled in configuration".into()));
    }

    let sessions = SessionManager::new();
    let streams = StreamRegistry::new();

    let encoder = source::pick_encoder().await;
    let audio_device = if settings.audio_enabled {
        Some(source::select_audio_device(settings.audio_device.as_deref()).await)
    } else {
        None
    };

    let server = Arc::new(RtspServer::new(
        &settings.bind_addr(),
        sessions.clone(),
        streams.clone(),
        settings
            .credentials()
            .map(|(u, p)| (u.to_string(), p.to_string())),
    ));
    let listener = server.bind().await?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(listener, shutdown_rx));

    let mut integration = Integration {
        settings,
        sessions,
        streams,
        sources: HashMap::new(),
        encoder,
        audio_device,
        shutdown,
        server_task,
    };

    for camera in config.cameras {
        integration.add_camera(camera);
    }
    Ok(integration)
}

impl Integration {
    /// Register one camera: stream config, transcoder, optional audio.
    pub fn add_camera(&mut self, camera: CameraConfig) {
        let stream_id = camera.stream_id();
        if self.sources.contains_key(&stream_id) {
            tracing::warn!(stream_id, "camera already registered, skipping");
            return;
        }

        let audio = self.audio_device.as_ref().map(|_| AudioCodec::Pcmu);
        let stream = StreamConfig::new(
            &stream_id,
            &camera.display_name(),
            camera.mount_paths(),
            audio,
        );
        self.streams.register(stream.clone());

        let mut handles = vec![source::spawn_transcoder(
            camera,
            self.settings.clone(),
            self.encoder.clone(),
            stream.clone(),
        )];
        if let Some(device) = &self.audio_device {
            handles.push(source::spawn_audio_capture(device.clone(), stream.clone()));
        }
        self.sources.insert(stream_id.clone(), handles);

        tracing::info!(
            stream_id,
            url = %format!("rtsp://{}:{}/{}", self.settings.listen, self.settings.port, stream_id),
            "camera stream available"
        );
    }

    /// Unregister a camera: stop its sources and evict its sessions.
    pub async fn remove_camera(&mut self, camera_id: u32) {
        let stream_id = format!("cam{}", camera_id);
        let Some(handles) = self.sources.remove(&stream_id) else {
            return;
        };
        for handle in handles {
            handle.stop().await;
        }
        let _ = self.streams.unregister(&stream_id);
        for id in self.sessions.ids() {
            if let Some(session) = self.sessions.get(&id) {
                if session.stream_id == stream_id {
                    self.streams.unsubscribe_all(&id);
                    self.sessions.remove(&id);
                }
            }
        }
        tracing::info!(stream_id, "camera stream removed");
    }

    /// Stop everything: sources first (graceful child shutdown), then the
    /// listener, then all remaining sessions.
    pub async fn stop(mut self) {
        tracing::info!("stopping RTSP integration");
        for (_, handles) in self.sources.drain() {
            for handle in handles {
                handle.stop().await;
            }
        }

        let _ = self.shutdown.send(true);
        let _ = self.server_task.await;

        for id in self.sessions.ids() {
            self.streams.unsubscribe_all(&id);
            self.sessions.remove(&id);
        }
        tracing::info!("RTSP integration stopped");
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            running: !self.server_task.is_finished(),
            listen: self.settings.listen.clone(),
            port: self.settings.port,
            streams: self
                .streams
                .streams()
                .iter()
                .map(|s| s.stream_id.clone())
                .collect(),
            sessions: self.sessions.len(),
        }
    }

    /// RTSP URL for a registered stream.
    pub fn stream_url(&self, stream_id: &str) -> String {
        format!(
            "rtsp://{}:{}/{}",
            self.settings.listen, self.settings.port, stream_id
        )
    }
}
