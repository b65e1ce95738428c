//! Server and camera configuration.
//!
//! Loaded from a TOML file with a `[server]` table and one `[[camera]]`
//! block per camera:
//!
//! ```toml
//! [server]
//! port = 8554
//! audio_enabled = true
//!
//! [[camera]]
//! id = 2
//! name = "Garage"
//! source_url = "http://127.0.0.1:8082"
//! aliases = ["stream"]
//! ```
//!
//! Empty strings for `username`, `password`, and `audio_device` are
//! treated as absent — an empty device value must never survive into
//! stored configuration, it only means "auto-detect".

use serde::Deserialize;

use crate::error::{Result, RtspError};

/// Floor for the encoder output framerate; very slow capture rates are
/// clamped up so clients do not starve between frames.
pub const MIN_OUTPUT_FRAMERATE: u32 = 10;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default, rename = "camera")]
    pub cameras: Vec<CameraConfig>,
}

/// The `[server]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Start the RTSP server at all.
    pub enabled: bool,
    /// Listen port.
    pub port: u16,
    /// Bind address.
    pub listen: String,
    /// Authentication is required when both username and password are
    /// non-empty.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Include an audio track in every stream.
    pub audio_enabled: bool,
    /// ALSA capture device; `None`/empty means auto-detect.
    pub audio_device: Option<String>,
    /// H.264 encoder target bitrate in kbit/s.
    pub video_bitrate: u32,
    /// Encoder preset (ultrafast ... medium).
    pub video_preset: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8554,
            listen: "0.0.0.0".to_string(),
            username: None,
            password: None,
            audio_enabled: false,
            audio_device: None,
            video_bitrate: 2000,
            video_preset: "ultrafast".to_string(),
        }
    }
}

impl ServerSettings {
    /// `host:port` string to bind the RTSP listener to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }

    /// Credentials when auth is enabled (both parts non-empty).
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }
}

/// One `[[camera]]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    /// Capture endpoint. An `rtsp://` or `http://` URL is handed to the
    /// transcoder as-is (MJPEG endpoints are typical).
    pub source_url: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Extra mount paths besides `cam<id>`.
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_framerate() -> u32 {
    25
}

impl CameraConfig {
    /// Primary mount path / stream identifier.
    pub fn stream_id(&self) -> String {
        format!("cam{}", self.id)
    }

    /// All mount paths: `cam<id>` plus aliases.
    pub fn mount_paths(&self) -> Vec<String> {
        let mut paths = vec![self.stream_id()];
        for alias in &self.aliases {
            let alias = alias.trim_matches('/');
            if !alias.is_empty() && !paths.iter().any(|p| p == alias) {
                paths.push(alias.to_string());
            }
        }
        paths
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Camera {}", self.id))
    }

    /// Encoder output framerate, clamped to [`MIN_OUTPUT_FRAMERATE`].
    pub fn output_framerate(&self) -> u32 {
        self.framerate.max(MIN_OUTPUT_FRAMERATE)
    }
}

impl Config {
    /// Load and normalize a configuration file.
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RtspError::Config(format!("{}: {}", path, e)))?;
        Self::parse(&text)
    }

    /// Parse configuration text (TOML).
    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| RtspError::Config(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Collapse empty optional strings to `None`.
    fn normalize(&mut self) {
        for field in [
            &mut self.server.username,
            &mut self.server.password,
            &mut self.server.audio_device,
        ] {
            if field.as_deref().is_some_and(|s| s.trim().is_empty()) {
                *field = None;
            }
        }
    }
}
