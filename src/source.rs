//! Media sources: per-camera ffmpeg transcoders and ALSA audio capture.
//!
//! Each camera gets a child process transcoding its feed (typically an
//! MJPEG endpoint) to Annex-B H.264 on stdout. A reader task splits the
//! byte stream into NAL units, assembles access units, caches SPS/PPS on
//! the stream, and fans the units out to playing sessions. A watchdog
//! restarts the child when stdout closes or stalls; restarts back off
//! from 1 s doubling up to 30 s.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{CameraConfig, ServerSettings};
use crate::error::RtspError;
use crate::media::h264::{
    nal_type, AccessUnitAssembler, AnnexBSplitter, NAL_TYPE_PPS, NAL_TYPE_SPS,
};
use crate::stream::StreamConfig;

/// Restart the child when stdout yields nothing for this long.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between SIGTERM and SIGKILL on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Hardware H.264 encoders, probed in preference order.
const HW_ENCODERS: &[&str] = &["h264_v4l2m2m", "h264_nvenc", "h264_qsv", "h264_nvmpi"];
const SW_ENCODER: &str = "libx264";

/// Pick the H.264 encoder: the first hardware encoder ffmpeg reports,
/// falling back to libx264. The choice is logged once.
pub async fn pick_encoder() -> String {
    let listed = Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .await
        .map(|out| String::from_utf8_lossy(&out.stdout).into_owned())
        .unwrap_or_default();

    for candidate in HW_ENCODERS {
        if listed.contains(candidate) {
            tracing::info!(encoder = candidate, "selected hardware H.264 encoder");
            return candidate.to_string();
        }
    }
    tracing::info!(encoder = SW_ENCODER, "no hardware encoder available, using software");
    SW_ENCODER.to_string()
}

/// Handle to a running source task; dropping it does not stop the source,
/// call [`stop`](Self::stop).
pub struct SourceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SourceHandle {
    /// Signal shutdown and wait for the task (and its child) to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the transcoder supervisor for one camera.
pub fn spawn_transcoder(
    camera: CameraConfig,
    settings: ServerSettings,
    encoder: String,
    stream: Arc<StreamConfig>,
) -> SourceHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(transcoder_supervisor(
        camera,
        settings,
        encoder,
        stream,
        shutdown_rx,
    ));
    SourceHandle {
        shutdown: shutdown_tx,
        task,
    }
}

async fn transcoder_supervisor(
    camera: CameraConfig,
    settings: ServerSettings,
    encoder: String,
    stream: Arc<StreamConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    // Synthesized PTS clock; runs across restarts so RTP timestamps stay
    // continuous for connected sessions.
    let epoch = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let started = Instant::now();
        match run_transcoder_once(&camera, &settings, &encoder, &stream, &mut shutdown, epoch)
            .await
        {
            Ok(()) => break, // shutdown requested
            Err(e) => {
                tracing::warn!(
                    stream_id = %stream.stream_id,
                    error = %e,
                    retry_in = ?backoff,
                    "transcoder stopped, restarting"
                );
            }
        }

        if *shutdown.borrow() {
            break;
        }
        // A run that survived for a while resets the backoff.
        if started.elapsed() > BACKOFF_CEILING {
            backoff = BACKOFF_INITIAL;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(BACKOFF_CEILING);
    }
    tracing::info!(stream_id = %stream.stream_id, "transcoder stopped");
}

/// One child lifetime: spawn, pump stdout until it closes/stalls or
/// shutdown is requested. `Ok(())` means shutdown; `Err` means restart.
async fn run_transcoder_once(
    camera: &CameraConfig,
    settings: &ServerSettings,
    encoder: &str,
    stream: &Arc<StreamConfig>,
    shutdown: &mut watch::Receiver<bool>,
    epoch: Instant,
) -> crate::error::Result<()> {
    let args = build_transcode_args(camera, settings, encoder);
    tracing::info!(
        stream_id = %stream.stream_id,
        command = %format!("ffmpeg {}", args.join(" ")),
        "starting transcoder"
    );

    let mut child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RtspError::Source(format!("failed to spawn ffmpeg: {}", e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| RtspError::Source("ffmpeg stdout not captured".into()))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_child_stderr(stderr, stream.stream_id.clone()));
    }

    let mut splitter = AnnexBSplitter::new();
    let mut assembler = AccessUnitAssembler::new();
    let mut buf = vec![0u8; 8192];

    let result = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
            }
            read = tokio::time::timeout(STALL_TIMEOUT, stdout.read(&mut buf)) => {
                match read {
                    Err(_) => break Err(RtspError::Source("no encoder output for 10s".into())),
                    Ok(Err(e)) => break Err(RtspError::Source(format!("stdout read: {}", e))),
                    Ok(Ok(0)) => break Err(RtspError::Source("encoder stdout closed".into())),
                    Ok(Ok(n)) => {
                        let pts = elapsed_90khz(epoch);
                        for nal in splitter.push(&buf[..n]) {
                            process_nal(stream, &mut assembler, nal, pts);
                        }
                    }
                }
            }
        }
    };

    if let Some(au) = assembler.take() {
        stream.broadcast_video(au);
    }
    graceful_stop(&mut child, &stream.stream_id).await;
    result
}

/// Route one NAL: cache parameter sets on the stream, feed the assembler,
/// and broadcast any access unit it completes.
fn process_nal(
    stream: &Arc<StreamConfig>,
    assembler: &mut AccessUnitAssembler,
    nal: Bytes,
    pts_90khz: u64,
) {
    match nal_type(&nal) {
        NAL_TYPE_SPS => {
            tracing::debug!(stream_id = %stream.stream_id, bytes = nal.len(), "captured SPS");
            if stream.update_sps(nal.clone()) {
                stream.announce_parameter_sets();
            }
        }
        NAL_TYPE_PPS => {
            tracing::debug!(stream_id = %stream.stream_id, bytes = nal.len(), "captured PPS");
            if stream.update_pps(nal.clone()) {
                stream.announce_parameter_sets();
            }
        }
        _ => {}
    }

    if let Some(au) = assembler.push(nal, pts_90khz) {
        stream.broadcast_video(au);
    }
}

fn elapsed_90khz(epoch: Instant) -> u64 {
    epoch.elapsed().as_micros() as u64 * 9 / 100
}

/// ffmpeg argument list for one camera's transcode.
fn build_transcode_args(
    camera: &CameraConfig,
    settings: &ServerSettings,
    encoder: &str,
) -> Vec<String> {
    let fps = camera.output_framerate();
    let bitrate = settings.video_bitrate;
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "info".into(),
        "-fflags".into(),
        "+genpts+nobuffer".into(),
        "-flags".into(),
        "low_delay".into(),
        "-probesize".into(),
        "32768".into(),
        "-analyzeduration".into(),
        "500000".into(),
    ];

    // Netcam passthrough sources declare their own format; local MJPEG
    // snapshot endpoints need it forced.
    if !camera.source_url.starts_with("rtsp://") {
        args.extend(["-f".into(), "mjpeg".into()]);
    }
    args.extend(["-i".into(), camera.source_url.clone()]);

    args.extend([
        "-an".into(),
        "-c:v".into(),
        encoder.into(),
        "-preset".into(),
        settings.video_preset.clone(),
        "-tune".into(),
        "zerolatency".into(),
        "-b:v".into(),
        format!("{}k", bitrate),
        "-maxrate".into(),
        format!("{}k", bitrate),
        "-bufsize".into(),
        format!("{}k", bitrate * 2),
        "-g".into(),
        (fps * 2).to_string(),
        "-keyint_min".into(),
        fps.to_string(),
        "-sc_threshold".into(),
        "0".into(),
        "-flags".into(),
        "+cgop".into(),
        "-r".into(),
        fps.to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ]);

    if encoder == SW_ENCODER {
        // Access-unit delimiters + repeated SPS/PPS keep the framer and
        // late joiners supplied with parameter sets.
        args.extend(["-x264-params".into(), "aud=1:repeat-headers=1".into()]);
    }

    args.extend([
        "-f".into(),
        "h264".into(),
        "-bsf:v".into(),
        "h264_mp4toannexb".into(),
        "pipe:1".into(),
    ]);
    args
}

/// Re-log the child's stderr: encoder warnings surface as warnings,
/// everything else at info.
async fn log_child_stderr(stderr: tokio::process::ChildStderr, stream_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let lower = line.to_ascii_lowercase();
        if ["error", "warning", "failed", "invalid"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            tracing::warn!(stream_id = %stream_id, "ffmpeg: {}", line);
        } else {
            tracing::info!(stream_id = %stream_id, "ffmpeg: {}", line);
        }
    }
}

/// Stop a child: SIGTERM, wait up to the grace period, then SIGKILL.
async fn graceful_stop(child: &mut Child, stream_id: &str) {
    if let Some(pid) = child.id() {
        // Ask politely first so ffmpeg can flush and exit.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
        tracing::warn!(stream_id, "child ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Spawn the audio capture supervisor for one camera's stream.
///
/// A second ffmpeg child reads the ALSA device and emits G.711 μ-law on
/// stdout; 20 ms chunks are fanned out to subscribers.
pub fn spawn_audio_capture(device: String, stream: Arc<StreamConfig>) -> SourceHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(audio_supervisor(device, stream, shutdown_rx));
    SourceHandle {
        shutdown: shutdown_tx,
        task,
    }
}

async fn audio_supervisor(
    device: String,
    stream: Arc<StreamConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_audio_once(&device, &stream, &mut shutdown).await {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(
                    stream_id = %stream.stream_id,
                    device = %device,
                    error = %e,
                    retry_in = ?backoff,
                    "audio capture stopped, restarting"
                );
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(BACKOFF_CEILING);
    }
}

async fn run_audio_once(
    device: &str,
    stream: &Arc<StreamConfig>,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::error::Result<()> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "warning",
            "-f",
            "alsa",
            "-i",
            device,
            "-ac",
            "1",
            "-ar",
            "8000",
            "-acodec",
            "pcm_mulaw",
            "-f",
            "mulaw",
            "pipe:1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RtspError::Source(format!("failed to spawn audio capture: {}", e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| RtspError::Source("audio stdout not captured".into()))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_child_stderr(stderr, stream.stream_id.clone()));
    }

    // 160 samples = 20 ms at 8 kHz, one RTP packet each.
    let mut chunk = [0u8; 160];
    let result = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
            }
            read = stdout.read_exact(&mut chunk) => {
                match read {
                    Ok(_) => stream.broadcast_audio(Bytes::copy_from_slice(&chunk)),
                    Err(e) => break Err(RtspError::Source(format!("audio read: {}", e))),
                }
            }
        }
    };

    graceful_stop(&mut child, &stream.stream_id).await;
    result
}

/// Enumerate ALSA capture devices by parsing `arecord -l`.
///
/// Lines look like:
/// `card 1: HD5000 [Microsoft LifeCam HD-5000], device 0: USB Audio [USB Audio]`
/// and become `("plughw:1,0", "Microsoft LifeCam HD-5000")`.
pub async fn detect_audio_devices() -> Vec<(String, String)> {
    let output = match Command::new("arecord")
        .arg("-l")
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        Ok(_) => return Vec::new(),
        Err(e) => {
            tracing::debug!(error = %e, "arecord not available, no audio devices");
            return Vec::new();
        }
    };

    let mut devices = Vec::new();
    for line in output.lines() {
        if let Some(dev) = parse_arecord_line(line.trim()) {
            if !devices.iter().any(|(id, _)| id == &dev.0) {
                tracing::info!(device = %dev.0, name = %dev.1, "detected audio capture device");
                devices.push(dev);
            }
        }
    }
    devices
}

fn parse_arecord_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("card ")?;
    let colon = rest.find(':')?;
    let card_num: u32 = rest[..colon].trim().parse().ok()?;
    let rest = &rest[colon + 1..];

    let desc_start = rest.find('[')?;
    let desc_end = rest.find(']')?;
    let desc = rest[desc_start + 1..desc_end].trim();

    let dev_part = rest[desc_end + 1..].trim_start_matches([',', ' ']);
    let dev_rest = dev_part.strip_prefix("device ")?;
    let dev_colon = dev_rest.find(':')?;
    let device_num: u32 = dev_rest[..dev_colon].trim().parse().ok()?;

    Some((format!("plughw:{},{}", card_num, device_num), desc.to_string()))
}

/// Resolve the capture device to use: the configured device when it
/// matches a detected one, else the first detected hardware device, else
/// `plughw:0,0`.
pub async fn select_audio_device(configured: Option<&str>) -> String {
    let devices = detect_audio_devices().await;

    if let Some(wanted) = configured.filter(|s| !s.trim().is_empty()) {
        if devices.iter().any(|(id, _)| id == wanted) {
            return wanted.to_string();
        }
        tracing::warn!(device = wanted, "configured audio device not detected, auto-selecting");
    }

    if let Some((id, name)) = devices.first() {
        tracing::info!(device = %id, name = %name, "auto-selected audio device");
        return id.clone();
    }
    "plughw:0,0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(url: &str) -> CameraConfig {
        CameraConfig {
            id: 1,
            name: None,
            source_url: url.to_string(),
            width: 1280,
            height: 720,
            framerate: 25,
            aliases: Vec::new(),
        }
    }

    #[test]
    fn mjpeg_source_forces_input_format() {
        let args = build_transcode_args(
            &camera("http://127.0.0.1:8082"),
            &ServerSettings::default(),
            SW_ENCODER,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f mjpeg -i http://127.0.0.1:8082"), "{}", joined);
        assert!(joined.contains("-x264-params aud=1:repeat-headers=1"));
        assert!(joined.contains("-bsf:v h264_mp4toannexb"));
        assert!(joined.ends_with("pipe:1"));
    }

    #[test]
    fn rtsp_source_passed_through() {
        let args = build_transcode_args(
            &camera("rtsp://10.0.0.9/live"),
            &ServerSettings::default(),
            "h264_nvenc",
        );
        let joined = args.join(" ");
        assert!(!joined.contains("-f mjpeg"));
        assert!(joined.contains("-i rtsp://10.0.0.9/live"));
        // x264 private options only apply to the software encoder.
        assert!(!joined.contains("x264-params"));
    }

    #[test]
    fn low_framerate_clamped_in_gop() {
        let mut cam = camera("http://x");
        cam.framerate = 3;
        let args = build_transcode_args(&cam, &ServerSettings::default(), SW_ENCODER);
        let g_idx = args.iter().position(|a| a == "-g").unwrap();
        assert_eq!(args[g_idx + 1], "20"); // 2 * clamped 10 fps
        let r_idx = args.iter().position(|a| a == "-r").unwrap();
        assert_eq!(args[r_idx + 1], "10");
    }

    #[test]
    fn arecord_line_parsing() {
        let line = "card 1: HD5000 [Microsoft LifeCam HD-5000], device 0: USB Audio [USB Audio]";
        assert_eq!(
            parse_arecord_line(line),
            Some(("plughw:1,0".to_string(), "Microsoft LifeCam HD-5000".to_string()))
        );
        assert_eq!(parse_arecord_line("**** List of CAPTURE Hardware Devices ****"), None);
        assert_eq!(parse_arecord_line(""), None);
    }
}
