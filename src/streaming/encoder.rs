//! Encoder process supervisor (C7). Spawns the configured encoder binary
//! with an argv built from an `EncodingProfile`, pipes its stdout to the
//! caller, drains stderr into `tracing`, and kills it on drop — mirroring
//! the teacher's `services/ffmpeg_wrapper.rs` lifecycle.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::errors::AppError;
use crate::models::{AudioCodecMode, ContainerMode, EncodingProfile, VideoCodecMode};

/// Builds the argv for the configured encoder binary from a profile and
/// an input URL, mirroring `services/ffmpeg_command_builder.rs`'s
/// approach of assembling flags in fixed, documented order rather than a
/// free-form template.
pub fn build_args(profile: &EncodingProfile, input_url: &str) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string(), "-loglevel".to_string(), "warning".to_string()];

    if profile.input_reconnect {
        args.extend([
            "-reconnect".to_string(),
            "1".to_string(),
            "-reconnect_streamed".to_string(),
            "1".to_string(),
            "-reconnect_delay_max".to_string(),
            "5".to_string(),
        ]);
    }

    args.extend(["-i".to_string(), input_url.to_string()]);

    match profile.video_codec {
        VideoCodecMode::Copy => args.extend(["-c:v".to_string(), "copy".to_string()]),
        VideoCodecMode::H264 => {
            args.extend([
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                profile.preset.clone(),
                "-g".to_string(),
                profile.gop_size.to_string(),
                "-keyint_min".to_string(),
                profile.keyframe_interval.to_string(),
            ]);
        }
    }

    match profile.audio_codec {
        AudioCodecMode::Copy => args.extend(["-c:a".to_string(), "copy".to_string()]),
        AudioCodecMode::Aac => args.extend(["-c:a".to_string(), "aac".to_string()]),
    }

    if profile.timestamp_strategy == "start_at_zero" {
        args.extend(["-avoid_negative_ts".to_string(), "make_zero".to_string()]);
    }

    let format = match profile.container {
        ContainerMode::Mpegts => "mpegts",
        ContainerMode::Mp4 => "mp4",
    };
    args.extend(["-f".to_string(), format.to_string(), "pipe:1".to_string()]);

    args
}

pub struct EncoderProcess {
    child: Child,
}

impl EncoderProcess {
    /// Spawns the encoder and returns a handle plus its stdout stream.
    /// `kill_on_drop` ensures an abandoned process (panic, early return)
    /// never outlives the caller.
    pub fn spawn(
        binary: &Path,
        profile: &EncodingProfile,
        input_url: &str,
    ) -> Result<(Self, impl AsyncRead + Unpin), AppError> {
        let args = build_args(profile, input_url);
        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::encoder(format!("failed to spawn {}: {e}", binary.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::encoder("encoder child has no stdout pipe"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        Ok((Self { child }, stdout))
    }

    /// Waits up to `grace` for the process to exit on its own (it may be
    /// reacting to the client disconnect already), then force-kills it.
    /// `kill_on_drop` on the underlying `Command` is the final backstop
    /// if even this is skipped. Default grace per §4.7 is 2s.
    pub async fn shutdown(mut self, grace: std::time::Duration) {
        let exited = tokio::time::timeout(grace, self.child.wait()).await;
        if exited.is_err() {
            let _ = self.child.kill().await;
        }
    }
}

/// Size in bytes of a single MPEG-TS packet: a 0x47 sync byte followed by
/// 187 bytes of payload.
const TS_PACKET_SIZE: usize = 188;
/// PID 0x1FFF is reserved by the MPEG-TS spec for null (stuffing) packets.
const NULL_PID_HIGH: u8 = 0x1F;
const NULL_PID_LOW: u8 = 0xFF;

/// Builds `count` null MPEG-TS packets (sync byte `0x47`, PID `0x1FFF`)
/// for the deferred-start keep-alive prologue (§4.7): some Plex clients
/// drop the connection if no bytes arrive within ~10s, so the gateway can
/// write a short run of these while the encoder is still warming up.
pub fn null_packets(count: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(count * TS_PACKET_SIZE);
    for _ in 0..count {
        buf.push(0x47);
        buf.push(NULL_PID_HIGH);
        buf.push(NULL_PID_LOW);
        buf.push(0x10); // no adaptation field, payload present, continuity counter 0
        buf.resize(buf.len() + TS_PACKET_SIZE - 4, 0xFF);
    }
    buf
}

/// Lines are accumulated and flushed as a single debug event at most once
/// per window, rather than one `tracing` event per line (§4.7 "stderr is
/// captured and rate-limited into the logger") — ffmpeg-style encoders are
/// chatty per-frame, and logging every line at scale drowns everything
/// else out. Mirrors the accumulation window in the teacher's
/// `ffmpeg_wrapper.rs` stderr monitor, minus its fallback/health bookkeeping
/// which has no counterpart here.
const STDERR_FLUSH_WINDOW: std::time::Duration = std::time::Duration::from_millis(500);

async fn drain_stderr<R: tokio::io::AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    let mut accumulated = Vec::new();
    let mut window = tokio::time::interval(STDERR_FLUSH_WINDOW);
    window.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => accumulated.push(line),
                Ok(None) => {
                    flush_stderr_lines(&mut accumulated);
                    break;
                }
                Err(e) => {
                    tracing::warn!("error reading encoder stderr: {e}");
                    break;
                }
            },
            _ = window.tick() => flush_stderr_lines(&mut accumulated),
        }
    }
}

fn flush_stderr_lines(accumulated: &mut Vec<String>) {
    if accumulated.is_empty() {
        return;
    }
    tracing::debug!(target: "encoder", lines = accumulated.len(), "{}", accumulated.join("\n"));
    accumulated.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_profile_uses_stream_copy() {
        let profile = EncodingProfile::default();
        let args = build_args(&profile, "http://upstream/stream");
        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
    }

    #[test]
    fn high_reliability_profile_forces_small_gop() {
        let profile = EncodingProfile::high_reliability();
        let args = build_args(&profile, "http://upstream/stream");
        assert!(args.windows(2).any(|w| w == ["-g", "25"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
    }

    #[test]
    fn reconnect_flags_only_present_when_enabled() {
        let mut profile = EncodingProfile::default();
        profile.input_reconnect = false;
        let args = build_args(&profile, "http://upstream/stream");
        assert!(!args.iter().any(|a| a == "-reconnect"));
    }

    #[test]
    fn null_packets_are_valid_ts_sync_bytes() {
        let buf = null_packets(4);
        assert_eq!(buf.len(), 4 * TS_PACKET_SIZE);
        for chunk in buf.chunks(TS_PACKET_SIZE) {
            assert_eq!(chunk[0], 0x47);
            assert_eq!(chunk[1] & 0x1F, NULL_PID_HIGH);
            assert_eq!(chunk[2], NULL_PID_LOW);
        }
    }
}
