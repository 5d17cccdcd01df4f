// Input probing using ffprobe

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::engine::core::{Resolution, run_with_timeout};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),
    #[error("ffprobe rejected the file: {0}")]
    Rejected(String),
    #[error("failed to run ffprobe: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse ffprobe output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Attachment,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    /// Absolute stream index in the input (for `-map 0:<index>`)
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub bitrate: Option<u64>,
    pub language: Option<String>,
    /// Cover art and thumbnails carry the attached_pic disposition
    pub attached_pic: bool,
    pub channels: Option<u32>,
}

/// Still-image codecs that never count as the main video stream
const STILL_IMAGE_CODECS: &[&str] = &["png", "bmp", "gif", "webp", "tiff"];

impl StreamInfo {
    /// Real video, not cover art or an embedded still
    pub fn is_primary_video_candidate(&self) -> bool {
        self.kind == StreamKind::Video
            && !self.attached_pic
            && !STILL_IMAGE_CODECS.contains(&self.codec.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaProbeResult {
    pub duration_seconds: f64,
    pub resolution: Resolution,
    /// ffprobe codec name of the main video stream (may be a legacy codec)
    pub current_codec: String,
    pub current_video_bitrate_bps: Option<u64>,
    pub has_hdr: bool,
    pub bit_depth: u8,
    pub fps: Option<f64>,
    pub pix_fmt: Option<String>,
    pub color_primaries: Option<String>,
    pub color_transfer: Option<String>,
    pub color_space: Option<String>,
    pub file_size_bytes: u64,
    pub format_bitrate_bps: Option<u64>,
    pub streams: Vec<StreamInfo>,
}

impl MediaProbeResult {
    /// Main video stream: first video stream that is not an attachment or still image
    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.is_primary_video_candidate())
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.kind == StreamKind::Audio)
    }

    pub fn subtitle_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.kind == StreamKind::Subtitle)
    }

    pub fn has_attachments(&self) -> bool {
        self.streams.iter().any(|s| s.kind == StreamKind::Attachment)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    bit_rate: Option<String>,
    bits_per_raw_sample: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    color_primaries: Option<String>,
    color_transfer: Option<String>,
    color_space: Option<String>,
    channels: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    disposition: FfprobeDisposition,
    #[serde(default)]
    tags: BTreeMap<String, serde_json::Value>,
}

impl FfprobeStream {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v.as_str())
    }

    /// Stream bitrate from the stream header, else the Matroska statistics tags
    fn bitrate(&self) -> Option<u64> {
        self.bit_rate
            .as_deref()
            .and_then(parse_u64)
            .or_else(|| self.tag("BPS").and_then(parse_u64))
            .or_else(|| self.tag("BPS-eng").and_then(parse_u64))
    }

    fn kind(&self) -> StreamKind {
        match self.codec_type.as_deref() {
            Some("video") => StreamKind::Video,
            Some("audio") => StreamKind::Audio,
            Some("subtitle") => StreamKind::Subtitle,
            Some("attachment") => StreamKind::Attachment,
            _ => StreamKind::Data,
        }
    }

    fn bit_depth(&self) -> u8 {
        if let Some(bits) = self
            .bits_per_raw_sample
            .as_deref()
            .and_then(|b| b.parse::<u8>().ok())
            .filter(|b| *b > 0)
        {
            return bits;
        }
        self.pix_fmt.as_deref().and_then(pix_fmt_depth).unwrap_or(8)
    }
}

/// Component depth encoded in an ffmpeg pixel format name.
///
/// High bit depth formats spell it as a suffix (`yuv420p10le`, `gbrp12`,
/// `gray16be`) or, for semi-planar layouts, in the name (`p010le`, `p216`).
/// Plain names such as `yuv410p` or `nv12` carry no depth and yield `None`.
fn pix_fmt_depth(fmt: &str) -> Option<u8> {
    let base = fmt
        .strip_suffix("le")
        .or_else(|| fmt.strip_suffix("be"))
        .unwrap_or(fmt);

    let digits = if let Some(layout) = base.strip_prefix('p').filter(|d| d.len() == 3) {
        // p010, p016, p210, p416: last two digits are the depth
        layout.get(1..)?
    } else if let Some(rest) = base.strip_prefix("gray") {
        rest
    } else {
        base.rsplit_once('p')?.1
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u8>().ok().filter(|d| (9..=16).contains(d))
}

fn parse_u64(s: &str) -> Option<u64> {
    s.trim().parse::<u64>().ok()
}

fn parse_f64(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a fraction string like "30000/1001" to f64
fn parse_fraction(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 2 {
        return None;
    }

    let numerator: f64 = parts[0].parse().ok()?;
    let denominator: f64 = parts[1].parse().ok()?;

    if denominator == 0.0 {
        return None;
    }

    Some(numerator / denominator)
}

/// Transfer characteristics that mark HDR content (PQ and HLG)
fn is_hdr_transfer(transfer: &str) -> bool {
    matches!(transfer, "smpte2084" | "arib-std-b67")
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output
pub fn parse_probe_output(json: &str) -> Result<MediaProbeResult, ProbeError> {
    let probe: FfprobeOutput =
        serde_json::from_str(json).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let format = probe.format.as_ref();
    let streams: Vec<StreamInfo> = probe
        .streams
        .iter()
        .map(|s| StreamInfo {
            index: s.index,
            kind: s.kind(),
            codec: s.codec_name.clone().unwrap_or_default(),
            bitrate: s.bitrate(),
            language: s.tag("language").map(str::to_string),
            attached_pic: s.disposition.attached_pic != 0,
            channels: s.channels,
        })
        .collect();

    let mut result = MediaProbeResult {
        file_size_bytes: format
            .and_then(|f| f.size.as_deref())
            .and_then(parse_u64)
            .unwrap_or(0),
        format_bitrate_bps: format.and_then(|f| f.bit_rate.as_deref()).and_then(parse_u64),
        bit_depth: 8,
        ..MediaProbeResult::default()
    };

    let video = streams
        .iter()
        .position(|s| s.is_primary_video_candidate())
        .map(|pos| &probe.streams[pos]);

    if let Some(video) = video {
        result.resolution = Resolution::new(video.width.unwrap_or(0), video.height.unwrap_or(0));
        result.current_codec = video.codec_name.clone().unwrap_or_default();
        result.current_video_bitrate_bps = video.bitrate();
        result.bit_depth = video.bit_depth();
        result.fps = video
            .r_frame_rate
            .as_deref()
            .and_then(parse_fraction)
            .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_fraction))
            .filter(|fps| *fps > 0.0);
        result.pix_fmt = video.pix_fmt.clone();
        result.color_primaries = video.color_primaries.clone();
        result.color_transfer = video.color_transfer.clone();
        result.color_space = video.color_space.clone();
        result.has_hdr = video
            .color_transfer
            .as_deref()
            .map(is_hdr_transfer)
            .unwrap_or(false);
    }

    result.duration_seconds = format
        .and_then(|f| f.duration.as_deref())
        .and_then(parse_f64)
        .or_else(|| video.and_then(|v| v.duration.as_deref()).and_then(parse_f64))
        .unwrap_or(0.0);
    result.streams = streams;

    Ok(result)
}

/// Probe a media file with ffprobe, bounded by `timeout`
pub fn probe_media(path: &Path, timeout: Duration) -> Result<MediaProbeResult, ProbeError> {
    let mut cmd = Command::new("ffprobe");
    cmd.args([
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ])
    .arg(path);

    let output = run_with_timeout(&mut cmd, timeout)?.ok_or(ProbeError::Timeout(timeout))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Rejected(stderr.trim().to_string()));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    let result = parse_probe_output(&json_str)?;
    debug!(
        file = %path.display(),
        codec = %result.current_codec,
        resolution = %result.resolution,
        duration = result.duration_seconds,
        "probed media"
    );
    Ok(result)
}
