#![allow(dead_code)] // Each test binary uses a different slice of these helpers

use anyhow::{Result, anyhow};
use ffpolicy::engine::core::{CommandDescriptor, CropRect, Resolution};
use ffpolicy::engine::hardware::{CpuInfo, GpuInfo, GpuVendor, HardwareProfile, classify_device};
use ffpolicy::engine::probe::{MediaProbeResult, ProbeError, StreamInfo, StreamKind};
use ffpolicy::engine::tools::MediaTools;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const RENDER_NODE: &str = "/dev/dri/renderD128";

/// Hardware profile with a single GPU and the given ffmpeg encoders
pub fn profile_with(vendor_id: u16, device_id: u16, encoders: &[&str]) -> HardwareProfile {
    let gpu = GpuInfo {
        card: "card0".to_string(),
        vendor: GpuVendor::from_pci_id(vendor_id),
        vendor_id,
        device_id,
        generation: classify_device(vendor_id, device_id),
        model: "test gpu".to_string(),
        driver: None,
        render_device: Some(PathBuf::from(RENDER_NODE)),
    };
    let encoders: BTreeSet<String> = encoders.iter().map(|s| s.to_string()).collect();
    HardwareProfile::from_parts(
        CpuInfo {
            model: "test cpu".to_string(),
            core_count: 8,
            feature_flags: BTreeSet::new(),
        },
        vec![gpu],
        &encoders,
    )
}

/// Intel Arc A770 with QSV and VA-API builds of every codec
pub fn intel_arc() -> HardwareProfile {
    profile_with(
        0x8086,
        0x56a0,
        &[
            "h264_qsv", "hevc_qsv", "av1_qsv", "vp9_qsv", "h264_vaapi", "hevc_vaapi", "av1_vaapi",
            "vp9_vaapi",
        ],
    )
}

pub fn stream(index: u32, kind: StreamKind, codec: &str, language: Option<&str>) -> StreamInfo {
    StreamInfo {
        index,
        kind,
        codec: codec.to_string(),
        bitrate: None,
        language: language.map(str::to_string),
        attached_pic: false,
        channels: (kind == StreamKind::Audio).then_some(2),
    }
}

/// Twenty-minute 1080p file: one video, one English AAC track, one SubRip track
pub fn probe_1080p(codec: &str, bit_depth: u8, video_bps: Option<u64>) -> MediaProbeResult {
    let mut video = stream(0, StreamKind::Video, codec, None);
    video.bitrate = video_bps;
    let mut audio = stream(1, StreamKind::Audio, "aac", Some("eng"));
    audio.bitrate = Some(128_000);

    MediaProbeResult {
        duration_seconds: 1200.0,
        resolution: Resolution::new(1920, 1080),
        current_codec: codec.to_string(),
        current_video_bitrate_bps: video_bps,
        has_hdr: false,
        bit_depth,
        fps: Some(23.976),
        pix_fmt: Some(if bit_depth > 8 { "yuv420p10le" } else { "yuv420p" }.to_string()),
        color_primaries: None,
        color_transfer: None,
        color_space: None,
        file_size_bytes: 1_000_000_000,
        format_bitrate_bps: None,
        streams: vec![video, audio, stream(2, StreamKind::Subtitle, "subrip", Some("eng"))],
    }
}

/// Write a file of `size` bytes so the validator sees something real on disk
pub fn media_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, vec![0u8; size]).expect("write fixture");
    path
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Ok(MediaProbeResult),
    Timeout,
    Rejected(String),
    Io,
}

/// Scripted stand-in for ffprobe/ffmpeg
pub struct FakeTools {
    pub probe: ProbeOutcome,
    /// Bytes the sample encode "produces"; None makes the sample fail
    pub sample_bytes: Option<u64>,
    pub crop: Option<CropRect>,
    pub probe_calls: Cell<u32>,
    pub sample_commands: RefCell<Vec<CommandDescriptor>>,
}

impl FakeTools {
    pub fn new(probe: MediaProbeResult) -> Self {
        Self::with_outcome(ProbeOutcome::Ok(probe))
    }

    pub fn with_outcome(probe: ProbeOutcome) -> Self {
        Self {
            probe,
            sample_bytes: None,
            crop: None,
            probe_calls: Cell::new(0),
            sample_commands: RefCell::new(Vec::new()),
        }
    }

    pub fn sample_bytes(mut self, bytes: u64) -> Self {
        self.sample_bytes = Some(bytes);
        self
    }

    pub fn crop(mut self, rect: CropRect) -> Self {
        self.crop = Some(rect);
        self
    }
}

impl MediaTools for FakeTools {
    fn probe(&self, _path: &Path, timeout: Duration) -> Result<MediaProbeResult, ProbeError> {
        self.probe_calls.set(self.probe_calls.get() + 1);
        match &self.probe {
            ProbeOutcome::Ok(probe) => Ok(probe.clone()),
            ProbeOutcome::Timeout => Err(ProbeError::Timeout(timeout)),
            ProbeOutcome::Rejected(msg) => Err(ProbeError::Rejected(msg.clone())),
            ProbeOutcome::Io => Err(ProbeError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            ))),
        }
    }

    fn encode_sample(&self, command: &CommandDescriptor, _timeout: Duration) -> Result<u64> {
        self.sample_commands.borrow_mut().push(command.clone());
        self.sample_bytes
            .ok_or_else(|| anyhow!("sample encode failed: Conversion failed!"))
    }

    fn detect_crop(
        &self,
        _path: &Path,
        _probe: &MediaProbeResult,
        _timeout: Duration,
    ) -> Result<Option<CropRect>> {
        Ok(self.crop)
    }
}
