//! Pipeline selection: mode + target codec + quality preset -> concrete encoder settings

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::core::types::{
    Backend, Codec, EncodingMode, QualityPreset, RateControl, RateControlSetting, Resolution,
    ResolutionTier,
};
use crate::engine::hardware::{EncoderApi, HardwareProfile, VideoEncoder};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("no encoder available for {codec} in {mode} mode (tried: {})", format_backends(.tried))]
    NoEncoderAvailable {
        codec: Codec,
        mode: EncodingMode,
        tried: Vec<Backend>,
    },
}

fn format_backends(backends: &[Backend]) -> String {
    backends
        .iter()
        .map(|b| b.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything the selector needs to know about one job
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionRequest {
    pub mode: EncodingMode,
    pub target_codec: Codec,
    pub quality_preset: QualityPreset,
    pub rate_control: RateControlSetting,
    pub prefer_secondary_backend: bool,
    pub software_fallback_allowed: bool,
    pub video_bitrate_bps: u64,
    pub max_bitrate_bps: u64,
    pub source_bit_depth: u8,
    pub preserve_bit_depth: bool,
    pub resolution: Resolution,
    pub fps: Option<f64>,
    pub forced: bool,
}

impl Default for SelectionRequest {
    fn default() -> Self {
        Self {
            mode: EncodingMode::Auto,
            target_codec: Codec::Hevc,
            quality_preset: QualityPreset::Balanced,
            rate_control: RateControlSetting::Auto,
            prefer_secondary_backend: false,
            software_fallback_allowed: false,
            video_bitrate_bps: 2_000_000,
            max_bitrate_bps: 4_000_000,
            source_bit_depth: 8,
            preserve_bit_depth: true,
            resolution: Resolution::new(1920, 1080),
            fps: None,
            forced: false,
        }
    }
}

impl SelectionRequest {
    fn wants_high_bit_depth(&self) -> bool {
        self.preserve_bit_depth && self.source_bit_depth > 8
    }
}

/// Concrete, immutable encoding choice for one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDescriptor {
    pub backend: Backend,
    pub codec: Codec,
    pub encoder: VideoEncoder,
    pub rate_control: RateControl,
    pub quality_preset: QualityPreset,
    pub bitrate_target: Option<u64>,
    pub bitrate_cap: Option<u64>,
    /// CRF / CQ / QP level for constant-quality modes
    pub quality_value: Option<u32>,
    pub encoder_preset: Option<&'static str>,
    pub two_pass: bool,
    pub scene_detection: bool,
    pub bit_depth: u8,
    pub profile: Option<&'static str>,
    pub level: Option<&'static str>,
    /// Encoder threads (software only)
    pub threads: Option<u32>,
    /// Render node for VA-API/QSV device initialisation
    pub device_path: Option<String>,
    pub forced: bool,
}

impl PipelineDescriptor {
    pub fn is_copy(&self) -> bool {
        self.codec == Codec::Copy
    }

    pub fn is_high_bit_depth(&self) -> bool {
        self.bit_depth > 8
    }

    pub fn api(&self) -> EncoderApi {
        self.encoder.api()
    }

    /// Video stream copy; bitrate and quality settings do not apply
    pub fn stream_copy(preset: QualityPreset, forced: bool) -> Self {
        Self {
            backend: Backend::CpuSoftware,
            codec: Codec::Copy,
            encoder: VideoEncoder::Copy,
            rate_control: RateControl::Vbr,
            quality_preset: preset,
            bitrate_target: None,
            bitrate_cap: None,
            quality_value: None,
            encoder_preset: None,
            two_pass: false,
            scene_detection: false,
            bit_depth: 8,
            profile: None,
            level: None,
            threads: None,
            device_path: None,
            forced,
        }
    }
}

/// Rate control shape implied by a quality preset on a backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetSettings {
    pub rate_control: RateControl,
    pub quality_value: Option<u32>,
    pub two_pass: bool,
    pub scene_detection: bool,
}

/// Constant-quality level per preset. Lower is better quality.
pub fn crf_value(codec: Codec, preset: QualityPreset) -> u32 {
    let table: [u32; 4] = match codec {
        Codec::H264 | Codec::Copy => [26, 23, 20, 17],
        Codec::Hevc => [28, 25, 22, 19],
        Codec::Av1 => [35, 32, 28, 22],
        Codec::Vp9 => [36, 34, 31, 24],
    };
    match preset {
        QualityPreset::Speed => table[0],
        QualityPreset::Balanced => table[1],
        QualityPreset::Quality => table[2],
        QualityPreset::Archive => table[3],
    }
}

/// Fixed preset -> rate control mapping
pub fn preset_settings(backend: Backend, codec: Codec, preset: QualityPreset) -> PresetSettings {
    use QualityPreset as P;
    if backend.is_gpu() {
        return PresetSettings {
            rate_control: RateControl::Vbr,
            quality_value: None,
            two_pass: preset == P::Archive,
            scene_detection: matches!(preset, P::Quality | P::Archive),
        };
    }

    match preset {
        P::Speed => PresetSettings {
            rate_control: RateControl::Vbr,
            quality_value: None,
            two_pass: false,
            scene_detection: false,
        },
        P::Balanced => PresetSettings {
            rate_control: RateControl::Vbr,
            quality_value: None,
            // SVT-AV1 two-pass needs a different stats workflow; stay single-pass
            two_pass: codec != Codec::Av1,
            scene_detection: true,
        },
        P::Quality | P::Archive => PresetSettings {
            rate_control: RateControl::Crf,
            quality_value: Some(crf_value(codec, preset)),
            two_pass: false,
            scene_detection: true,
        },
    }
}

/// Encoder speed preset name for the API
pub fn encoder_preset(api: EncoderApi, codec: Codec, preset: QualityPreset) -> Option<&'static str> {
    let idx = match preset {
        QualityPreset::Speed => 0,
        QualityPreset::Balanced => 1,
        QualityPreset::Quality => 2,
        QualityPreset::Archive => 3,
    };
    let table: [&'static str; 4] = match (api, codec) {
        (_, Codec::Copy) => return None,
        (EncoderApi::Software, Codec::H264 | Codec::Hevc) => ["veryfast", "medium", "slow", "veryslow"],
        (EncoderApi::Software, Codec::Av1) => ["10", "8", "6", "4"],
        // libvpx -cpu-used
        (EncoderApi::Software, Codec::Vp9) => ["5", "3", "2", "1"],
        (EncoderApi::Qsv, _) => ["veryfast", "medium", "slow", "veryslow"],
        (EncoderApi::Amf, _) => ["speed", "balanced", "quality", "quality"],
        (EncoderApi::Nvenc, _) => ["p2", "p4", "p6", "p7"],
        // VA-API -compression_level (driver-specific, lower is slower)
        (EncoderApi::Vaapi, _) => ["7", "4", "2", "1"],
    };
    Some(table[idx])
}

/// Encoder profile for the codec and output bit depth
pub fn codec_profile(codec: Codec, high_bit_depth: bool) -> Option<&'static str> {
    match (codec, high_bit_depth) {
        (Codec::H264, false) => Some("high"),
        (Codec::H264, true) => Some("high10"),
        (Codec::Hevc, false) => Some("main"),
        (Codec::Hevc, true) => Some("main10"),
        (Codec::Av1, _) => Some("main"),
        (Codec::Vp9, false) => Some("0"),
        (Codec::Vp9, true) => Some("2"),
        (Codec::Copy, _) => None,
    }
}

/// Level for h264/hevc from the resolution tier; high frame rates step up one level
pub fn codec_level(codec: Codec, resolution: Resolution, fps: Option<f64>) -> Option<&'static str> {
    let high_fps = fps.map(|f| f > 31.0).unwrap_or(false);
    match codec {
        Codec::H264 => Some(match (resolution.tier(), high_fps) {
            (ResolutionTier::Sd, _) => "3.1",
            (ResolutionTier::Hd, false) => "4.0",
            (ResolutionTier::Hd, true) | (ResolutionTier::FullHd, false) => "4.1",
            (ResolutionTier::FullHd, true) => "4.2",
            (ResolutionTier::Qhd, _) => "5.1",
            (ResolutionTier::Uhd, false) => "5.1",
            (ResolutionTier::Uhd, true) => "5.2",
        }),
        Codec::Hevc => Some(match (resolution.tier(), high_fps) {
            (ResolutionTier::Sd, _) => "3.1",
            (ResolutionTier::Hd, _) => "4.0",
            (ResolutionTier::FullHd, false) => "4.1",
            (ResolutionTier::FullHd, true) | (ResolutionTier::Qhd, false) => "5.0",
            (ResolutionTier::Qhd, true) | (ResolutionTier::Uhd, false) => "5.1",
            (ResolutionTier::Uhd, true) => "5.2",
        }),
        _ => None,
    }
}

/// Backend order to try for a mode
pub fn backend_order(mode: EncodingMode, prefer_secondary: bool) -> Vec<Backend> {
    let gpus = if prefer_secondary {
        [Backend::GpuSecondary, Backend::GpuPrimary]
    } else {
        [Backend::GpuPrimary, Backend::GpuSecondary]
    };
    match mode {
        EncodingMode::Auto => vec![gpus[0], gpus[1], Backend::CpuSoftware],
        EncodingMode::GpuOnly => gpus.to_vec(),
        EncodingMode::CpuOnly => vec![Backend::CpuSoftware],
    }
}

fn qualifies(profile: &HardwareProfile, codec: Codec, backend: Backend, need_high_bit_depth: bool) -> bool {
    let supported = backend == Backend::CpuSoftware || profile.supports(codec, backend);
    supported && (!need_high_bit_depth || profile.supports_high_bit_depth(codec, backend))
}

/// Software encoder threads: leave one core for the system
pub fn software_threads(core_count: usize) -> u32 {
    core_count.saturating_sub(1).max(1) as u32
}

/// Choose the backend and settings for a job
pub fn select_pipeline(
    request: &SelectionRequest,
    profile: &HardwareProfile,
) -> Result<PipelineDescriptor, PolicyError> {
    let codec = request.target_codec;
    if codec == Codec::Copy {
        return Ok(PipelineDescriptor::stream_copy(request.quality_preset, request.forced));
    }

    let order = backend_order(request.mode, request.prefer_secondary_backend);
    let pick = |need_hb: bool| {
        order
            .iter()
            .copied()
            .find(|b| qualifies(profile, codec, *b, need_hb))
    };

    let mut chosen = if request.wants_high_bit_depth() {
        pick(true).or_else(|| {
            let fallback = pick(false);
            if let Some(backend) = fallback {
                info!(
                    codec = %codec,
                    backend = %backend,
                    source_bit_depth = request.source_bit_depth,
                    "no backend encodes >8-bit {codec}, output will be downsampled"
                );
            }
            fallback
        })
    } else {
        pick(false)
    };

    if chosen.is_none() && request.mode == EncodingMode::GpuOnly {
        if request.software_fallback_allowed {
            warn!(
                codec = %codec,
                "no GPU encoder available, degrading to cpu_software (software_fallback_allowed)"
            );
            chosen = Some(Backend::CpuSoftware);
        } else {
            return Err(PolicyError::NoEncoderAvailable {
                codec,
                mode: request.mode,
                tried: order,
            });
        }
    }

    let backend = chosen.ok_or_else(|| PolicyError::NoEncoderAvailable {
        codec,
        mode: request.mode,
        tried: order.clone(),
    })?;

    let api = profile
        .encoder_api(backend)
        .unwrap_or(EncoderApi::Software);
    let encoder = VideoEncoder::lookup(api, codec).ok_or_else(|| PolicyError::NoEncoderAvailable {
        codec,
        mode: request.mode,
        tried: order.clone(),
    })?;

    let bit_depth = if request.wants_high_bit_depth() && profile.supports_high_bit_depth(codec, backend) {
        10
    } else {
        8
    };

    let mut settings = preset_settings(backend, codec, request.quality_preset);
    match request.rate_control {
        RateControlSetting::Auto => {}
        RateControlSetting::Vbr => {
            settings.rate_control = RateControl::Vbr;
            settings.quality_value = None;
        }
        RateControlSetting::Crf => {
            settings.rate_control = RateControl::Crf;
            settings.quality_value = Some(crf_value(codec, request.quality_preset));
            settings.two_pass = false;
        }
        RateControlSetting::Cbr => {
            settings.rate_control = RateControl::Cbr;
            settings.quality_value = None;
            settings.two_pass = false;
        }
    }

    let target = request.video_bitrate_bps;
    let (bitrate_target, bitrate_cap) = match settings.rate_control {
        RateControl::Vbr => (Some(target), Some(request.max_bitrate_bps.max(target))),
        RateControl::Cbr => (Some(target), Some(target)),
        RateControl::Crf => (None, None),
    };

    let device_path = match api {
        EncoderApi::Vaapi | EncoderApi::Qsv => profile.render_device(),
        _ => None,
    };

    let pipeline = PipelineDescriptor {
        backend,
        codec,
        encoder,
        rate_control: settings.rate_control,
        quality_preset: request.quality_preset,
        bitrate_target,
        bitrate_cap,
        quality_value: settings.quality_value,
        encoder_preset: encoder_preset(api, codec, request.quality_preset),
        two_pass: settings.two_pass,
        scene_detection: settings.scene_detection,
        bit_depth,
        profile: codec_profile(codec, bit_depth > 8),
        level: codec_level(codec, request.resolution, request.fps),
        threads: (backend == Backend::CpuSoftware).then(|| software_threads(profile.core_count)),
        device_path,
        forced: request.forced,
    };

    debug!(
        backend = %pipeline.backend,
        encoder = pipeline.encoder.ffmpeg_name(),
        rate_control = ?pipeline.rate_control,
        bit_depth = pipeline.bit_depth,
        "pipeline selected"
    );
    Ok(pipeline)
}
