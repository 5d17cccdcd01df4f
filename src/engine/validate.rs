//! Pre-flight validation and skip analysis.
//!
//! Runs before any pipeline is synthesized: file integrity first, then the
//! cheap skip checks (codec hierarchy, already-optimal bitrate), then the
//! optional sample-encode size prediction.

use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::core::{
    AudioOptions, Codec, CropOptions, OutputContainer, PipelineDescriptor, RateControl, ResolutionTier,
    SkipDecision, SkipReason, source_codec_rank, synthesize_sample,
};
use crate::engine::probe::{MediaProbeResult, ProbeError};
use crate::engine::tools::MediaTools;

/// Files at or below this duration are treated as broken
pub const MIN_DURATION_SECONDS: f64 = 1.0;

/// A file is already optimal when its bitrate is within this factor of the table value
pub const OPTIMAL_BITRATE_TOLERANCE: f64 = 1.20;

/// Constant-quality encodes never exceed this multiple of the source bitrate
pub const SAFETY_CAP_FACTOR: f64 = 1.5;

/// Assumed bitrate for audio streams that don't report one
pub const AUDIO_BITRATE_ESTIMATE_BPS: u64 = 128_000;

/// Bitrate (bps) a well-compressed file needs, by resolution tier.
/// Columns: h264, hevc, av1, vp9.
const OPTIMAL_BITRATE_TABLE: [(ResolutionTier, [u64; 4]); 5] = [
    (ResolutionTier::Sd, [1_500_000, 900_000, 700_000, 900_000]),
    (ResolutionTier::Hd, [3_000_000, 2_000_000, 1_500_000, 2_000_000]),
    (ResolutionTier::FullHd, [6_000_000, 4_000_000, 3_000_000, 4_000_000]),
    (ResolutionTier::Qhd, [10_000_000, 7_000_000, 5_000_000, 7_000_000]),
    (ResolutionTier::Uhd, [20_000_000, 14_000_000, 10_000_000, 14_000_000]),
];

/// Table lookup; None for stream copy
pub fn optimal_bitrate(tier: ResolutionTier, codec: Codec) -> Option<u64> {
    let column = match codec {
        Codec::H264 => 0,
        Codec::Hevc => 1,
        Codec::Av1 => 2,
        Codec::Vp9 => 3,
        Codec::Copy => return None,
    };
    OPTIMAL_BITRATE_TABLE
        .iter()
        .find(|(t, _)| *t == tier)
        .map(|(_, row)| row[column])
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSettings {
    pub min_file_size_bytes: u64,
    pub probe_timeout: Duration,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            min_file_size_bytes: 1024,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid(MediaProbeResult),
    Invalid(SkipDecision),
}

fn reject(reason: SkipReason, detail: impl Into<String>) -> ValidationResult {
    let decision = SkipDecision::skip(reason, detail);
    warn!(reason = %decision.reason, detail = %decision.detail, "file rejected");
    ValidationResult::Invalid(decision)
}

/// Check existence, size and probe-ability of an input file
pub fn validate(file: &Path, tools: &dyn MediaTools, settings: &ValidationSettings) -> ValidationResult {
    let metadata = match std::fs::metadata(file) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return reject(SkipReason::FileNotFound, format!("{} does not exist", file.display()));
        }
        Err(e) => {
            return reject(SkipReason::FileError, format!("cannot stat {}: {e}", file.display()));
        }
    };

    if !metadata.is_file() {
        return reject(SkipReason::FileError, format!("{} is not a regular file", file.display()));
    }

    let size = metadata.len();
    if size < settings.min_file_size_bytes {
        return reject(
            SkipReason::FileCorrupted,
            format!("{size} bytes is below the {} byte minimum", settings.min_file_size_bytes),
        );
    }

    let mut probe = match tools.probe(file, settings.probe_timeout) {
        Ok(probe) => probe,
        Err(ProbeError::Timeout(t)) => {
            return reject(SkipReason::FileTimeout, format!("metadata probe exceeded {}s", t.as_secs()));
        }
        Err(e @ (ProbeError::Rejected(_) | ProbeError::Parse(_))) => {
            return reject(SkipReason::FileCorrupted, e.to_string());
        }
        Err(e @ ProbeError::Io(_)) => return reject(SkipReason::FileError, e.to_string()),
    };

    if probe.video_stream().is_none() {
        return reject(SkipReason::FileCorrupted, "no video stream");
    }

    if probe.duration_seconds <= MIN_DURATION_SECONDS {
        return reject(
            SkipReason::FileCorrupted,
            format!("duration {:.2}s is too short", probe.duration_seconds),
        );
    }

    if probe.file_size_bytes == 0 {
        probe.file_size_bytes = size;
    }

    debug!(file = %file.display(), "validation passed");
    ValidationResult::Valid(probe)
}

// ============================================================================
// Skip analysis
// ============================================================================

/// Current video bitrate: stream-reported value, else container size over duration minus audio
pub fn measured_video_bitrate(probe: &MediaProbeResult) -> Option<u64> {
    if let Some(bps) = probe.current_video_bitrate_bps.filter(|b| *b > 0) {
        return Some(bps);
    }

    let total = if probe.file_size_bytes > 0 && probe.duration_seconds > 0.0 {
        (probe.file_size_bytes as f64 * 8.0 / probe.duration_seconds) as u64
    } else {
        probe.format_bitrate_bps?
    };

    let audio: u64 = probe
        .audio_streams()
        .map(|s| s.bitrate.unwrap_or(AUDIO_BITRATE_ESTIMATE_BPS))
        .sum();

    Some(total.saturating_sub(audio))
}

/// True when the file's video bitrate is already at or near what the target codec would need
pub fn is_already_optimal(probe: &MediaProbeResult, target_codec: Codec) -> bool {
    let Some(expected) = optimal_bitrate(probe.resolution.tier(), target_codec) else {
        return false;
    };
    let Some(current) = measured_video_bitrate(probe) else {
        return false;
    };
    current as f64 <= OPTIMAL_BITRATE_TOLERANCE * expected as f64
}

pub fn check_already_optimal(probe: &MediaProbeResult, target_codec: Codec) -> SkipDecision {
    if !is_already_optimal(probe, target_codec) {
        return SkipDecision::proceed();
    }
    let current = measured_video_bitrate(probe).unwrap_or(0);
    let expected = optimal_bitrate(probe.resolution.tier(), target_codec).unwrap_or(0);
    SkipDecision::skip(
        SkipReason::AlreadyOptimal,
        format!(
            "{} kbps is within {:.0}% of the {} kbps expected for {target_codec} at {}",
            current / 1000,
            (OPTIMAL_BITRATE_TOLERANCE - 1.0) * 100.0,
            expected / 1000,
            probe.resolution
        ),
    )
}

/// Never re-encode into a less efficient codec unless the target was forced
pub fn check_codec_hierarchy(probe: &MediaProbeResult, target_codec: Codec, forced: bool) -> SkipDecision {
    if forced || target_codec == Codec::Copy {
        return SkipDecision::proceed();
    }
    let source_rank = source_codec_rank(&probe.current_codec);
    if source_rank > target_codec.rank() {
        return SkipDecision::skip(
            SkipReason::BetterSourceCodec,
            format!(
                "source {} ranks above target {target_codec}",
                probe.current_codec
            ),
        );
    }
    SkipDecision::proceed()
}

/// Cap constant-quality encodes at 1.5x the measured source bitrate
pub fn apply_bitrate_safety_cap(
    mut pipeline: PipelineDescriptor,
    source_bitrate_bps: Option<u64>,
) -> PipelineDescriptor {
    if pipeline.rate_control != RateControl::Crf || pipeline.is_copy() {
        return pipeline;
    }
    let Some(source) = source_bitrate_bps.filter(|b| *b > 0) else {
        return pipeline;
    };

    let safety = (source as f64 * SAFETY_CAP_FACTOR) as u64;
    let cap = pipeline.bitrate_cap.map_or(safety, |existing| existing.min(safety));
    debug!(cap, source, "bitrate safety cap applied");
    pipeline.bitrate_cap = Some(cap);
    pipeline
}

// ============================================================================
// Size prediction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeProjection {
    pub sample_bytes: u64,
    pub sample_seconds: f64,
    pub projected_bytes: u64,
    pub savings_ratio: f64,
}

/// Scale a sample encode to the full duration
pub fn project_size(input_bytes: u64, duration: f64, sample_bytes: u64, sample_seconds: f64) -> SizeProjection {
    let scale = if sample_seconds > 0.0 { duration / sample_seconds } else { 1.0 };
    let projected_bytes = (sample_bytes as f64 * scale) as u64;
    let savings_ratio = if input_bytes > 0 {
        (input_bytes as f64 - projected_bytes as f64) / input_bytes as f64
    } else {
        0.0
    };
    SizeProjection {
        sample_bytes,
        sample_seconds,
        projected_bytes,
        savings_ratio,
    }
}

pub fn check_projected_savings(projection: &SizeProjection, min_savings_ratio: f64) -> SkipDecision {
    if projection.savings_ratio >= min_savings_ratio {
        return SkipDecision::proceed();
    }
    SkipDecision::skip(
        SkipReason::ProjectedInsufficientSavings,
        format!(
            "projected {} MB saves {:.1}% (minimum {:.1}%)",
            projection.projected_bytes / 1_000_000,
            projection.savings_ratio * 100.0,
            min_savings_ratio * 100.0
        ),
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizePredictionSettings {
    pub test_duration_seconds: u32,
    pub min_savings_ratio: f64,
    pub timeout: Duration,
}

/// Encode the first `test_duration_seconds` with the selected pipeline and
/// skip when the projected output doesn't save enough. A failed or timed out
/// sample never blocks the job.
#[allow(clippy::too_many_arguments)]
pub fn predict_size(
    pipeline: &PipelineDescriptor,
    probe: &MediaProbeResult,
    file_in: &Path,
    container: OutputContainer,
    audio: &AudioOptions,
    crop: &CropOptions,
    tools: &dyn MediaTools,
    settings: &SizePredictionSettings,
) -> SkipDecision {
    let sample_seconds = (settings.test_duration_seconds as f64).min(probe.duration_seconds);
    if sample_seconds <= 0.0 {
        return SkipDecision::proceed();
    }

    let work_dir = std::env::temp_dir()
        .join("ffpolicy_sample")
        .join(Uuid::new_v4().to_string());
    if let Err(e) = std::fs::create_dir_all(&work_dir) {
        warn!(error = %e, "cannot create sample directory, skipping size prediction");
        return SkipDecision::proceed();
    }

    let sample_out = work_dir.join(format!("sample.{}", container.extension()));
    let command = synthesize_sample(
        pipeline,
        probe,
        file_in,
        &sample_out,
        audio,
        crop,
        sample_seconds.ceil() as u32,
    );

    let result = tools.encode_sample(&command, settings.timeout);
    match std::fs::remove_dir_all(&work_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %work_dir.display(), "sample directory already gone");
        }
        Err(e) => {
            warn!(error = %e, dir = %work_dir.display(), "could not remove sample directory");
        }
    }

    match result {
        Ok(sample_bytes) => {
            let projection = project_size(probe.file_size_bytes, probe.duration_seconds, sample_bytes, sample_seconds);
            info!(
                sample_bytes,
                projected = projection.projected_bytes,
                savings = format!("{:.1}%", projection.savings_ratio * 100.0),
                "size prediction"
            );
            check_projected_savings(&projection, settings.min_savings_ratio)
        }
        Err(e) => {
            warn!(error = %e, "sample encode failed, proceeding without size prediction");
            SkipDecision::proceed()
        }
    }
}
