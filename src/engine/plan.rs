//! Per-file driver: validate, skip-check, select, synthesize.
//!
//! The engine never runs the transcode itself. It hands the host a
//! [`JobPlan`]; for executable jobs that is the command plus a fresh
//! [`ProgressTracker`] for the host to feed.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::engine::core::{
    AudioOptions, Backend, Codec, CommandDescriptor, CropOptions, CropRect, PipelineDescriptor,
    PolicyError, SelectionRequest, SkipDecision, SubtitleOptions, resolve_container,
    select_pipeline, synthesize,
};
use crate::engine::hardware::{HardwareProfile, VideoEncoder};
use crate::engine::probe::MediaProbeResult;
use crate::engine::progress::ProgressTracker;
use crate::engine::tools::MediaTools;
use crate::engine::validate::{
    SizePredictionSettings, ValidationResult, ValidationSettings, apply_bitrate_safety_cap,
    check_already_optimal, check_codec_hierarchy, measured_video_bitrate, predict_size, validate,
};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Everything the host needs to run one transcode
#[derive(Debug)]
pub struct ExecutionPlan {
    pub pipeline: PipelineDescriptor,
    pub command: CommandDescriptor,
    pub probe: MediaProbeResult,
    pub crop: Option<CropRect>,
    /// Plan was produced with dry_run; the host should print, not execute
    pub dry_run: bool,
    pub tracker: ProgressTracker,
}

#[derive(Debug)]
pub enum JobPlan {
    /// Validation failed; the file is unusable
    Rejected(SkipDecision),
    /// File is fine but not worth encoding
    Skipped(SkipDecision),
    Execute(Box<ExecutionPlan>),
}

/// Serializable view of a plan for `--json` output
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanSummary<'a> {
    Rejected {
        decision: &'a SkipDecision,
    },
    Skipped {
        decision: &'a SkipDecision,
    },
    Execute {
        pipeline: &'a PipelineDescriptor,
        command: &'a CommandDescriptor,
        command_line: String,
        analysis_command_line: Option<String>,
        crop: Option<String>,
        dry_run: bool,
    },
}

impl JobPlan {
    pub fn decision(&self) -> Option<&SkipDecision> {
        match self {
            JobPlan::Rejected(d) | JobPlan::Skipped(d) => Some(d),
            JobPlan::Execute(_) => None,
        }
    }

    pub fn summary(&self) -> PlanSummary<'_> {
        match self {
            JobPlan::Rejected(decision) => PlanSummary::Rejected { decision },
            JobPlan::Skipped(decision) => PlanSummary::Skipped { decision },
            JobPlan::Execute(plan) => PlanSummary::Execute {
                pipeline: &plan.pipeline,
                command: &plan.command,
                command_line: plan.command.display(),
                analysis_command_line: plan.command.analysis_display(),
                crop: plan.crop.map(|c| c.to_string()),
                dry_run: plan.dry_run,
            },
        }
    }
}

/// Holds the process-wide hardware profile and the configuration; plans one file at a time
#[derive(Debug, Clone)]
pub struct TranscodeEngine {
    hardware: Arc<HardwareProfile>,
    config: Config,
}

impl TranscodeEngine {
    pub fn new(hardware: Arc<HardwareProfile>, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { hardware, config })
    }

    pub fn hardware(&self) -> &HardwareProfile {
        &self.hardware
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn selection_request(&self, probe: &MediaProbeResult) -> Result<SelectionRequest, ConfigError> {
        let enc = &self.config.encoding;
        Ok(SelectionRequest {
            mode: enc.encoding_mode,
            target_codec: enc.target_codec,
            quality_preset: enc.quality_preset,
            rate_control: enc.rate_control,
            prefer_secondary_backend: enc.prefer_secondary_backend,
            software_fallback_allowed: enc.fallback_allowed(),
            video_bitrate_bps: enc.video_bitrate_bps()?,
            max_bitrate_bps: enc.max_bitrate_bps()?,
            source_bit_depth: probe.bit_depth,
            preserve_bit_depth: enc.preserve_bit_depth,
            resolution: probe.resolution,
            fps: probe.fps,
            forced: enc.force_target_codec,
        })
    }

    pub fn audio_options(&self) -> AudioOptions {
        let audio = &self.config.audio;
        AudioOptions {
            codec: audio.audio_codec,
            bitrate: audio.audio_bitrate.clone(),
            mode: audio.audio_mode,
            languages: audio.audio_languages.clone(),
        }
    }

    pub fn subtitle_options(&self) -> SubtitleOptions {
        SubtitleOptions {
            mode: self.config.subtitles.subtitle_mode,
        }
    }

    /// Output path with the resolved container's extension.
    /// Defaults to `<stem>.<codec>.<ext>` next to the input.
    pub fn output_path(&self, file_in: &Path, file_out: Option<&Path>) -> PathBuf {
        let container = resolve_container(self.config.encoding.container, file_in);
        match file_out {
            Some(out) => out.with_extension(container.extension()),
            None => {
                let stem = file_in
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "output".to_string());
                file_in.with_file_name(format!(
                    "{stem}.{}.{}",
                    self.config.encoding.target_codec,
                    container.extension()
                ))
            }
        }
    }

    fn detect_crop(&self, file_in: &Path, probe: &MediaProbeResult, tools: &dyn MediaTools) -> CropOptions {
        let enc = &self.config.encoding;
        let mut crop = CropOptions {
            auto: enc.auto_crop,
            detected: None,
            min_dimension: enc.crop_min_dimension,
        };
        if !enc.auto_crop {
            return crop;
        }
        match tools.detect_crop(file_in, probe, self.config.analysis.probe_timeout()) {
            Ok(rect) => crop.detected = rect,
            Err(e) => warn!(error = %e, "crop detection failed, encoding without crop"),
        }
        crop
    }

    /// Decide what to do with one file
    pub fn plan(&self, file_in: &Path, file_out: Option<&Path>, tools: &dyn MediaTools) -> Result<JobPlan, PlanError> {
        let analysis = &self.config.analysis;
        let enc = &self.config.encoding;
        info!(file = %file_in.display(), "planning job");

        debug!(stage = "validate", "pre-flight");
        let settings = ValidationSettings {
            min_file_size_bytes: analysis.min_file_size_bytes,
            probe_timeout: analysis.probe_timeout(),
        };
        let probe = match validate(file_in, tools, &settings) {
            ValidationResult::Valid(probe) => probe,
            ValidationResult::Invalid(decision) => return Ok(JobPlan::Rejected(decision)),
        };

        debug!(stage = "skip_check", "pre-flight");
        let target = enc.target_codec;
        if target != Codec::Copy {
            let decision = check_codec_hierarchy(&probe, target, enc.force_target_codec);
            if decision.skip {
                info!(reason = %decision.reason, detail = %decision.detail, "skipping");
                return Ok(JobPlan::Skipped(decision));
            }
            if analysis.skip_optimal {
                let decision = check_already_optimal(&probe, target);
                if decision.skip {
                    info!(reason = %decision.reason, detail = %decision.detail, "skipping");
                    return Ok(JobPlan::Skipped(decision));
                }
            }
        }

        let request = self.selection_request(&probe)?;
        let pipeline = select_pipeline(&request, &self.hardware)?;
        let pipeline = apply_bitrate_safety_cap(pipeline, measured_video_bitrate(&probe));

        let output = self.output_path(file_in, file_out);
        let container = resolve_container(enc.container, file_in);
        let crop = if pipeline.is_copy() {
            CropOptions::default()
        } else {
            self.detect_crop(file_in, &probe, tools)
        };
        let audio = self.audio_options();

        if analysis.size_prediction && !analysis.dry_run && !pipeline.is_copy() {
            let prediction = SizePredictionSettings {
                test_duration_seconds: analysis.test_duration_seconds,
                min_savings_ratio: analysis.min_savings_ratio,
                timeout: analysis.test_encode_timeout(),
            };
            let decision = predict_size(&pipeline, &probe, file_in, container, &audio, &crop, tools, &prediction);
            if decision.skip {
                info!(reason = %decision.reason, detail = %decision.detail, "skipping");
                return Ok(JobPlan::Skipped(decision));
            }
        }

        let command = synthesize(
            &pipeline,
            &probe,
            file_in,
            &output,
            &audio,
            &self.subtitle_options(),
            &crop,
        );
        info!(
            backend = %pipeline.backend,
            encoder = pipeline.encoder.ffmpeg_name(),
            output = %output.display(),
            "job planned"
        );

        let tracker = ProgressTracker::new(probe.duration_seconds);
        Ok(JobPlan::Execute(Box::new(ExecutionPlan {
            crop: crop.effective(probe.resolution),
            pipeline,
            command,
            probe,
            dry_run: analysis.dry_run,
            tracker,
        })))
    }
}

// ============================================================================
// Execution failure assessment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrySuggestion {
    /// Re-plan the job on the software encoder
    CpuSoftware,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionFailure {
    pub exit_code: Option<i32>,
    pub backend: Backend,
    pub encoder: VideoEncoder,
    pub cancelled: bool,
    pub suggestion: Option<RetrySuggestion>,
    /// Last lines of ffmpeg's stderr
    pub detail: String,
}

/// SIGINT, SIGQUIT or SIGTERM, as a signal-death exit code or ffmpeg's own message
fn was_user_cancelled(exit_code: Option<i32>, stderr: &str) -> bool {
    if matches!(exit_code, Some(130 | 131 | 143)) {
        return true;
    }
    stderr.contains("received signal 2")
        || stderr.contains("received signal 3")
        || stderr.contains("received signal 15")
}

/// Structured report for a transcode that exited non-zero.
/// GPU failures that weren't cancelled suggest a software retry.
pub fn assess_failure(pipeline: &PipelineDescriptor, exit_code: Option<i32>, stderr: &str) -> ExecutionFailure {
    let cancelled = was_user_cancelled(exit_code, stderr);
    let suggestion = (pipeline.backend.is_gpu() && !cancelled).then_some(RetrySuggestion::CpuSoftware);

    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let detail = lines[lines.len().saturating_sub(5)..].join("\n");

    if let Some(suggestion) = suggestion {
        warn!(
            backend = %pipeline.backend,
            encoder = pipeline.encoder.ffmpeg_name(),
            ?exit_code,
            ?suggestion,
            "GPU pipeline failed"
        );
    }

    ExecutionFailure {
        exit_code,
        backend: pipeline.backend,
        encoder: pipeline.encoder,
        cancelled,
        suggestion,
        detail,
    }
}
