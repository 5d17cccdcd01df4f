// End-to-end planning scenarios against scripted media tools

mod common;

use common::{FakeTools, ProbeOutcome, intel_arc, media_file, probe_1080p};
use ffpolicy::config::{Config, ConfigError};
use ffpolicy::engine::core::{
    Backend, Codec, CropRect, EncodingMode, PolicyError, SkipReason,
};
use ffpolicy::engine::hardware::{HardwareProfile, VideoEncoder};
use ffpolicy::engine::probe::StreamKind;
use ffpolicy::engine::progress::{ProgressEvent, ProgressHandler};
use ffpolicy::engine::{ExecutionPlan, JobPlan, PlanError, TranscodeEngine};
use std::sync::Arc;
use tempfile::TempDir;

fn engine(hardware: HardwareProfile, config: Config) -> TranscodeEngine {
    TranscodeEngine::new(Arc::new(hardware), config).expect("valid config")
}

fn cpu_engine(config: Config) -> TranscodeEngine {
    engine(HardwareProfile::software_only(8), config)
}

fn expect_execute(plan: JobPlan) -> Box<ExecutionPlan> {
    match plan {
        JobPlan::Execute(exec) => exec,
        other => panic!("expected an executable plan, got {:?}", other),
    }
}

fn expect_skip(plan: &JobPlan, reason: SkipReason) {
    match plan {
        JobPlan::Skipped(decision) => {
            assert!(decision.skip);
            assert_eq!(decision.reason, reason);
            assert!(!decision.detail.is_empty());
        }
        other => panic!("expected skip with {reason}, got {:?}", other),
    }
}

fn expect_reject(plan: &JobPlan, reason: SkipReason) {
    match plan {
        JobPlan::Rejected(decision) => {
            assert_eq!(decision.reason, reason);
            assert!(decision.is_rejection());
        }
        other => panic!("expected rejection with {reason}, got {:?}", other),
    }
}

// ============================================================================
// Skip analysis
// ============================================================================

#[test]
fn already_optimal_h264_is_skipped() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(2_100_000)));

    let plan = cpu_engine(Config::default()).plan(&file, None, &tools).unwrap();
    expect_skip(&plan, SkipReason::AlreadyOptimal);
}

#[test]
fn already_optimal_check_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(2_100_000)));

    let mut config = Config::default();
    config.analysis.skip_optimal = false;
    let exec = expect_execute(cpu_engine(config).plan(&file, None, &tools).unwrap());
    assert_eq!(exec.pipeline.encoder, VideoEncoder::Libx265);
}

#[test]
fn better_source_codec_is_skipped_unless_forced() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "movie.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("av1", 8, Some(9_000_000)));

    let plan = cpu_engine(Config::default()).plan(&file, None, &tools).unwrap();
    expect_skip(&plan, SkipReason::BetterSourceCodec);

    let mut config = Config::default();
    config.encoding.force_target_codec = true;
    let exec = expect_execute(cpu_engine(config).plan(&file, None, &tools).unwrap());
    assert!(exec.pipeline.forced);
    assert_eq!(exec.pipeline.codec, Codec::Hevc);
}

#[test]
fn stream_copy_bypasses_skip_checks() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "movie.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("av1", 8, Some(1_000_000)));

    let mut config = Config::default();
    config.encoding.target_codec = Codec::Copy;
    config.encoding.auto_crop = true;
    let tools = tools.crop(CropRect {
        width: 1920,
        height: 800,
        x: 0,
        y: 140,
    });
    let exec = expect_execute(cpu_engine(config).plan(&file, None, &tools).unwrap());
    assert!(exec.pipeline.is_copy());
    assert!(exec.crop.is_none());
    let args = exec.command.args.join(" ");
    assert!(args.contains("-c:v copy"));
    assert!(!args.contains("-vf"));
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn empty_file_is_rejected_without_probing() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "empty.mkv", 0);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000)));

    let plan = cpu_engine(Config::default()).plan(&file, None, &tools).unwrap();
    expect_reject(&plan, SkipReason::FileCorrupted);
    assert_eq!(tools.probe_calls.get(), 0);
}

#[test]
fn missing_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000)));

    let plan = cpu_engine(Config::default())
        .plan(&dir.path().join("gone.mkv"), None, &tools)
        .unwrap();
    expect_reject(&plan, SkipReason::FileNotFound);
}

#[test]
fn probe_failures_map_to_rejection_reasons() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "clip.mkv", 4096);
    let engine = cpu_engine(Config::default());

    let cases = [
        (ProbeOutcome::Timeout, SkipReason::FileTimeout),
        (
            ProbeOutcome::Rejected("Invalid data found when processing input".to_string()),
            SkipReason::FileCorrupted,
        ),
        (ProbeOutcome::Io, SkipReason::FileError),
    ];
    for (outcome, reason) in cases {
        let tools = FakeTools::with_outcome(outcome);
        let plan = engine.plan(&file, None, &tools).unwrap();
        expect_reject(&plan, reason);
    }
}

#[test]
fn audio_only_and_short_files_are_corrupted() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "clip.mkv", 4096);
    let engine = cpu_engine(Config::default());

    let mut audio_only = probe_1080p("h264", 8, Some(8_000_000));
    audio_only.streams.retain(|s| s.kind != StreamKind::Video);
    let plan = engine.plan(&file, None, &FakeTools::new(audio_only)).unwrap();
    expect_reject(&plan, SkipReason::FileCorrupted);

    let mut short = probe_1080p("h264", 8, Some(8_000_000));
    short.duration_seconds = 0.8;
    let plan = engine.plan(&file, None, &FakeTools::new(short)).unwrap();
    expect_reject(&plan, SkipReason::FileCorrupted);
}

// ============================================================================
// Pipeline selection through the planner
// ============================================================================

#[test]
fn ten_bit_source_uses_gpu_primary_main10() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "uhd.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("hevc", 10, Some(20_000_000)));

    let exec = expect_execute(engine(intel_arc(), Config::default()).plan(&file, None, &tools).unwrap());
    assert_eq!(exec.pipeline.backend, Backend::GpuPrimary);
    assert_eq!(exec.pipeline.encoder, VideoEncoder::HevcQsv);
    assert_eq!(exec.pipeline.bit_depth, 10);
    assert_eq!(exec.pipeline.profile, Some("main10"));

    let args = exec.command.args.join(" ");
    assert!(args.contains("-init_hw_device qsv=qs:/dev/dri/renderD128"));
    assert!(args.contains("-hwaccel qsv"));
    assert!(args.contains("-profile:v main10"));
    assert!(exec.command.analysis_pass.is_none());
}

#[test]
fn gpu_only_requires_explicit_fallback_policy() {
    let mut config = Config::default();
    config.encoding.encoding_mode = EncodingMode::GpuOnly;
    config.encoding.software_fallback_allowed = None;

    let err = TranscodeEngine::new(Arc::new(HardwareProfile::software_only(4)), config).unwrap_err();
    assert_eq!(err, ConfigError::MissingFallbackPolicy);
}

#[test]
fn gpu_only_without_gpu_reports_no_encoder() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000)));

    let mut config = Config::default();
    config.encoding.encoding_mode = EncodingMode::GpuOnly;
    config.encoding.software_fallback_allowed = Some(false);
    let err = cpu_engine(config.clone()).plan(&file, None, &tools).unwrap_err();
    assert!(matches!(
        err,
        PlanError::Policy(PolicyError::NoEncoderAvailable { codec: Codec::Hevc, .. })
    ));

    config.encoding.software_fallback_allowed = Some(true);
    let exec = expect_execute(cpu_engine(config).plan(&file, None, &tools).unwrap());
    assert_eq!(exec.pipeline.backend, Backend::CpuSoftware);
}

#[test]
fn quality_preset_gets_safety_cap() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000)));

    let mut config = Config::default();
    config.encoding.quality_preset = ffpolicy::engine::core::QualityPreset::Quality;
    let exec = expect_execute(cpu_engine(config).plan(&file, None, &tools).unwrap());
    assert_eq!(exec.pipeline.bitrate_cap, Some(12_000_000));
    let args = exec.command.args.join(" ");
    assert!(args.contains("-crf 22 -maxrate 12000k -bufsize 24000k"));
}

#[test]
fn amf_constant_quality_honours_safety_cap() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000)));

    let mut config = Config::default();
    config.encoding.quality_preset = ffpolicy::engine::core::QualityPreset::Quality;
    config.encoding.rate_control = ffpolicy::engine::core::RateControlSetting::Crf;
    let hardware = common::profile_with(0x1002, 0x73bf, &["hevc_amf"]);
    let exec = expect_execute(engine(hardware, config).plan(&file, None, &tools).unwrap());

    assert_eq!(exec.pipeline.encoder, VideoEncoder::HevcAmf);
    assert_eq!(exec.pipeline.bitrate_cap, Some(12_000_000));
    let args = exec.command.args.join(" ");
    assert!(args.contains("-rc qvbr -qvbr_quality_level 22 -maxrate 12000k -bufsize 24000k"));
    assert!(!args.contains("cqp"));
}

#[test]
fn auto_crop_applies_detected_rectangle() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "film.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000))).crop(CropRect {
        width: 1920,
        height: 800,
        x: 0,
        y: 140,
    });

    let mut config = Config::default();
    config.encoding.auto_crop = true;
    let exec = expect_execute(cpu_engine(config).plan(&file, None, &tools).unwrap());
    assert_eq!(exec.crop.map(|c| c.to_string()), Some("1920:800:0:140".to_string()));
    assert!(exec.command.args.contains(&"crop=1920:800:0:140".to_string()));
}

// ============================================================================
// Size prediction
// ============================================================================

fn prediction_config() -> Config {
    let mut config = Config::default();
    config.analysis.size_prediction = true;
    config
}

#[test]
fn insufficient_projected_savings_aborts_before_full_encode() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    // 49 MB per 60 s sample projects to 980 MB of a 1 GB input: 2% savings
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000))).sample_bytes(49_000_000);

    let plan = cpu_engine(prediction_config()).plan(&file, None, &tools).unwrap();
    expect_skip(&plan, SkipReason::ProjectedInsufficientSavings);

    let samples = tools.sample_commands.borrow();
    assert_eq!(samples.len(), 1);
    let args = samples[0].args.join(" ");
    assert!(args.contains("-t 60"));
    assert!(!args.contains("-progress"));
    assert!(samples[0].analysis_pass.is_none());
}

#[test]
fn sufficient_savings_proceeds() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000))).sample_bytes(30_000_000);

    let exec = expect_execute(cpu_engine(prediction_config()).plan(&file, None, &tools).unwrap());
    assert_eq!(tools.sample_commands.borrow().len(), 1);
    assert!(exec.command.args.iter().any(|a| a == "-progress"));
}

#[test]
fn failed_sample_encode_does_not_block() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000)));

    let plan = cpu_engine(prediction_config()).plan(&file, None, &tools).unwrap();
    expect_execute(plan);
    assert_eq!(tools.sample_commands.borrow().len(), 1);
}

#[test]
fn dry_run_skips_size_prediction() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000))).sample_bytes(49_000_000);

    let mut config = prediction_config();
    config.analysis.dry_run = true;
    let exec = expect_execute(cpu_engine(config).plan(&file, None, &tools).unwrap());
    assert!(exec.dry_run);
    assert!(tools.sample_commands.borrow().is_empty());
}

// ============================================================================
// Hand-off
// ============================================================================

#[test]
fn execution_plan_carries_a_fresh_tracker() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mp4", 4096);
    let tools = FakeTools::new(probe_1080p("h264", 8, Some(8_000_000)));

    let mut exec = expect_execute(cpu_engine(Config::default()).plan(&file, None, &tools).unwrap());
    assert_eq!(exec.command.output_path, dir.path().join("show.hevc.mkv"));

    let report = exec.tracker.handle(ProgressEvent::TextLine("out_time=00:10:00.000000"));
    assert_eq!(report.percent, Some(50));
}

#[test]
fn plan_summary_serializes_outcome() {
    let dir = TempDir::new().unwrap();
    let file = media_file(dir.path(), "show.mkv", 4096);
    let tools = FakeTools::new(probe_1080p("av1", 8, Some(3_000_000)));

    let plan = cpu_engine(Config::default()).plan(&file, None, &tools).unwrap();
    let json = serde_json::to_value(plan.summary()).unwrap();
    assert_eq!(json["outcome"], "skipped");
    assert_eq!(json["decision"]["reason"], "BETTER_SOURCE_CODEC");
}
