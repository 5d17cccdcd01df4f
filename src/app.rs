use crate::cli::{Cli, Commands};
use ffpolicy::engine::hardware::{GpuInfo, HardwareProfile};
use ffpolicy::engine::probe::MediaProbeResult;
use ffpolicy::engine::progress::{ProgressEvent, ProgressHandler, ProgressTracker};
use ffpolicy::engine::tools::{FfmpegTools, MediaTools};
use ffpolicy::engine::{JobPlan, TranscodeEngine};
use ffpolicy::{config, engine};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

pub fn run(cli: Cli) {
    if let Err(e) = engine::init_logging(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("Warning: {:#}", e);
    }

    match cli.command {
        Commands::CheckFfmpeg => handle_check_ffmpeg(),
        Commands::Hardware { json } => handle_hardware(json),
        Commands::Probe { file, json } => handle_probe(&file, json),
        Commands::Plan {
            file,
            output,
            json,
            config,
        } => handle_plan(&file, output.as_deref(), json, config),
        Commands::Progress { duration } => handle_progress(duration),
        Commands::InitConfig => handle_init_config(),
    }
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("Error: {:#}", e);
    process::exit(1);
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => fail(e),
    }
}

fn handle_check_ffmpeg() {
    match engine::ffmpeg_version() {
        Ok(version) => {
            println!("ffmpeg found: {}", version);
            match engine::ffprobe_version() {
                Ok(probe_version) => {
                    println!("ffprobe found: {}", probe_version);
                    process::exit(0);
                }
                Err(e) => fail(format!("{:#}", e)),
            }
        }
        Err(e) => fail(format!("{:#}", e)),
    }
}

fn print_gpu(gpu: &GpuInfo) {
    println!("  {} {}", gpu.card, gpu.model);
    println!(
        "    vendor:     {:?} [{:04x}:{:04x}]",
        gpu.vendor, gpu.vendor_id, gpu.device_id
    );
    println!("    generation: {}", gpu.generation.tag());
    println!("    driver:     {}", gpu.driver.as_deref().unwrap_or("unknown"));
    println!(
        "    render:     {}",
        gpu.render_device
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );
}

fn handle_hardware(json: bool) {
    let profile = HardwareProfile::detect();
    if json {
        print_json(&profile);
        return;
    }

    println!("CPU: {} ({} cores)", profile.cpu_model, profile.core_count);
    if profile.gpus.is_empty() {
        println!("GPU: none detected");
    } else {
        println!("GPUs:");
        for gpu in &profile.gpus {
            print_gpu(gpu);
        }
    }

    println!("Encoders:");
    for (codec, backend) in &profile.encoder_capability_set {
        let encoder = profile
            .encoder_for(*codec, *backend)
            .map(|e| e.ffmpeg_name())
            .unwrap_or("?");
        let hbd = if profile.supports_high_bit_depth(*codec, *backend) {
            " (10-bit)"
        } else {
            ""
        };
        println!("  {:<5} {:<14} {}{}", codec.as_str(), backend.as_str(), encoder, hbd);
    }
}

fn print_probe(probe: &MediaProbeResult) {
    println!("Duration:   {:.2} seconds", probe.duration_seconds);
    println!("Resolution: {} ({:?})", probe.resolution, probe.resolution.tier());
    println!("Codec:      {} ({}-bit{})", probe.current_codec, probe.bit_depth, if probe.has_hdr { ", HDR" } else { "" });
    if let Some(bps) = engine::validate::measured_video_bitrate(probe) {
        println!("Bitrate:    {}", engine::format_bitrate(bps));
    }
    for stream in &probe.streams {
        println!(
            "  #{} {:?} {} {}",
            stream.index,
            stream.kind,
            stream.codec,
            stream.language.as_deref().unwrap_or("")
        );
    }
}

fn handle_probe(file: &Path, json: bool) {
    let timeout = config::Config::load()
        .map(|c| c.analysis.probe_timeout())
        .unwrap_or_else(|_| config::AnalysisConfig::default().probe_timeout());

    match FfmpegTools.probe(file, timeout) {
        Ok(probe) if json => print_json(&probe),
        Ok(probe) => print_probe(&probe),
        Err(e) => fail(e),
    }
}

fn handle_plan(file: &Path, output: Option<&Path>, json: bool, config_path: Option<PathBuf>) {
    let cfg = match config_path {
        Some(path) => config::Config::load_from(&path),
        None => config::Config::load(),
    }
    .unwrap_or_else(|e| fail(format!("{:#}", e)));

    let hardware = Arc::new(HardwareProfile::detect());
    let engine = TranscodeEngine::new(hardware, cfg).unwrap_or_else(|e| fail(e));
    let plan = engine
        .plan(file, output, &FfmpegTools)
        .unwrap_or_else(|e| fail(e));

    if json {
        print_json(&plan.summary());
    } else {
        print_plan(&plan);
    }

    let code = plan_exit_code(&plan);
    if code != 0 {
        process::exit(code);
    }
}

/// Rejected files exit 2 whatever the output format
fn plan_exit_code(plan: &JobPlan) -> i32 {
    match plan {
        JobPlan::Rejected(_) => 2,
        JobPlan::Skipped(_) | JobPlan::Execute(_) => 0,
    }
}

fn print_plan(plan: &JobPlan) {
    match plan {
        JobPlan::Rejected(decision) => {
            println!("Rejected: {} ({})", decision.reason, decision.detail);
        }
        JobPlan::Skipped(decision) => {
            println!("Skipped: {} ({})", decision.reason, decision.detail);
        }
        JobPlan::Execute(exec) => {
            let p = &exec.pipeline;
            println!("Pipeline: {} via {} ({})", p.codec, p.encoder.display_name(), p.backend);
            println!(
                "Rate control: {:?}, preset {:?}, {}-bit",
                p.rate_control, p.quality_preset, p.bit_depth
            );
            if let Some(crop) = exec.crop {
                println!("Crop: {}", crop);
            }
            if exec.dry_run {
                println!("(dry run)");
            }
            if let Some(first) = exec.command.analysis_display() {
                println!("\nPass 1:\n{}", first);
            }
            println!("\n{}", exec.command.display());
        }
    }
}

fn handle_progress(duration: f64) {
    let mut tracker = ProgressTracker::new(duration);
    let mut last = None;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let report = tracker.handle(ProgressEvent::TextLine(&line));
        if report.percent != last {
            if let Some(pct) = report.percent {
                println!("{}%", pct);
            }
            last = report.percent;
        }
    }

    let report = tracker.handle(ProgressEvent::Unset);
    match report.percent {
        Some(pct) if report.percent != last => println!("{}%", pct),
        Some(_) => {}
        None => println!("progress unavailable (unknown duration)"),
    }
}

fn handle_init_config() {
    match config::Config::config_path() {
        Ok(path) if path.exists() => match config::Config::load_from(&path) {
            Ok(cfg) => {
                println!("Config loaded successfully from {}", path.display());
                if let Err(e) = cfg.validate() {
                    println!("Config has problems: {}", e);
                }
                println!("{:#?}", cfg);
            }
            Err(e) => fail(format!("{:#}", e)),
        },
        Ok(path) => {
            println!("Config missing, creating default...");
            if let Err(e) = config::Config::ensure_default() {
                fail(format!("Failed to save default config: {:#}", e));
            }
            println!("Default config saved to {}", path.display());
        }
        Err(e) => fail(format!("{:#}", e)),
    }
}
