//! External media tools the engine calls out to (ffprobe / ffmpeg)

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

use crate::engine::core::{CommandDescriptor, CropRect, cropdetect_args, parse_cropdetect, run_with_timeout};
use crate::engine::probe::{MediaProbeResult, ProbeError, probe_media};

/// Seam between the policy engine and the tools that touch media.
/// Tests substitute fakes; production uses [`FfmpegTools`].
pub trait MediaTools {
    /// Metadata probe bounded by `timeout`
    fn probe(&self, path: &Path, timeout: Duration) -> Result<MediaProbeResult, ProbeError>;

    /// Run a sample encode and return the size of the produced file in bytes
    fn encode_sample(&self, command: &CommandDescriptor, timeout: Duration) -> Result<u64>;

    /// Black-bar detection; `Ok(None)` when nothing was reported
    fn detect_crop(
        &self,
        path: &Path,
        probe: &MediaProbeResult,
        timeout: Duration,
    ) -> Result<Option<CropRect>>;
}

/// ffprobe/ffmpeg from PATH
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegTools;

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}

impl MediaTools for FfmpegTools {
    fn probe(&self, path: &Path, timeout: Duration) -> Result<MediaProbeResult, ProbeError> {
        probe_media(path, timeout)
    }

    fn encode_sample(&self, command: &CommandDescriptor, timeout: Duration) -> Result<u64> {
        debug!(cmd = %command.display(), "running sample encode");
        let mut cmd = command.to_command();
        let output = run_with_timeout(&mut cmd, timeout)
            .context("Failed to spawn ffmpeg for sample encode")?
            .with_context(|| format!("Sample encode timed out after {}s", timeout.as_secs()))?;

        if !output.status.success() {
            anyhow::bail!(
                "Sample encode failed ({}): {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }

        let size = std::fs::metadata(&command.output_path)
            .with_context(|| format!("Sample output missing: {}", command.output_path.display()))?
            .len();
        Ok(size)
    }

    fn detect_crop(
        &self,
        path: &Path,
        probe: &MediaProbeResult,
        timeout: Duration,
    ) -> Result<Option<CropRect>> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(cropdetect_args(path, probe));
        let output = run_with_timeout(&mut cmd, timeout)
            .context("Failed to spawn ffmpeg for crop detection")?
            .with_context(|| format!("Crop detection timed out after {}s", timeout.as_secs()))?;

        if !output.status.success() {
            anyhow::bail!(
                "Crop detection failed ({}): {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        Ok(parse_cropdetect(&String::from_utf8_lossy(&output.stderr)))
    }
}
