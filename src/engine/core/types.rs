use serde::{Deserialize, Serialize};
use std::fmt;

/// Video codecs the engine can target
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    H264,
    Hevc,
    Av1,
    Vp9,
    /// Stream copy (remux only, no video re-encode)
    Copy,
}

impl Codec {
    /// Codecs that map to a real encoder
    pub const ENCODABLE: [Codec; 4] = [Codec::H264, Codec::Hevc, Codec::Av1, Codec::Vp9];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Av1 => "av1",
            Self::Vp9 => "vp9",
            Self::Copy => "copy",
        }
    }

    /// Map an ffprobe `codec_name` to a target codec (None for anything we don't encode to)
    pub fn from_ffprobe_name(name: &str) -> Option<Codec> {
        match name.trim().to_ascii_lowercase().as_str() {
            "h264" | "avc" | "avc1" => Some(Self::H264),
            "hevc" | "h265" | "hvc1" | "hev1" => Some(Self::Hevc),
            "av1" | "av01" => Some(Self::Av1),
            "vp9" | "vp09" => Some(Self::Vp9),
            _ => None,
        }
    }

    /// Position in the efficiency hierarchy: av1 > hevc = vp9 > h264 > everything else
    pub fn rank(&self) -> u8 {
        match self {
            Self::Av1 => 3,
            Self::Hevc | Self::Vp9 => 2,
            Self::H264 => 1,
            Self::Copy => 0,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Efficiency rank of a source codec as reported by ffprobe.
/// Legacy and unknown codecs (mpeg2video, vc1, wmv3, ...) rank 0.
pub fn source_codec_rank(codec_name: &str) -> u8 {
    Codec::from_ffprobe_name(codec_name)
        .map(|c| c.rank())
        .unwrap_or(0)
}

/// Encoding execution path
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Vendor framework: QSV (Intel), AMF (AMD), NVENC (NVIDIA)
    GpuPrimary,
    /// VA-API
    GpuSecondary,
    CpuSoftware,
}

impl Backend {
    pub fn is_gpu(&self) -> bool {
        !matches!(self, Self::CpuSoftware)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GpuPrimary => "gpu_primary",
            Self::GpuSecondary => "gpu_secondary",
            Self::CpuSoftware => "cpu_software",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControl {
    Vbr,
    /// Constant quality (CRF / CQ / global_quality depending on encoder)
    Crf,
    Cbr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    Speed,
    #[default]
    Balanced,
    Quality,
    Archive,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 4] = [
        QualityPreset::Speed,
        QualityPreset::Balanced,
        QualityPreset::Quality,
        QualityPreset::Archive,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncodingMode {
    #[default]
    Auto,
    GpuOnly,
    CpuOnly,
}

impl fmt::Display for EncodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::GpuOnly => "gpu_only",
            Self::CpuOnly => "cpu_only",
        })
    }
}

/// Rate control as configured; `Auto` defers to the quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateControlSetting {
    #[default]
    Auto,
    Vbr,
    Crf,
    Cbr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerSetting {
    #[default]
    Mkv,
    Mp4,
    /// Keep the input's container family
    Same,
}

/// Resolved output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputContainer {
    Mkv,
    Mp4,
}

impl OutputContainer {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mkv => "mkv",
            Self::Mp4 => "mp4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodecSetting {
    #[default]
    Aac,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    #[default]
    All,
    First,
    ByLanguage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleMode {
    #[default]
    Copy,
    Srt,
    Ass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    Sd,
    Hd,
    FullHd,
    Qhd,
    Uhd,
}

impl ResolutionTier {
    pub const ALL: [ResolutionTier; 5] = [
        ResolutionTier::Sd,
        ResolutionTier::Hd,
        ResolutionTier::FullHd,
        ResolutionTier::Qhd,
        ResolutionTier::Uhd,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Classify by effective height. Letterboxed/scope content (e.g. 1920x800) keeps the
    /// tier of its width, so the 16:9-equivalent height is used when larger.
    pub fn tier(&self) -> ResolutionTier {
        let effective = self.height.max(self.width.saturating_mul(9) / 16);
        match effective {
            0..=576 => ResolutionTier::Sd,
            577..=720 => ResolutionTier::Hd,
            721..=1080 => ResolutionTier::FullHd,
            1081..=1440 => ResolutionTier::Qhd,
            _ => ResolutionTier::Uhd,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Reason attached to a pre-flight verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    None,
    FileNotFound,
    FileCorrupted,
    FileTimeout,
    FileError,
    AlreadyOptimal,
    BetterSourceCodec,
    ProjectedInsufficientSavings,
}

impl SkipReason {
    /// Validation failures reject the job; the rest mark it processed-without-change
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound | Self::FileCorrupted | Self::FileTimeout | Self::FileError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::FileCorrupted => "FILE_CORRUPTED",
            Self::FileTimeout => "FILE_TIMEOUT",
            Self::FileError => "FILE_ERROR",
            Self::AlreadyOptimal => "ALREADY_OPTIMAL",
            Self::BetterSourceCodec => "BETTER_SOURCE_CODEC",
            Self::ProjectedInsufficientSavings => "PROJECTED_INSUFFICIENT_SAVINGS",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkipDecision {
    pub skip: bool,
    pub reason: SkipReason,
    pub detail: String,
}

impl SkipDecision {
    pub fn proceed() -> Self {
        Self {
            skip: false,
            reason: SkipReason::None,
            detail: String::new(),
        }
    }

    pub fn skip(reason: SkipReason, detail: impl Into<String>) -> Self {
        Self {
            skip: true,
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.skip && self.reason.is_validation_failure()
    }
}

/// Parse a bitrate string such as "2M", "4000k", "2.5m" or "128000" into bits per second
pub fn parse_bitrate(value: &str) -> Option<u64> {
    let trimmed = value.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return None;
    }

    let (number, multiplier) = match trimmed.chars().last()? {
        'k' => (&trimmed[..trimmed.len() - 1], 1_000.0),
        'm' => (&trimmed[..trimmed.len() - 1], 1_000_000.0),
        'g' => (&trimmed[..trimmed.len() - 1], 1_000_000_000.0),
        _ => (trimmed.as_str(), 1.0),
    };

    let parsed: f64 = number.trim().parse().ok()?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return None;
    }
    Some((parsed * multiplier).round() as u64)
}

/// Format bits per second as an ffmpeg kbit string ("4000k")
pub fn format_bitrate(bps: u64) -> String {
    format!("{}k", bps / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_rank_hierarchy() {
        assert!(Codec::Av1.rank() > Codec::Hevc.rank());
        assert!(Codec::Hevc.rank() > Codec::H264.rank());
        assert_eq!(Codec::Vp9.rank(), Codec::Hevc.rank());
        assert_eq!(source_codec_rank("mpeg2video"), 0);
        assert_eq!(source_codec_rank("wmv3"), 0);
        assert_eq!(source_codec_rank("HEVC"), 2);
    }

    #[test]
    fn test_from_ffprobe_name() {
        assert_eq!(Codec::from_ffprobe_name("h264"), Some(Codec::H264));
        assert_eq!(Codec::from_ffprobe_name("hevc"), Some(Codec::Hevc));
        assert_eq!(Codec::from_ffprobe_name("av1"), Some(Codec::Av1));
        assert_eq!(Codec::from_ffprobe_name("vp9"), Some(Codec::Vp9));
        assert_eq!(Codec::from_ffprobe_name("mpeg4"), None);
    }

    #[test]
    fn test_resolution_tier() {
        assert_eq!(Resolution::new(720, 480).tier(), ResolutionTier::Sd);
        assert_eq!(Resolution::new(1280, 720).tier(), ResolutionTier::Hd);
        assert_eq!(Resolution::new(1920, 1080).tier(), ResolutionTier::FullHd);
        // Scope crop keeps its width's tier
        assert_eq!(Resolution::new(1920, 800).tier(), ResolutionTier::FullHd);
        assert_eq!(Resolution::new(2560, 1440).tier(), ResolutionTier::Qhd);
        assert_eq!(Resolution::new(3840, 2160).tier(), ResolutionTier::Uhd);
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate("2M"), Some(2_000_000));
        assert_eq!(parse_bitrate("4000k"), Some(4_000_000));
        assert_eq!(parse_bitrate("2.5m"), Some(2_500_000));
        assert_eq!(parse_bitrate("128k"), Some(128_000));
        assert_eq!(parse_bitrate("96000"), Some(96_000));
        assert_eq!(parse_bitrate(""), None);
        assert_eq!(parse_bitrate("fast"), None);
        assert_eq!(parse_bitrate("-3M"), None);
    }

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(4_000_000), "4000k");
        assert_eq!(format_bitrate(128_000), "128k");
    }

    #[test]
    fn test_skip_decision_rejection() {
        let rejected = SkipDecision::skip(SkipReason::FileCorrupted, "0 bytes");
        assert!(rejected.is_rejection());

        let skipped = SkipDecision::skip(SkipReason::AlreadyOptimal, "low bitrate");
        assert!(skipped.skip);
        assert!(!skipped.is_rejection());

        assert!(!SkipDecision::proceed().skip);
    }
}
