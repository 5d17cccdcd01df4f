//! GPU/CPU capability detection and encoder availability

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Serialize, Serializer};
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::{debug, info, warn};

use crate::engine::core::{Backend, Codec, run_with_timeout};

/// Default sysfs DRM class directory
pub const SYSFS_DRM_ROOT: &str = "/sys/class/drm";

/// Default DRI device directory
pub const DEV_DRI_ROOT: &str = "/dev/dri";

pub const PCI_VENDOR_INTEL: u16 = 0x8086;
pub const PCI_VENDOR_AMD: u16 = 0x1002;
pub const PCI_VENDOR_NVIDIA: u16 = 0x10de;

// ============================================================================
// Video Encoder Selection
// ============================================================================

/// Encoder API family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderApi {
    Software,
    Qsv,
    Amf,
    Nvenc,
    Vaapi,
}

impl EncoderApi {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Software => "Software",
            Self::Qsv => "Quick Sync",
            Self::Amf => "AMF",
            Self::Nvenc => "NVENC",
            Self::Vaapi => "VA-API",
        }
    }
}

/// Supported video encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoEncoder {
    // H.264 encoders
    Libx264,
    H264Qsv,
    H264Amf,
    H264Nvenc,
    H264Vaapi,

    // HEVC encoders
    Libx265,
    HevcQsv,
    HevcAmf,
    HevcNvenc,
    HevcVaapi,

    // AV1 encoders
    LibsvtAv1,
    Av1Qsv,
    Av1Amf,
    Av1Nvenc,
    Av1Vaapi,

    // VP9 encoders (no AMF/NVENC implementation exists)
    LibvpxVp9,
    Vp9Qsv,
    Vp9Vaapi,

    /// Stream copy
    Copy,
}

impl VideoEncoder {
    /// Resolve the encoder for an API/codec pair. None when the vendor has no such encoder.
    pub fn lookup(api: EncoderApi, codec: Codec) -> Option<Self> {
        use EncoderApi as A;
        let encoder = match (codec, api) {
            (Codec::Copy, _) => Self::Copy,
            (Codec::H264, A::Software) => Self::Libx264,
            (Codec::H264, A::Qsv) => Self::H264Qsv,
            (Codec::H264, A::Amf) => Self::H264Amf,
            (Codec::H264, A::Nvenc) => Self::H264Nvenc,
            (Codec::H264, A::Vaapi) => Self::H264Vaapi,
            (Codec::Hevc, A::Software) => Self::Libx265,
            (Codec::Hevc, A::Qsv) => Self::HevcQsv,
            (Codec::Hevc, A::Amf) => Self::HevcAmf,
            (Codec::Hevc, A::Nvenc) => Self::HevcNvenc,
            (Codec::Hevc, A::Vaapi) => Self::HevcVaapi,
            (Codec::Av1, A::Software) => Self::LibsvtAv1,
            (Codec::Av1, A::Qsv) => Self::Av1Qsv,
            (Codec::Av1, A::Amf) => Self::Av1Amf,
            (Codec::Av1, A::Nvenc) => Self::Av1Nvenc,
            (Codec::Av1, A::Vaapi) => Self::Av1Vaapi,
            (Codec::Vp9, A::Software) => Self::LibvpxVp9,
            (Codec::Vp9, A::Qsv) => Self::Vp9Qsv,
            (Codec::Vp9, A::Vaapi) => Self::Vp9Vaapi,
            (Codec::Vp9, A::Amf | A::Nvenc) => return None,
        };
        Some(encoder)
    }

    /// Get the FFmpeg encoder name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            Self::Libx264 => "libx264",
            Self::H264Qsv => "h264_qsv",
            Self::H264Amf => "h264_amf",
            Self::H264Nvenc => "h264_nvenc",
            Self::H264Vaapi => "h264_vaapi",
            Self::Libx265 => "libx265",
            Self::HevcQsv => "hevc_qsv",
            Self::HevcAmf => "hevc_amf",
            Self::HevcNvenc => "hevc_nvenc",
            Self::HevcVaapi => "hevc_vaapi",
            Self::LibsvtAv1 => "libsvtav1",
            Self::Av1Qsv => "av1_qsv",
            Self::Av1Amf => "av1_amf",
            Self::Av1Nvenc => "av1_nvenc",
            Self::Av1Vaapi => "av1_vaapi",
            Self::LibvpxVp9 => "libvpx-vp9",
            Self::Vp9Qsv => "vp9_qsv",
            Self::Vp9Vaapi => "vp9_vaapi",
            Self::Copy => "copy",
        }
    }

    pub fn api(&self) -> EncoderApi {
        match self {
            Self::Libx264 | Self::Libx265 | Self::LibsvtAv1 | Self::LibvpxVp9 | Self::Copy => {
                EncoderApi::Software
            }
            Self::H264Qsv | Self::HevcQsv | Self::Av1Qsv | Self::Vp9Qsv => EncoderApi::Qsv,
            Self::H264Amf | Self::HevcAmf | Self::Av1Amf => EncoderApi::Amf,
            Self::H264Nvenc | Self::HevcNvenc | Self::Av1Nvenc => EncoderApi::Nvenc,
            Self::H264Vaapi | Self::HevcVaapi | Self::Av1Vaapi | Self::Vp9Vaapi => {
                EncoderApi::Vaapi
            }
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            Self::Libx264 | Self::H264Qsv | Self::H264Amf | Self::H264Nvenc | Self::H264Vaapi => {
                Codec::H264
            }
            Self::Libx265 | Self::HevcQsv | Self::HevcAmf | Self::HevcNvenc | Self::HevcVaapi => {
                Codec::Hevc
            }
            Self::LibsvtAv1 | Self::Av1Qsv | Self::Av1Amf | Self::Av1Nvenc | Self::Av1Vaapi => {
                Codec::Av1
            }
            Self::LibvpxVp9 | Self::Vp9Qsv | Self::Vp9Vaapi => Codec::Vp9,
            Self::Copy => Codec::Copy,
        }
    }

    /// Check if this is a hardware encoder
    pub fn is_hardware(&self) -> bool {
        self.api() != EncoderApi::Software
    }

    /// Get user-friendly display name
    pub fn display_name(&self) -> String {
        match self {
            Self::Copy => "Stream copy".to_string(),
            _ => format!(
                "{} {} ({})",
                self.codec().as_str().to_uppercase(),
                self.api().display_name(),
                self.ffmpeg_name()
            ),
        }
    }
}

impl Serialize for VideoEncoder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.ffmpeg_name())
    }
}

/// Cache for the output of `ffmpeg -encoders`.
static FFMPEG_ENCODERS_OUTPUT_CACHE: OnceLock<String> = OnceLock::new();

/// Upper bound for the one-time `ffmpeg -encoders` query
const ENCODER_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

fn ffmpeg_encoders_output() -> &'static str {
    FFMPEG_ENCODERS_OUTPUT_CACHE.get_or_init(|| {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-encoders"]);
        encoders_output_from(&mut cmd, ENCODER_QUERY_TIMEOUT)
    })
}

/// Run an encoder-listing command, treating failure or a hang as "no encoders"
fn encoders_output_from(cmd: &mut Command, timeout: Duration) -> String {
    match run_with_timeout(cmd, timeout) {
        Ok(Some(output)) => String::from_utf8_lossy(&output.stdout).to_string(),
        Ok(None) => {
            warn!(timeout_secs = timeout.as_secs_f64(), "encoder query timed out");
            String::new()
        }
        Err(e) => {
            warn!(error = %e, "could not query ffmpeg encoders");
            String::new()
        }
    }
}

/// Parse `ffmpeg -encoders` output into the set of video encoder names.
///
/// Lines look like ` V....D libx264   libx264 H.264 / AVC ...`; the legend
/// above the `------` separator is ignored.
pub fn parse_encoder_list(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            (flags.len() == 6 && flags.starts_with('V')).then(|| name.to_string())
        })
        .collect()
}

/// Video encoders compiled into the local ffmpeg (queried once per process)
pub fn ffmpeg_video_encoders() -> &'static BTreeSet<String> {
    static ENCODERS: OnceLock<BTreeSet<String>> = OnceLock::new();
    ENCODERS.get_or_init(|| {
        let encoders = parse_encoder_list(ffmpeg_encoders_output());
        debug!(count = encoders.len(), "ffmpeg video encoders cached");
        encoders
    })
}

// ============================================================================
// GPU Identification
// ============================================================================

/// Detected GPU vendor for hardware encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    #[default]
    Unknown,
    Intel,
    Nvidia,
    Amd,
}

impl GpuVendor {
    pub fn from_pci_id(vendor_id: u16) -> Self {
        match vendor_id {
            PCI_VENDOR_INTEL => Self::Intel,
            PCI_VENDOR_AMD => Self::Amd,
            PCI_VENDOR_NVIDIA => Self::Nvidia,
            _ => Self::Unknown,
        }
    }

    /// Vendor framework used for the `gpu_primary` backend
    pub fn primary_api(&self) -> Option<EncoderApi> {
        match self {
            Self::Intel => Some(EncoderApi::Qsv),
            Self::Amd => Some(EncoderApi::Amf),
            Self::Nvidia => Some(EncoderApi::Nvenc),
            Self::Unknown => None,
        }
    }

    /// VA-API is only offered on Intel and AMD
    pub fn supports_vaapi(&self) -> bool {
        matches!(self, Self::Intel | Self::Amd)
    }
}

/// Coarse hardware family used to gate codec and bit-depth support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuGeneration {
    #[default]
    Unknown,
    IntelGen9,
    IntelGen11,
    IntelGen12,
    IntelArc,
    AmdGcn,
    AmdRdna1,
    AmdRdna2,
    AmdRdna3,
    NvidiaPascal,
    NvidiaTuring,
    NvidiaAmpere,
    NvidiaAda,
}

impl GpuGeneration {
    /// Whether this generation has a fixed-function encoder for the codec
    pub fn encodes(&self, codec: Codec) -> bool {
        use GpuGeneration as G;
        match codec {
            Codec::H264 => true,
            Codec::Hevc => !matches!(self, G::Unknown),
            Codec::Vp9 => matches!(self, G::IntelGen11 | G::IntelGen12 | G::IntelArc),
            Codec::Av1 => matches!(self, G::IntelArc | G::AmdRdna3 | G::NvidiaAda),
            Codec::Copy => false,
        }
    }

    /// Whether the encoder for the codec accepts >8-bit input on this generation
    pub fn encodes_high_bit_depth(&self, codec: Codec) -> bool {
        use GpuGeneration as G;
        if !self.encodes(codec) {
            return false;
        }
        match codec {
            Codec::H264 | Codec::Copy => false,
            Codec::Hevc => !matches!(self, G::Unknown | G::IntelGen9 | G::AmdGcn),
            Codec::Vp9 | Codec::Av1 => true,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::IntelGen9 => "intel_gen9",
            Self::IntelGen11 => "intel_gen11",
            Self::IntelGen12 => "intel_gen12",
            Self::IntelArc => "intel_arc",
            Self::AmdGcn => "amd_gcn",
            Self::AmdRdna1 => "amd_rdna1",
            Self::AmdRdna2 => "amd_rdna2",
            Self::AmdRdna3 => "amd_rdna3",
            Self::NvidiaPascal => "nvidia_pascal",
            Self::NvidiaTuring => "nvidia_turing",
            Self::NvidiaAmpere => "nvidia_ampere",
            Self::NvidiaAda => "nvidia_ada",
        }
    }
}

/// How a generation rule matches a PCI device id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMatch {
    Exact(u16),
    Range(u16, u16),
}

impl DeviceMatch {
    fn matches(&self, device_id: u16) -> bool {
        match *self {
            Self::Exact(id) => id == device_id,
            Self::Range(lo, hi) => (lo..=hi).contains(&device_id),
        }
    }
}

/// One row of the device-id → generation table
#[derive(Debug, Clone, Copy)]
pub struct GenerationRule {
    pub vendor_id: u16,
    pub device: DeviceMatch,
    pub generation: GpuGeneration,
    pub family: &'static str,
}

const fn exact(vendor_id: u16, id: u16, generation: GpuGeneration, family: &'static str) -> GenerationRule {
    GenerationRule {
        vendor_id,
        device: DeviceMatch::Exact(id),
        generation,
        family,
    }
}

const fn range(
    vendor_id: u16,
    lo: u16,
    hi: u16,
    generation: GpuGeneration,
    family: &'static str,
) -> GenerationRule {
    GenerationRule {
        vendor_id,
        device: DeviceMatch::Range(lo, hi),
        generation,
        family,
    }
}

/// Device-id table. Exact rules win over ranges; among ranges the first row wins,
/// so narrower ranges are listed before the broad ones they overlap.
pub static GENERATION_TABLE: &[GenerationRule] = &[
    // Intel
    exact(PCI_VENDOR_INTEL, 0x56a0, GpuGeneration::IntelArc, "Arc A770"),
    exact(PCI_VENDOR_INTEL, 0x56a1, GpuGeneration::IntelArc, "Arc A750"),
    exact(PCI_VENDOR_INTEL, 0x56a5, GpuGeneration::IntelArc, "Arc A380"),
    exact(PCI_VENDOR_INTEL, 0x4905, GpuGeneration::IntelGen12, "Iris Xe MAX (DG1)"),
    range(PCI_VENDOR_INTEL, 0x5690, 0x56bf, GpuGeneration::IntelArc, "Arc Alchemist (DG2)"),
    range(PCI_VENDOR_INTEL, 0x7d40, 0x7dff, GpuGeneration::IntelArc, "Meteor Lake Arc"),
    range(PCI_VENDOR_INTEL, 0xa780, 0xa7ff, GpuGeneration::IntelGen12, "Raptor Lake Xe"),
    range(PCI_VENDOR_INTEL, 0x4680, 0x46ff, GpuGeneration::IntelGen12, "Alder Lake Xe"),
    range(PCI_VENDOR_INTEL, 0x9a40, 0x9aff, GpuGeneration::IntelGen12, "Tiger Lake Xe"),
    range(PCI_VENDOR_INTEL, 0x8a50, 0x8a7f, GpuGeneration::IntelGen11, "Ice Lake"),
    range(PCI_VENDOR_INTEL, 0x3e90, 0x3eff, GpuGeneration::IntelGen9, "Coffee Lake"),
    range(PCI_VENDOR_INTEL, 0x5900, 0x59ff, GpuGeneration::IntelGen9, "Kaby Lake"),
    range(PCI_VENDOR_INTEL, 0x1900, 0x19ff, GpuGeneration::IntelGen9, "Skylake"),
    // AMD
    exact(PCI_VENDOR_AMD, 0x15bf, GpuGeneration::AmdRdna3, "Phoenix (Radeon 780M)"),
    exact(PCI_VENDOR_AMD, 0x15c8, GpuGeneration::AmdRdna3, "Phoenix2"),
    exact(PCI_VENDOR_AMD, 0x164e, GpuGeneration::AmdRdna2, "Raphael"),
    exact(PCI_VENDOR_AMD, 0x1681, GpuGeneration::AmdRdna2, "Rembrandt (Radeon 680M)"),
    exact(PCI_VENDOR_AMD, 0x1638, GpuGeneration::AmdGcn, "Cezanne (Vega)"),
    exact(PCI_VENDOR_AMD, 0x15d8, GpuGeneration::AmdGcn, "Picasso (Vega)"),
    range(PCI_VENDOR_AMD, 0x7440, 0x74ff, GpuGeneration::AmdRdna3, "Navi 3x"),
    range(PCI_VENDOR_AMD, 0x73a0, 0x73ff, GpuGeneration::AmdRdna2, "Navi 2x"),
    range(PCI_VENDOR_AMD, 0x7310, 0x734f, GpuGeneration::AmdRdna1, "Navi 1x"),
    range(PCI_VENDOR_AMD, 0x6860, 0x687f, GpuGeneration::AmdGcn, "Vega"),
    range(PCI_VENDOR_AMD, 0x67c0, 0x67ff, GpuGeneration::AmdGcn, "Polaris"),
    // NVIDIA
    range(PCI_VENDOR_NVIDIA, 0x2680, 0x28ff, GpuGeneration::NvidiaAda, "Ada Lovelace"),
    range(PCI_VENDOR_NVIDIA, 0x2200, 0x25ff, GpuGeneration::NvidiaAmpere, "Ampere"),
    range(PCI_VENDOR_NVIDIA, 0x2180, 0x21ff, GpuGeneration::NvidiaTuring, "Turing (TU116/TU117)"),
    range(PCI_VENDOR_NVIDIA, 0x1e00, 0x1fff, GpuGeneration::NvidiaTuring, "Turing"),
    range(PCI_VENDOR_NVIDIA, 0x1b00, 0x1dff, GpuGeneration::NvidiaPascal, "Pascal"),
];

/// Find the rule for a device in the given table
pub fn classify_device_in(
    table: &'static [GenerationRule],
    vendor_id: u16,
    device_id: u16,
) -> Option<&'static GenerationRule> {
    let candidates = || table.iter().filter(move |r| r.vendor_id == vendor_id);

    candidates()
        .find(|r| matches!(r.device, DeviceMatch::Exact(_)) && r.device.matches(device_id))
        .or_else(|| {
            candidates().find(|r| {
                matches!(r.device, DeviceMatch::Range(..)) && r.device.matches(device_id)
            })
        })
}

/// Classify a PCI device with the built-in table
pub fn classify_device(vendor_id: u16, device_id: u16) -> GpuGeneration {
    classify_device_in(GENERATION_TABLE, vendor_id, device_id)
        .map(|r| r.generation)
        .unwrap_or(GpuGeneration::Unknown)
}

/// One display-class PCI device found under sysfs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    /// DRM card name, e.g. `card0`
    pub card: String,
    pub vendor: GpuVendor,
    pub vendor_id: u16,
    pub device_id: u16,
    pub generation: GpuGeneration,
    pub model: String,
    /// Kernel driver bound to the device (i915, xe, amdgpu, nvidia, ...)
    pub driver: Option<String>,
    pub render_device: Option<PathBuf>,
}

/// Parse a sysfs hex id such as `0x8086\n`
pub fn parse_hex_id(raw: &str) -> Option<u16> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16).ok()
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn sorted_entries_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .filter(|n| n.starts_with(prefix))
                .collect()
        })
        .unwrap_or_default();
    // renderD128 before renderD129, card0 before card1
    names.sort_by_key(|n| {
        let digits: String = n.chars().filter(|c| c.is_ascii_digit()).collect();
        (digits.parse::<u32>().unwrap_or(u32::MAX), n.clone())
    });
    names
}

/// Enumerate GPUs from a sysfs DRM root and DRI device directory (testable)
pub fn detect_gpu_in(sysfs_drm: &Path, dev_dri: &Path) -> Vec<GpuInfo> {
    let render_nodes = sorted_entries_with_prefix(dev_dri, "renderD");
    let mut gpus = Vec::new();

    // connectors show up as card0-HDMI-A-1; only the bare cardN entries are devices
    for (position, card) in sorted_entries_with_prefix(sysfs_drm, "card")
        .into_iter()
        .filter(|n| !n.contains('-'))
        .enumerate()
    {
        let device_dir = sysfs_drm.join(&card).join("device");

        let is_display = read_trimmed(&device_dir.join("class"))
            .map(|c| c.to_ascii_lowercase().starts_with("0x03"))
            .unwrap_or(false);
        if !is_display {
            debug!(card = %card, "skipping non-display device");
            continue;
        }

        let (Some(vendor_id), Some(device_id)) = (
            read_trimmed(&device_dir.join("vendor")).and_then(|v| parse_hex_id(&v)),
            read_trimmed(&device_dir.join("device")).and_then(|d| parse_hex_id(&d)),
        ) else {
            debug!(card = %card, "missing vendor/device id");
            continue;
        };

        let vendor = GpuVendor::from_pci_id(vendor_id);
        if vendor == GpuVendor::Unknown {
            debug!(card = %card, vendor_id = format!("{vendor_id:#06x}"), "unsupported GPU vendor");
            continue;
        }

        let rule = classify_device_in(GENERATION_TABLE, vendor_id, device_id);
        let generation = rule.map(|r| r.generation).unwrap_or_default();
        let model = rule
            .map(|r| r.family.to_string())
            .unwrap_or_else(|| format!("{vendor:?} GPU [{vendor_id:04x}:{device_id:04x}]"));

        let driver = std::fs::read_link(device_dir.join("driver"))
            .ok()
            .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string));

        // Prefer the kernel's own card -> render node link, else the card's
        // position among all cardN entries (skipped cards still own a node)
        let render_device = sorted_entries_with_prefix(&device_dir.join("drm"), "renderD")
            .into_iter()
            .next()
            .or_else(|| render_nodes.get(position).cloned())
            .map(|node| dev_dri.join(node));

        gpus.push(GpuInfo {
            card,
            vendor,
            vendor_id,
            device_id,
            generation,
            model,
            driver,
            render_device,
        });
    }

    gpus
}

/// Detect NVIDIA GPU using nvidia-smi
pub fn detect_nvidia_gpu() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let name = stdout.lines().next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Detect all supported GPUs on this machine
pub fn detect_gpu() -> Vec<GpuInfo> {
    let mut gpus = detect_gpu_in(Path::new(SYSFS_DRM_ROOT), Path::new(DEV_DRI_ROOT));

    if gpus.iter().any(|g| g.vendor == GpuVendor::Nvidia) {
        if let Some(name) = detect_nvidia_gpu() {
            for gpu in gpus.iter_mut().filter(|g| g.vendor == GpuVendor::Nvidia) {
                gpu.model = name.clone();
            }
        }
    }

    for gpu in &gpus {
        info!(
            card = %gpu.card,
            vendor = ?gpu.vendor,
            generation = gpu.generation.tag(),
            model = %gpu.model,
            "detected GPU"
        );
    }
    gpus
}

// ============================================================================
// CPU Identification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub model: String,
    pub core_count: usize,
    pub feature_flags: BTreeSet<String>,
}

impl Default for CpuInfo {
    fn default() -> Self {
        Self {
            model: "unknown".to_string(),
            core_count: 1,
            feature_flags: BTreeSet::new(),
        }
    }
}

/// Parse `/proc/cpuinfo` contents. Missing fields stay unknown.
pub fn parse_cpuinfo(text: &str) -> CpuInfo {
    let mut info = CpuInfo {
        core_count: 0,
        ..CpuInfo::default()
    };
    let mut model: Option<String> = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "processor" => info.core_count += 1,
            "model name" | "Model" | "cpu model" if model.is_none() && !value.is_empty() => {
                model = Some(value.to_string());
            }
            // x86 uses "flags", ARM uses "Features"
            "flags" | "Features" if info.feature_flags.is_empty() => {
                info.feature_flags = value.split_whitespace().map(str::to_string).collect();
            }
            _ => {}
        }
    }

    if let Some(model) = model {
        info.model = model;
    }
    info
}

/// Best-effort CPU detection; never fails
pub fn detect_cpu() -> CpuInfo {
    let mut info = std::fs::read_to_string("/proc/cpuinfo")
        .map(|text| parse_cpuinfo(&text))
        .unwrap_or_else(|_| CpuInfo {
            core_count: 0,
            ..CpuInfo::default()
        });

    let sys =
        System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
    let cpus = sys.cpus();

    if info.core_count == 0 {
        info.core_count = cpus.len().max(1);
    }
    if info.model == "unknown" {
        if let Some(brand) = cpus.first().map(|c| c.brand().trim()).filter(|b| !b.is_empty()) {
            info.model = brand.to_string();
        }
    }

    debug!(model = %info.model, cores = info.core_count, "detected CPU");
    info
}

// ============================================================================
// Capability Profile
// ============================================================================

/// Encoder capability sets derived from GPU findings and ffmpeg's encoder list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncoderCapabilities {
    pub supported: BTreeSet<(Codec, Backend)>,
    pub high_bit_depth: BTreeSet<(Codec, Backend)>,
}

/// Intersect the selected GPU's generation gates with the encoders ffmpeg ships.
/// CPU software entries are always present.
pub fn encoder_capabilities(gpu: Option<&GpuInfo>, ffmpeg_encoders: &BTreeSet<String>) -> EncoderCapabilities {
    let mut caps = EncoderCapabilities::default();

    for codec in Codec::ENCODABLE {
        caps.supported.insert((codec, Backend::CpuSoftware));
        if codec != Codec::H264 {
            caps.high_bit_depth.insert((codec, Backend::CpuSoftware));
        }

        let Some(gpu) = gpu else { continue };
        if !gpu.generation.encodes(codec) {
            continue;
        }

        let mut offer = |backend: Backend, api: EncoderApi| {
            let Some(encoder) = VideoEncoder::lookup(api, codec) else {
                return;
            };
            if !ffmpeg_encoders.contains(encoder.ffmpeg_name()) {
                debug!(encoder = encoder.ffmpeg_name(), "encoder missing from ffmpeg build");
                return;
            }
            caps.supported.insert((codec, backend));
            if gpu.generation.encodes_high_bit_depth(codec) {
                caps.high_bit_depth.insert((codec, backend));
            }
        };

        if let Some(api) = gpu.vendor.primary_api() {
            // QSV needs the Intel render node to initialise a session
            if api != EncoderApi::Qsv || gpu.render_device.is_some() {
                offer(Backend::GpuPrimary, api);
            }
        }
        if gpu.vendor.supports_vaapi() && gpu.render_device.is_some() {
            offer(Backend::GpuSecondary, EncoderApi::Vaapi);
        }
    }

    caps
}

/// Query encoder capabilities for the given GPUs against the cached ffmpeg encoder list
pub fn detect_encoders(gpus: &[GpuInfo]) -> EncoderCapabilities {
    encoder_capabilities(primary_gpu(gpus), ffmpeg_video_encoders())
}

/// GPU used for encoding: the first one that has a render node, else the first one
pub fn primary_gpu(gpus: &[GpuInfo]) -> Option<&GpuInfo> {
    gpus.iter()
        .find(|g| g.render_device.is_some())
        .or_else(|| gpus.first())
}

/// Immutable per-process description of what this machine can encode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareProfile {
    pub cpu_model: String,
    pub core_count: usize,
    pub cpu_feature_flags: BTreeSet<String>,
    pub gpus: Vec<GpuInfo>,
    pub gpu_model: Option<String>,
    pub gpu_vendor: GpuVendor,
    pub gpu_generation_tag: GpuGeneration,
    pub gpu_vendor_device_id: Option<(u16, u16)>,
    pub render_device_path: Option<PathBuf>,
    pub encoder_capability_set: BTreeSet<(Codec, Backend)>,
    pub high_bit_depth_set: BTreeSet<(Codec, Backend)>,
}

impl HardwareProfile {
    /// Probe the local machine. Called once per process; share the result via `Arc`.
    pub fn detect() -> Self {
        let cpu = detect_cpu();
        let gpus = detect_gpu();
        let profile = Self::from_parts(cpu, gpus, ffmpeg_video_encoders());

        if profile.gpus.is_empty() {
            warn!("no supported GPU detected, software encoding only");
        }
        info!(
            backends = ?profile.encoder_capability_set,
            "hardware capability profile ready"
        );
        profile
    }

    /// Assemble a profile from already-detected parts
    pub fn from_parts(cpu: CpuInfo, gpus: Vec<GpuInfo>, ffmpeg_encoders: &BTreeSet<String>) -> Self {
        let primary = primary_gpu(&gpus).cloned();
        let caps = encoder_capabilities(primary.as_ref(), ffmpeg_encoders);

        Self {
            cpu_model: cpu.model,
            core_count: cpu.core_count.max(1),
            cpu_feature_flags: cpu.feature_flags,
            gpu_model: primary.as_ref().map(|g| g.model.clone()),
            gpu_vendor: primary.as_ref().map(|g| g.vendor).unwrap_or_default(),
            gpu_generation_tag: primary.as_ref().map(|g| g.generation).unwrap_or_default(),
            gpu_vendor_device_id: primary.as_ref().map(|g| (g.vendor_id, g.device_id)),
            render_device_path: primary.as_ref().and_then(|g| g.render_device.clone()),
            gpus,
            encoder_capability_set: caps.supported,
            high_bit_depth_set: caps.high_bit_depth,
        }
    }

    /// A machine with no usable GPU
    pub fn software_only(core_count: usize) -> Self {
        Self::from_parts(
            CpuInfo {
                core_count,
                ..CpuInfo::default()
            },
            Vec::new(),
            &BTreeSet::new(),
        )
    }

    pub fn supports(&self, codec: Codec, backend: Backend) -> bool {
        self.encoder_capability_set.contains(&(codec, backend))
    }

    pub fn supports_high_bit_depth(&self, codec: Codec, backend: Backend) -> bool {
        self.high_bit_depth_set.contains(&(codec, backend))
    }

    pub fn has_gpu_backend(&self) -> bool {
        self.encoder_capability_set.iter().any(|(_, b)| b.is_gpu())
    }

    /// API that implements a backend on this machine
    pub fn encoder_api(&self, backend: Backend) -> Option<EncoderApi> {
        match backend {
            Backend::CpuSoftware => Some(EncoderApi::Software),
            Backend::GpuPrimary => self.gpu_vendor.primary_api(),
            Backend::GpuSecondary => self.gpu_vendor.supports_vaapi().then_some(EncoderApi::Vaapi),
        }
    }

    /// Concrete encoder for a codec on a backend, if the machine supports it
    pub fn encoder_for(&self, codec: Codec, backend: Backend) -> Option<VideoEncoder> {
        if codec == Codec::Copy {
            return Some(VideoEncoder::Copy);
        }
        if !self.supports(codec, backend) {
            return None;
        }
        VideoEncoder::lookup(self.encoder_api(backend)?, codec)
    }

    /// Render node string for ffmpeg device arguments
    pub fn render_device(&self) -> Option<String> {
        self.render_device_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(vendor_id: u16, device_id: u16, render: bool) -> GpuInfo {
        GpuInfo {
            card: "card0".to_string(),
            vendor: GpuVendor::from_pci_id(vendor_id),
            vendor_id,
            device_id,
            generation: classify_device(vendor_id, device_id),
            model: "test".to_string(),
            driver: None,
            render_device: render.then(|| PathBuf::from("/dev/dri/renderD128")),
        }
    }

    fn all_encoders() -> BTreeSet<String> {
        [
            "libx264", "libx265", "libsvtav1", "libvpx-vp9", "h264_qsv", "hevc_qsv", "av1_qsv",
            "vp9_qsv", "h264_vaapi", "hevc_vaapi", "av1_vaapi", "vp9_vaapi", "h264_amf",
            "hevc_amf", "av1_amf", "h264_nvenc", "hevc_nvenc", "av1_nvenc",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_encoder_lookup_names() {
        assert_eq!(
            VideoEncoder::lookup(EncoderApi::Vaapi, Codec::Hevc).map(|e| e.ffmpeg_name()),
            Some("hevc_vaapi")
        );
        assert_eq!(
            VideoEncoder::lookup(EncoderApi::Software, Codec::Vp9).map(|e| e.ffmpeg_name()),
            Some("libvpx-vp9")
        );
        assert_eq!(VideoEncoder::lookup(EncoderApi::Nvenc, Codec::Vp9), None);
        assert!(VideoEncoder::Av1Amf.is_hardware());
        assert!(!VideoEncoder::LibsvtAv1.is_hardware());
    }

    #[test]
    fn test_parse_encoder_list() {
        let output = "Encoders:\n V..... = Video\n A..... = Audio\n ------\n V....D libx264              libx264 H.264\n V..... hevc_vaapi           H.265/HEVC (VAAPI)\n A....D aac                  AAC\n";
        let encoders = parse_encoder_list(output);
        assert!(encoders.contains("libx264"));
        assert!(encoders.contains("hevc_vaapi"));
        assert!(!encoders.contains("aac"));
        assert!(!encoders.contains("="));
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x8086\n"), Some(0x8086));
        assert_eq!(parse_hex_id("10de"), Some(0x10de));
        assert_eq!(parse_hex_id("zz"), None);
    }

    #[test]
    fn test_classify_known_devices() {
        assert_eq!(classify_device(PCI_VENDOR_INTEL, 0x56a0), GpuGeneration::IntelArc);
        assert_eq!(classify_device(PCI_VENDOR_INTEL, 0x9a49), GpuGeneration::IntelGen12);
        assert_eq!(classify_device(PCI_VENDOR_INTEL, 0x5912), GpuGeneration::IntelGen9);
        assert_eq!(classify_device(PCI_VENDOR_AMD, 0x744c), GpuGeneration::AmdRdna3);
        assert_eq!(classify_device(PCI_VENDOR_AMD, 0x1681), GpuGeneration::AmdRdna2);
        assert_eq!(classify_device(PCI_VENDOR_NVIDIA, 0x2684), GpuGeneration::NvidiaAda);
        assert_eq!(classify_device(PCI_VENDOR_NVIDIA, 0x1b80), GpuGeneration::NvidiaPascal);
        assert_eq!(classify_device(PCI_VENDOR_NVIDIA, 0x0001), GpuGeneration::Unknown);
    }

    #[test]
    fn test_exact_rule_beats_earlier_range() {
        static TABLE: &[GenerationRule] = &[
            range(PCI_VENDOR_INTEL, 0x4600, 0x46ff, GpuGeneration::IntelGen12, "broad"),
            range(PCI_VENDOR_INTEL, 0x46a0, 0x46af, GpuGeneration::IntelGen11, "narrow"),
            exact(PCI_VENDOR_INTEL, 0x46a6, GpuGeneration::IntelArc, "exact"),
        ];
        let hit = classify_device_in(TABLE, PCI_VENDOR_INTEL, 0x46a6).map(|r| r.family);
        assert_eq!(hit, Some("exact"));
        // Among ranges, table order wins
        let hit = classify_device_in(TABLE, PCI_VENDOR_INTEL, 0x46a1).map(|r| r.family);
        assert_eq!(hit, Some("broad"));
    }

    #[test]
    fn test_generation_gates() {
        assert!(!GpuGeneration::IntelGen9.encodes(Codec::Av1));
        assert!(GpuGeneration::IntelArc.encodes(Codec::Av1));
        assert!(!GpuGeneration::NvidiaAmpere.encodes(Codec::Av1));
        assert!(!GpuGeneration::AmdRdna3.encodes(Codec::Vp9));
        assert!(GpuGeneration::Unknown.encodes(Codec::H264));
        assert!(!GpuGeneration::Unknown.encodes(Codec::Hevc));
        assert!(!GpuGeneration::IntelGen9.encodes_high_bit_depth(Codec::Hevc));
        assert!(GpuGeneration::IntelGen12.encodes_high_bit_depth(Codec::Hevc));
        assert!(!GpuGeneration::IntelArc.encodes_high_bit_depth(Codec::H264));
    }

    #[test]
    fn test_capabilities_intel_with_render_node() {
        let caps = encoder_capabilities(Some(&gpu(PCI_VENDOR_INTEL, 0x56a0, true)), &all_encoders());
        assert!(caps.supported.contains(&(Codec::Av1, Backend::GpuPrimary)));
        assert!(caps.supported.contains(&(Codec::Av1, Backend::GpuSecondary)));
        assert!(caps.supported.contains(&(Codec::Vp9, Backend::GpuSecondary)));
        assert!(caps.high_bit_depth.contains(&(Codec::Hevc, Backend::GpuPrimary)));
    }

    #[test]
    fn test_capabilities_without_render_node() {
        let caps = encoder_capabilities(Some(&gpu(PCI_VENDOR_INTEL, 0x56a0, false)), &all_encoders());
        assert!(!caps.supported.iter().any(|(_, b)| b.is_gpu()));
        assert!(caps.supported.contains(&(Codec::Hevc, Backend::CpuSoftware)));
    }

    #[test]
    fn test_capabilities_generation_gate_beats_ffmpeg_listing() {
        // ffmpeg lists av1_nvenc but Ampere has no AV1 encoder block
        let caps = encoder_capabilities(Some(&gpu(PCI_VENDOR_NVIDIA, 0x2204, false)), &all_encoders());
        assert!(caps.supported.contains(&(Codec::Hevc, Backend::GpuPrimary)));
        assert!(!caps.supported.contains(&(Codec::Av1, Backend::GpuPrimary)));
        assert!(!caps.supported.iter().any(|(_, b)| *b == Backend::GpuSecondary));
    }

    #[test]
    fn test_capabilities_missing_ffmpeg_encoder() {
        let mut encoders = all_encoders();
        encoders.remove("hevc_amf");
        let caps = encoder_capabilities(Some(&gpu(PCI_VENDOR_AMD, 0x73bf, true)), &encoders);
        assert!(!caps.supported.contains(&(Codec::Hevc, Backend::GpuPrimary)));
        assert!(caps.supported.contains(&(Codec::Hevc, Backend::GpuSecondary)));
    }

    #[test]
    fn test_parse_cpuinfo() {
        let text = "processor\t: 0\nmodel name\t: AMD Ryzen 7 5800X\nflags\t\t: fpu sse4_2 avx2\n\nprocessor\t: 1\nmodel name\t: AMD Ryzen 7 5800X\nflags\t\t: fpu sse4_2 avx2\n";
        let cpu = parse_cpuinfo(text);
        assert_eq!(cpu.model, "AMD Ryzen 7 5800X");
        assert_eq!(cpu.core_count, 2);
        assert!(cpu.feature_flags.contains("avx2"));
    }

    #[test]
    fn test_parse_cpuinfo_unknown_fields() {
        let cpu = parse_cpuinfo("garbage without separators\n");
        assert_eq!(cpu.model, "unknown");
        assert_eq!(cpu.core_count, 0);
        assert!(cpu.feature_flags.is_empty());
    }

    #[test]
    fn test_software_only_profile() {
        let profile = HardwareProfile::software_only(8);
        assert!(!profile.has_gpu_backend());
        assert_eq!(profile.core_count, 8);
        assert_eq!(
            profile.encoder_for(Codec::Hevc, Backend::CpuSoftware),
            Some(VideoEncoder::Libx265)
        );
        assert_eq!(profile.encoder_for(Codec::Hevc, Backend::GpuPrimary), None);
    }

    #[test]
    fn test_detect_cpu_never_fails() {
        let cpu = detect_cpu();
        assert!(cpu.core_count >= 1);
        assert!(!cpu.model.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_encoders_output_reads_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo ' ------'; echo ' V....D libx265  H.265'"]);
        let output = encoders_output_from(&mut cmd, Duration::from_secs(5));
        assert!(parse_encoder_list(&output).contains("libx265"));
    }

    #[cfg(unix)]
    #[test]
    fn test_encoders_output_hung_command_is_empty() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 5"]);
        let started = std::time::Instant::now();
        let output = encoders_output_from(&mut cmd, Duration::from_millis(200));
        assert!(output.is_empty());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_encoders_output_missing_program_is_empty() {
        let mut cmd = Command::new("definitely-not-an-ffmpeg-binary");
        assert!(encoders_output_from(&mut cmd, Duration::from_secs(1)).is_empty());
    }
}
