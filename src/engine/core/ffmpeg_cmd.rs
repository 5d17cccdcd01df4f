use super::policy::PipelineDescriptor;
use super::types::{
    AudioCodecSetting, AudioMode, Codec, ContainerSetting, OutputContainer, RateControl,
    Resolution, SubtitleMode, format_bitrate,
};
use crate::engine::hardware::EncoderApi;
use crate::engine::probe::{MediaProbeResult, StreamInfo};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use uuid::Uuid;

const DEFAULT_RENDER_DEVICE: &str = "/dev/dri/renderD128";

/// Source codecs the GPU decoders handle reliably
const HW_DECODABLE_CODECS: &[&str] = &["h264", "hevc", "vp9", "av1", "mpeg2video"];

/// Audio codecs MP4 can carry without re-encoding
const MP4_AUDIO_CODECS: &[&str] = &["aac", "mp3", "ac3", "eac3", "alac", "opus", "flac"];

const TEXT_SUBTITLE_CODECS: &[&str] = &["subrip", "srt", "ass", "ssa", "mov_text", "webvtt", "text"];

/// Ordered ffmpeg argument list, built the same way as a `Command`
#[derive(Debug, Default)]
struct ArgList(Vec<String>);

impl ArgList {
    fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.0.push(arg.into());
        self
    }

    fn into_vec(self) -> Vec<String> {
        self.0
    }
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AudioOptions {
    pub codec: AudioCodecSetting,
    /// ffmpeg bitrate string, e.g. "128k"
    pub bitrate: String,
    pub mode: AudioMode,
    /// ISO 639-2 codes for `AudioMode::ByLanguage`
    pub languages: Vec<String>,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            codec: AudioCodecSetting::Aac,
            bitrate: "128k".to_string(),
            mode: AudioMode::All,
            languages: vec!["eng".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubtitleOptions {
    pub mode: SubtitleMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl fmt::Display for CropRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropOptions {
    pub auto: bool,
    /// Rectangle reported by cropdetect, if detection ran
    pub detected: Option<CropRect>,
    pub min_dimension: u32,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self {
            auto: false,
            detected: None,
            min_dimension: 128,
        }
    }
}

impl CropOptions {
    /// Crop to apply for a frame, after clamping. None means no crop filter.
    pub fn effective(&self, frame: Resolution) -> Option<CropRect> {
        if !self.auto {
            return None;
        }
        clamp_crop(self.detected?, frame, self.min_dimension)
    }
}

/// Clamp a crop rectangle to the frame and to a minimum size.
/// Returns None when the result covers the whole frame.
pub fn clamp_crop(rect: CropRect, frame: Resolution, min_dimension: u32) -> Option<CropRect> {
    if frame.width == 0 || frame.height == 0 {
        return None;
    }

    let min_w = min_dimension.min(frame.width);
    let min_h = min_dimension.min(frame.height);
    let width = rect.width.clamp(min_w, frame.width);
    let height = rect.height.clamp(min_h, frame.height);
    let x = rect.x.min(frame.width - width);
    let y = rect.y.min(frame.height - height);

    if width == frame.width && height == frame.height {
        return None;
    }
    Some(CropRect {
        width,
        height,
        x,
        y,
    })
}

/// Last `crop=W:H:X:Y` suggestion in cropdetect stderr output
pub fn parse_cropdetect(stderr: &str) -> Option<CropRect> {
    stderr.lines().rev().find_map(|line| {
        let start = line.find("crop=")? + "crop=".len();
        let value = line[start..].split_whitespace().next()?;
        let parts: Vec<u32> = value
            .split(':')
            .map(|p| p.parse().ok())
            .collect::<Option<Vec<_>>>()?;
        match parts.as_slice() {
            [width, height, x, y] => Some(CropRect {
                width: *width,
                height: *height,
                x: *x,
                y: *y,
            }),
            _ => None,
        }
    })
}

fn null_output_target() -> &'static str {
    if cfg!(windows) { "NUL" } else { "/dev/null" }
}

/// Arguments for a black-bar detection run over a short window of the input
pub fn cropdetect_args(file_in: &Path, probe: &MediaProbeResult) -> Vec<String> {
    // Skip intros and studio logos, but stay inside short clips
    let seek = (probe.duration_seconds * 0.1).min(300.0).floor() as u64;
    let mut args = ArgList::default();
    args.arg("-hide_banner")
        .arg("-nostdin")
        .arg("-ss")
        .arg(seek.to_string())
        .arg("-i")
        .arg(file_in.to_string_lossy())
        .arg("-t")
        .arg("20")
        .arg("-vf")
        .arg("cropdetect=limit=24:round=2:reset=0")
        .arg("-an")
        .arg("-sn")
        .arg("-f")
        .arg("null")
        .arg(null_output_target());
    args.into_vec()
}

// ============================================================================
// Command descriptor
// ============================================================================

/// Declarative ffmpeg invocation; the host decides when and how to run it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandDescriptor {
    pub program: String,
    pub args: Vec<String>,
    /// First pass of a two-pass software encode, run before `args`
    pub analysis_pass: Option<Vec<String>>,
    pub output_path: PathBuf,
    pub container: OutputContainer,
    /// Directory holding two-pass statistics; remove after the encode
    pub passlog_dir: Option<PathBuf>,
}

impl CommandDescriptor {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    pub fn analysis_command(&self) -> Option<Command> {
        self.analysis_pass.as_ref().map(|args| {
            let mut cmd = Command::new(&self.program);
            cmd.args(args);
            cmd
        })
    }

    /// Shell-quoted command line for display
    pub fn display(&self) -> String {
        quote_command(&self.program, &self.args)
    }

    pub fn analysis_display(&self) -> Option<String> {
        self.analysis_pass
            .as_ref()
            .map(|args| quote_command(&self.program, args))
    }
}

fn quote_command(program: &str, args: &[String]) -> String {
    let words = std::iter::once(program).chain(args.iter().map(String::as_str));
    shlex::try_join(words.clone()).unwrap_or_else(|_| words.collect::<Vec<_>>().join(" "))
}

// ============================================================================
// Container and stream selection
// ============================================================================

/// Resolve the configured container against the input file
pub fn resolve_container(setting: ContainerSetting, file_in: &Path) -> OutputContainer {
    match setting {
        ContainerSetting::Mkv => OutputContainer::Mkv,
        ContainerSetting::Mp4 => OutputContainer::Mp4,
        ContainerSetting::Same => container_from_output(file_in),
    }
}

/// Container implied by a file extension (mp4 family, else Matroska)
pub fn container_from_output(path: &Path) -> OutputContainer {
    match path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4" | "m4v" | "mov") => OutputContainer::Mp4,
        _ => OutputContainer::Mkv,
    }
}

/// Hardware decode is only used for codecs the GPU decoders handle; VA-API/QSV
/// frames cannot pass through the software crop filter.
pub fn hw_decode_allowed(pipeline: &PipelineDescriptor, probe: &MediaProbeResult, cropping: bool) -> bool {
    let api = pipeline.api();
    if !matches!(api, EncoderApi::Vaapi | EncoderApi::Qsv | EncoderApi::Nvenc) || pipeline.is_copy() {
        return false;
    }
    if cropping && matches!(api, EncoderApi::Vaapi | EncoderApi::Qsv) {
        return false;
    }
    let codec = probe.current_codec.as_str();
    if codec == "h264" && probe.bit_depth > 8 {
        return false;
    }
    HW_DECODABLE_CODECS.contains(&codec)
}

fn selected_audio<'a>(probe: &'a MediaProbeResult, opts: &AudioOptions) -> Vec<&'a StreamInfo> {
    let mut streams = probe.audio_streams();
    match opts.mode {
        AudioMode::All => streams.collect(),
        AudioMode::First => streams.next().into_iter().collect(),
        AudioMode::ByLanguage => {
            let matching: Vec<&StreamInfo> = probe
                .audio_streams()
                .filter(|s| {
                    s.language
                        .as_deref()
                        .map(|lang| opts.languages.iter().any(|l| l.eq_ignore_ascii_case(lang)))
                        .unwrap_or(false)
                })
                .collect();
            if matching.is_empty() {
                streams.next().into_iter().collect()
            } else {
                matching
            }
        }
    }
}

fn audio_copy_allowed(stream: &StreamInfo, container: OutputContainer) -> bool {
    container == OutputContainer::Mkv || MP4_AUDIO_CODECS.contains(&stream.codec.as_str())
}

fn is_text_subtitle(stream: &StreamInfo) -> bool {
    TEXT_SUBTITLE_CODECS.contains(&stream.codec.as_str())
}

/// Subtitle streams to keep with their output codec
fn selected_subtitles<'a>(
    probe: &'a MediaProbeResult,
    opts: &SubtitleOptions,
    container: OutputContainer,
) -> Vec<(&'a StreamInfo, &'static str)> {
    probe
        .subtitle_streams()
        .filter_map(|s| match (container, opts.mode) {
            // MP4 only carries text subtitles, as mov_text
            (OutputContainer::Mp4, _) => is_text_subtitle(s).then_some((s, "mov_text")),
            (OutputContainer::Mkv, SubtitleMode::Copy) => Some((s, "copy")),
            (OutputContainer::Mkv, SubtitleMode::Srt) => is_text_subtitle(s).then_some((s, "srt")),
            (OutputContainer::Mkv, SubtitleMode::Ass) => is_text_subtitle(s).then_some((s, "ass")),
        })
        .collect()
}

// ============================================================================
// Video filters and encoder arguments
// ============================================================================

fn software_pix_fmt(high_bit_depth: bool) -> &'static str {
    if high_bit_depth { "yuv420p10le" } else { "yuv420p" }
}

/// Filter chain plus whether frames stay in GPU memory end to end
fn video_filters(
    pipeline: &PipelineDescriptor,
    probe: &MediaProbeResult,
    crop: Option<CropRect>,
    hw_decode: bool,
) -> (Vec<String>, bool) {
    let mut filters = Vec::new();
    let downsample = probe.bit_depth > 8 && !pipeline.is_high_bit_depth();
    let ten_bit = pipeline.is_high_bit_depth();

    if let Some(rect) = crop {
        filters.push(format!("crop={rect}"));
    }

    match pipeline.api() {
        EncoderApi::Vaapi if hw_decode => {
            if downsample {
                filters.push("scale_vaapi=format=nv12".to_string());
            }
            (filters, true)
        }
        EncoderApi::Vaapi => {
            filters.push(format!("format={}", if ten_bit { "p010" } else { "nv12" }));
            filters.push("hwupload".to_string());
            (filters, true)
        }
        EncoderApi::Qsv if hw_decode => {
            if downsample {
                filters.push("vpp_qsv=format=nv12".to_string());
            }
            (filters, true)
        }
        EncoderApi::Qsv => {
            filters.push(format!("format={}", if ten_bit { "p010le" } else { "nv12" }));
            filters.push("hwupload=extra_hw_frames=64".to_string());
            (filters, true)
        }
        EncoderApi::Nvenc if hw_decode && crop.is_none() => {
            if downsample {
                filters.push("scale_cuda=format=nv12".to_string());
            }
            (filters, true)
        }
        _ => (filters, false),
    }
}

fn rate_control_args(args: &mut ArgList, pipeline: &PipelineDescriptor) {
    let api = pipeline.api();
    let codec = pipeline.codec;
    let target = pipeline.bitrate_target.map(format_bitrate);
    let cap = pipeline.bitrate_cap.map(format_bitrate);
    let bufsize = pipeline.bitrate_cap.map(|c| format_bitrate(c.saturating_mul(2)));
    let quality = pipeline.quality_value.unwrap_or(0).to_string();

    match pipeline.rate_control {
        RateControl::Vbr => {
            match api {
                EncoderApi::Nvenc => {
                    args.arg("-rc").arg("vbr");
                }
                EncoderApi::Amf => {
                    args.arg("-rc").arg("vbr_peak");
                }
                EncoderApi::Vaapi => {
                    args.arg("-rc_mode").arg("VBR");
                }
                _ => {}
            }
            if let Some(target) = &target {
                args.arg("-b:v").arg(target);
            }
            if let (Some(cap), Some(bufsize)) = (&cap, &bufsize) {
                args.arg("-maxrate").arg(cap).arg("-bufsize").arg(bufsize);
            }
        }
        RateControl::Cbr => {
            match api {
                EncoderApi::Nvenc | EncoderApi::Amf => {
                    args.arg("-rc").arg("cbr");
                }
                EncoderApi::Vaapi => {
                    args.arg("-rc_mode").arg("CBR");
                }
                _ => {}
            }
            if let Some(target) = &target {
                args.arg("-b:v").arg(target);
                if api == EncoderApi::Software {
                    args.arg("-minrate").arg(target);
                }
                args.arg("-maxrate").arg(target).arg("-bufsize").arg(target);
            }
        }
        RateControl::Crf => match api {
            EncoderApi::Software if codec == Codec::Vp9 => {
                // Constrained quality when capped, pure CRF otherwise
                args.arg("-crf")
                    .arg(&quality)
                    .arg("-b:v")
                    .arg(cap.clone().unwrap_or_else(|| "0".to_string()));
            }
            EncoderApi::Software => {
                args.arg("-crf").arg(&quality);
                if let (Some(cap), Some(bufsize)) = (&cap, &bufsize) {
                    args.arg("-maxrate").arg(cap).arg("-bufsize").arg(bufsize);
                }
            }
            EncoderApi::Nvenc => {
                args.arg("-rc").arg("vbr").arg("-cq").arg(&quality).arg("-b:v").arg("0");
                if let (Some(cap), Some(bufsize)) = (&cap, &bufsize) {
                    args.arg("-maxrate").arg(cap).arg("-bufsize").arg(bufsize);
                }
            }
            EncoderApi::Qsv => {
                args.arg("-global_quality").arg(&quality);
                if let Some(cap) = &cap {
                    args.arg("-maxrate").arg(cap);
                }
            }
            // CQP has no peak limit; a capped job uses quality-defined VBR instead
            EncoderApi::Amf => match (&cap, &bufsize) {
                (Some(cap), Some(bufsize)) => {
                    args.arg("-rc")
                        .arg("qvbr")
                        .arg("-qvbr_quality_level")
                        .arg(&quality)
                        .arg("-maxrate")
                        .arg(cap)
                        .arg("-bufsize")
                        .arg(bufsize);
                }
                _ => {
                    args.arg("-rc")
                        .arg("cqp")
                        .arg("-qp_i")
                        .arg(&quality)
                        .arg("-qp_p")
                        .arg(&quality);
                }
            },
            EncoderApi::Vaapi => match &cap {
                Some(cap) => {
                    args.arg("-rc_mode")
                        .arg("QVBR")
                        .arg("-global_quality")
                        .arg(&quality)
                        .arg("-b:v")
                        .arg(cap)
                        .arg("-maxrate")
                        .arg(cap);
                }
                None => {
                    args.arg("-rc_mode").arg("CQP").arg("-qp").arg(&quality);
                }
            },
        },
    }
}

/// Pass number and statistics prefix for a two-pass software encode
#[derive(Debug, Clone, Copy)]
struct PassInfo<'a> {
    pass: u8,
    log_prefix: &'a Path,
}

fn video_encoder_args(
    args: &mut ArgList,
    pipeline: &PipelineDescriptor,
    gpu_frames: bool,
    pass: Option<PassInfo<'_>>,
) {
    let api = pipeline.api();
    let codec = pipeline.codec;
    let preset = pipeline.encoder_preset;

    args.arg("-c:v").arg(pipeline.encoder.ffmpeg_name());

    match (api, preset) {
        (EncoderApi::Software, Some(p)) if codec == Codec::Vp9 => {
            args.arg("-deadline").arg("good").arg("-cpu-used").arg(p).arg("-row-mt").arg("1");
        }
        (EncoderApi::Amf, Some(p)) => {
            args.arg("-quality").arg(p);
        }
        (EncoderApi::Vaapi, Some(p)) => {
            args.arg("-compression_level").arg(p);
        }
        (_, Some(p)) => {
            args.arg("-preset").arg(p);
        }
        (_, None) => {}
    }

    rate_control_args(args, pipeline);

    let emit_profile = !(api == EncoderApi::Vaapi && matches!(codec, Codec::Av1 | Codec::Vp9));
    if let Some(profile) = pipeline.profile.filter(|_| emit_profile) {
        args.arg("-profile:v").arg(profile);
    }

    let emit_level = match api {
        EncoderApi::Software => codec == Codec::H264,
        EncoderApi::Nvenc | EncoderApi::Vaapi => true,
        EncoderApi::Qsv | EncoderApi::Amf => false,
    };
    if let Some(level) = pipeline.level.filter(|_| emit_level) {
        args.arg("-level:v").arg(level);
    }

    match api {
        EncoderApi::Software => match codec {
            Codec::H264 | Codec::Vp9 => {
                if codec == Codec::H264 && !pipeline.scene_detection {
                    args.arg("-sc_threshold").arg("0");
                }
                if let Some(info) = pass {
                    args.arg("-pass")
                        .arg(info.pass.to_string())
                        .arg("-passlogfile")
                        .arg(info.log_prefix.to_string_lossy());
                }
            }
            Codec::Hevc => {
                let mut params = Vec::new();
                if let Some(level) = pipeline.level {
                    params.push(format!("level-idc={level}"));
                }
                if !pipeline.scene_detection {
                    params.push("scenecut=0".to_string());
                }
                if let Some(info) = pass {
                    params.push(format!("pass={}", info.pass));
                    params.push(format!("stats={}.log", info.log_prefix.to_string_lossy()));
                }
                if !params.is_empty() {
                    args.arg("-x265-params").arg(params.join(":"));
                }
            }
            Codec::Av1 => {
                if pipeline.scene_detection {
                    args.arg("-svtav1-params").arg("scd=1");
                }
            }
            Codec::Copy => {}
        },
        EncoderApi::Nvenc => {
            if pipeline.two_pass {
                args.arg("-multipass").arg("fullres");
            }
            if pipeline.scene_detection {
                args.arg("-rc-lookahead").arg("20");
            }
        }
        EncoderApi::Amf => {
            if pipeline.two_pass {
                args.arg("-preencode").arg("1");
            }
            if pipeline.scene_detection {
                args.arg("-preanalysis").arg("1");
            }
        }
        EncoderApi::Qsv => {
            if pipeline.scene_detection {
                args.arg("-extbrc").arg("1").arg("-look_ahead_depth").arg("40");
            }
        }
        EncoderApi::Vaapi => {}
    }

    if !gpu_frames {
        let pix_fmt = match api {
            EncoderApi::Software => software_pix_fmt(pipeline.is_high_bit_depth()),
            _ if pipeline.is_high_bit_depth() => "p010le",
            EncoderApi::Nvenc => "yuv420p",
            _ => "nv12",
        };
        args.arg("-pix_fmt").arg(pix_fmt);
    }

    if let Some(threads) = pipeline.threads {
        args.arg("-threads").arg(threads.to_string());
    }
}

/// HDR color tags survive only on encoders that honour the generic flags
fn preserves_color_tags(api: EncoderApi) -> bool {
    matches!(api, EncoderApi::Software | EncoderApi::Nvenc | EncoderApi::Amf)
}

fn color_tag_args(args: &mut ArgList, probe: &MediaProbeResult) {
    args.arg("-color_primaries")
        .arg(probe.color_primaries.as_deref().unwrap_or("bt2020"))
        .arg("-color_trc")
        .arg(probe.color_transfer.as_deref().unwrap_or("smpte2084"))
        .arg("-colorspace")
        .arg(probe.color_space.as_deref().unwrap_or("bt2020nc"));
}

fn hw_device_args(args: &mut ArgList, pipeline: &PipelineDescriptor, hw_decode: bool, cropping: bool) {
    let device = pipeline
        .device_path
        .as_deref()
        .unwrap_or(DEFAULT_RENDER_DEVICE);

    match pipeline.api() {
        EncoderApi::Vaapi => {
            args.arg("-init_hw_device")
                .arg(format!("vaapi=va:{device}"))
                .arg("-filter_hw_device")
                .arg("va");
            if hw_decode {
                args.arg("-hwaccel")
                    .arg("vaapi")
                    .arg("-hwaccel_device")
                    .arg("va")
                    .arg("-hwaccel_output_format")
                    .arg("vaapi");
            }
        }
        EncoderApi::Qsv => {
            args.arg("-init_hw_device")
                .arg(format!("qsv=qs:{device}"))
                .arg("-filter_hw_device")
                .arg("qs");
            if hw_decode {
                args.arg("-hwaccel")
                    .arg("qsv")
                    .arg("-hwaccel_output_format")
                    .arg("qsv");
            }
        }
        EncoderApi::Nvenc if hw_decode => {
            args.arg("-hwaccel").arg("cuda");
            // Cropping needs frames in system memory
            if !cropping {
                args.arg("-hwaccel_output_format").arg("cuda");
            }
        }
        _ => {}
    }
}

// ============================================================================
// Synthesis
// ============================================================================

struct Synthesis<'a> {
    pipeline: &'a PipelineDescriptor,
    probe: &'a MediaProbeResult,
    file_in: &'a Path,
    audio: &'a AudioOptions,
    subtitles: Option<&'a SubtitleOptions>,
    crop: Option<CropRect>,
}

impl Synthesis<'_> {
    fn video_map(&self) -> String {
        self.probe
            .video_stream()
            .map(|s| format!("0:{}", s.index))
            .unwrap_or_else(|| "0:v:0".to_string())
    }

    fn output_codec(&self) -> Option<Codec> {
        if self.pipeline.is_copy() {
            Codec::from_ffprobe_name(&self.probe.current_codec)
        } else {
            Some(self.pipeline.codec)
        }
    }

    fn build(&self, file_out: &Path, sample_seconds: Option<u32>) -> CommandDescriptor {
        let pipeline = self.pipeline;
        let container = container_from_output(file_out);
        let cropping = self.crop.is_some() && !pipeline.is_copy();
        let hw_decode = hw_decode_allowed(pipeline, self.probe, cropping);
        let crop = if pipeline.is_copy() { None } else { self.crop };

        let audio = selected_audio(self.probe, self.audio);
        let subtitles = match (self.subtitles, sample_seconds) {
            (Some(opts), None) => selected_subtitles(self.probe, opts, container),
            _ => Vec::new(),
        };
        let keep_attachments = container == OutputContainer::Mkv
            && self.probe.has_attachments()
            && subtitles
                .iter()
                .any(|(s, codec)| *codec == "ass" || matches!(s.codec.as_str(), "ass" | "ssa"));

        let two_pass = sample_seconds.is_none()
            && pipeline.two_pass
            && pipeline.api() == EncoderApi::Software
            && matches!(pipeline.codec, Codec::H264 | Codec::Hevc | Codec::Vp9);
        let passlog_dir = two_pass.then(|| {
            std::env::temp_dir()
                .join("ffpolicy_2pass")
                .join(Uuid::new_v4().to_string())
        });
        let log_prefix = passlog_dir.as_ref().map(|d| d.join("ffmpeg2pass"));

        let mut args = ArgList::default();
        args.arg("-hide_banner").arg("-nostdin");
        if !pipeline.is_copy() {
            hw_device_args(&mut args, pipeline, hw_decode, cropping);
        }
        args.arg("-i").arg(self.file_in.to_string_lossy());

        match sample_seconds {
            Some(seconds) => {
                args.arg("-t").arg(seconds.to_string());
            }
            None => {
                args.arg("-progress").arg("-").arg("-nostats");
            }
        }

        // Explicit maps: video first, then the selected audio/subtitle streams
        args.arg("-map").arg(self.video_map());
        for stream in &audio {
            args.arg("-map").arg(format!("0:{}", stream.index));
        }
        for (stream, _) in &subtitles {
            args.arg("-map").arg(format!("0:{}", stream.index));
        }
        if keep_attachments {
            args.arg("-map").arg("0:t?");
        }

        if pipeline.is_copy() {
            args.arg("-c:v").arg("copy");
        } else {
            let (filters, gpu_frames) = video_filters(pipeline, self.probe, crop, hw_decode);
            if !filters.is_empty() {
                args.arg("-vf").arg(filters.join(","));
            }
            let pass = log_prefix.as_deref().map(|p| PassInfo {
                pass: 2,
                log_prefix: p,
            });
            video_encoder_args(&mut args, pipeline, gpu_frames, pass);
            if self.probe.has_hdr && preserves_color_tags(pipeline.api()) {
                color_tag_args(&mut args, self.probe);
            }
        }

        if container == OutputContainer::Mp4 && self.output_codec() == Some(Codec::Hevc) {
            args.arg("-tag:v").arg("hvc1");
        }

        for (i, stream) in audio.iter().enumerate() {
            if self.audio.codec == AudioCodecSetting::Copy && audio_copy_allowed(stream, container) {
                args.arg(format!("-c:a:{i}")).arg("copy");
            } else {
                args.arg(format!("-c:a:{i}"))
                    .arg("aac")
                    .arg(format!("-b:a:{i}"))
                    .arg(&self.audio.bitrate);
            }
        }

        if sample_seconds.is_some() {
            args.arg("-sn");
        }
        for (i, (_, codec)) in subtitles.iter().enumerate() {
            args.arg(format!("-c:s:{i}")).arg(*codec);
        }
        if keep_attachments {
            args.arg("-c:t").arg("copy");
        }

        if container == OutputContainer::Mp4 {
            args.arg("-movflags").arg("+faststart");
        }
        args.arg("-y").arg(file_out.to_string_lossy());

        let analysis_pass = log_prefix.as_deref().map(|prefix| {
            let (filters, gpu_frames) = video_filters(pipeline, self.probe, crop, false);
            let mut first = ArgList::default();
            first
                .arg("-hide_banner")
                .arg("-nostdin")
                .arg("-i")
                .arg(self.file_in.to_string_lossy())
                .arg("-map")
                .arg(self.video_map());
            if !filters.is_empty() {
                first.arg("-vf").arg(filters.join(","));
            }
            video_encoder_args(
                &mut first,
                pipeline,
                gpu_frames,
                Some(PassInfo {
                    pass: 1,
                    log_prefix: prefix,
                }),
            );
            first
                .arg("-an")
                .arg("-sn")
                .arg("-f")
                .arg("null")
                .arg("-y")
                .arg(null_output_target());
            first.into_vec()
        });

        CommandDescriptor {
            program: "ffmpeg".to_string(),
            args: args.into_vec(),
            analysis_pass,
            output_path: file_out.to_path_buf(),
            container,
            passlog_dir,
        }
    }
}

/// Build the ffmpeg invocation for a chosen pipeline.
///
/// The output container follows `file_out`'s extension. Nothing is executed here.
pub fn synthesize(
    pipeline: &PipelineDescriptor,
    probe: &MediaProbeResult,
    file_in: &Path,
    file_out: &Path,
    audio_opts: &AudioOptions,
    subtitle_opts: &SubtitleOptions,
    crop_opts: &CropOptions,
) -> CommandDescriptor {
    Synthesis {
        pipeline,
        probe,
        file_in,
        audio: audio_opts,
        subtitles: Some(subtitle_opts),
        crop: crop_opts.effective(probe.resolution),
    }
    .build(file_out, None)
}

/// Single-pass encode of the first `seconds` of the input, used to predict output size
pub fn synthesize_sample(
    pipeline: &PipelineDescriptor,
    probe: &MediaProbeResult,
    file_in: &Path,
    sample_out: &Path,
    audio_opts: &AudioOptions,
    crop_opts: &CropOptions,
    seconds: u32,
) -> CommandDescriptor {
    Synthesis {
        pipeline,
        probe,
        file_in,
        audio: audio_opts,
        subtitles: None,
        crop: crop_opts.effective(probe.resolution),
    }
    .build(sample_out, Some(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::core::policy::{SelectionRequest, select_pipeline};
    use crate::engine::core::types::{Backend, QualityPreset};
    use crate::engine::hardware::{HardwareProfile, VideoEncoder};
    use crate::engine::probe::StreamKind;

    fn stream(index: u32, kind: StreamKind, codec: &str, language: Option<&str>) -> StreamInfo {
        StreamInfo {
            index,
            kind,
            codec: codec.to_string(),
            bitrate: None,
            language: language.map(str::to_string),
            attached_pic: false,
            channels: None,
        }
    }

    fn probe_1080p_h264() -> MediaProbeResult {
        MediaProbeResult {
            duration_seconds: 600.0,
            resolution: Resolution::new(1920, 1080),
            current_codec: "h264".to_string(),
            current_video_bitrate_bps: Some(8_000_000),
            bit_depth: 8,
            file_size_bytes: 600_000_000,
            streams: vec![
                stream(0, StreamKind::Video, "h264", None),
                stream(1, StreamKind::Audio, "dts", Some("eng")),
                stream(2, StreamKind::Audio, "ac3", Some("jpn")),
                stream(3, StreamKind::Subtitle, "subrip", Some("eng")),
                stream(4, StreamKind::Subtitle, "hdmv_pgs_subtitle", Some("eng")),
            ],
            ..MediaProbeResult::default()
        }
    }

    fn cpu_pipeline(preset: QualityPreset) -> PipelineDescriptor {
        let request = SelectionRequest {
            quality_preset: preset,
            ..SelectionRequest::default()
        };
        select_pipeline(&request, &HardwareProfile::software_only(4)).unwrap()
    }

    fn vaapi_pipeline() -> PipelineDescriptor {
        let mut pipeline = cpu_pipeline(QualityPreset::Speed);
        pipeline.backend = Backend::GpuSecondary;
        pipeline.encoder = VideoEncoder::HevcVaapi;
        pipeline.encoder_preset = Some("7");
        pipeline.threads = None;
        pipeline.device_path = Some("/dev/dri/renderD129".to_string());
        pipeline
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_progress_args_present() {
        let cmd = synthesize(
            &cpu_pipeline(QualityPreset::Speed),
            &probe_1080p_h264(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &AudioOptions::default(),
            &SubtitleOptions::default(),
            &CropOptions::default(),
        );
        assert!(has_pair(&cmd.args, "-progress", "-"));
        assert!(cmd.args.contains(&"-nostats".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("out.mkv"));
        assert_eq!(cmd.container, OutputContainer::Mkv);
        assert!(cmd.analysis_pass.is_none());
    }

    #[test]
    fn test_two_pass_software_has_analysis_pass() {
        let cmd = synthesize(
            &cpu_pipeline(QualityPreset::Balanced),
            &probe_1080p_h264(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &AudioOptions::default(),
            &SubtitleOptions::default(),
            &CropOptions::default(),
        );
        let first = cmd.analysis_pass.clone().expect("analysis pass");
        assert!(first.iter().any(|a| a.contains("pass=1")));
        assert!(cmd.args.iter().any(|a| a.contains("pass=2")));
        assert!(first.contains(&"-an".to_string()));
        assert!(cmd.passlog_dir.is_some());
    }

    #[test]
    fn test_vaapi_hw_decode_for_h264() {
        let cmd = synthesize(
            &vaapi_pipeline(),
            &probe_1080p_h264(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &AudioOptions::default(),
            &SubtitleOptions::default(),
            &CropOptions::default(),
        );
        assert!(has_pair(&cmd.args, "-init_hw_device", "vaapi=va:/dev/dri/renderD129"));
        assert!(has_pair(&cmd.args, "-hwaccel_output_format", "vaapi"));
        assert!(!cmd.args.iter().any(|a| a.contains("hwupload")));
    }

    #[test]
    fn test_vaapi_legacy_codec_uses_upload() {
        let mut probe = probe_1080p_h264();
        probe.current_codec = "wmv3".to_string();
        let cmd = synthesize(
            &vaapi_pipeline(),
            &probe,
            Path::new("in.wmv"),
            Path::new("out.mkv"),
            &AudioOptions::default(),
            &SubtitleOptions::default(),
            &CropOptions::default(),
        );
        assert!(!cmd.args.contains(&"-hwaccel".to_string()));
        assert!(has_pair(&cmd.args, "-vf", "format=nv12,hwupload"));
    }

    #[test]
    fn test_vaapi_crop_disables_hw_decode() {
        let crop = CropOptions {
            auto: true,
            detected: Some(CropRect {
                width: 1920,
                height: 800,
                x: 0,
                y: 140,
            }),
            min_dimension: 128,
        };
        let cmd = synthesize(
            &vaapi_pipeline(),
            &probe_1080p_h264(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &AudioOptions::default(),
            &SubtitleOptions::default(),
            &crop,
        );
        assert!(!cmd.args.contains(&"-hwaccel".to_string()));
        assert!(has_pair(&cmd.args, "-vf", "crop=1920:800:0:140,format=nv12,hwupload"));
    }

    #[test]
    fn test_clamp_crop() {
        let frame = Resolution::new(1920, 1080);
        let tiny = CropRect {
            width: 16,
            height: 8,
            x: 1910,
            y: 1075,
        };
        let clamped = clamp_crop(tiny, frame, 128).unwrap();
        assert_eq!((clamped.width, clamped.height), (128, 128));
        assert_eq!((clamped.x, clamped.y), (1792, 952));

        let full = CropRect {
            width: 4000,
            height: 3000,
            x: 0,
            y: 0,
        };
        assert_eq!(clamp_crop(full, frame, 128), None);
    }

    #[test]
    fn test_parse_cropdetect() {
        let stderr = "[Parsed_cropdetect_0 @ 0x55] x1:0 x2:1919 y1:138 y2:941 w:1920 h:800 x:0 y:140 pts:1 t:0.04 limit:0.09 crop=1920:800:0:140\n\
                      [Parsed_cropdetect_0 @ 0x55] x1:0 x2:1919 y1:138 y2:941 w:1920 h:804 x:0 y:138 pts:2 t:0.08 limit:0.09 crop=1920:804:0:138\n";
        assert_eq!(
            parse_cropdetect(stderr),
            Some(CropRect {
                width: 1920,
                height: 804,
                x: 0,
                y: 138
            })
        );
        assert_eq!(parse_cropdetect("no crop here"), None);
    }

    #[test]
    fn test_audio_by_language_falls_back_to_first() {
        let probe = probe_1080p_h264();
        let opts = AudioOptions {
            mode: AudioMode::ByLanguage,
            languages: vec!["ger".to_string()],
            ..AudioOptions::default()
        };
        let picked: Vec<u32> = selected_audio(&probe, &opts).iter().map(|s| s.index).collect();
        assert_eq!(picked, vec![1]);

        let opts = AudioOptions {
            mode: AudioMode::ByLanguage,
            languages: vec!["JPN".to_string()],
            ..AudioOptions::default()
        };
        let picked: Vec<u32> = selected_audio(&probe, &opts).iter().map(|s| s.index).collect();
        assert_eq!(picked, vec![2]);
    }

    #[test]
    fn test_mp4_transcodes_incompatible_audio_and_drops_image_subs() {
        let audio = AudioOptions {
            codec: AudioCodecSetting::Copy,
            ..AudioOptions::default()
        };
        let cmd = synthesize(
            &cpu_pipeline(QualityPreset::Speed),
            &probe_1080p_h264(),
            Path::new("in.mkv"),
            Path::new("out.mp4"),
            &audio,
            &SubtitleOptions::default(),
            &CropOptions::default(),
        );
        // dts cannot live in mp4, ac3 can
        assert!(has_pair(&cmd.args, "-c:a:0", "aac"));
        assert!(has_pair(&cmd.args, "-c:a:1", "copy"));
        assert!(has_pair(&cmd.args, "-c:s:0", "mov_text"));
        assert!(!cmd.args.contains(&"-c:s:1".to_string()));
        assert!(!cmd.args.contains(&"0:4".to_string()));
        assert!(has_pair(&cmd.args, "-tag:v", "hvc1"));
        assert!(has_pair(&cmd.args, "-movflags", "+faststart"));
    }

    #[test]
    fn test_stream_copy() {
        let pipeline = PipelineDescriptor::stream_copy(QualityPreset::Balanced, false);
        let cmd = synthesize(
            &pipeline,
            &probe_1080p_h264(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &AudioOptions::default(),
            &SubtitleOptions::default(),
            &CropOptions::default(),
        );
        assert!(has_pair(&cmd.args, "-c:v", "copy"));
        assert!(!cmd.args.contains(&"-vf".to_string()));
    }

    #[test]
    fn test_sample_command() {
        let cmd = synthesize_sample(
            &cpu_pipeline(QualityPreset::Balanced),
            &probe_1080p_h264(),
            Path::new("in.mkv"),
            Path::new("/tmp/sample.mkv"),
            &AudioOptions::default(),
            &CropOptions::default(),
            60,
        );
        assert!(has_pair(&cmd.args, "-t", "60"));
        assert!(!cmd.args.contains(&"-progress".to_string()));
        assert!(cmd.args.contains(&"-sn".to_string()));
        assert!(cmd.analysis_pass.is_none());
    }

    #[test]
    fn test_resolve_container() {
        assert_eq!(resolve_container(ContainerSetting::Same, Path::new("a.MP4")), OutputContainer::Mp4);
        assert_eq!(resolve_container(ContainerSetting::Same, Path::new("a.avi")), OutputContainer::Mkv);
        assert_eq!(resolve_container(ContainerSetting::Mp4, Path::new("a.mkv")), OutputContainer::Mp4);
    }

    #[test]
    fn test_display_quotes_paths() {
        let cmd = synthesize(
            &cpu_pipeline(QualityPreset::Speed),
            &probe_1080p_h264(),
            Path::new("my movie.mkv"),
            Path::new("out.mkv"),
            &AudioOptions::default(),
            &SubtitleOptions::default(),
            &CropOptions::default(),
        );
        assert!(cmd.display().contains("'my movie.mkv'"));
        assert!(cmd.display().starts_with("ffmpeg -hide_banner"));
    }
}
