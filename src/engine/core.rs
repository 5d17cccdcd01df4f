mod ffmpeg_cmd;
mod ffmpeg_info;
pub mod log;
mod policy;
mod types;

pub use ffmpeg_cmd::{
    AudioOptions, CommandDescriptor, CropOptions, CropRect, SubtitleOptions, clamp_crop,
    container_from_output, cropdetect_args, hw_decode_allowed,
    parse_cropdetect, resolve_container, synthesize, synthesize_sample,
};
pub use ffmpeg_info::{ffmpeg_version, ffprobe_version, run_with_timeout};
pub use log::init_logging;
pub use policy::{
    PipelineDescriptor, PolicyError, PresetSettings, SelectionRequest, backend_order,
    codec_level, codec_profile, crf_value, encoder_preset, preset_settings, select_pipeline,
    software_threads,
};
pub use types::{
    AudioCodecSetting, AudioMode, Backend, Codec, ContainerSetting, EncodingMode,
    OutputContainer, QualityPreset, RateControl, RateControlSetting, Resolution,
    ResolutionTier, SkipDecision, SkipReason, SubtitleMode, format_bitrate, parse_bitrate,
    source_codec_rank,
};
