use clap::{ArgAction, Parser, Subcommand};
use ffpolicy::engine::core::log::DEFAULT_LOG_FILE;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ffpolicy")]
#[command(about = "Hardware-aware FFmpeg transcode policy engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Append logs to a file instead of stderr (`--log-file` alone uses ./ffpolicy.log)
    #[arg(
        long,
        value_name = "PATH",
        global = true,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = DEFAULT_LOG_FILE
    )]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check if ffmpeg and ffprobe are installed
    CheckFfmpeg,

    /// Detect CPU, GPUs and the encoders each backend can use
    Hardware {
        /// Print the hardware profile as JSON
        #[arg(long)]
        json: bool,
    },

    /// Probe a media file and print what the engine sees
    Probe {
        /// Path to the media file
        file: PathBuf,

        /// Print the probe result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan a transcode: validate, skip-check, select a pipeline and print the command
    Plan {
        /// Input media file
        file: PathBuf,

        /// Output path (extension follows the configured container)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,

        /// Config file to use instead of the default location
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Read ffmpeg output from stdin and print completion percentage
    Progress {
        /// Total media duration in seconds
        #[arg(long)]
        duration: f64,
    },

    /// Show config status and location, or create default config if missing
    InitConfig,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_plan_with_global_flags() {
        let cli = Cli::try_parse_from([
            "ffpolicy", "plan", "movie.mkv", "--json", "-vv", "--output", "out.mkv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Plan { file, output, json, config } => {
                assert_eq!(file, PathBuf::from("movie.mkv"));
                assert_eq!(output, Some(PathBuf::from("out.mkv")));
                assert!(json);
                assert!(config.is_none());
            }
            _ => panic!("expected plan"),
        }
    }

    #[test]
    fn test_bare_log_file_uses_default_name() {
        let cli = Cli::try_parse_from(["ffpolicy", "--log-file", "hardware"]).unwrap();
        assert_eq!(cli.log_file, Some(PathBuf::from(DEFAULT_LOG_FILE)));
        assert!(matches!(cli.command, Commands::Hardware { json: false }));

        let cli = Cli::try_parse_from(["ffpolicy", "hardware", "--log-file=/tmp/x.log"]).unwrap();
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/x.log")));
    }
}
