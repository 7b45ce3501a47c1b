mod compositor;
mod encoder;
mod ffmpeg;
mod layout;
mod manifest;
mod pipeline;
mod probe;
mod progress;
mod scan;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use ffmpeg::{EncodeOptions, Tools, ToolFailure};
use pipeline::{PipelineConfig, DEFAULT_FPS};
use progress::{format_duration, format_rate, PipelineSummary, ProgressConfig, ProgressMode};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "framestack",
    version,
    about = "Encode a map's annotation, camera and depth frames into clips and stack them into one video"
)]
struct Cli {
    /// Dataset root holding images/<map>/{annotation,camera,depth}/
    dataset: PathBuf,

    /// Map name: the subdirectory under images/ and the frame filename prefix
    map: String,

    /// Frame rate of the produced clips.
    #[arg(long, default_value_t = DEFAULT_FPS, value_parser = clap::value_parser!(u32).range(1..))]
    fps: u32,

    /// Directory the clips and the composite are written to.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// First frame index for every stream. Default: lowest index found on disk.
    #[arg(long)]
    start_number: Option<u64>,

    /// Encode the three streams concurrently.
    #[arg(long, default_value_t = false)]
    parallel: bool,

    /// libx264 constant rate factor (0-51). Default: encoder default.
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=51))]
    crf: Option<u8>,

    /// Output pixel format.
    #[arg(long, default_value = "yuv420p")]
    pix_fmt: String,

    /// ffmpeg executable.
    #[arg(long, env = "FRAMESTACK_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// ffprobe executable (only used with --probe).
    #[arg(long, env = "FRAMESTACK_FFPROBE", default_value = "ffprobe")]
    ffprobe: PathBuf,

    /// Probe every produced file and report frame count, size and duration.
    #[arg(long, default_value_t = false)]
    probe: bool,

    /// Print the ffmpeg commands instead of running them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
    #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,
}

impl Cli {
    fn into_config(self) -> PipelineConfig {
        let mut cfg = PipelineConfig::new(self.dataset, self.map);
        cfg.output_dir = self.output_dir;
        cfg.fps = self.fps;
        cfg.start_number = self.start_number;
        cfg.parallel = self.parallel;
        cfg.encode = EncodeOptions {
            pix_fmt: self.pix_fmt,
            crf: self.crf,
            threads: None,
        };
        cfg.tools = Tools {
            ffmpeg: self.ffmpeg,
            ffprobe: self.ffprobe,
        };
        cfg.probe = self.probe;
        cfg.progress = ProgressConfig::new(self.progress);
        cfg
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            if err.print().is_err() {
                eprintln!("{}", err);
            }
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:?}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let dry_run = cli.dry_run;
    let cfg = cli.into_config();

    if dry_run {
        let plan = pipeline::plan(&cfg)?;
        for warning in &plan.scan.warnings {
            eprintln!("[WARN] plan: {}", warning);
        }
        for line in plan.command_lines() {
            println!("{}", line);
        }
        return Ok(());
    }

    ffmpeg::ensure_tool_available(&cfg.tools.ffmpeg).context("ffmpeg not found")?;
    if cfg.probe {
        ffmpeg::ensure_tool_available(&cfg.tools.ffprobe).context("ffprobe not found")?;
    }

    let summary = pipeline::run(&cfg)?;
    print_summary(&summary);
    Ok(())
}

/// Mirrors ffmpeg's own exit code when it is the reason the run stopped.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| e.downcast_ref::<ToolFailure>())
        .and_then(|f| f.code)
        .and_then(|c| u8::try_from(c).ok())
        .filter(|&c| c != 0)
        .unwrap_or(1)
}

fn print_summary(summary: &PipelineSummary) {
    for clip in &summary.clips {
        println!(
            "Clip summary: stream={} output={} start={} frames={} duration={}{}",
            clip.kind,
            clip.output.display(),
            clip.start_number,
            clip.frames,
            format_duration(clip.elapsed),
            clip.probe
                .as_ref()
                .map(|p| format!(" probe=[{}]", p))
                .unwrap_or_default()
        );
    }
    println!(
        "Composite summary: output={} frames={} duration={}{}",
        summary.composite.output.display(),
        summary.composite.frames,
        format_duration(summary.composite.elapsed),
        summary
            .composite
            .probe
            .as_ref()
            .map(|p| format!(" probe=[{}]", p))
            .unwrap_or_default()
    );
    println!("{}", stack_summary_line(summary));
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}

fn stack_summary_line(summary: &PipelineSummary) -> String {
    format!(
        "Stack summary: map={} output_dir={} fps={} parallel={} frames={}/{} duration={} rate={} warnings={}",
        summary.map,
        summary.output_dir.display(),
        summary.fps,
        summary.parallel,
        summary.frames,
        summary.expected_frames,
        format_duration(summary.elapsed),
        format_rate(summary.avg_frames_per_sec),
        summary.warning_count,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_map_onto_pipeline_config() {
        let cli = Cli::try_parse_from(["framestack", "data", "west_coast"]).expect("parse");
        let cfg = cli.into_config();
        assert_eq!(cfg.fps, 24);
        assert_eq!(cfg.output_dir, PathBuf::from("."));
        assert_eq!(cfg.encode.pix_fmt, "yuv420p");
        assert!(cfg.start_number.is_none());
        assert!(!cfg.parallel);
    }

    #[test]
    fn zero_fps_and_out_of_range_crf_are_rejected() {
        assert!(Cli::try_parse_from(["framestack", "d", "m", "--fps", "0"]).is_err());
        assert!(Cli::try_parse_from(["framestack", "d", "m", "--crf", "52"]).is_err());
        assert!(Cli::try_parse_from(["framestack", "d", "m", "--crf", "51"]).is_ok());
    }

    #[test]
    fn missing_map_is_a_usage_error() {
        let err = Cli::try_parse_from(["framestack", "data"])
            .err()
            .expect("map is required");
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn exit_code_follows_tool_failure() {
        let failure = ToolFailure {
            label: "composite".to_string(),
            output: PathBuf::from("m.mp4"),
            status: "exit status: 234".to_string(),
            code: Some(234),
            frames: 0,
            stderr_tail: vec![],
        };
        let err = anyhow::Error::new(failure).context("stack clips");
        assert_eq!(exit_code_for(&err), 234);

        let other = anyhow::anyhow!("scan failed");
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn stack_summary_reports_frames_against_the_plan() {
        let summary = PipelineSummary {
            map: "italy".to_string(),
            output_dir: PathBuf::from("videos"),
            fps: 24,
            parallel: true,
            clips: vec![],
            composite: progress::CompositeSummary {
                output: PathBuf::from("videos/italy.mp4"),
                frames: 8,
                elapsed: std::time::Duration::from_secs(1),
                probe: None,
            },
            frames: 38,
            expected_frames: 40,
            elapsed: std::time::Duration::from_secs(2),
            avg_frames_per_sec: 19.0,
            warning_count: 40,
            warnings: vec!["camera frames: 1 gap(s)".to_string()],
        };
        assert_eq!(
            stack_summary_line(&summary),
            "Stack summary: map=italy output_dir=videos fps=24 parallel=true frames=38/40 \
             duration=00:02 rate=19.0 frames/s warnings=40"
        );
    }
}
