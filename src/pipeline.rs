use crate::compositor;
use crate::encoder::{self, ClipJob};
use crate::ffmpeg::{EncodeOptions, FfmpegJob, Tools};
use crate::layout::{MapLayout, StreamKind};
use crate::probe;
use crate::progress::{PipelineSummary, ProgressConfig, ProgressReporter, Task};
use crate::scan::{self, DatasetScan, StreamScan};

use anyhow::{Context, Result};
use std::path::PathBuf;

pub const DEFAULT_FPS: u32 = 24;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dataset_root: PathBuf,
    pub map: String,
    pub output_dir: PathBuf,
    pub fps: u32,
    /// Overrides the first frame index found by the scan, for every stream.
    pub start_number: Option<u64>,
    pub parallel: bool,
    pub encode: EncodeOptions,
    pub tools: Tools,
    pub probe: bool,
    pub progress: ProgressConfig,
}

impl PipelineConfig {
    pub fn new(dataset_root: impl Into<PathBuf>, map: impl Into<String>) -> Self {
        Self {
            dataset_root: dataset_root.into(),
            map: map.into(),
            output_dir: PathBuf::from("."),
            fps: DEFAULT_FPS,
            start_number: None,
            parallel: false,
            encode: EncodeOptions::default(),
            tools: Tools::default(),
            probe: false,
            progress: ProgressConfig::default(),
        }
    }

    pub fn layout(&self) -> MapLayout {
        MapLayout::new(&self.dataset_root, &self.map, &self.output_dir)
    }
}

/// Everything the run would execute, computed before any subprocess starts.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub layout: MapLayout,
    pub scan: DatasetScan,
    pub clips: Vec<ClipJob>,
    pub composite: FfmpegJob,
}

impl PipelinePlan {
    pub fn command_lines(&self) -> Vec<String> {
        self.clips
            .iter()
            .map(|c| c.job.command_line())
            .chain(std::iter::once(self.composite.command_line()))
            .collect()
    }

    /// Frames each ffmpeg run should reach, judged from the scan.
    pub fn task_frames(&self) -> Vec<(Task, u64)> {
        self.clips
            .iter()
            .map(|c| {
                let frames = self
                    .scan
                    .stream(c.kind)
                    .map_or(0, StreamScan::contiguous_frames);
                (Task::Clip(c.kind), frames)
            })
            .chain(std::iter::once((
                Task::Composite,
                self.scan.expected_composite_frames(),
            )))
            .collect()
    }
}

pub fn plan(cfg: &PipelineConfig) -> Result<PipelinePlan> {
    let layout = cfg.layout();
    let scan = scan::scan_dataset(&layout)
        .with_context(|| format!("scan frames under {}", layout.map_dir().display()))?;

    let mut encode = cfg.encode.clone();
    if cfg.parallel && encode.threads.is_none() {
        encode.threads = Some((num_cpus::get() / StreamKind::ALL.len()).max(1));
    }

    let clips = StreamKind::ALL
        .iter()
        .map(|&kind| {
            let start = cfg.start_number.unwrap_or_else(|| {
                scan.stream(kind).map(|s| s.start_number()).unwrap_or(0)
            });
            encoder::clip_job(&layout, kind, start, cfg.fps, &cfg.tools.ffmpeg, &encode)
        })
        .collect::<Vec<_>>();

    let clip_paths = clips.iter().map(|c| c.job.output.clone()).collect::<Vec<_>>();
    let composite = compositor::composite_job(
        &clip_paths,
        &layout.composite_path(),
        &cfg.tools.ffmpeg,
        &cfg.encode,
    )?;

    Ok(PipelinePlan {
        layout,
        scan,
        clips,
        composite,
    })
}

/// Scan, encode the three clips, stack them, and optionally probe the results.
pub fn run(cfg: &PipelineConfig) -> Result<PipelineSummary> {
    let plan = plan(cfg)?;

    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("create output dir {}", cfg.output_dir.display()))?;

    let reporter = ProgressReporter::new("stack", &plan.task_frames(), cfg.progress);
    let progress = reporter.handle();

    if let Some(params) = &plan.scan.parameters {
        progress.log(format!(
            "capture parameters: experiment={} camera={} fov={} imgs_per_map={}",
            params.experiment_name.as_deref().unwrap_or("-"),
            params
                .camera_res
                .map(|[w, h]| format!("{}x{}", w, h))
                .unwrap_or_else(|| "-".to_string()),
            params
                .camera_fov
                .map(|f| format!("{}", f))
                .unwrap_or_else(|| "-".to_string()),
            params
                .imgs_per_map
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string())
        ));
    }
    for s in &plan.scan.streams {
        if let (Some(first), Some(last)) = (s.first_index, s.last_index) {
            progress.log(format!(
                "{} frames: {:06}..={:06} ({} on disk)",
                s.kind, first, last, s.frame_count
            ));
        }
    }
    for warning in &plan.scan.warnings {
        progress.warn(warning.clone());
    }

    progress.set_stage(if cfg.parallel {
        "phase 1/2: encode clips (parallel)"
    } else {
        "phase 1/2: encode clips"
    });
    let mut clips = encoder::encode_clips(plan.clips.clone(), cfg.parallel, &progress)?;

    progress.set_stage("phase 2/2: composite");
    let mut composite = compositor::run_composite(&plan.composite, &progress)?;

    if cfg.probe {
        progress.set_stage("probe outputs");
        for clip in &mut clips {
            clip.probe = Some(probe::probe_video(&cfg.tools.ffprobe, &clip.output)?);
        }
        composite.probe = Some(probe::probe_video(&cfg.tools.ffprobe, &composite.output)?);
    }

    let outcome = reporter.finish(format!("{} complete", plan.layout.composite_path().display()));

    Ok(PipelineSummary {
        map: cfg.map.clone(),
        output_dir: cfg.output_dir.clone(),
        fps: cfg.fps,
        parallel: cfg.parallel,
        clips,
        composite,
        frames: outcome.frames,
        expected_frames: outcome.expected_frames,
        elapsed: outcome.elapsed,
        avg_frames_per_sec: outcome.avg_frames_per_sec,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}
