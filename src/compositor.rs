use crate::ffmpeg::{self, EncodeOptions, FfmpegJob};
use crate::progress::{CompositeSummary, ProgressHandle, Task};

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Stacks the inputs top to bottom in the order given. The result ends with the shortest input.
pub fn composite_job(
    inputs: &[PathBuf],
    output: &Path,
    ffmpeg: &Path,
    options: &EncodeOptions,
) -> Result<FfmpegJob> {
    if inputs.len() < 2 {
        bail!("vertical stack needs at least two clips, got {}", inputs.len());
    }

    let mut job = FfmpegJob::new(Task::Composite, ffmpeg, output);
    for input in inputs {
        job.arg("-i").arg(input);
    }
    job.arg("-filter_complex")
        .arg(vstack_filter(inputs.len()))
        .finish(options);
    Ok(job)
}

fn vstack_filter(inputs: usize) -> String {
    format!("vstack=inputs={}:shortest=1", inputs)
}

pub fn run_composite(job: &FfmpegJob, progress: &ProgressHandle) -> Result<CompositeSummary> {
    progress.log(format!("stacking clips into {}", job.output.display()));
    let outcome = ffmpeg::run_job(job, progress)?;
    Ok(CompositeSummary {
        output: outcome.output,
        frames: outcome.frames,
        elapsed: outcome.elapsed,
        probe: None,
    })
}
