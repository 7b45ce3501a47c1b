use crate::ffmpeg::{self, EncodeOptions, FfmpegJob};
use crate::layout::{MapLayout, StreamKind};
use crate::progress::{ClipSummary, ProgressHandle, Task};

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// One frame sequence to be turned into one clip.
#[derive(Debug, Clone)]
pub struct ClipJob {
    pub kind: StreamKind,
    pub pattern: PathBuf,
    pub start_number: u64,
    pub job: FfmpegJob,
}

pub fn clip_job(
    layout: &MapLayout,
    kind: StreamKind,
    start_number: u64,
    fps: u32,
    ffmpeg: &Path,
    options: &EncodeOptions,
) -> ClipJob {
    let pattern = layout.frame_pattern(kind);
    let mut job = FfmpegJob::new(Task::Clip(kind), ffmpeg, &layout.clip_path(kind));
    job.arg("-framerate")
        .arg(fps.to_string())
        .arg("-start_number")
        .arg(start_number.to_string())
        .arg("-i")
        .arg(&pattern)
        .finish(options);
    ClipJob {
        kind,
        pattern,
        start_number,
        job,
    }
}

/// Encodes every clip, either one after another or all at once.
///
/// In parallel mode every encode is joined even when one fails; the error
/// reported is the first one in job order.
pub fn encode_clips(
    jobs: Vec<ClipJob>,
    parallel: bool,
    progress: &ProgressHandle,
) -> Result<Vec<ClipSummary>> {
    if !parallel {
        let mut out = Vec::with_capacity(jobs.len());
        for cj in &jobs {
            out.push(encode_one(cj, progress)?);
        }
        return Ok(out);
    }

    let mut handles = vec![];
    for cj in jobs {
        let progress = progress.clone();
        handles.push((
            cj.kind,
            std::thread::spawn(move || encode_one(&cj, &progress)),
        ));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (kind, h) in handles {
        let res = h
            .join()
            .map_err(|_| anyhow!("encoder thread for {} panicked", kind))
            .and_then(|r| r);
        results.push(res);
    }
    results.into_iter().collect()
}

fn encode_one(cj: &ClipJob, progress: &ProgressHandle) -> Result<ClipSummary> {
    progress.log(format!(
        "encoding {} frames from {} (start={})",
        cj.kind,
        cj.pattern.display(),
        cj.start_number
    ));

    let outcome = ffmpeg::run_job(&cj.job, progress)?;
    Ok(ClipSummary {
        kind: cj.kind,
        output: outcome.output,
        start_number: cj.start_number,
        frames: outcome.frames,
        elapsed: outcome.elapsed,
        probe: None,
    })
}
