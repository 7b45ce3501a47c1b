use crate::progress::{ProgressHandle, Task};

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const STDERR_TAIL_LINES: usize = 20;

/// Executables the pipeline shells out to.
#[derive(Debug, Clone)]
pub struct Tools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

pub fn ensure_tool_available(program: &Path) -> Result<()> {
    let out = Command::new(program)
        .arg("-version")
        .output()
        .with_context(|| format!("failed to run {} -version", program.display()))?;
    if !out.status.success() {
        bail!(
            "{} exists but returned non-zero on -version",
            program.display()
        );
    }
    Ok(())
}

/// Output-side encoder settings shared by the clip and composite encodes.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub pix_fmt: String,
    pub crf: Option<u8>,
    /// Per-process `-threads`; `None` lets ffmpeg decide.
    pub threads: Option<usize>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            pix_fmt: "yuv420p".to_string(),
            crf: None,
            threads: None,
        }
    }
}

impl EncodeOptions {
    pub fn output_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![];
        args.push("-c:v".into());
        args.push("libx264".into());
        if let Some(crf) = self.crf {
            args.push("-crf".into());
            args.push(crf.to_string().into());
        }
        args.push("-pix_fmt".into());
        args.push(self.pix_fmt.clone().into());
        if let Some(t) = self.threads {
            args.push("-threads".into());
            args.push(t.max(1).to_string().into());
        }
        // reproducible container and stream headers across reruns
        for a in ["-map_metadata", "-1", "-fflags", "+bitexact", "-flags:v", "+bitexact"] {
            args.push(a.into());
        }
        args
    }
}

/// One ffmpeg invocation producing one output file.
#[derive(Debug, Clone)]
pub struct FfmpegJob {
    pub task: Task,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub output: PathBuf,
}

impl FfmpegJob {
    /// Starts the argument list with the flags every job shares.
    pub fn new(task: Task, program: &Path, output: &Path) -> Self {
        let mut job = Self {
            task,
            program: program.to_path_buf(),
            args: vec![],
            output: output.to_path_buf(),
        };
        job.args_mut([
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "error",
            "-nostats",
            "-progress",
            "pipe:1",
            "-y",
        ]);
        job
    }

    pub fn arg(&mut self, a: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(a.as_ref().to_os_string());
        self
    }

    pub fn args_mut<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for a in args {
            self.arg(a);
        }
        self
    }

    /// Appends encoder settings and the output path; call last.
    pub fn finish(&mut self, options: &EncodeOptions) -> &mut Self {
        let out = self.output.clone();
        self.args_mut(options.output_args()).arg(out)
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|a| shell_quote(&a.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub output: PathBuf,
    pub frames: u64,
    pub elapsed: Duration,
}

/// ffmpeg ran but exited unsuccessfully. Carries the exit code so `main` can mirror it.
#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub label: String,
    pub output: PathBuf,
    pub status: String,
    pub code: Option<i32>,
    pub frames: u64,
    pub stderr_tail: Vec<String>,
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ffmpeg failed stage={} output={} status={} frames={}",
            self.label,
            self.output.display(),
            self.status,
            self.frames
        )?;
        if self.stderr_tail.is_empty() {
            write!(f, " stderr_tail=<no ffmpeg stderr>")
        } else {
            for line in &self.stderr_tail {
                write!(f, "\n  {}", line)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ToolFailure {}

impl ToolFailure {
    fn from_status(job: &FfmpegJob, status: ExitStatus, frames: u64, stderr_tail: Vec<String>) -> Self {
        Self {
            label: job.task.to_string(),
            output: job.output.clone(),
            status: status.to_string(),
            code: status.code(),
            frames,
            stderr_tail,
        }
    }
}

/// Runs the job to completion, reporting `frame=` progress under the job's task.
pub fn run_job(job: &FfmpegJob, progress: &ProgressHandle) -> Result<JobOutcome> {
    let started = Instant::now();
    progress.start_task(job.task);

    let mut child = Command::new(&job.program)
        .args(&job.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {} for {}", job.program.display(), job.task))?;

    let stderr_handle = child.stderr.take().map(spawn_stderr_collector);
    let mut frames = 0u64;
    let read_error = match child.stdout.take() {
        Some(stdout) => follow_progress(stdout, |n| {
            if n > frames {
                frames = n;
                progress.task_frames(job.task, n);
            }
        })
        .err(),
        None => Some(io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdout missing")),
    };

    // the child is always reaped and its stderr drained, even after a read error
    let status = child
        .wait()
        .with_context(|| format!("wait for ffmpeg ({})", job.task))?;
    let stderr_tail = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    if !status.success() {
        progress.finish_task(job.task, false);
        return Err(ToolFailure::from_status(job, status, frames, stderr_tail).into());
    }
    if let Some(e) = read_error {
        progress.finish_task(job.task, false);
        return Err(anyhow::Error::new(e).context(format!("read ffmpeg progress ({})", job.task)));
    }

    progress.finish_task(job.task, true);
    Ok(JobOutcome {
        output: job.output.clone(),
        frames,
        elapsed: started.elapsed(),
    })
}

/// Feeds every `frame=` value to `on_frame` until EOF. Lines need not be UTF-8.
fn follow_progress(stdout: impl Read, mut on_frame: impl FnMut(u64)) -> io::Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        if let Some(n) = parse_frame_line(&String::from_utf8_lossy(&buf)) {
            on_frame(n);
        }
    }
}

/// `-progress` emits `key=value` lines; only the frame counter matters here.
fn parse_frame_line(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    if key.trim() != "frame" {
        return None;
    }
    value.trim().parse().ok()
}

fn spawn_stderr_collector(stderr: impl Read + Send + 'static) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut lines = VecDeque::new();
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).unwrap_or(0);
            if read == 0 {
                break;
            }
            let cleaned = String::from_utf8_lossy(&buf).trim_end().to_string();
            if cleaned.trim().is_empty() {
                continue;
            }
            lines.push_back(cleaned);
            if lines.len() > STDERR_TAIL_LINES {
                lines.pop_front();
            }
        }

        lines.into_iter().collect::<Vec<_>>()
    })
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_-./%:=+,@".contains(&b));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StreamKind;
    use crate::progress::ProgressReporter;

    #[cfg(unix)]
    fn sh_job(script: &str) -> FfmpegJob {
        FfmpegJob {
            task: Task::Clip(StreamKind::Depth),
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
            output: PathBuf::from("fake.mp4"),
        }
    }

    #[test]
    fn frame_lines_parse_and_others_are_skipped() {
        assert_eq!(parse_frame_line("frame=42\n"), Some(42));
        assert_eq!(parse_frame_line("frame= 7"), Some(7));
        assert_eq!(parse_frame_line("fps=23.98"), None);
        assert_eq!(parse_frame_line("progress=end"), None);
        assert_eq!(parse_frame_line("garbage"), None);
    }

    #[test]
    fn job_arguments_start_with_shared_flags_and_end_with_output() {
        let mut job = FfmpegJob::new(
            Task::Clip(StreamKind::Camera),
            Path::new("ffmpeg"),
            Path::new("out/x.mp4"),
        );
        job.args_mut(["-framerate", "24"]).finish(&EncodeOptions::default());

        let args = job
            .args
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(args.first().map(String::as_str), Some("-hide_banner"));
        assert!(args.iter().any(|a| a == "-y"));
        assert!(args.windows(2).any(|w| w == ["-progress", "pipe:1"]));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "yuv420p"]));
        assert!(args.windows(2).any(|w| w == ["-fflags", "+bitexact"]));
        assert_eq!(args.last().map(String::as_str), Some("out/x.mp4"));
    }

    #[test]
    fn crf_and_threads_are_optional() {
        let opts = EncodeOptions {
            crf: Some(18),
            threads: Some(0),
            ..EncodeOptions::default()
        };
        let args = opts
            .output_args()
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert!(args.windows(2).any(|w| w == ["-crf", "18"]));
        assert!(args.windows(2).any(|w| w == ["-threads", "1"]));

        let plain = EncodeOptions::default().output_args();
        assert!(!plain.iter().any(|a| a == "-crf" || a == "-threads"));
    }

    #[test]
    fn command_line_quotes_only_when_needed() {
        assert_eq!(shell_quote("west_coast_%06d.png"), "west_coast_%06d.png");
        assert_eq!(shell_quote("my frames/a.png"), "'my frames/a.png'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn failure_message_keeps_stderr_lines_verbatim() {
        let failure = ToolFailure {
            label: "clip depth".to_string(),
            output: PathBuf::from("italy_depth.mp4"),
            status: "exit status: 1".to_string(),
            code: Some(1),
            frames: 0,
            stderr_tail: vec!["italy_%06d_depth.png: No such file or directory".to_string()],
        };
        let text = failure.to_string();
        assert!(text.contains("stage=clip depth"));
        assert!(text.contains("\n  italy_%06d_depth.png: No such file or directory"));
    }

    #[cfg(unix)]
    #[test]
    fn run_job_surfaces_exit_code_of_failing_tool() {
        let (_reporter, handle) = ProgressReporter::quiet("test");
        let job = sh_job("echo frame=3; echo boom >&2; exit 3");

        let err = run_job(&job, &handle).expect_err("sh exits 3");
        let failure = err.downcast_ref::<ToolFailure>().expect("typed failure");
        assert_eq!(failure.code, Some(3));
        assert_eq!(failure.frames, 3);
        assert_eq!(failure.label, "clip depth");
        assert_eq!(failure.stderr_tail, vec!["boom".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_output_still_yields_the_tool_failure() {
        let (_reporter, handle) = ProgressReporter::quiet("test");
        let job = sh_job("printf 'frame=1\\n\\377\\n'; printf 'bad \\377 byte\\n' >&2; exit 7");

        let err = run_job(&job, &handle).expect_err("sh exits 7");
        let failure = err.downcast_ref::<ToolFailure>().expect("typed failure");
        assert_eq!(failure.code, Some(7));
        assert_eq!(failure.frames, 1);
        assert_eq!(failure.label, "clip depth");
        assert_eq!(failure.stderr_tail.len(), 1);
        assert!(failure.stderr_tail[0].starts_with("bad "));
    }

    #[cfg(unix)]
    #[test]
    fn run_job_counts_progress_frames() {
        let (reporter, handle) = ProgressReporter::quiet("test");
        let job = sh_job("printf 'frame=2\\nprogress=continue\\n\\377\\nframe=5\\nprogress=end\\n'");

        let outcome = run_job(&job, &handle).expect("sh exits 0");
        assert_eq!(outcome.frames, 5);
        assert_eq!(reporter.finish("done").frames, 5);
    }
}
