use crate::layout::StreamKind;
use crate::probe::ProbeInfo;

use clap::ValueEnum;
use indicatif::{HumanCount, MultiProgress, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const KEPT_WARNINGS: usize = 32;
const TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

impl ProgressMode {
    /// Turns `Auto` into `Rich` on a terminal and `Plain` otherwise.
    fn settle(self, stderr_is_tty: bool) -> ProgressMode {
        match self {
            ProgressMode::Auto if stderr_is_tty => ProgressMode::Rich,
            ProgressMode::Auto => ProgressMode::Plain,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// A running ffmpeg with no new frame for this long is reported.
    pub stall_after: Duration,
    pub plain_every: Duration,
    stderr_is_tty: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            stall_after: Duration::from_secs(30),
            plain_every: Duration::from_secs(2),
            stderr_is_tty: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    fn with_tty(mut self, is_tty: bool) -> Self {
        self.stderr_is_tty = Some(is_tty);
        self
    }

    fn effective_mode(&self) -> ProgressMode {
        let tty = self
            .stderr_is_tty
            .unwrap_or_else(|| std::io::stderr().is_terminal());
        self.mode.settle(tty)
    }
}

/// One ffmpeg run of the pipeline. Orders as the pipeline runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Task {
    Clip(StreamKind),
    Composite,
}

impl Task {
    fn key(self) -> &'static str {
        match self {
            Task::Clip(kind) => kind.name(),
            Task::Composite => "composite",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Clip(kind) => write!(f, "clip {}", kind),
            Task::Composite => f.write_str("composite"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClipSummary {
    pub kind: StreamKind,
    pub output: PathBuf,
    pub start_number: u64,
    pub frames: u64,
    pub elapsed: Duration,
    pub probe: Option<ProbeInfo>,
}

#[derive(Debug, Clone)]
pub struct CompositeSummary {
    pub output: PathBuf,
    pub frames: u64,
    pub elapsed: Duration,
    pub probe: Option<ProbeInfo>,
}

#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub map: String,
    pub output_dir: PathBuf,
    pub fps: u32,
    pub parallel: bool,
    pub clips: Vec<ClipSummary>,
    pub composite: CompositeSummary,
    pub frames: u64,
    pub expected_frames: u64,
    pub elapsed: Duration,
    pub avg_frames_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

/// Totals across every task once the reporter closes.
#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub frames: u64,
    pub expected_frames: u64,
    pub avg_frames_per_sec: f64,
    /// Every warning raised, including ones no longer kept in `warnings`.
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Running,
    Done,
    Failed,
}

#[derive(Debug)]
struct TaskState {
    expected: u64,
    frames: u64,
    phase: Phase,
    last_frame_at: Instant,
}

impl TaskState {
    fn new(expected: u64, now: Instant) -> Self {
        Self {
            expected,
            frames: 0,
            phase: Phase::Waiting,
            last_frame_at: now,
        }
    }
}

#[derive(Debug)]
struct Board {
    started: Instant,
    stage: String,
    tasks: BTreeMap<Task, TaskState>,
    last_plain: Option<Instant>,
    last_stall_warn: Option<Instant>,
    warnings: Vec<String>,
    warning_total: usize,
}

impl Board {
    fn new(plan: &[(Task, u64)], now: Instant) -> Self {
        Self {
            started: now,
            stage: "starting".to_string(),
            tasks: plan
                .iter()
                .map(|&(task, expected)| (task, TaskState::new(expected, now)))
                .collect(),
            last_plain: None,
            last_stall_warn: None,
            warnings: vec![],
            warning_total: 0,
        }
    }

    fn task(&mut self, task: Task) -> &mut TaskState {
        self.tasks
            .entry(task)
            .or_insert_with(|| TaskState::new(0, Instant::now()))
    }

    fn remember(&mut self, message: &str) {
        self.warning_total += 1;
        if self.warnings.len() >= KEPT_WARNINGS {
            self.warnings.remove(0);
        }
        self.warnings.push(message.to_string());
    }

    /// First running task that has not produced a frame for `after`.
    fn stalled(&self, now: Instant, after: Duration) -> Option<(Task, Duration)> {
        self.tasks.iter().find_map(|(&task, t)| {
            let idle = now.saturating_duration_since(t.last_frame_at);
            (t.phase == Phase::Running && idle >= after).then_some((task, idle))
        })
    }

    /// `key=frames/expected`, with `+` on running tasks and `!` on failed ones.
    fn status_line(&self, label: &str) -> String {
        let tasks = self
            .tasks
            .iter()
            .map(|(task, t)| {
                let mark = match t.phase {
                    Phase::Running => "+",
                    Phase::Failed => "!",
                    Phase::Waiting | Phase::Done => "",
                };
                format!("{}={}/{}{}", task.key(), t.frames, t.expected, mark)
            })
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "[PROGRESS] {} elapsed={} stage={} {}",
            label,
            format_duration(self.started.elapsed()),
            self.stage,
            tasks
        )
    }

    fn outcome(&self) -> ProgressOutcome {
        let elapsed = self.started.elapsed();
        let frames = self.tasks.values().map(|t| t.frames).sum();
        ProgressOutcome {
            elapsed,
            frames,
            expected_frames: self.tasks.values().map(|t| t.expected).sum(),
            avg_frames_per_sec: average_rate(frames, elapsed),
            warning_count: self.warning_total,
            warnings: self.warnings.clone(),
        }
    }
}

/// Terminal bars: a stage spinner over one frame bar per task.
struct Bars {
    multi: MultiProgress,
    stage: ProgressBar,
    tasks: BTreeMap<Task, ProgressBar>,
}

impl Bars {
    fn new(label: &str, plan: &[(Task, u64)]) -> Self {
        let multi = MultiProgress::new();

        let stage = multi.add(ProgressBar::new_spinner());
        stage.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {prefix:.bold} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        stage.set_prefix(label.to_string());
        stage.set_message("starting");
        stage.enable_steady_tick(Duration::from_millis(120));

        let style = ProgressStyle::with_template(
            "  {prefix:>10.bold} {bar:30.cyan/blue} {human_pos:>6}/{human_len:6} frames {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let tasks = plan
            .iter()
            .map(|&(task, expected)| {
                let bar = multi.add(ProgressBar::new(expected));
                bar.set_style(style.clone());
                bar.set_prefix(task.key());
                bar.set_message("waiting");
                (task, bar)
            })
            .collect();

        Self {
            multi,
            stage,
            tasks,
        }
    }
}

struct Shared {
    label: String,
    mode: ProgressMode,
    config: ProgressConfig,
    board: Mutex<Board>,
    bars: Option<Bars>,
    stop: AtomicBool,
    closed: AtomicBool,
}

/// Cloneable sink the ffmpeg runners report into.
#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

/// Owns the display for one run; closing it yields the totals.
pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

/// A poisoned lock only means another reporter call panicked; the counters are still usable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProgressReporter {
    /// `plan` lists every task with the frame count it is expected to reach.
    pub fn new(label: impl Into<String>, plan: &[(Task, u64)], config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.effective_mode();

        let bars = (mode == ProgressMode::Rich).then(|| Bars::new(&label, plan));
        let shared = Arc::new(Shared {
            label,
            mode,
            config,
            board: Mutex::new(Board::new(plan, Instant::now())),
            bars,
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let ticker = (mode != ProgressMode::Quiet).then(|| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while !shared.stop.load(Ordering::Relaxed) {
                    thread::sleep(TICK);
                    shared.tick();
                }
            })
        });

        Self {
            handle: ProgressHandle { shared },
            ticker,
        }
    }

    #[cfg(test)]
    pub fn quiet(label: &str) -> (Self, ProgressHandle) {
        let reporter = Self::new(label, &[], ProgressConfig::new(ProgressMode::Quiet));
        let handle = reporter.handle();
        (reporter, handle)
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        self.stop_ticker();
        self.handle.shared.close(Some(final_message.into()))
    }

    fn stop_ticker(&mut self) {
        self.handle.shared.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_ticker();
        let _ = self.handle.shared.close(None);
    }
}

impl ProgressHandle {
    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        let line = {
            let mut board = lock(&self.shared.board);
            board.stage = stage.clone();
            if self.shared.mode == ProgressMode::Plain {
                board.last_plain = Some(Instant::now());
                Some(board.status_line(&self.shared.label))
            } else {
                None
            }
        };
        if let Some(bars) = &self.shared.bars {
            bars.stage.set_message(stage);
        }
        if let Some(line) = line {
            eprintln!("{}", line);
        }
    }

    pub fn start_task(&self, task: Task) {
        {
            let mut board = lock(&self.shared.board);
            let t = board.task(task);
            t.phase = Phase::Running;
            t.last_frame_at = Instant::now();
        }
        if let Some(bar) = self.bar(task) {
            bar.set_message("running");
        }
    }

    /// ffmpeg reports a running total; a count lower than the last one is ignored.
    pub fn task_frames(&self, task: Task, frames: u64) {
        {
            let mut board = lock(&self.shared.board);
            let t = board.task(task);
            if frames <= t.frames {
                return;
            }
            t.frames = frames;
            t.last_frame_at = Instant::now();
        }
        if let Some(bar) = self.bar(task) {
            if bar.length().map_or(true, |len| frames > len) {
                bar.set_length(frames);
            }
            bar.set_position(frames);
        }
    }

    pub fn finish_task(&self, task: Task, succeeded: bool) {
        let frames = {
            let mut board = lock(&self.shared.board);
            let t = board.task(task);
            t.phase = if succeeded { Phase::Done } else { Phase::Failed };
            t.frames
        };
        if let Some(bar) = self.bar(task) {
            if succeeded {
                bar.finish_with_message("done");
            } else {
                bar.abandon_with_message("failed");
            }
        }
        if succeeded {
            self.log(format!("{} done: {} frames", task, HumanCount(frames)));
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.shared.emit("INFO", &message.into());
    }

    /// Prints a warning and keeps it for the final outcome.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        lock(&self.shared.board).remember(&message);
        self.shared.emit("WARN", &message);
    }

    fn bar(&self, task: Task) -> Option<&ProgressBar> {
        self.shared.bars.as_ref().and_then(|b| b.tasks.get(&task))
    }
}

impl Shared {
    fn tick(&self) {
        let now = Instant::now();
        let (line, stall) = {
            let mut board = lock(&self.board);

            let plain_due = self.mode == ProgressMode::Plain
                && board
                    .last_plain
                    .map_or(true, |t| now.duration_since(t) >= self.config.plain_every);
            let line = if plain_due {
                board.last_plain = Some(now);
                Some(board.status_line(&self.label))
            } else {
                None
            };

            let warn_due = board
                .last_stall_warn
                .map_or(true, |t| now.duration_since(t) >= self.config.stall_after);
            let stall = if warn_due {
                board.stalled(now, self.config.stall_after).map(|(task, idle)| {
                    format!(
                        "no new frames from {} for {}s (stage={})",
                        task,
                        idle.as_secs(),
                        board.stage
                    )
                })
            } else {
                None
            };
            if let Some(msg) = &stall {
                board.last_stall_warn = Some(now);
                board.remember(msg);
            }
            (line, stall)
        };

        if let Some(line) = line {
            eprintln!("{}", line);
        }
        if let Some(msg) = stall {
            self.emit("WARN", &msg);
        }
    }

    fn emit(&self, level: &str, message: &str) {
        if self.mode == ProgressMode::Quiet {
            return;
        }
        let line = format!("[{}] {}: {}", level, self.label, message);
        match &self.bars {
            Some(bars) => {
                if bars.multi.println(&line).is_err() {
                    eprintln!("{}", line);
                }
            }
            None => eprintln!("{}", line),
        }
    }

    fn close(&self, final_message: Option<String>) -> ProgressOutcome {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        let (outcome, line) = {
            let board = lock(&self.board);
            let line = (first && self.mode == ProgressMode::Plain)
                .then(|| board.status_line(&self.label));
            (board.outcome(), line)
        };
        if !first {
            return outcome;
        }

        if let Some(line) = line {
            eprintln!("{}", line);
            if let Some(msg) = &final_message {
                eprintln!("[DONE] {}: {}", self.label, msg);
            }
        }
        if let Some(bars) = &self.bars {
            for bar in bars.tasks.values() {
                if !bar.is_finished() {
                    bar.finish_and_clear();
                }
            }
            match final_message {
                Some(msg) => bars.stage.finish_with_message(msg),
                None => bars.stage.finish_and_clear(),
            }
        }
        outcome
    }
}

pub fn average_rate(frames: u64, elapsed: Duration) -> f64 {
    frames as f64 / elapsed.as_secs_f64().max(1e-6)
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

pub fn format_rate(fps: f64) -> String {
    if fps <= 0.1 {
        "0 frames/s".to_string()
    } else {
        format!("{:.1} frames/s", fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_with(plan: &[(Task, u64)]) -> ProgressReporter {
        ProgressReporter::new("t", plan, ProgressConfig::new(ProgressMode::Quiet))
    }

    #[test]
    fn auto_follows_the_terminal() {
        let auto = ProgressConfig::new(ProgressMode::Auto);
        assert_eq!(auto.with_tty(true).effective_mode(), ProgressMode::Rich);
        assert_eq!(auto.with_tty(false).effective_mode(), ProgressMode::Plain);

        let quiet = ProgressConfig::new(ProgressMode::Quiet).with_tty(true);
        assert_eq!(quiet.effective_mode(), ProgressMode::Quiet);
    }

    #[test]
    fn tasks_order_clips_before_the_composite() {
        let mut tasks = vec![
            Task::Composite,
            Task::Clip(StreamKind::Depth),
            Task::Clip(StreamKind::Annotation),
        ];
        tasks.sort();
        assert_eq!(tasks[0], Task::Clip(StreamKind::Annotation));
        assert_eq!(tasks[2], Task::Composite);
        assert_eq!(Task::Clip(StreamKind::Camera).to_string(), "clip camera");
    }

    #[test]
    fn frame_totals_are_tracked_per_task() {
        let reporter = quiet_with(&[
            (Task::Clip(StreamKind::Annotation), 10),
            (Task::Clip(StreamKind::Camera), 10),
            (Task::Composite, 10),
        ]);
        let handle = reporter.handle();
        let camera = Task::Clip(StreamKind::Camera);
        handle.start_task(camera);
        handle.task_frames(camera, 4);
        handle.task_frames(camera, 9);
        // a stale report never moves the count back
        handle.task_frames(camera, 2);
        handle.finish_task(camera, true);
        handle.task_frames(Task::Composite, 3);

        let outcome = reporter.finish("done");
        assert_eq!(outcome.frames, 12);
        assert_eq!(outcome.expected_frames, 30);
    }

    #[test]
    fn status_line_lists_each_task() {
        let now = Instant::now();
        let mut board = Board::new(
            &[(Task::Clip(StreamKind::Depth), 24), (Task::Composite, 24)],
            now,
        );
        board.stage = "phase 1/2: encode clips".to_string();
        let depth = board.task(Task::Clip(StreamKind::Depth));
        depth.phase = Phase::Running;
        depth.frames = 12;
        board.task(Task::Composite).phase = Phase::Failed;

        let line = board.status_line("stack");
        assert!(
            line.starts_with("[PROGRESS] stack elapsed=00:00 stage=phase 1/2: encode clips"),
            "{line}"
        );
        assert!(line.ends_with("depth=12/24+ composite=0/24!"), "{line}");
    }

    #[test]
    fn only_running_tasks_stall() {
        let now = Instant::now();
        let after = Duration::from_secs(30);
        let camera = Task::Clip(StreamKind::Camera);
        let mut board = Board::new(&[(camera, 10)], now);
        assert!(board.stalled(now + after, after).is_none());

        board.task(camera).phase = Phase::Running;
        assert!(board.stalled(now + Duration::from_secs(29), after).is_none());
        let (task, idle) = board.stalled(now + after, after).expect("stalled");
        assert_eq!(task, camera);
        assert_eq!(idle, after);

        board.task(camera).phase = Phase::Done;
        assert!(board.stalled(now + after, after).is_none());
    }

    #[test]
    fn warning_count_includes_dropped_warnings() {
        let reporter = quiet_with(&[]);
        let handle = reporter.handle();
        for i in 0..(KEPT_WARNINGS + 5) {
            handle.warn(format!("w{}", i));
        }
        let outcome = reporter.finish("done");
        assert_eq!(outcome.warning_count, KEPT_WARNINGS + 5);
        assert_eq!(outcome.warnings.len(), KEPT_WARNINGS);
        assert_eq!(outcome.warnings[0], "w5");
    }

    #[test]
    fn durations_and_rates_format_compactly() {
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_rate(0.0), "0 frames/s");
        assert_eq!(format_rate(23.96), "24.0 frames/s");
        assert_eq!(average_rate(48, Duration::from_secs(2)), 24.0);
    }
}
