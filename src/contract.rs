use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use std::{fmt, fmt::Display};

use nix::sys::signal::Signal;
use serde::Serialize;

/// Frame-rate statistics of one stream, as observed by its sink.
///
/// `min_fps` starts at `+inf` and `max_fps` at `0` until the first
/// post-warm-up rate sample exists.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FpsReport {
    pub instantaneous_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,
    pub sample_window_avg_fps: f64,
    pub overall_avg_fps: f64,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

impl FpsReport {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            instantaneous_fps: 0.0,
            min_fps: f64::INFINITY,
            max_fps: 0.0,
            sample_window_avg_fps: 0.0,
            overall_avg_fps: 0.0,
            start_time: None,
            end_time: None,
        }
    }

    pub fn has_samples(&self) -> bool {
        self.min_fps.is_finite()
    }
}

impl Default for FpsReport {
    fn default() -> Self {
        Self::empty()
    }
}

impl Display for FpsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FPS: {:.4} Min: {:.4} Max: {:.4} Avg: {:.4}",
            self.instantaneous_fps, self.min_fps, self.max_fps, self.overall_avg_fps
        )
    }
}

/// Aggregate over periodic snapshots of the summed per-stream FPS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FpsTotals {
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
}

impl FpsTotals {
    #[must_use]
    pub fn new() -> Self {
        Self {
            total: 0.0,
            min: f64::INFINITY,
            max: 0.0,
            avg: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, total_fps: f64) {
        self.total += total_fps;
        self.min = self.min.min(total_fps);
        self.max = self.max.max(total_fps);
        self.count += 1;
        self.avg = self.total / self.count as f64;
    }

    /// Single-stream runs report that stream's own statistics.
    #[must_use]
    pub fn from_single(report: &FpsReport) -> Self {
        Self {
            total: report.instantaneous_fps,
            min: report.min_fps,
            max: report.max_fps,
            avg: report.overall_avg_fps,
            count: usize::from(report.has_samples()),
        }
    }

    /// Totals built from final reports when no live snapshot was collected.
    #[must_use]
    pub fn from_reports(reports: &[FpsReport]) -> Self {
        let mut totals = Self::new();
        if reports.iter().all(FpsReport::has_samples) && !reports.is_empty() {
            totals.observe(reports.iter().map(|r| r.overall_avg_fps).sum());
        }
        totals
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn select(&self, key: &str) -> Option<f64> {
        match key {
            "average" | "avg" => Some(self.avg),
            "min" => Some(self.min),
            "max" => Some(self.max),
            "total" => Some(self.total),
            _ => None,
        }
    }
}

impl Default for FpsTotals {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessExit {
    Code(i32),
    Signal(i32),
}

impl ProcessExit {
    /// Clean exit or a signal the harness itself sends at iteration end.
    pub fn is_expected(self) -> bool {
        match self {
            Self::Code(code) => code == 0,
            Self::Signal(sig) => [Signal::SIGTERM, Signal::SIGKILL, Signal::SIGINT]
                .iter()
                .any(|s| *s as i32 == sig),
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(sig)) => Self::Signal(sig),
            (None, None) => Self::Code(-1),
        }
    }
}

impl Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(sig) => match Signal::try_from(*sig) {
                Ok(signal) => write!(f, "signal {signal}"),
                Err(_) => write!(f, "signal {sig}"),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no input found in {}, regenerate using --force", .0.display())]
    NoInput(PathBuf),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("runner exited with unexpected {status}, see {}", run_dir.display())]
    RunnerExit { run_dir: PathBuf, status: ProcessExit },
    #[error("task error: {0}")]
    Task(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

impl BenchError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Handle to one runner process, real or simulated.
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking liveness check; `Some` once the process has exited.
    fn poll(&mut self) -> Result<Option<ProcessExit>, BenchError>;

    fn terminate(&mut self) -> Result<(), BenchError>;

    fn kill(&mut self) -> Result<(), BenchError>;

    fn wait(&mut self) -> Result<ProcessExit, BenchError>;
}

/// Polls until the process exits or `timeout` elapses.
pub fn wait_timeout(
    process: &mut dyn ProcessHandle,
    timeout: Duration,
) -> Result<Option<ProcessExit>, BenchError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(exit) = process.poll()? {
            return Ok(Some(exit));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// SIGTERM, then SIGKILL if the process outlives `grace`.
pub fn shutdown_process(
    process: &mut dyn ProcessHandle,
    grace: Duration,
) -> Result<ProcessExit, BenchError> {
    if let Some(exit) = process.poll()? {
        return Ok(exit);
    }
    process.terminate()?;
    if let Some(exit) = wait_timeout(process, grace)? {
        return Ok(exit);
    }
    process.kill()?;
    process.wait()
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_has_sentinels() {
        let report = FpsReport::empty();
        assert!(!report.has_samples());
        assert_eq!(report.max_fps, 0.0);
        assert!(report.min_fps.is_infinite());
    }

    #[test]
    fn totals_track_snapshots() {
        let mut totals = FpsTotals::new();
        totals.observe(30.0);
        totals.observe(50.0);
        assert_eq!(totals.count, 2);
        assert_eq!(totals.min, 30.0);
        assert_eq!(totals.max, 50.0);
        assert_eq!(totals.select("average"), Some(40.0));
        assert_eq!(totals.select("bogus"), None);
    }

    #[test]
    fn totals_from_reports_require_every_stream() {
        let mut ok = FpsReport::empty();
        ok.min_fps = 10.0;
        ok.overall_avg_fps = 12.0;
        assert_eq!(FpsTotals::from_reports(&[ok, ok]).total, 24.0);
        assert!(FpsTotals::from_reports(&[ok, FpsReport::empty()]).is_empty());
    }

    #[test]
    fn expected_exits() {
        assert!(ProcessExit::Code(0).is_expected());
        assert!(ProcessExit::Signal(Signal::SIGTERM as i32).is_expected());
        assert!(ProcessExit::Signal(Signal::SIGKILL as i32).is_expected());
        assert!(!ProcessExit::Code(1).is_expected());
        assert!(!ProcessExit::Signal(Signal::SIGSEGV as i32).is_expected());
    }
}
