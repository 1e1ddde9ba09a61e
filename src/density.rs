//! Stream-density search.
//!
//! The controller runs one iteration per candidate stream count, judges it
//! with [`check_density`] and moves a `(max_success, min_failure)` bracket
//! until the two are adjacent, a candidate repeats, the allowed range is
//! exhausted or the iteration cap is hit.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::iteration::{IterationExecutor, IterationPlan, IterationResult};
use crate::settings::{DensitySettings, SearchMethod, TargetCondition};
use crate::{BenchError, FpsReport};

/// Upper bound used for ranges given with a single value.
pub const UNBOUNDED: f64 = i64::MAX as f64;

/// Resolves a configured `[lower]` or `[lower, upper]` range against `target_fps`.
///
/// Bounds below `1` are offsets from the target (`lower = target - v`,
/// `upper = target + v`); bounds of `1` or more are absolute.
pub fn normalize_range(range: &[f64], target_fps: f64) -> Option<(f64, f64)> {
    let (&lower, rest) = range.split_first()?;
    let lower = if lower < 1.0 { target_fps - lower } else { lower };
    let upper = match rest.first() {
        Some(&upper) if upper < 1.0 => target_fps + upper,
        Some(&upper) => upper,
        None => UNBOUNDED,
    };
    Some((lower, upper))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RangeCheck {
    pub value: f64,
    pub range: (f64, f64),
    pub passed: bool,
}

impl RangeCheck {
    fn new(value: f64, range: (f64, f64)) -> Self {
        Self {
            value,
            range,
            passed: range.0 <= value && value <= range.1,
        }
    }
}

/// Verdict for one stream, or for the aggregate when `stream` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamCheck {
    pub stream: Option<usize>,
    pub minimum: Option<RangeCheck>,
    pub average: Option<RangeCheck>,
    pub passed: bool,
}

impl StreamCheck {
    fn evaluate(
        stream: Option<usize>,
        minimum: Option<(f64, (f64, f64))>,
        average: Option<(f64, (f64, f64))>,
    ) -> Self {
        let minimum = minimum.map(|(value, range)| RangeCheck::new(value, range));
        let average = average.map(|(value, range)| RangeCheck::new(value, range));
        let passed = minimum.is_none_or(|c| c.passed) && average.is_none_or(|c| c.passed);
        Self {
            stream,
            minimum,
            average,
            passed,
        }
    }

    fn no_samples(stream: Option<usize>) -> Self {
        Self {
            stream,
            minimum: None,
            average: None,
            passed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DensityCheck {
    pub condition: TargetCondition,
    pub passed: bool,
    pub checks: Vec<StreamCheck>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Pass/fail for one iteration's per-stream reports.
pub fn check_density(reports: &[FpsReport], settings: &DensitySettings) -> DensityCheck {
    let target = settings.fps;
    let minimum_range = settings
        .minimum_range
        .as_deref()
        .and_then(|r| normalize_range(r, target));
    let average_range = match (&settings.minimum_range, &settings.average_range) {
        (_, Some(range)) => normalize_range(range, target),
        (None, None) => normalize_range(&[0.0], target),
        (Some(_), None) => None,
    };

    let checks = match settings.target_condition {
        _ if reports.is_empty() => vec![StreamCheck::no_samples(None)],
        TargetCondition::Stream => reports
            .iter()
            .enumerate()
            .map(|(stream, report)| {
                if !report.has_samples() {
                    return StreamCheck::no_samples(Some(stream));
                }
                StreamCheck::evaluate(
                    Some(stream),
                    minimum_range.map(|r| (report.min_fps, r)),
                    average_range.map(|r| (report.overall_avg_fps, r)),
                )
            })
            .collect(),
        _ if !reports.iter().all(FpsReport::has_samples) => vec![StreamCheck::no_samples(None)],
        TargetCondition::Average => vec![StreamCheck::evaluate(
            None,
            minimum_range.map(|r| (mean(reports.iter().map(|r| r.min_fps)), r)),
            average_range.map(|r| (mean(reports.iter().map(|r| r.overall_avg_fps)), r)),
        )],
        TargetCondition::Total => vec![StreamCheck::evaluate(
            None,
            None,
            average_range.map(|r| (reports.iter().map(|r| r.overall_avg_fps).sum(), r)),
        )],
    };

    DensityCheck {
        condition: settings.target_condition,
        passed: checks.iter().all(|c| c.passed),
        checks,
    }
}

/// `floor(sum(per-stream overall average) / target_fps)`.
pub fn calculated_streams(reports: &[FpsReport], target_fps: f64) -> Option<usize> {
    if target_fps <= 0.0 || reports.is_empty() || !reports.iter().all(FpsReport::has_samples) {
        return None;
    }
    let total: f64 = reports.iter().map(|r| r.overall_avg_fps).sum();
    Some((total / target_fps).floor() as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    /// `fixed-streams` was configured; no search.
    Fixed,
    /// `min_failure - max_success == 1`.
    Converged,
    /// The next candidate had already been tried.
    Repeated,
    /// Passing at `max-streams` or failing at `min-streams`.
    OutOfRange,
    IterationCap,
    /// Total-throughput ascent stopped improving.
    NoImprovement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStep {
    Next(usize),
    Done(Termination),
}

#[derive(Debug, Clone)]
pub struct SearchState {
    min_streams: usize,
    max_streams: usize,
    method: SearchMethod,
    condition: TargetCondition,
    max_iterations: usize,
    pub num_streams: usize,
    pub iteration: usize,
    pub max_success: Option<usize>,
    pub max_success_iteration: Option<usize>,
    pub min_failure: Option<usize>,
    pub min_failure_iteration: Option<usize>,
    pub density: usize,
    best_total: Option<f64>,
    tried: BTreeMap<usize, bool>,
}

impl SearchState {
    pub fn new(settings: &DensitySettings, start: usize) -> Self {
        Self {
            min_streams: settings.min_streams,
            max_streams: settings.max_streams,
            method: settings.search_method,
            condition: settings.target_condition,
            max_iterations: settings.max_iterations,
            num_streams: start.clamp(settings.min_streams, settings.max_streams),
            iteration: 0,
            max_success: None,
            max_success_iteration: None,
            min_failure: None,
            min_failure_iteration: None,
            density: 0,
            best_total: None,
            tried: BTreeMap::new(),
        }
    }

    pub fn tried(&self) -> &BTreeMap<usize, bool> {
        &self.tried
    }

    fn record_success(&mut self, streams: usize) {
        if self.max_success.is_none_or(|s| streams > s) {
            self.max_success = Some(streams);
            self.max_success_iteration = Some(self.iteration);
        }
        self.density = self.density.max(streams);
    }

    fn record_failure(&mut self, streams: usize) {
        if self.min_failure.is_none_or(|f| streams < f) {
            self.min_failure = Some(streams);
            self.min_failure_iteration = Some(self.iteration);
        }
    }

    /// Folds in the iteration just run at `self.num_streams` and picks the next count.
    pub fn advance(&mut self, passed: bool, total_fps: f64, calculated: Option<usize>) -> SearchStep {
        let streams = self.num_streams;
        let step = match self.condition {
            TargetCondition::Total => self.ascend(streams, total_fps),
            TargetCondition::Stream | TargetCondition::Average => {
                self.bracket(streams, passed, calculated)
            }
        };
        self.iteration += 1;
        match step {
            SearchStep::Next(_) if self.iteration >= self.max_iterations => {
                SearchStep::Done(Termination::IterationCap)
            }
            SearchStep::Next(next) => {
                self.num_streams = next;
                step
            }
            done => done,
        }
    }

    fn ascend(&mut self, streams: usize, total_fps: f64) -> SearchStep {
        let improved = self.best_total.is_none_or(|best| total_fps > best);
        self.tried.insert(streams, improved);
        if !improved {
            self.record_failure(streams);
            return SearchStep::Done(Termination::NoImprovement);
        }
        self.best_total = Some(total_fps);
        self.record_success(streams);
        if streams >= self.max_streams {
            return SearchStep::Done(Termination::OutOfRange);
        }
        SearchStep::Next(streams + 1)
    }

    fn bracket(&mut self, streams: usize, passed: bool, calculated: Option<usize>) -> SearchStep {
        self.tried.insert(streams, passed);
        if passed {
            self.record_success(streams);
        } else {
            self.record_failure(streams);
        }
        if let (Some(success), Some(failure)) = (self.max_success, self.min_failure) {
            if failure <= success + 1 {
                return SearchStep::Done(Termination::Converged);
            }
        }

        let mut candidate = match (self.method, passed) {
            (SearchMethod::Linear, true) => streams as i64 + 1,
            (SearchMethod::Linear, false) => streams as i64 - 1,
            (SearchMethod::Binary, _) => match (self.max_success, self.min_failure) {
                (Some(success), Some(failure)) => ((success + failure) / 2) as i64,
                (Some(success), None) => (success * 2) as i64,
                (None, Some(failure)) => (failure / 2) as i64,
                (None, None) => streams as i64,
            },
        };

        let lower = self.max_success.map_or(self.min_streams as i64 - 1, |s| s as i64);
        let upper = self.min_failure.map_or(self.max_streams as i64 + 1, |f| f as i64);
        if let Some(calculated) = calculated {
            let calculated = calculated as i64;
            if lower < calculated
                && calculated < upper
                && !self.tried.contains_key(&(calculated as usize))
            {
                candidate = calculated;
            }
        }

        let clamped = candidate.clamp(self.min_streams as i64, self.max_streams as i64) as usize;
        if self.tried.contains_key(&clamped) {
            let leaves_range =
                candidate > self.max_streams as i64 || candidate < self.min_streams as i64;
            return SearchStep::Done(if leaves_range {
                Termination::OutOfRange
            } else {
                Termination::Repeated
            });
        }
        SearchStep::Next(clamped)
    }
}

/// Starting stream count: fixed, explicit, estimated from throughput, or `min-streams`.
pub fn initial_streams(settings: &DensitySettings, throughput_fps: Option<f64>) -> usize {
    let estimate = || {
        throughput_fps
            .filter(|fps| *fps > 0.0 && settings.fps > 0.0)
            .map(|fps| (fps / settings.fps).floor() as usize)
    };
    settings
        .fixed_streams
        .or(settings.starting_streams)
        .or_else(estimate)
        .unwrap_or(settings.min_streams)
        .clamp(settings.min_streams, settings.max_streams)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DensityOutcome {
    pub density: usize,
    pub termination: Termination,
    pub max_success: Option<usize>,
    pub max_success_iteration: Option<usize>,
    pub min_failure: Option<usize>,
    pub min_failure_iteration: Option<usize>,
    pub iterations: Vec<IterationResult>,
}

impl DensityOutcome {
    pub fn best_passing(&self) -> Option<&IterationResult> {
        self.max_success_iteration.and_then(|i| self.iterations.get(i))
    }

    pub fn nearest_failing(&self) -> Option<&IterationResult> {
        self.min_failure_iteration.and_then(|i| self.iterations.get(i))
    }
}

/// Runs the density search rooted at `results_dir` (`iteration_<i>` per trial).
pub fn run_density_search(
    executor: &mut dyn IterationExecutor,
    settings: &DensitySettings,
    start: usize,
    results_dir: &Path,
) -> Result<DensityOutcome, BenchError> {
    let topology = settings.topology();
    let mut state = SearchState::new(settings, start);
    let mut iterations = Vec::new();
    info!(
        start = state.num_streams,
        min_streams = settings.min_streams,
        max_streams = settings.max_streams,
        method = ?settings.search_method,
        condition = ?settings.target_condition,
        fps = settings.fps,
        "measuring stream density"
    );

    let termination = loop {
        let run_root = results_dir.join(format!("iteration_{}", state.iteration));
        let plan = IterationPlan {
            measurement: "density",
            iteration: state.iteration,
            num_streams: state.num_streams,
            topology: &topology,
            warm_up: settings.warm_up,
            sample_size: settings.sample_size,
            frame_rate: Some(settings.fps),
            duration: settings.duration,
            overhead: settings.iteration_overhead,
            run_root: &run_root,
        };
        let mut result = executor.run_iteration(&plan)?;
        let check = check_density(&result.reports, settings);
        info!(
            iteration = state.iteration,
            streams = state.num_streams,
            passed = check.passed,
            total_fps = result.total_fps(),
            "density iteration"
        );

        if settings.fixed_streams.is_some() {
            if check.passed {
                state.record_success(state.num_streams);
            } else {
                state.record_failure(state.num_streams);
            }
            result.check = Some(check);
            iterations.push(result);
            break Termination::Fixed;
        }

        let calculated = calculated_streams(&result.reports, settings.fps);
        let step = state.advance(check.passed, result.total_fps(), calculated);
        result.check = Some(check);
        iterations.push(result);
        if let SearchStep::Done(termination) = step {
            break termination;
        }
    };

    if state.density == 0 {
        warn!(
            results = %results_dir.display(),
            "no stream density calculated, check runner logs"
        );
    }
    info!(
        density = state.density,
        ?termination,
        iterations = iterations.len(),
        "stream density"
    );
    Ok(DensityOutcome {
        density: state.density,
        termination,
        max_success: state.max_success,
        max_success_iteration: state.max_success_iteration,
        min_failure: state.min_failure,
        min_failure_iteration: state.min_failure_iteration,
        iterations,
    })
}
