use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::contract::{FpsTotals, ProcessExit, wait_timeout};
use crate::density::DensityCheck;
use crate::pipeline::StartGate;
use crate::settings::{RunnerSettings, Topology};
use crate::task::{RunRequest, StreamGroup, Task};
use crate::{BenchError, FpsReport};

/// Splits `[0, num_streams)` into contiguous per-process ranges.
///
/// Without `streams_per_process` the size is `ceil(num_streams / max_processes)`,
/// or everything in one process when neither is set.
pub fn partition_streams(
    num_streams: usize,
    streams_per_process: Option<usize>,
    max_processes: Option<usize>,
) -> Vec<Range<usize>> {
    if num_streams == 0 {
        return Vec::new();
    }
    let size = streams_per_process
        .filter(|s| *s > 0)
        .or_else(|| {
            max_processes
                .filter(|m| *m > 0)
                .map(|m| num_streams.div_ceil(m))
        })
        .unwrap_or(num_streams);
    (0..num_streams)
        .step_by(size)
        .map(|start| start..(start + size).min(num_streams))
        .collect()
}

fn round_robin<T>(items: &[T], index: usize) -> Option<&T> {
    if items.is_empty() {
        None
    } else {
        items.get(index % items.len())
    }
}

/// One trial at a fixed stream count.
#[derive(Debug, Clone)]
pub struct IterationPlan<'a> {
    pub measurement: &'a str,
    pub iteration: usize,
    pub num_streams: usize,
    pub topology: &'a Topology,
    pub warm_up: u64,
    pub sample_size: u64,
    pub frame_rate: Option<f64>,
    pub duration: f64,
    pub overhead: f64,
    /// Each process gets `process_<p>` below this directory.
    pub run_root: &'a Path,
}

impl IterationPlan<'_> {
    pub fn budget(&self) -> Duration {
        Duration::from_secs_f64((self.duration + self.overhead).max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub run_dir: PathBuf,
    pub streams: Range<usize>,
    pub exit: ProcessExit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationResult {
    pub iteration: usize,
    pub num_streams: usize,
    /// Ordered by stream index.
    pub reports: Vec<FpsReport>,
    pub totals: FpsTotals,
    pub processes: Vec<ProcessRecord>,
    pub check: Option<DensityCheck>,
}

impl IterationResult {
    /// Sum of the per-stream overall averages.
    pub fn total_fps(&self) -> f64 {
        self.reports.iter().map(|r| r.overall_avg_fps).sum()
    }

    pub fn passed(&self) -> bool {
        self.check.as_ref().is_some_and(|c| c.passed)
    }
}

pub trait IterationExecutor {
    fn run_iteration(&mut self, plan: &IterationPlan<'_>) -> Result<IterationResult, BenchError>;
}

/// Runs iterations through a [`Task`], one runner process per partition.
pub struct IterationRunner<'a> {
    task: &'a dyn Task,
    runner_settings: &'a RunnerSettings,
    pub poll_interval: Duration,
    pub grace: Duration,
    pub join_timeout: Duration,
}

impl<'a> IterationRunner<'a> {
    pub fn new(task: &'a dyn Task, runner_settings: &'a RunnerSettings) -> Self {
        Self {
            task,
            runner_settings,
            poll_interval: Duration::from_secs(1),
            grace: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
        }
    }

    fn launch(
        &self,
        plan: &IterationPlan<'_>,
        gate: &Arc<StartGate>,
    ) -> Result<Vec<StreamGroup>, BenchError> {
        let topology = plan.topology;
        let partitions = partition_streams(
            plan.num_streams,
            topology.streams_per_process,
            topology.max_processes,
        );
        let mut groups: Vec<StreamGroup> = Vec::with_capacity(partitions.len());
        for (process, streams) in partitions.into_iter().enumerate() {
            let run_dir = plan.run_root.join(format!("process_{process}"));
            let launched = fs::create_dir_all(&run_dir)
                .map_err(|e| BenchError::io(format!("create {}", run_dir.display()), e))
                .and_then(|()| {
                    self.task.run(RunRequest {
                        run_dir: &run_dir,
                        measurement: plan.measurement,
                        runner_settings: self.runner_settings,
                        warm_up: plan.warm_up,
                        frame_rate: plan.frame_rate,
                        sample_size: plan.sample_size,
                        num_streams: streams.len(),
                        first_stream: streams.start,
                        gate: Some(Arc::clone(gate)),
                        numa_node: round_robin(&topology.numa_nodes, process).copied(),
                        gpu_render_device: round_robin(&topology.gpu_render_devices, process)
                            .map(String::as_str),
                    })
                });
            match launched {
                Ok(group) => groups.push(group),
                Err(err) => {
                    for group in &mut groups {
                        if let Err(teardown) = group.shutdown(self.grace, self.join_timeout) {
                            warn!(error = %teardown, "failed to tear down partial iteration");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(groups)
    }
}

fn snapshot(groups: &[StreamGroup]) -> Option<f64> {
    let reports = groups.iter().flat_map(StreamGroup::reports).collect::<Vec<_>>();
    (!reports.is_empty() && reports.iter().all(FpsReport::has_samples))
        .then(|| reports.iter().map(|r| r.instantaneous_fps).sum())
}

impl IterationExecutor for IterationRunner<'_> {
    fn run_iteration(&mut self, plan: &IterationPlan<'_>) -> Result<IterationResult, BenchError> {
        let started = Instant::now();
        let deadline = started + plan.budget();
        let gate = StartGate::shared();
        let mut groups = self.launch(plan, &gate)?;
        info!(
            measurement = plan.measurement,
            iteration = plan.iteration,
            streams = plan.num_streams,
            processes = groups.len(),
            "iteration started"
        );
        gate.release(plan.num_streams);

        let mut totals = FpsTotals::new();
        let mut processes = Vec::with_capacity(groups.len());
        for index in 0..groups.len() {
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let group = &mut groups[index];
                if !group.sources_alive() {
                    debug!(run_dir = %group.run_dir.display(), "source finished");
                    break;
                }
                let tick = self.poll_interval.min(deadline - now);
                if let Some(exit) = wait_timeout(group.process.as_mut(), tick)? {
                    debug!(run_dir = %group.run_dir.display(), %exit, "runner exited early");
                    break;
                }
                if let Some(total) = snapshot(&groups) {
                    totals.observe(total);
                    info!(
                        iteration = plan.iteration,
                        elapsed_s = started.elapsed().as_secs(),
                        streams = plan.num_streams,
                        total_fps = total,
                        per_stream_fps = total / plan.num_streams as f64,
                        "fps snapshot"
                    );
                }
            }

            let group = &mut groups[index];
            let exit = group.shutdown(self.grace, self.join_timeout)?;
            processes.push(ProcessRecord {
                run_dir: group.run_dir.clone(),
                streams: group.streams.clone(),
                exit,
            });
        }

        let reports = groups.iter().flat_map(StreamGroup::reports).collect::<Vec<_>>();
        drop(groups);

        if let [single] = reports.as_slice() {
            totals = FpsTotals::from_single(single);
        } else if totals.is_empty() {
            totals = FpsTotals::from_reports(&reports);
        }
        for (stream, report) in reports.iter().enumerate() {
            debug!(iteration = plan.iteration, stream, %report, "stream result");
        }
        info!(
            iteration = plan.iteration,
            streams = plan.num_streams,
            elapsed_s = started.elapsed().as_secs_f64(),
            "iteration finished"
        );

        if let Some(bad) = processes.iter().find(|p| !p.exit.is_expected()) {
            return Err(BenchError::RunnerExit {
                run_dir: bad.run_dir.clone(),
                status: bad.exit,
            });
        }

        Ok(IterationResult {
            iteration: plan.iteration,
            num_streams: plan.num_streams,
            reports,
            totals,
            processes,
            check: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10, Some(3), None, vec![0..3, 3..6, 6..9, 9..10])]
    #[case(10, None, Some(3), vec![0..4, 4..8, 8..10])]
    #[case(4, None, None, vec![0..4])]
    #[case(4, Some(0), None, vec![0..4])]
    #[case(2, Some(8), Some(1), vec![0..2])]
    #[case(0, Some(2), None, vec![])]
    fn partitions(
        #[case] streams: usize,
        #[case] per_process: Option<usize>,
        #[case] max_processes: Option<usize>,
        #[case] expected: Vec<Range<usize>>,
    ) {
        assert_eq!(partition_streams(streams, per_process, max_processes), expected);
    }

    #[test]
    fn partitions_cover_every_stream_once() {
        for streams in 1..=40usize {
            for per_process in 1..=9usize {
                let ranges = partition_streams(streams, Some(per_process), None);
                assert_eq!(ranges.len(), streams.div_ceil(per_process));
                let mut next = 0;
                for range in &ranges {
                    assert_eq!(range.start, next);
                    assert!(!range.is_empty() && range.len() <= per_process);
                    next = range.end;
                }
                assert_eq!(next, streams);
            }
        }
    }

    #[test]
    fn devices_assigned_round_robin() {
        let nodes = [0u32, 1];
        assert_eq!(
            (0..5).map(|p| round_robin(&nodes, p).copied()).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(0), Some(1), Some(0)]
        );
        assert_eq!(round_robin::<u32>(&[], 3), None);
    }

    #[test]
    fn budget_includes_overhead() {
        let topology = Topology::default();
        let plan = IterationPlan {
            measurement: "density",
            iteration: 0,
            num_streams: 1,
            topology: &topology,
            warm_up: 0,
            sample_size: 1,
            frame_rate: None,
            duration: 2.5,
            overhead: 10.0,
            run_root: Path::new("/tmp"),
        };
        assert_eq!(plan.budget(), Duration::from_millis(12_500));
    }
}
