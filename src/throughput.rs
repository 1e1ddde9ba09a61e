use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::BenchError;
use crate::iteration::{IterationExecutor, IterationPlan, IterationResult};
use crate::settings::ThroughputSettings;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputOutcome {
    pub select: String,
    /// The selected aggregate; `None` when no rate sample was collected.
    pub fps: Option<f64>,
    pub result: IterationResult,
}

/// One unthrottled iteration at `settings.streams`, no search.
pub fn run_throughput(
    executor: &mut dyn IterationExecutor,
    settings: &ThroughputSettings,
    results_dir: &Path,
) -> Result<ThroughputOutcome, BenchError> {
    let topology = settings.topology();
    info!(
        streams = settings.streams,
        duration_s = settings.duration,
        select = settings.select.as_str(),
        "measuring throughput"
    );
    let result = executor.run_iteration(&IterationPlan {
        measurement: "throughput",
        iteration: 0,
        num_streams: settings.streams,
        topology: &topology,
        warm_up: settings.warm_up,
        sample_size: settings.sample_size,
        frame_rate: None,
        duration: settings.duration,
        overhead: settings.iteration_overhead,
        run_root: results_dir,
    })?;

    let fps = if result.totals.is_empty() {
        None
    } else {
        result
            .totals
            .select(&settings.select)
            .filter(|fps| fps.is_finite())
    };
    match fps {
        Some(fps) => info!(select = settings.select.as_str(), fps, "throughput"),
        None => warn!(
            results = %results_dir.display(),
            "no throughput calculated, check runner logs"
        ),
    }

    Ok(ThroughputOutcome {
        select: settings.select.clone(),
        fps,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::FpsTotals;
    use crate::FpsReport;

    struct Fixed(FpsReport);

    impl IterationExecutor for Fixed {
        fn run_iteration(
            &mut self,
            plan: &IterationPlan<'_>,
        ) -> Result<IterationResult, BenchError> {
            assert_eq!(plan.frame_rate, None);
            let reports = vec![self.0; plan.num_streams];
            Ok(IterationResult {
                iteration: plan.iteration,
                num_streams: plan.num_streams,
                totals: if plan.num_streams == 1 {
                    FpsTotals::from_single(&reports[0])
                } else {
                    FpsTotals::from_reports(&reports)
                },
                reports,
                processes: Vec::new(),
                check: None,
            })
        }
    }

    fn report(avg: f64) -> FpsReport {
        FpsReport {
            instantaneous_fps: avg + 1.0,
            min_fps: avg - 5.0,
            max_fps: avg + 5.0,
            sample_window_avg_fps: avg,
            overall_avg_fps: avg,
            start_time: Some(10.0),
            end_time: Some(40.0),
        }
    }

    #[test]
    fn selects_configured_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ThroughputSettings::default();
        let outcome = run_throughput(&mut Fixed(report(120.0)), &settings, dir.path()).unwrap();
        assert_eq!(outcome.fps, Some(120.0));

        settings.select = "max".to_string();
        let outcome = run_throughput(&mut Fixed(report(120.0)), &settings, dir.path()).unwrap();
        assert_eq!(outcome.fps, Some(125.0));
    }

    #[test]
    fn repeated_runs_agree() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ThroughputSettings {
            streams: 3,
            ..ThroughputSettings::default()
        };
        let mut executor = Fixed(report(50.0));
        let first = run_throughput(&mut executor, &settings, dir.path()).unwrap();
        let second = run_throughput(&mut executor, &settings, dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fps, Some(150.0));
    }

    #[test]
    fn no_samples_means_no_throughput() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_throughput(
            &mut Fixed(FpsReport::empty()),
            &ThroughputSettings::default(),
            dir.path(),
        )
        .unwrap();
        assert_eq!(outcome.fps, None);
    }
}
