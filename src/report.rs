use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::BenchError;
use crate::contract::FpsTotals;
use crate::density::DensityOutcome;
use crate::iteration::IterationResult;
use crate::settings::RunnerSettings;
use crate::throughput::ThroughputOutcome;

pub const RESULT_FILE: &str = "result.json";

/// Session details recorded next to every result.
#[derive(Debug, Clone)]
pub struct ResultContext<'a> {
    pub pipeline: &'a str,
    pub runner: &'a str,
    pub runner_settings: &'a RunnerSettings,
    pub command_line: &'a [String],
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, BenchError> {
    serde_json::to_value(value).map_err(|e| BenchError::Serialize(e.to_string()))
}

/// `{"Iteration: 0000": {"Stream: 0000": FpsReport, ...}, ...}`
pub fn iterations_map(iterations: &[IterationResult]) -> Result<Value, BenchError> {
    let mut map = Map::new();
    for result in iterations {
        let mut streams = Map::new();
        for (stream, report) in result.reports.iter().enumerate() {
            streams.insert(format!("Stream: {stream:04}"), to_value(report)?);
        }
        map.insert(format!("Iteration: {:04}", result.iteration), Value::Object(streams));
    }
    Ok(Value::Object(map))
}

fn base_document(
    streams: usize,
    totals: &FpsTotals,
    processes: usize,
    iterations: &[IterationResult],
    measurement_settings: Value,
    ctx: &ResultContext<'_>,
) -> Result<Map<String, Value>, BenchError> {
    let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
    let document = json!({
        "pipeline": ctx.pipeline,
        "runner": ctx.runner,
        "streams": streams,
        "max": finite(totals.max),
        "min": finite(totals.min),
        "avg": finite(totals.avg),
        "total": finite(totals.total),
        "processes": processes,
        "iterations": iterations_map(iterations)?,
        "measurement_settings": measurement_settings,
        "runner_settings": ctx.runner_settings,
        "command_line": ctx.command_line.join(" "),
    });
    match document {
        Value::Object(map) => Ok(map),
        _ => Err(BenchError::Serialize("result is not an object".to_string())),
    }
}

pub fn throughput_document<S: Serialize>(
    outcome: &ThroughputOutcome,
    settings: &S,
    ctx: &ResultContext<'_>,
) -> Result<Value, BenchError> {
    let result = &outcome.result;
    let mut document = base_document(
        result.num_streams,
        &result.totals,
        result.processes.len(),
        std::slice::from_ref(result),
        to_value(settings)?,
        ctx,
    )?;
    document.insert("select".to_string(), json!(outcome.select));
    document.insert("fps".to_string(), json!(outcome.fps));
    Ok(Value::Object(document))
}

pub fn density_document<S: Serialize>(
    outcome: &DensityOutcome,
    settings: &S,
    ctx: &ResultContext<'_>,
) -> Result<Value, BenchError> {
    let best = outcome.best_passing();
    let totals = best.map(|b| b.totals).unwrap_or_default();
    let mut document = base_document(
        outcome.density,
        &totals,
        best.map_or(0, |b| b.processes.len()),
        &outcome.iterations,
        to_value(settings)?,
        ctx,
    )?;
    document.insert("density".to_string(), json!(outcome.density));
    document.insert("termination".to_string(), to_value(&outcome.termination)?);
    document.insert("max_success".to_string(), json!(outcome.max_success));
    document.insert("min_failure".to_string(), json!(outcome.min_failure));
    let checks = outcome
        .iterations
        .iter()
        .map(|r| to_value(&r.check))
        .collect::<Result<Vec<_>, _>>()?;
    document.insert("checks".to_string(), Value::Array(checks));
    Ok(Value::Object(document))
}

pub fn write_result(dir: &Path, document: &Value) -> Result<PathBuf, BenchError> {
    fs::create_dir_all(dir).map_err(|e| BenchError::io(format!("create {}", dir.display()), e))?;
    let path = dir.join(RESULT_FILE);
    let raw = serde_json::to_string_pretty(document)
        .map_err(|e| BenchError::Serialize(e.to_string()))?;
    fs::write(&path, raw).map_err(|e| BenchError::io(format!("write {}", path.display()), e))?;
    Ok(path)
}

/// Selected FPS of a previous throughput run in `dir`, if one was recorded.
pub fn read_throughput(dir: &Path) -> Result<Option<f64>, BenchError> {
    let path = dir.join(RESULT_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .map_err(|e| BenchError::io(format!("read {}", path.display()), e))?;
    let document: Value = serde_json::from_str(&raw)
        .map_err(|e| BenchError::Config(format!("invalid {}: {e}", path.display())))?;
    if let Some(fps) = document.get("fps").and_then(Value::as_f64) {
        return Ok(Some(fps));
    }
    let key = match document.get("select").and_then(Value::as_str) {
        Some("average") | None => "avg",
        Some(other) => other,
    };
    Ok(document
        .get(key)
        .and_then(Value::as_f64)
        .filter(|fps| *fps > 0.0))
}

fn fps_row(report: &mut String, label: &str, result: Option<&IterationResult>) -> std::fmt::Result {
    let Some(result) = result else {
        return writeln!(report, "| {label} | - | - | - | - | - |");
    };
    let streams = result.reports.len().max(1) as f64;
    let min = result
        .reports
        .iter()
        .map(|r| r.min_fps)
        .fold(f64::INFINITY, f64::min);
    writeln!(
        report,
        "| {label} | {} | {:.2} | {:.2} | {:.2} | {} |",
        result.num_streams,
        result.total_fps(),
        result.total_fps() / streams,
        if min.is_finite() { min } else { 0.0 },
        result.processes.len()
    )
}

pub fn density_table(outcome: &DensityOutcome, ctx: &ResultContext<'_>) -> Result<String, BenchError> {
    let render = || -> Result<String, std::fmt::Error> {
        let mut report = String::new();
        writeln!(&mut report, "# Stream Density")?;
        writeln!(&mut report, "pipeline: {}", ctx.pipeline)?;
        writeln!(&mut report, "runner: {}", ctx.runner)?;
        writeln!(&mut report, "density: {}", outcome.density)?;
        writeln!(&mut report, "termination: {:?}", outcome.termination)?;
        writeln!(&mut report, "iterations: {}", outcome.iterations.len())?;
        writeln!(&mut report)?;
        writeln!(
            &mut report,
            "| Iteration | Streams | Total FPS | Per-Stream FPS | Min FPS | Processes |"
        )?;
        writeln!(&mut report, "|---|---:|---:|---:|---:|---:|")?;
        fps_row(&mut report, "best passing", outcome.best_passing())?;
        fps_row(&mut report, "nearest failing", outcome.nearest_failing())?;
        writeln!(&mut report)?;
        writeln!(&mut report, "## Iterations")?;
        for result in &outcome.iterations {
            writeln!(
                &mut report,
                "- {:04}: streams={} passed={} total_fps={:.2}",
                result.iteration,
                result.num_streams,
                result.passed(),
                result.total_fps()
            )?;
        }
        Ok(report)
    };
    render().map_err(|e| BenchError::Serialize(e.to_string()))
}

pub fn throughput_table(
    outcome: &ThroughputOutcome,
    ctx: &ResultContext<'_>,
) -> Result<String, BenchError> {
    let totals = &outcome.result.totals;
    let render = || -> Result<String, std::fmt::Error> {
        let mut report = String::new();
        writeln!(&mut report, "# Throughput")?;
        writeln!(&mut report, "pipeline: {}", ctx.pipeline)?;
        writeln!(&mut report, "runner: {}", ctx.runner)?;
        writeln!(&mut report, "streams: {}", outcome.result.num_streams)?;
        writeln!(&mut report)?;
        writeln!(&mut report, "| Select | FPS | Min | Max | Avg | Total |")?;
        writeln!(&mut report, "|---|---:|---:|---:|---:|---:|")?;
        writeln!(
            &mut report,
            "| {} | {} | {:.2} | {:.2} | {:.2} | {:.2} |",
            outcome.select,
            outcome
                .fps
                .map_or_else(|| "-".to_string(), |fps| format!("{fps:.2}")),
            if totals.min.is_finite() { totals.min } else { 0.0 },
            totals.max,
            totals.avg,
            totals.total
        )?;
        Ok(report)
    };
    render().map_err(|e| BenchError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FpsReport;
    use crate::density::Termination;
    use crate::iteration::ProcessRecord;
    use crate::contract::ProcessExit;

    fn iteration(index: usize, streams: usize, avg: f64) -> IterationResult {
        let report = FpsReport {
            instantaneous_fps: avg,
            min_fps: avg - 1.0,
            max_fps: avg + 1.0,
            sample_window_avg_fps: avg,
            overall_avg_fps: avg,
            start_time: Some(1.0),
            end_time: Some(2.0),
        };
        let reports = vec![report; streams];
        IterationResult {
            iteration: index,
            num_streams: streams,
            totals: FpsTotals::from_reports(&reports),
            reports,
            processes: vec![ProcessRecord {
                run_dir: PathBuf::from(format!("/runs/iteration_{index}/process_0")),
                streams: 0..streams,
                exit: ProcessExit::Signal(15),
            }],
            check: None,
        }
    }

    fn context<'a>(settings: &'a RunnerSettings, argv: &'a [String]) -> ResultContext<'a> {
        ResultContext {
            pipeline: "od-h264",
            runner: "mockrun",
            runner_settings: settings,
            command_line: argv,
        }
    }

    #[test]
    fn density_result_layout() {
        let outcome = DensityOutcome {
            density: 2,
            termination: Termination::Converged,
            max_success: Some(2),
            max_success_iteration: Some(1),
            min_failure: Some(3),
            min_failure_iteration: Some(0),
            iterations: vec![iteration(0, 3, 20.0), iteration(1, 2, 30.0)],
        };
        let settings = RunnerSettings::default();
        let argv = vec!["pipebench".to_string(), "measure".to_string()];
        let document = density_document(&outcome, &json!({"fps": 30}), &context(&settings, &argv))
            .unwrap();

        assert_eq!(document["streams"], 2);
        assert_eq!(document["density"], 2);
        assert_eq!(document["termination"], "converged");
        assert_eq!(document["total"], 60.0);
        assert_eq!(document["processes"], 1);
        assert_eq!(document["command_line"], "pipebench measure");
        assert_eq!(document["measurement_settings"]["fps"], 30);
        let streams = document["iterations"]["Iteration: 0000"].as_object().unwrap();
        assert_eq!(streams.len(), 3);
        assert_eq!(streams["Stream: 0002"]["overall_avg_fps"], 20.0);

        let table = density_table(&outcome, &context(&settings, &argv)).unwrap();
        assert!(table.contains("| best passing | 2 | 60.00 | 30.00 | 29.00 | 1 |"), "{table}");
        assert!(table.contains("| nearest failing | 3 |"), "{table}");
    }

    #[test]
    fn throughput_round_trips_through_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ThroughputOutcome {
            select: "total".to_string(),
            fps: Some(90.0),
            result: iteration(0, 3, 30.0),
        };
        let settings = RunnerSettings::default();
        let document = throughput_document(&outcome, &json!({}), &context(&settings, &[])).unwrap();
        write_result(dir.path(), &document).unwrap();
        assert_eq!(read_throughput(dir.path()).unwrap(), Some(90.0));
    }

    #[test]
    fn throughput_read_falls_back_to_select_key() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_throughput(dir.path()).unwrap(), None);
        fs::write(
            dir.path().join(RESULT_FILE),
            r#"{"select":"average","avg":61.5,"max":70.0}"#,
        )
        .unwrap();
        assert_eq!(read_throughput(dir.path()).unwrap(), Some(61.5));
    }
}
