use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

mod contract;
mod density;
mod fifo;
mod frame_cache;
mod iteration;
mod launcher;
mod media;
mod models;
mod pipeline;
mod report;
mod settings;
mod sink;
mod source;
mod task;
mod throughput;

pub use contract::{
    BenchError, FpsReport, FpsTotals, ProcessExit, ProcessHandle, shutdown_process, wait_timeout,
};
pub use density::{
    DensityCheck, DensityOutcome, RangeCheck, SearchState, SearchStep, StreamCheck, Termination,
    UNBOUNDED, calculated_streams, check_density, initial_streams, normalize_range,
    run_density_search,
};
pub use fifo::{create as create_fifo, is_fifo};
pub use frame_cache::{FrameCache, Frames};
pub use iteration::{
    IterationExecutor, IterationPlan, IterationResult, IterationRunner, ProcessRecord,
    partition_streams,
};
pub use launcher::{
    GPU_DEVICE_ENV, LATENCY_LOG_ENV, LaunchRequest, RunnerCommand, RunnerProcess, runner_command,
    start_runner,
};
pub use media::{CapsInfo, MediaType, frame_index, list_frames, media_type, read_caps};
pub use models::{FULL_FRAME, ModelArtifacts, ModelLookup, ModelVariant, find_model};
pub use pipeline::StartGate;
pub use report::{
    RESULT_FILE, ResultContext, density_document, density_table, iterations_map, read_throughput,
    throughput_document, throughput_table, write_result,
};
pub use settings::{
    DensitySettings, MeasurementSettings, RunCommand, RunnerSettings, Scenario, SearchMethod,
    SourceScenario, TargetCondition, ThroughputSettings, Topology, Workload, load_document,
};
pub use sink::{FpsTracker, MediaSink, SinkConfig};
pub use source::{MediaSource, SourceConfig};
pub use task::{
    OBJECTS_CAPS, PiperunTask, RAW_VIDEO_CAPS, RunRequest, StreamGroup, Task, TaskContext,
    TaskFactory, TaskRegistry,
};
pub use throughput::{ThroughputOutcome, run_throughput};

/// What `pipebench measure` was asked to do.
#[derive(Debug, Clone, Default)]
pub struct MeasureOptions {
    pub workspace: PathBuf,
    /// Without a workload file, `pipeline` and `task` describe a default one.
    pub workload: Option<PathBuf>,
    pub pipeline: Option<String>,
    pub task: Option<String>,
    pub runner: String,
    /// Re-measure throughput even when a previous result exists.
    pub throughput: bool,
    pub density: bool,
    pub force: bool,
    pub overrides: Vec<(String, String)>,
    pub verbose: u8,
    pub command_line: Vec<String>,
}

#[derive(Debug)]
pub struct MeasureSummary {
    pub target_dir: PathBuf,
    pub throughput_fps: Option<f64>,
    pub throughput: Option<ThroughputOutcome>,
    pub density: Option<DensityOutcome>,
    /// Markdown tables, one per measurement run.
    pub tables: Vec<String>,
}

/// One benchmarking session: a workload, a runner and the task driving it.
pub struct BenchSession {
    options: MeasureOptions,
    workload: Workload,
    workload_name: String,
    pipeline_root: PathBuf,
    workload_root: PathBuf,
    target_dir: PathBuf,
    runner_settings: RunnerSettings,
    task: Box<dyn Task>,
}

impl BenchSession {
    pub fn open(options: MeasureOptions, registry: &TaskRegistry) -> Result<Self, BenchError> {
        let (workload, workload_name) = match &options.workload {
            Some(path) => (Workload::load(path)?, workload_name(path)),
            None => {
                let (Some(pipeline), Some(task)) = (&options.pipeline, &options.task) else {
                    return Err(BenchError::Config(
                        "either a workload file or a pipeline and task are required".to_string(),
                    ));
                };
                let workload = Workload::minimal(pipeline, task, options.density);
                workload.validate()?;
                (workload, "default".to_string())
            }
        };

        let pipeline_root = options.workspace.join(&workload.pipeline);
        if !pipeline_root.is_dir() {
            return Err(BenchError::Config(format!(
                "pipeline {} not found in workspace {}",
                workload.pipeline,
                options.workspace.display()
            )));
        }
        let workload_root = pipeline_root.join("workloads").join(&workload_name);
        let target_dir = pipeline_root
            .join("runners")
            .join(&options.runner)
            .join("results")
            .join(&workload_name);

        let mut runner_settings =
            RunnerSettings::load(&options.workspace, &workload.pipeline, &options.runner)?;
        for (key, value) in &options.overrides {
            runner_settings.apply_override(key, value);
        }

        let ctx = TaskContext {
            workspace: options.workspace.clone(),
            pipeline_root: pipeline_root.clone(),
            workload: workload.clone(),
            runner: options.runner.clone(),
            verbose: options.verbose,
            frame_cache: FrameCache::new(),
        };
        let task = registry.create(&workload.task, &ctx)?;

        Ok(Self {
            options,
            workload,
            workload_name,
            pipeline_root,
            workload_root,
            target_dir,
            runner_settings,
            task,
        })
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    fn prepare(&self) -> Result<(), BenchError> {
        if self.options.force && self.target_dir.exists() {
            fs::remove_dir_all(&self.target_dir).map_err(|e| {
                BenchError::io(format!("remove {}", self.target_dir.display()), e)
            })?;
        }
        fs::create_dir_all(&self.target_dir)
            .map_err(|e| BenchError::io(format!("create {}", self.target_dir.display()), e))?;

        let copy = self
            .target_dir
            .join(format!("{}.workload.json", self.workload_name));
        let raw = serde_json::to_string_pretty(&self.workload)
            .map_err(|e| BenchError::Serialize(e.to_string()))?;
        fs::write(&copy, raw).map_err(|e| BenchError::io(format!("write {}", copy.display()), e))?;

        let timeout = self
            .workload
            .measurement
            .throughput
            .as_ref()
            .map(|t| Duration::from_secs_f64(t.duration));
        self.task.prepare(&self.workload_root, timeout)
    }

    pub fn measure(&self) -> Result<MeasureSummary, BenchError> {
        self.prepare()?;
        info!(
            pipeline = self.workload.pipeline.as_str(),
            task = self.task.name(),
            runner = self.options.runner.as_str(),
            target = %self.target_dir.display(),
            "measuring"
        );

        let ctx = ResultContext {
            pipeline: &self.workload.pipeline,
            runner: &self.options.runner,
            runner_settings: &self.runner_settings,
            command_line: &self.options.command_line,
        };
        let mut executor = IterationRunner::new(self.task.as_ref(), &self.runner_settings);
        let mut summary = MeasureSummary {
            target_dir: self.target_dir.clone(),
            throughput_fps: None,
            throughput: None,
            density: None,
            tables: Vec::new(),
        };

        let throughput_dir = self.target_dir.join("throughput");
        let density = self.workload.measurement.density.as_ref();
        let previous = match density {
            Some(_) if !self.options.throughput => read_throughput(&throughput_dir)?,
            _ => None,
        };
        if let Some(fps) = previous {
            info!(fps, "using previous throughput result");
            summary.throughput_fps = Some(fps);
        } else if let Some(settings) = &self.workload.measurement.throughput {
            let outcome = run_throughput(&mut executor, settings, &throughput_dir)?;
            write_result(&throughput_dir, &throughput_document(&outcome, settings, &ctx)?)?;
            let table = throughput_table(&outcome, &ctx)?;
            write_table(&throughput_dir, &table)?;
            summary.tables.push(table);
            summary.throughput_fps = outcome.fps;
            summary.throughput = Some(outcome);
        }

        if let Some(settings) = density {
            let density_dir = self.target_dir.join("density");
            let start = initial_streams(settings, summary.throughput_fps);
            let outcome = run_density_search(&mut executor, settings, start, &density_dir)?;
            write_result(&density_dir, &density_document(&outcome, settings, &ctx)?)?;
            let table = density_table(&outcome, &ctx)?;
            write_table(&density_dir, &table)?;
            summary.tables.push(table);
            summary.density = Some(outcome);
        }

        if summary.tables.is_empty() {
            warn!("workload configures no measurement");
        }
        Ok(summary)
    }

    pub fn pipeline_root(&self) -> &Path {
        &self.pipeline_root
    }
}

fn write_table(dir: &Path, table: &str) -> Result<(), BenchError> {
    let path = dir.join("result.md");
    fs::write(&path, table).map_err(|e| BenchError::io(format!("write {}", path.display()), e))
}

/// `smoke.workload.toml` -> `smoke`
fn workload_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .filter(|n| !n.is_empty())
        .unwrap_or("default")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_name_strips_every_extension() {
        assert_eq!(workload_name(Path::new("/w/smoke.workload.toml")), "smoke");
        assert_eq!(workload_name(Path::new("density.json")), "density");
        assert_eq!(workload_name(Path::new("/")), "default");
    }

    #[test]
    fn missing_pipeline_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = MeasureOptions {
            workspace: dir.path().to_path_buf(),
            pipeline: Some("absent".to_string()),
            task: Some("object-detection".to_string()),
            runner: "mockrun".to_string(),
            ..MeasureOptions::default()
        };
        let err = BenchSession::open(options, &TaskRegistry::with_defaults())
            .err()
            .unwrap();
        assert!(matches!(err, BenchError::Config(_)), "{err}");
    }

    #[test]
    fn unknown_task_is_rejected_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("pipe")).unwrap();
        let options = MeasureOptions {
            workspace: dir.path().to_path_buf(),
            pipeline: Some("pipe".to_string()),
            task: Some("pose-estimation".to_string()),
            runner: "mockrun".to_string(),
            ..MeasureOptions::default()
        };
        let err = BenchSession::open(options, &TaskRegistry::with_defaults())
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown task"), "{err}");
    }
}
