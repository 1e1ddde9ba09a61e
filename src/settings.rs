use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::BenchError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceScenario {
    /// Cached payloads are replayed through per-stream input pipes.
    #[default]
    Memory,
    /// The runner reads the elementary stream file itself.
    Disk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Scenario {
    pub source: SourceScenario,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMethod {
    Linear,
    #[default]
    Binary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetCondition {
    /// Every stream must meet the ranges on its own.
    #[default]
    Stream,
    /// The mean of the per-stream values must meet the ranges.
    Average,
    /// Greedy ascent on summed throughput.
    Total,
}

/// Placement of streams onto runner processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub streams_per_process: Option<usize>,
    pub max_processes: Option<usize>,
    pub numa_nodes: Vec<u32>,
    pub gpu_render_devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ThroughputSettings {
    pub duration: f64,
    pub warm_up: u64,
    pub sample_size: u64,
    pub select: String,
    pub streams: usize,
    pub iteration_overhead: f64,
    pub streams_per_process: Option<usize>,
    pub max_processes: Option<usize>,
    pub numa_nodes: Vec<u32>,
    pub gpu_render_devices: Vec<String>,
}

impl Default for ThroughputSettings {
    fn default() -> Self {
        Self {
            duration: 30.0,
            warm_up: 2,
            sample_size: 30,
            select: "average".to_string(),
            streams: 1,
            iteration_overhead: 10.0,
            streams_per_process: None,
            max_processes: None,
            numa_nodes: Vec::new(),
            gpu_render_devices: Vec::new(),
        }
    }
}

impl ThroughputSettings {
    pub fn topology(&self) -> Topology {
        Topology {
            streams_per_process: self.streams_per_process,
            max_processes: self.max_processes,
            numa_nodes: self.numa_nodes.clone(),
            gpu_render_devices: self.gpu_render_devices.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DensitySettings {
    pub fps: f64,
    pub duration: f64,
    pub warm_up: u64,
    pub sample_size: u64,
    pub min_streams: usize,
    pub max_streams: usize,
    pub fixed_streams: Option<usize>,
    pub starting_streams: Option<usize>,
    pub search_method: SearchMethod,
    pub target_condition: TargetCondition,
    pub minimum_range: Option<Vec<f64>>,
    pub average_range: Option<Vec<f64>>,
    pub max_iterations: usize,
    pub iteration_overhead: f64,
    pub streams_per_process: Option<usize>,
    pub max_processes: Option<usize>,
    pub numa_nodes: Vec<u32>,
    pub gpu_render_devices: Vec<String>,
}

impl Default for DensitySettings {
    fn default() -> Self {
        Self {
            fps: 30.0,
            duration: 30.0,
            warm_up: 2,
            sample_size: 30,
            min_streams: 1,
            max_streams: 64,
            fixed_streams: None,
            starting_streams: None,
            search_method: SearchMethod::default(),
            target_condition: TargetCondition::default(),
            minimum_range: None,
            average_range: None,
            max_iterations: 32,
            iteration_overhead: 10.0,
            streams_per_process: None,
            max_processes: None,
            numa_nodes: Vec::new(),
            gpu_render_devices: Vec::new(),
        }
    }
}

impl DensitySettings {
    pub fn topology(&self) -> Topology {
        Topology {
            streams_per_process: self.streams_per_process,
            max_processes: self.max_processes,
            numa_nodes: self.numa_nodes.clone(),
            gpu_render_devices: self.gpu_render_devices.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MeasurementSettings {
    pub scenario: Scenario,
    pub save_pipeline_output: bool,
    pub throughput: Option<ThroughputSettings>,
    pub density: Option<DensitySettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Workload {
    pub pipeline: String,
    pub task: String,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_precision")]
    pub precision: String,
    #[serde(default)]
    pub measurement: MeasurementSettings,
}

fn default_precision() -> String {
    "FP32".to_string()
}

impl Workload {
    pub fn load(path: &Path) -> Result<Self, BenchError> {
        let workload: Self = load_document(path)?;
        workload.validate()?;
        Ok(workload)
    }

    /// A throughput-only (or throughput + density) workload with default settings.
    pub fn minimal(pipeline: &str, task: &str, density: bool) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            task: task.to_string(),
            media: None,
            models: Vec::new(),
            precision: default_precision(),
            measurement: MeasurementSettings {
                throughput: Some(ThroughputSettings::default()),
                density: density.then(DensitySettings::default),
                ..MeasurementSettings::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        if self.pipeline.is_empty() {
            return Err(BenchError::Config("workload names no pipeline".to_string()));
        }
        if let Some(throughput) = &self.measurement.throughput {
            if throughput.duration <= 0.0 {
                return Err(BenchError::Config("throughput duration must be positive".to_string()));
            }
            if throughput.sample_size == 0 || throughput.streams == 0 {
                return Err(BenchError::Config(
                    "throughput sample-size and streams must be at least 1".to_string(),
                ));
            }
            if !["average", "avg", "min", "max", "total"].contains(&throughput.select.as_str()) {
                return Err(BenchError::Config(format!(
                    "unknown throughput select key: {}",
                    throughput.select
                )));
            }
            validate_topology(&throughput.topology())?;
        }
        if let Some(density) = &self.measurement.density {
            if density.fps <= 0.0 || density.duration <= 0.0 {
                return Err(BenchError::Config("density fps and duration must be positive".to_string()));
            }
            if density.sample_size == 0 {
                return Err(BenchError::Config("density sample-size must be at least 1".to_string()));
            }
            if density.min_streams == 0 || density.min_streams > density.max_streams {
                return Err(BenchError::Config(format!(
                    "invalid stream range [{}, {}]",
                    density.min_streams, density.max_streams
                )));
            }
            if density.max_iterations == 0 {
                return Err(BenchError::Config("max-iterations must be at least 1".to_string()));
            }
            for (name, range) in [
                ("minimum-range", &density.minimum_range),
                ("average-range", &density.average_range),
            ] {
                if range.as_ref().is_some_and(|r| r.is_empty() || r.len() > 2) {
                    return Err(BenchError::Config(format!("{name} takes one or two values")));
                }
            }
            validate_topology(&density.topology())?;
        }
        Ok(())
    }
}

fn validate_topology(topology: &Topology) -> Result<(), BenchError> {
    if topology.streams_per_process == Some(0) || topology.max_processes == Some(0) {
        return Err(BenchError::Config(
            "streams-per-process and max-processes must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Launch command from a runner config: a shell-style line or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RunCommand {
    Line(String),
    Argv(Vec<String>),
}

impl RunCommand {
    pub fn argv(&self) -> Result<Vec<String>, BenchError> {
        match self {
            Self::Line(line) => shlex::split(line).ok_or_else(|| {
                BenchError::Config(format!("unbalanced quotes in runner `run`: {line}"))
            }),
            Self::Argv(argv) => Ok(argv.clone()),
        }
    }
}

/// Free-form runner configuration, passed through to the piperun document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RunnerSettings {
    values: Map<String, Value>,
}

impl RunnerSettings {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// `<workspace>/<pipeline>/<runner>.config.toml`, falling back to `.json`.
    /// Neither existing yields empty settings.
    pub fn load(workspace: &Path, pipeline: &str, runner: &str) -> Result<Self, BenchError> {
        let Some(path) = runner_config_path(workspace, pipeline, runner) else {
            return Ok(Self::default());
        };
        let value: Value = load_document(&path)?;
        match value {
            Value::Object(values) => Ok(Self { values }),
            _ => Err(BenchError::Config(format!(
                "{} must contain a table",
                path.display()
            ))),
        }
    }

    /// Values parse as JSON when they can, otherwise they are kept as strings.
    pub fn apply_override(&mut self, key: &str, value: &str) {
        let parsed =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        self.values.insert(key.to_string(), parsed);
    }

    pub fn run_command(&self) -> Result<Option<RunCommand>, BenchError> {
        self.values
            .get("run")
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| BenchError::Config(format!("invalid runner `run`: {e}")))
            })
            .transpose()
    }

    pub fn trace_latency(&self) -> bool {
        self.values
            .get("trace-latency")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}

fn runner_config_path(workspace: &Path, pipeline: &str, runner: &str) -> Option<PathBuf> {
    let dir = workspace.join(pipeline);
    ["toml", "json"]
        .iter()
        .map(|ext| dir.join(format!("{runner}.config.{ext}")))
        .find(|path| path.is_file())
}

/// Reads a TOML or JSON document, chosen by file extension.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, BenchError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| BenchError::io(format!("read {}", path.display()), e))?;
    let invalid = |e: String| BenchError::Config(format!("invalid {}: {e}", path.display()));
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw).map_err(|e| invalid(e.to_string())),
        Some("json") => serde_json::from_str(&raw).map_err(|e| invalid(e.to_string())),
        other => Err(BenchError::Config(format!(
            "unsupported document type {:?} for {}",
            other.unwrap_or_default(),
            path.display()
        ))),
    }
}
