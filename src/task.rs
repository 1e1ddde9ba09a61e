use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::contract::{ProcessExit, ProcessHandle, shutdown_process};
use crate::frame_cache::FrameCache;
use crate::launcher::{LaunchRequest, start_runner};
use crate::media::{CapsInfo, media_type, read_caps};
use crate::models::{ModelLookup, find_model};
use crate::pipeline::StartGate;
use crate::settings::{RunnerSettings, SourceScenario, Workload};
use crate::sink::{MediaSink, SinkConfig};
use crate::source::{MediaSource, SourceConfig};
use crate::{BenchError, FpsReport, fifo};

/// Everything a task needs to know about the session it runs in.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workspace: PathBuf,
    pub pipeline_root: PathBuf,
    pub workload: Workload,
    pub runner: String,
    pub verbose: u8,
    pub frame_cache: FrameCache,
}

#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub run_dir: &'a Path,
    /// `throughput` or `density`; names the generated piperun document.
    pub measurement: &'a str,
    pub runner_settings: &'a RunnerSettings,
    pub warm_up: u64,
    /// `None` replays input unthrottled.
    pub frame_rate: Option<f64>,
    pub sample_size: u64,
    pub num_streams: usize,
    pub first_stream: usize,
    pub gate: Option<Arc<StartGate>>,
    pub numa_node: Option<u32>,
    pub gpu_render_device: Option<&'a str>,
}

impl RunRequest<'_> {
    pub fn streams(&self) -> Range<usize> {
        self.first_stream..self.first_stream + self.num_streams
    }
}

/// Sources, sinks and the runner process serving one stream partition.
pub struct StreamGroup {
    pub sources: Vec<Option<MediaSource>>,
    pub sinks: Vec<MediaSink>,
    pub process: Box<dyn ProcessHandle>,
    pub run_dir: PathBuf,
    pub streams: Range<usize>,
    /// Named pipes live here; removed when the group is dropped.
    pub pipe_dir: Option<TempDir>,
}

impl StreamGroup {
    /// False once any memory source has stopped replaying.
    pub fn sources_alive(&self) -> bool {
        self.sources.iter().flatten().all(MediaSource::is_alive)
    }

    pub fn reports(&self) -> Vec<FpsReport> {
        self.sinks.iter().map(MediaSink::get_fps).collect()
    }

    /// Sources first, then the runner, then the sinks.
    pub fn shutdown(
        &mut self,
        grace: Duration,
        join_timeout: Duration,
    ) -> Result<ProcessExit, BenchError> {
        for source in self.sources.iter().flatten() {
            source.stop();
        }
        for source in self.sources.iter_mut().flatten() {
            if !source.join_timeout(join_timeout) {
                warn!(uri = source.uri(), "source did not stop in time");
            }
        }
        let exit = shutdown_process(self.process.as_mut(), grace)?;
        for sink in &self.sinks {
            sink.stop();
        }
        for sink in &mut self.sinks {
            sink.join_timeout(join_timeout);
        }
        Ok(exit)
    }
}

impl std::fmt::Debug for StreamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamGroup")
            .field("streams", &self.streams)
            .field("run_dir", &self.run_dir)
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Validates cached inputs under `workload_root` before any measurement.
    fn prepare(&self, workload_root: &Path, timeout: Option<Duration>) -> Result<(), BenchError>;

    /// Starts sinks, the runner process and sources for one partition.
    fn run(&self, request: RunRequest<'_>) -> Result<StreamGroup, BenchError>;
}

pub type TaskFactory =
    Box<dyn Fn(&TaskContext) -> Result<Box<dyn Task>, BenchError> + Send + Sync>;

#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for name in [
            "object-detection",
            "object-classification",
            "object-tracking",
            "object-detection-multi",
        ] {
            registry.register(name, move |ctx| {
                Ok(Box::new(PiperunTask::new(name, ctx.clone(), OBJECTS_CAPS)))
            });
        }
        registry.register("decode-vpp", |ctx| {
            Ok(Box::new(PiperunTask::new("decode-vpp", ctx.clone(), RAW_VIDEO_CAPS)))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&TaskContext) -> Result<Box<dyn Task>, BenchError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names = self.factories.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    pub fn create(&self, name: &str, ctx: &TaskContext) -> Result<Box<dyn Task>, BenchError> {
        let Some(factory) = self.factories.get(name) else {
            return Err(BenchError::Config(format!(
                "unknown task `{name}`, known tasks: {}",
                self.names().join(", ")
            )));
        };
        factory(ctx)
    }
}

pub const OBJECTS_CAPS: &str = "metadata/objects,format=jsonl";
pub const RAW_VIDEO_CAPS: &str = "video/x-raw";

#[derive(Debug)]
struct Prepared {
    workload_root: PathBuf,
    caps: CapsInfo,
    models: BTreeMap<String, Value>,
}

/// Drives an external runner through a generated `*.piperun.json` document
/// and per-stream named pipes.
#[derive(Debug)]
pub struct PiperunTask {
    name: String,
    ctx: TaskContext,
    output_caps: &'static str,
    prepared: OnceLock<Prepared>,
}

impl PiperunTask {
    pub fn new(name: &str, ctx: TaskContext, output_caps: &'static str) -> Self {
        Self {
            name: name.to_string(),
            ctx,
            output_caps,
            prepared: OnceLock::new(),
        }
    }

    fn scenario(&self) -> SourceScenario {
        self.ctx.workload.measurement.scenario.source
    }

    fn resolve_models(&self) -> Result<BTreeMap<String, Value>, BenchError> {
        let mut models = BTreeMap::new();
        for name in &self.ctx.workload.models {
            let resolved = match find_model(name, &self.ctx.pipeline_root)? {
                ModelLookup::FullFrame => Value::Null,
                ModelLookup::NotFound(root) => {
                    return Err(BenchError::Config(format!(
                        "can't find model root for {name}: {}",
                        root.display()
                    )));
                }
                ModelLookup::Found(artifacts) => {
                    let Some((precision, variant)) =
                        artifacts.variant(&self.ctx.workload.precision)
                    else {
                        return Err(BenchError::Config(format!("model {name} has no files")));
                    };
                    json!({"precision": precision, "files": variant})
                }
            };
            models.insert(name.clone(), resolved);
        }
        Ok(models)
    }

    fn disk_input(&self, workload_root: &Path, caps: &CapsInfo) -> Result<PathBuf, BenchError> {
        let media = media_type(&caps.caps)?;
        let input = workload_root.join("input");
        if let Some(container) = media.container_formats.first() {
            let candidate = input.join(format!("stream.fps.{container}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        let extension = media.elementary_stream_extension().ok_or_else(|| {
            BenchError::Config(format!("{} can't be read from disk", media.key))
        })?;
        Ok(input.join(format!("stream.{extension}")))
    }

    fn write_piperun(
        &self,
        request: &RunRequest<'_>,
        prepared: &Prepared,
        inputs: Vec<Value>,
        outputs: Vec<Value>,
    ) -> Result<PathBuf, BenchError> {
        let workload = &self.ctx.workload;
        let document = json!({
            "pipeline": workload.pipeline,
            "task": workload.task,
            "media": workload.media,
            "inputs": inputs,
            "outputs": outputs,
            "runner-config": request.runner_settings,
            "pipeline-root": self.ctx.pipeline_root,
            "models-root": self.ctx.pipeline_root.join("models"),
            "models": prepared.models,
            "workload-root": prepared.workload_root,
            "first-stream": request.first_stream,
        });
        let path = request
            .run_dir
            .join(format!("{}.piperun.json", request.measurement));
        let raw = serde_json::to_string_pretty(&document)
            .map_err(|e| BenchError::Serialize(e.to_string()))?;
        fs::write(&path, raw).map_err(|e| BenchError::io(format!("write {}", path.display()), e))?;
        Ok(path)
    }
}

impl Task for PiperunTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, workload_root: &Path, timeout: Option<Duration>) -> Result<(), BenchError> {
        for dir in ["input", "reference"] {
            let path = workload_root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| BenchError::io(format!("create {}", path.display()), e))?;
        }
        let input = workload_root.join("input");
        if !input.join("caps.json").is_file() {
            return Err(BenchError::NoInput(input));
        }
        let caps = read_caps(&input)?;
        let media = media_type(&caps.caps)?;
        match self.scenario() {
            SourceScenario::Memory => {
                let extension = media.frame_extension.ok_or_else(|| {
                    BenchError::Config(format!("{} can't be replayed from memory", media.key))
                })?;
                let frames = self.ctx.frame_cache.load(&input, extension)?;
                if frames.is_empty() {
                    return Err(BenchError::NoInput(input));
                }
                info!(task = self.name(), frames = frames.len(), caps = caps.caps.as_str(), "input cached");
            }
            SourceScenario::Disk => {
                let path = self.disk_input(workload_root, &caps)?;
                if !path.is_file() {
                    return Err(BenchError::NoInput(path));
                }
            }
        }
        let models = self.resolve_models()?;
        debug!(task = self.name(), ?timeout, models = models.len(), "task prepared");

        self.prepared
            .set(Prepared {
                workload_root: workload_root.to_path_buf(),
                caps,
                models,
            })
            .map_err(|_| BenchError::Task(format!("task {} prepared twice", self.name())))
    }

    fn run(&self, request: RunRequest<'_>) -> Result<StreamGroup, BenchError> {
        let Some(prepared) = self.prepared.get() else {
            return Err(BenchError::Task(format!("task {} was not prepared", self.name())));
        };
        let scenario = self.scenario();
        let pipe_dir = tempfile::Builder::new()
            .prefix("pipebench-")
            .tempdir()
            .map_err(|e| BenchError::io("create pipe directory", e))?;
        let input_dir = prepared.workload_root.join("input");

        let mut inputs = Vec::with_capacity(request.num_streams);
        let mut outputs = Vec::with_capacity(request.num_streams);
        let mut input_pipes = Vec::with_capacity(request.num_streams);
        let mut output_pipes = Vec::with_capacity(request.num_streams);
        for stream in request.streams() {
            let dir = pipe_dir.path().join(format!("stream_{stream:04}"));
            fs::create_dir(&dir)
                .map_err(|e| BenchError::io(format!("create {}", dir.display()), e))?;

            let (uri, caps) = match scenario {
                SourceScenario::Memory => {
                    let path = dir.join("input");
                    fifo::create(&path)?;
                    let uri = format!("pipe://{}", path.display());
                    input_pipes.push(Some((path, uri.clone())));
                    (uri, prepared.caps.caps.clone())
                }
                SourceScenario::Disk => {
                    let path = self.disk_input(&prepared.workload_root, &prepared.caps)?;
                    input_pipes.push(None);
                    (
                        format!("file://{}", path.display()),
                        prepared.caps.media_key().to_string(),
                    )
                }
            };
            inputs.push(json!({
                "uri": uri,
                "caps": caps,
                "extended-caps": prepared.caps.caps,
                "source": prepared.caps.source,
            }));

            let path = dir.join("output");
            fifo::create(&path)?;
            let uri = format!("pipe://{}", path.display());
            outputs.push(json!({"uri": uri, "caps": self.output_caps}));
            output_pipes.push((path, uri));
        }
        let piperun_config = self.write_piperun(&request, prepared, inputs, outputs)?;

        let save_output = self.ctx.workload.measurement.save_pipeline_output;
        let mut sinks = Vec::with_capacity(request.num_streams);
        for (stream, (path, uri)) in request.streams().zip(output_pipes) {
            let mut sink = MediaSink::new(SinkConfig {
                source_path: path,
                source_uri: uri,
                caps: self.output_caps.to_string(),
                stream_index: stream,
                reference_dir: Some(prepared.workload_root.join("reference")),
                warm_up: request.warm_up,
                sample_size: request.sample_size,
                save_output,
                output_dir: Some(request.run_dir.to_path_buf()),
                gate: request.gate.clone(),
            })?;
            sink.start()?;
            sinks.push(sink);
        }

        let process = start_runner(&LaunchRequest {
            runner: &self.ctx.runner,
            settings: request.runner_settings,
            run_dir: request.run_dir,
            piperun_config: &piperun_config,
            pipeline_root: &self.ctx.pipeline_root,
            systeminfo: &prepared.workload_root.join("systeminfo.json"),
            redirect: self.ctx.verbose < 2,
            numa_node: request.numa_node,
            gpu_render_device: request.gpu_render_device,
        })?;

        let mut sources = Vec::with_capacity(request.num_streams);
        for pipe in input_pipes {
            let Some((path, uri)) = pipe else {
                sources.push(None);
                continue;
            };
            let mut source = MediaSource::new(
                SourceConfig {
                    sink_path: path,
                    sink_uri: uri,
                    caps: prepared.caps.caps.clone(),
                    input_dir: input_dir.clone(),
                    frame_rate: request.frame_rate,
                    frame_count: None,
                    elapsed_time: None,
                },
                &self.ctx.frame_cache,
            )?;
            source.start()?;
            sources.push(Some(source));
        }

        Ok(StreamGroup {
            sources,
            sinks,
            process: Box::new(process),
            run_dir: request.run_dir.to_path_buf(),
            streams: request.streams(),
            pipe_dir: Some(pipe_dir),
        })
    }
}
