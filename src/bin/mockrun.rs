//! Stand-in runner: consumes each input stream and answers every frame with
//! a reference record, so the harness can be exercised without a media stack.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use pipebench::{list_frames, media_type};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Mock pipeline runner driven by a piperun document")]
struct Args {
    #[arg(long)]
    systeminfo: Option<PathBuf>,

    piperun_config: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Piperun {
    inputs: Vec<Endpoint>,
    outputs: Vec<Endpoint>,
    #[serde(default)]
    runner_config: Map<String, Value>,
    workload_root: PathBuf,
    #[serde(default)]
    first_stream: usize,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    uri: String,
    caps: String,
}

/// What a stream answers each input frame with.
#[derive(Debug)]
enum Reply {
    Lines(Vec<String>),
    Frames(Vec<Vec<u8>>),
}

impl Reply {
    fn write(&self, out: &mut impl Write, frame: u64) -> io::Result<()> {
        match self {
            Self::Lines(lines) if lines.is_empty() => writeln!(out, "{{\"frame\":{frame}}}"),
            Self::Lines(lines) => writeln!(out, "{}", lines[frame as usize % lines.len()]),
            Self::Frames(frames) => out.write_all(&frames[frame as usize % frames.len()]),
        }
    }
}

#[derive(Debug)]
enum Input {
    /// Frame sizes of the memory-replayed stream, in order.
    Pipe { path: PathBuf, sizes: Vec<usize> },
    /// Disk input is not decoded, only paced.
    File { frame_rate: f64 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let raw = fs::read_to_string(&args.piperun_config)
        .with_context(|| format!("read {}", args.piperun_config.display()))?;
    let piperun: Piperun = serde_json::from_str(&raw)
        .with_context(|| format!("parse {}", args.piperun_config.display()))?;
    if piperun.inputs.len() != piperun.outputs.len() {
        bail!(
            "{} inputs but {} outputs",
            piperun.inputs.len(),
            piperun.outputs.len()
        );
    }
    if let Some(path) = &args.systeminfo {
        debug!(systeminfo = %path.display(), "system info");
    }

    let streams = piperun.inputs.len();
    let setting = |key: &str| piperun.runner_config.get(key).and_then(Value::as_f64);
    let frame_rate = setting("fps").unwrap_or(30.0);
    let max_stream_fps = setting("max-total-fps")
        .filter(|fps| *fps > 0.0)
        .map(|fps| fps / streams.max(1) as f64);
    info!(
        streams,
        first_stream = piperun.first_stream,
        max_stream_fps,
        "mockrun started"
    );

    let mut workers = Vec::with_capacity(streams);
    for (offset, (input, output)) in piperun.inputs.iter().zip(&piperun.outputs).enumerate() {
        let stream = piperun.first_stream + offset;
        let input = open_input(input, &piperun.workload_root, frame_rate)?;
        let reply = Arc::new(load_reply(output, &piperun)?);
        let output = pipe_path(&output.uri)?;
        let worker = thread::Builder::new()
            .name(format!("mockrun-{stream}"))
            .spawn(move || run_stream(stream, input, &output, &reply, max_stream_fps))
            .context("spawn stream thread")?;
        workers.push(worker);
    }

    for worker in workers {
        match worker.join() {
            Ok(Ok(frames)) => debug!(frames, "stream finished"),
            Ok(Err(err)) => warn!(error = %err, "stream failed"),
            Err(_) => bail!("stream thread panicked"),
        }
    }
    Ok(())
}

fn pipe_path(uri: &str) -> Result<PathBuf> {
    match uri.strip_prefix("pipe://") {
        Some(path) => Ok(PathBuf::from(path)),
        None => bail!("unsupported output uri {uri}"),
    }
}

fn open_input(endpoint: &Endpoint, workload_root: &Path, frame_rate: f64) -> Result<Input> {
    if let Some(path) = endpoint.uri.strip_prefix("pipe://") {
        let media = media_type(&endpoint.caps)?;
        let sizes = match media.frame_extension {
            Some(extension) => list_frames(&workload_root.join("input"), extension)?
                .iter()
                .map(|frame| fs::metadata(frame).map(|m| m.len() as usize))
                .collect::<io::Result<Vec<_>>>()
                .context("stat input frames")?,
            None => Vec::new(),
        };
        return Ok(Input::Pipe {
            path: PathBuf::from(path),
            sizes,
        });
    }
    if endpoint.uri.starts_with("file://") {
        return Ok(Input::File { frame_rate });
    }
    bail!("unsupported input uri {}", endpoint.uri)
}

fn load_reply(endpoint: &Endpoint, piperun: &Piperun) -> Result<Reply> {
    let media = media_type(&endpoint.caps)?;
    let reference_dir = piperun.workload_root.join("reference");
    if let Some(extension) = media.frame_extension {
        let frames = list_frames(&reference_dir, extension)?
            .iter()
            .map(|frame| fs::read(frame).with_context(|| format!("read {}", frame.display())))
            .collect::<Result<Vec<_>>>()?;
        if frames.is_empty() {
            bail!("no reference frames in {}", reference_dir.display());
        }
        return Ok(Reply::Frames(frames));
    }

    let reference = piperun
        .runner_config
        .get("reference")
        .and_then(Value::as_str)
        .map_or_else(
            || reference_dir.join("objects.jsonl"),
            |name| piperun.workload_root.join(name),
        );
    let lines = match fs::read_to_string(&reference) {
        Ok(raw) => raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect(),
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", reference.display())),
    };
    Ok(Reply::Lines(lines))
}

fn run_stream(
    stream: usize,
    input: Input,
    output: &Path,
    reply: &Reply,
    max_fps: Option<f64>,
) -> Result<u64> {
    let mut reader = match &input {
        Input::Pipe { path, .. } => Some(BufReader::new(
            File::open(path).with_context(|| format!("open {}", path.display()))?,
        )),
        Input::File { .. } => None,
    };
    let out = OpenOptions::new()
        .write(true)
        .open(output)
        .with_context(|| format!("open {}", output.display()))?;
    let mut out = io::BufWriter::new(out);
    debug!(stream, "stream connected");

    let pace = match &input {
        Input::File { frame_rate } => Some(max_fps.map_or(*frame_rate, |m| m.min(*frame_rate))),
        Input::Pipe { .. } => max_fps,
    }
    .filter(|fps| *fps > 0.0)
    .map(|fps| Duration::from_secs_f64(1.0 / fps));

    let started = Instant::now();
    let mut buffer = Vec::new();
    let mut frame = 0u64;
    loop {
        if let (Some(reader), Input::Pipe { sizes, .. }) = (reader.as_mut(), &input) {
            let read = if sizes.is_empty() {
                buffer.clear();
                reader.read_until(b'\n', &mut buffer).map(|n| n > 0)
            } else {
                buffer.resize(sizes[frame as usize % sizes.len()], 0);
                match reader.read_exact(&mut buffer) {
                    Ok(()) => Ok(true),
                    Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
                    Err(err) => Err(err),
                }
            };
            if !read.context("read input")? {
                break;
            }
        }

        match reply.write(&mut out, frame).and_then(|()| out.flush()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::BrokenPipe => break,
            Err(err) => return Err(err).context("write output"),
        }
        frame += 1;

        if let Some(interval) = pace {
            let due = started + interval.mul_f64(frame as f64);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
    }
    Ok(frame)
}
