use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::contract::unix_now;
use crate::media::{list_frames, media_type};
use crate::pipeline::StartGate;
use crate::{BenchError, FpsReport, fifo};

/// Rolling frame-rate statistics for one stream.
///
/// Every `sample_size` frames closes a sample window. Windows before
/// `warm_up` are discarded, the first trusted window only sets the
/// baseline, and every later window yields a rate sample.
#[derive(Debug, Clone)]
pub struct FpsTracker {
    warm_up: u64,
    sample_size: u64,
    frames: u64,
    windows: u64,
    rate_samples: u64,
    baseline: Option<(f64, u64)>,
    last_window: f64,
    total_sample_fps: f64,
    report: FpsReport,
}

impl FpsTracker {
    pub fn new(warm_up: u64, sample_size: u64) -> Self {
        Self {
            warm_up,
            sample_size: sample_size.max(1),
            frames: 0,
            windows: 0,
            rate_samples: 0,
            baseline: None,
            last_window: 0.0,
            total_sample_fps: 0.0,
            report: FpsReport::empty(),
        }
    }

    /// `now` is wall-clock seconds; it must not go backwards.
    pub fn record_frame(&mut self, now: f64) {
        self.frames += 1;
        if self.frames % self.sample_size != 0 {
            return;
        }
        self.windows += 1;
        if self.windows < self.warm_up {
            return;
        }
        let Some((start, start_frames)) = self.baseline else {
            self.baseline = Some((now, self.frames));
            self.last_window = now;
            self.report.start_time = Some(now);
            return;
        };
        let window_elapsed = now - self.last_window;
        let total_elapsed = now - start;
        if window_elapsed <= 0.0 || total_elapsed <= 0.0 {
            return;
        }

        let fps = self.sample_size as f64 / window_elapsed;
        self.rate_samples += 1;
        self.total_sample_fps += fps;
        self.last_window = now;

        let report = &mut self.report;
        report.instantaneous_fps = fps;
        report.max_fps = report.max_fps.max(fps);
        report.min_fps = report.min_fps.min(fps);
        report.sample_window_avg_fps = self.total_sample_fps / self.rate_samples as f64;
        report.overall_avg_fps = (self.frames - start_frames) as f64 / total_elapsed;
    }

    pub fn finish(&mut self, now: f64) {
        if self.report.end_time.is_none() {
            self.report.end_time = Some(now);
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn rate_samples(&self) -> u64 {
        self.rate_samples
    }

    pub fn report(&self) -> FpsReport {
        self.report
    }
}

/// Monotonic wall-clock seconds anchored at construction.
#[derive(Debug, Clone, Copy)]
struct Clock {
    anchor: Instant,
    anchor_unix: f64,
}

impl Clock {
    fn new() -> Self {
        Self {
            anchor: Instant::now(),
            anchor_unix: unix_now(),
        }
    }

    fn now(&self) -> f64 {
        self.anchor_unix + self.anchor.elapsed().as_secs_f64()
    }
}

#[derive(Debug, Clone)]
enum ReadMode {
    Lines,
    Frames(Arc<[u64]>),
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub source_path: PathBuf,
    pub source_uri: String,
    pub caps: String,
    pub stream_index: usize,
    /// Frame-mode sizes come from the reference frames listed here.
    pub reference_dir: Option<PathBuf>,
    pub warm_up: u64,
    pub sample_size: u64,
    pub save_output: bool,
    pub output_dir: Option<PathBuf>,
    pub gate: Option<Arc<StartGate>>,
}

#[derive(Debug)]
struct SinkState {
    stopped: AtomicBool,
    connected: AtomicBool,
    tracker: Mutex<FpsTracker>,
}

/// Drains one stream's output pipe and measures its frame rate.
#[derive(Debug)]
pub struct MediaSink {
    config: SinkConfig,
    mode: ReadMode,
    state: Arc<SinkState>,
    handle: Option<JoinHandle<()>>,
}

impl MediaSink {
    pub fn new(config: SinkConfig) -> Result<Self, BenchError> {
        let media = media_type(&config.caps)?;
        let mode = if media.line_delimited {
            ReadMode::Lines
        } else {
            let extension = media.frame_extension.ok_or_else(|| {
                BenchError::Config(format!("{} has no frame form", media.key))
            })?;
            let reference = config.reference_dir.as_deref().ok_or_else(|| {
                BenchError::Config(format!("{} output needs a reference directory", media.key))
            })?;
            let sizes = list_frames(reference, extension)?
                .iter()
                .map(|path| {
                    fs::metadata(path)
                        .map(|m| m.len())
                        .map_err(|e| BenchError::io(format!("stat {}", path.display()), e))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if sizes.is_empty() {
                return Err(BenchError::NoInput(reference.to_path_buf()));
            }
            ReadMode::Frames(sizes.into())
        };
        if config.save_output && config.output_dir.is_none() {
            return Err(BenchError::Config(
                "saving pipeline output needs an output directory".to_string(),
            ));
        }
        let tracker = FpsTracker::new(config.warm_up, config.sample_size);
        Ok(Self {
            config,
            mode,
            state: Arc::new(SinkState {
                stopped: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                tracker: Mutex::new(tracker),
            }),
            handle: None,
        })
    }

    pub fn start(&mut self) -> Result<(), BenchError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let config = self.config.clone();
        let mode = self.mode.clone();
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name(format!("sink-{}", self.config.stream_index))
            .spawn(move || run_sink(&config, &mode, &state))
            .map_err(|e| BenchError::io("spawn sink thread", e))?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn get_fps(&self) -> FpsReport {
        self.state
            .tracker
            .lock()
            .map(|t| t.report())
            .unwrap_or_default()
    }

    pub fn frames_read(&self) -> u64 {
        self.state.tracker.lock().map(|t| t.frames()).unwrap_or_default()
    }

    pub fn stream_index(&self) -> usize {
        self.config.stream_index
    }

    pub fn uri(&self) -> &str {
        &self.config.source_uri
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
        self.poke();
    }

    fn poke(&self) {
        if fifo::is_fifo(&self.config.source_path) {
            let _ = fifo::poke_reader(&self.config.source_path);
        }
    }

    /// Returns `false` and leaves the thread detached if it does not finish.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_alive() {
            if Instant::now() >= deadline {
                warn!(
                    stream = self.config.stream_index,
                    "sink did not finish in time, detaching"
                );
                return false;
            }
            if self.state.stopped.load(Ordering::Acquire) {
                self.poke();
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for MediaSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sink(config: &SinkConfig, mode: &ReadMode, state: &SinkState) {
    let clock = Clock::new();
    let uri = config.source_uri.as_str();

    if let Some(gate) = &config.gate {
        if !gate.acquire_unless(&state.stopped) {
            finish(state, &clock);
            return;
        }
    }
    if state.stopped.load(Ordering::Acquire) {
        finish(state, &clock);
        return;
    }

    debug!(uri, started = clock.now(), "starting memory sink");
    let source = match File::open(&config.source_path) {
        Ok(file) => file,
        Err(err) => {
            warn!(uri, error = %err, "failed to open sink pipe");
            finish(state, &clock);
            return;
        }
    };
    state.connected.store(true, Ordering::Release);

    let result = match mode {
        ReadMode::Lines => read_lines(config, source, state, &clock),
        ReadMode::Frames(sizes) => read_frames(config, source, sizes, state, &clock),
    };
    if let Err(err) = result {
        warn!(uri, error = %err, "sink read failed");
    }

    state.connected.store(false, Ordering::Release);
    finish(state, &clock);
    let frames = state.tracker.lock().map(|t| t.frames()).unwrap_or_default();
    info!(uri, frames_read = frames, "memory sink ended");
}

fn finish(state: &SinkState, clock: &Clock) {
    if let Ok(mut tracker) = state.tracker.lock() {
        tracker.finish(clock.now());
    }
}

fn record(state: &SinkState, clock: &Clock) {
    if let Ok(mut tracker) = state.tracker.lock() {
        tracker.record_frame(clock.now());
    }
}

fn read_lines(
    config: &SinkConfig,
    source: File,
    state: &SinkState,
    clock: &Clock,
) -> io::Result<()> {
    let mut output = match (&config.output_dir, config.save_output) {
        (Some(dir), true) => Some(File::create(
            dir.join(format!("stream_{}.objects.jsonl", config.stream_index)),
        )?),
        _ => None,
    };
    let mut reader = BufReader::new(source);
    let mut line = Vec::new();
    while !state.stopped.load(Ordering::Acquire) {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 || line.last() != Some(&b'\n') {
            break;
        }
        if let Some(output) = output.as_mut() {
            output.write_all(&line)?;
        }
        record(state, clock);
    }
    if let Some(mut output) = output {
        output.flush()?;
    }
    Ok(())
}

fn read_frames(
    config: &SinkConfig,
    mut source: File,
    sizes: &[u64],
    state: &SinkState,
    clock: &Clock,
) -> io::Result<()> {
    let mut frame = Vec::new();
    let mut count = 0u64;
    while !state.stopped.load(Ordering::Acquire) {
        let size = sizes[(count % sizes.len() as u64) as usize] as usize;
        frame.resize(size, 0);
        match source.read_exact(&mut frame) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err),
        }
        count += 1;
        if let (Some(dir), true) = (&config.output_dir, config.save_output) {
            save_frame(dir, config.stream_index, count, &frame)?;
        }
        record(state, clock);
    }
    Ok(())
}

fn save_frame(dir: &Path, stream_index: usize, count: u64, frame: &[u8]) -> io::Result<()> {
    fs::write(
        dir.join(format!("stream_{stream_index}.frame_{count:06}.raw.bin")),
        frame,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn warm_up_windows_are_discarded() {
        let (warm_up, sample_size) = (2u64, 5u64);
        let mut tracker = FpsTracker::new(warm_up, sample_size);
        let mut first_sample_at = None;
        for frame in 1..=40u64 {
            tracker.record_frame(frame as f64 * 0.1);
            if first_sample_at.is_none() && tracker.rate_samples() > 0 {
                first_sample_at = Some(frame);
            }
        }
        assert_eq!(first_sample_at, Some(sample_size * (warm_up + 1)));
    }

    #[test]
    fn no_samples_before_baseline() {
        let mut tracker = FpsTracker::new(1, 10);
        for frame in 1..=10u64 {
            tracker.record_frame(frame as f64);
        }
        let report = tracker.report();
        assert!(!report.has_samples());
        assert_eq!(report.start_time, Some(10.0));
        assert_eq!(report.max_fps, 0.0);
    }

    #[test]
    fn instantaneous_between_extrema() {
        let mut tracker = FpsTracker::new(0, 2);
        let mut now = 0.0;
        for frame in 0..60u64 {
            now += if frame % 7 == 0 { 0.05 } else { 0.02 };
            tracker.record_frame(now);
            let report = tracker.report();
            if report.has_samples() {
                assert!(report.min_fps <= report.instantaneous_fps);
                assert!(report.instantaneous_fps <= report.max_fps);
            }
        }
        assert!(tracker.rate_samples() > 0);
    }

    #[test]
    fn steady_rate_is_measured() {
        let mut tracker = FpsTracker::new(1, 3);
        for frame in 1..=30u64 {
            tracker.record_frame(frame as f64 / 30.0);
        }
        let report = tracker.report();
        assert!((report.overall_avg_fps - 30.0).abs() < 1e-6);
        assert!((report.sample_window_avg_fps - 30.0).abs() < 1e-6);
        assert!((report.min_fps - report.max_fps).abs() < 1e-6);
    }

    fn line_sink(dir: &Path, gate: Option<Arc<StartGate>>) -> (MediaSink, PathBuf) {
        let pipe = dir.join("output");
        fifo::create(&pipe).unwrap();
        let sink = MediaSink::new(SinkConfig {
            source_path: pipe.clone(),
            source_uri: format!("pipe://{}", pipe.display()),
            caps: "metadata/objects,format=jsonl".to_string(),
            stream_index: 3,
            reference_dir: None,
            warm_up: 0,
            sample_size: 1,
            save_output: true,
            output_dir: Some(dir.to_path_buf()),
            gate,
        })
        .unwrap();
        (sink, pipe)
    }

    #[test]
    fn line_sink_counts_and_persists_records() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, pipe) = line_sink(dir.path(), None);
        sink.start().unwrap();
        {
            let mut writer = OpenOptions::new().write(true).open(&pipe).unwrap();
            for i in 0..5 {
                writeln!(writer, "{{\"frame\":{i}}}").unwrap();
            }
        }
        assert!(sink.join_timeout(Duration::from_secs(5)));
        assert_eq!(sink.frames_read(), 5);
        assert!(sink.get_fps().end_time.is_some());
        let saved = fs::read_to_string(dir.path().join("stream_3.objects.jsonl")).unwrap();
        assert_eq!(saved.lines().count(), 5);
    }

    #[test]
    fn gated_sink_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let gate = StartGate::shared();
        let (mut sink, pipe) = line_sink(dir.path(), Some(Arc::clone(&gate)));
        sink.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(fifo::poke_reader(&pipe).is_err(), "sink opened before release");
        gate.release(1);
        let mut writer = OpenOptions::new().write(true).open(&pipe).unwrap();
        writeln!(writer, "{{}}").unwrap();
        drop(writer);
        assert!(sink.join_timeout(Duration::from_secs(5)));
        assert_eq!(sink.frames_read(), 1);
    }

    #[test]
    fn stop_unblocks_waiting_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, _pipe) = line_sink(dir.path(), None);
        sink.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        sink.stop();
        assert!(sink.join_timeout(Duration::from_secs(5)));
        assert_eq!(sink.frames_read(), 0);
    }

    #[test]
    fn dropping_unconnected_sink_ends_its_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, _pipe) = line_sink(dir.path(), None);
        sink.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        let state = Arc::clone(&sink.state);
        drop(sink);

        let deadline = Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&state) > 1 {
            assert!(Instant::now() < deadline, "sink thread still blocked in open");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn frame_sink_uses_reference_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("reference");
        fs::create_dir(&reference).unwrap();
        fs::write(reference.join("frame_000001.raw.bin"), [0u8; 3]).unwrap();
        fs::write(reference.join("frame_000002.raw.bin"), [0u8; 5]).unwrap();
        let pipe = dir.path().join("output");
        fifo::create(&pipe).unwrap();
        let mut sink = MediaSink::new(SinkConfig {
            source_path: pipe.clone(),
            source_uri: "pipe://output".to_string(),
            caps: "video/x-raw,format=BGR".to_string(),
            stream_index: 0,
            reference_dir: Some(reference),
            warm_up: 0,
            sample_size: 1,
            save_output: false,
            output_dir: None,
            gate: None,
        })
        .unwrap();
        sink.start().unwrap();
        {
            let mut writer = OpenOptions::new().write(true).open(&pipe).unwrap();
            writer.write_all(&[1u8; 3 + 5 + 3 + 2]).unwrap();
        }
        assert!(sink.join_timeout(Duration::from_secs(5)));
        assert_eq!(sink.frames_read(), 3);
    }

    #[test]
    fn frame_sink_without_reference_is_rejected() {
        let err = MediaSink::new(SinkConfig {
            source_path: PathBuf::from("/nonexistent"),
            source_uri: String::new(),
            caps: "video/x-raw".to_string(),
            stream_index: 0,
            reference_dir: None,
            warm_up: 0,
            sample_size: 1,
            save_output: false,
            output_dir: None,
            gate: None,
        })
        .unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }
}
