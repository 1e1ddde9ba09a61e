use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::frame_cache::{FrameCache, Frames};
use crate::media::media_type;
use crate::{BenchError, fifo};

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub sink_path: PathBuf,
    pub sink_uri: String,
    pub caps: String,
    pub input_dir: PathBuf,
    /// `None` writes as fast as the reader drains.
    pub frame_rate: Option<f64>,
    pub frame_count: Option<u64>,
    pub elapsed_time: Option<f64>,
}

impl SourceConfig {
    fn frame_limit(&self) -> Option<u64> {
        match (self.frame_count, self.elapsed_time, self.frame_rate) {
            (Some(count), _, _) => Some(count),
            (None, Some(elapsed), Some(rate)) if rate > 0.0 => Some((elapsed * rate) as u64),
            _ => None,
        }
    }

    fn pacing(&self) -> Duration {
        match self.frame_rate {
            Some(rate) if rate >= 0.0 => Duration::from_secs_f64(1.0 / (rate + 0.5)),
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct SourceState {
    stopped: AtomicBool,
    connected: AtomicBool,
    written: AtomicU64,
}

/// Replays cached input frames into one stream's input pipe.
#[derive(Debug)]
pub struct MediaSource {
    path: PathBuf,
    uri: String,
    frames: Frames,
    limit: Option<u64>,
    pacing: Duration,
    state: Arc<SourceState>,
    handle: Option<JoinHandle<()>>,
}

impl MediaSource {
    pub fn new(config: SourceConfig, cache: &FrameCache) -> Result<Self, BenchError> {
        let media = media_type(&config.caps)?;
        let extension = media.frame_extension.ok_or_else(|| {
            BenchError::Config(format!("{} has no cached frame form", media.key))
        })?;
        let frames = cache.load(&config.input_dir, extension)?;
        if frames.is_empty() {
            return Err(BenchError::NoInput(config.input_dir));
        }
        Ok(Self {
            limit: config.frame_limit(),
            pacing: config.pacing(),
            path: config.sink_path,
            uri: config.sink_uri,
            frames,
            state: Arc::new(SourceState::default()),
            handle: None,
        })
    }

    pub fn start(&mut self) -> Result<(), BenchError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let path = self.path.clone();
        let uri = self.uri.clone();
        let frames = Arc::clone(&self.frames);
        let state = Arc::clone(&self.state);
        let (limit, pacing) = (self.limit, self.pacing);
        let handle = thread::Builder::new()
            .name(format!("source-{}", self.uri))
            .spawn(move || run_source(&path, &uri, &frames, limit, pacing, &state))
            .map_err(|e| BenchError::io("spawn source thread", e))?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
        if fifo::is_fifo(&self.path) {
            let _ = fifo::poke_writer(&self.path);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn frames_written(&self) -> u64 {
        self.state.written.load(Ordering::Acquire)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Joins the writer thread, re-poking a pending open until it returns.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            if self.state.stopped.load(Ordering::Acquire) && fifo::is_fifo(&self.path) {
                let _ = fifo::poke_writer(&self.path);
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_source(
    path: &Path,
    uri: &str,
    frames: &Frames,
    limit: Option<u64>,
    pacing: Duration,
    state: &SourceState,
) {
    // Survives reconnects so replay resumes with the frame that failed.
    let mut index = 0u64;
    let started = Instant::now();
    info!(uri, "starting memory source");

    'connection: while !state.stopped.load(Ordering::Acquire) {
        let mut sink = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(err) => {
                if state.stopped.load(Ordering::Acquire) {
                    break;
                }
                warn!(uri, error = %err, "failed to open source pipe, retrying");
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        if state.stopped.load(Ordering::Acquire) {
            break;
        }
        state.connected.store(true, Ordering::Release);
        debug!(uri, "source connected");

        loop {
            if state.stopped.load(Ordering::Acquire) {
                break 'connection;
            }
            let frame = &frames[(index % frames.len() as u64) as usize];
            match sink.write_all(frame) {
                Ok(()) => {
                    index += 1;
                    state.written.store(index, Ordering::Release);
                }
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(uri, frames_written = index, "reader disconnected");
                    state.connected.store(false, Ordering::Release);
                    continue 'connection;
                }
                Err(err) => {
                    warn!(uri, error = %err, "source write failed");
                    break 'connection;
                }
            }
            if limit.is_some_and(|limit| index >= limit) {
                state.stopped.store(true, Ordering::Release);
                break 'connection;
            }
            if !pacing.is_zero() {
                thread::sleep(pacing);
            }
        }
    }

    state.connected.store(false, Ordering::Release);
    info!(
        uri,
        frames_written = index,
        elapsed_s = started.elapsed().as_secs_f64(),
        "memory source ended"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Read;

    fn fixture(frame_count: u8) -> (tempfile::TempDir, SourceConfig) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        fs::create_dir(&input).unwrap();
        for i in 0..frame_count {
            fs::write(input.join(format!("frame_{:06}.x-h264.bin", i + 1)), [i; 4]).unwrap();
        }
        let pipe = dir.path().join("pipe");
        fifo::create(&pipe).unwrap();
        let config = SourceConfig {
            sink_uri: format!("pipe://{}", pipe.display()),
            sink_path: pipe,
            caps: "video/x-h264,alignment=au".to_string(),
            input_dir: input,
            frame_rate: None,
            frame_count: None,
            elapsed_time: None,
        };
        (dir, config)
    }

    fn read_frames(reader: &mut File, count: usize) -> Vec<u8> {
        (0..count)
            .map(|_| {
                let mut frame = [0u8; 4];
                reader.read_exact(&mut frame).unwrap();
                assert!(frame.iter().all(|b| *b == frame[0]), "torn frame {frame:?}");
                frame[0]
            })
            .collect()
    }

    #[test]
    fn missing_input_is_reported() {
        let (dir, mut config) = fixture(0);
        config.input_dir = dir.path().join("input");
        let err = MediaSource::new(config, &FrameCache::new()).unwrap_err();
        assert!(matches!(err, BenchError::NoInput(_)));
    }

    #[test]
    fn pacing_and_limits_follow_rate() {
        let (_dir, mut config) = fixture(1);
        assert_eq!(config.pacing(), Duration::ZERO);
        config.frame_rate = Some(29.5);
        assert_eq!(config.pacing(), Duration::from_secs_f64(1.0 / 30.0));
        config.elapsed_time = Some(2.0);
        assert_eq!(config.frame_limit(), Some(59));
        config.frame_count = Some(5);
        assert_eq!(config.frame_limit(), Some(5));
    }

    #[test]
    fn bounded_source_stops_after_frame_count() {
        let (_dir, mut config) = fixture(3);
        config.frame_count = Some(5);
        let path = config.sink_path.clone();
        let mut source = MediaSource::new(config, &FrameCache::new()).unwrap();
        source.start().unwrap();
        let mut reader = File::open(&path).unwrap();
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert!(source.join_timeout(Duration::from_secs(5)));
        assert_eq!(all.chunks(4).map(|c| c[0]).collect::<Vec<_>>(), vec![0, 1, 2, 0, 1]);
        assert_eq!(source.frames_written(), 5);
    }

    #[test]
    fn broken_pipe_resumes_round_robin() {
        let (_dir, mut config) = fixture(3);
        config.frame_rate = Some(200.0);
        let path = config.sink_path.clone();
        let mut source = MediaSource::new(config, &FrameCache::new()).unwrap();
        source.start().unwrap();

        let mut reader = File::open(&path).unwrap();
        let first = read_frames(&mut reader, 2);
        assert_eq!(first, vec![0, 1]);
        drop(reader);

        thread::sleep(Duration::from_millis(100));
        assert!(source.is_alive());

        let mut reader = File::open(&path).unwrap();
        let resumed = read_frames(&mut reader, 6);
        for pair in resumed.windows(2) {
            assert_eq!(pair[1], (pair[0] + 1) % 3);
        }
        let written_before_stop = source.frames_written();
        assert!(written_before_stop >= 8);

        source.stop();
        drop(reader);
        assert!(source.join_timeout(Duration::from_secs(5)));
        assert!(!source.is_connected());
    }

    #[test]
    fn stop_releases_source_waiting_for_reader() {
        let (_dir, config) = fixture(2);
        let mut source = MediaSource::new(config, &FrameCache::new()).unwrap();
        source.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        source.stop();
        assert!(source.join_timeout(Duration::from_secs(5)));
        assert_eq!(source.frames_written(), 0);
    }

    #[test]
    fn dropping_unread_source_ends_its_thread() {
        let (_dir, config) = fixture(2);
        let mut source = MediaSource::new(config, &FrameCache::new()).unwrap();
        source.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        let state = Arc::clone(&source.state);
        drop(source);

        let deadline = Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&state) > 1 {
            assert!(Instant::now() < deadline, "source thread still blocked in open");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(state.written.load(Ordering::Acquire), 0);
    }
}
