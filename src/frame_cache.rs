use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::BenchError;
use crate::media::list_frames;

pub type Frames = Arc<[Arc<[u8]>]>;

/// Input payloads shared by every source of a benchmarking session.
///
/// Keyed by `(input directory, frame extension)`. The first source to ask
/// for a key reads the directory; everyone else gets the same buffers.
#[derive(Debug, Clone, Default)]
pub struct FrameCache {
    inner: Arc<Mutex<HashMap<(PathBuf, String), Frames>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, input_dir: &Path, extension: &str) -> Result<Frames, BenchError> {
        let key = (input_dir.to_path_buf(), extension.to_string());
        let mut cache = self
            .inner
            .lock()
            .map_err(|_| BenchError::Task("frame cache lock poisoned".to_string()))?;
        if let Some(frames) = cache.get(&key) {
            if !frames.is_empty() {
                return Ok(Arc::clone(frames));
            }
        }

        let frames = list_frames(input_dir, extension)?
            .iter()
            .map(|path| {
                fs::read(path)
                    .map(Arc::<[u8]>::from)
                    .map_err(|e| BenchError::io(format!("read frame {}", path.display()), e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            input = %input_dir.display(),
            extension,
            frames = frames.len(),
            "populated frame cache"
        );
        let frames: Frames = frames.into();
        cache.insert(key, Arc::clone(&frames));
        Ok(frames)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
