use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::BenchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaType {
    pub key: &'static str,
    /// Extension of individually cached frames, e.g. `frame_000001.x-h264.bin`.
    pub frame_extension: Option<&'static str>,
    pub line_delimited: bool,
    pub container_formats: &'static [&'static str],
    pub elementary_stream_extensions: &'static [&'static str],
}

impl MediaType {
    pub fn elementary_stream_extension(&self) -> Option<&'static str> {
        self.elementary_stream_extensions.first().copied()
    }
}

const MEDIA_TYPES: &[MediaType] = &[
    MediaType {
        key: "video/x-h264",
        frame_extension: Some("x-h264.bin"),
        line_delimited: false,
        container_formats: &["mp4"],
        elementary_stream_extensions: &["h264", "264"],
    },
    MediaType {
        key: "video/x-h265",
        frame_extension: Some("x-h265.bin"),
        line_delimited: false,
        container_formats: &["mp4"],
        elementary_stream_extensions: &["h265", "265"],
    },
    MediaType {
        key: "video/x-raw",
        frame_extension: Some("raw.bin"),
        line_delimited: false,
        container_formats: &["mp4"],
        elementary_stream_extensions: &["raw.bin"],
    },
    MediaType {
        key: "metadata/objects",
        frame_extension: None,
        line_delimited: true,
        container_formats: &[],
        elementary_stream_extensions: &[],
    },
    MediaType {
        key: "metadata/line-per-frame",
        frame_extension: None,
        line_delimited: true,
        container_formats: &[],
        elementary_stream_extensions: &[],
    },
];

/// Looks up the media type named by the first field of a caps string.
pub fn media_type(caps: &str) -> Result<&'static MediaType, BenchError> {
    let key = caps.split(',').next().unwrap_or_default().trim();
    MEDIA_TYPES
        .iter()
        .find(|m| m.key == key)
        .ok_or_else(|| BenchError::Config(format!("unsupported media type: {key}")))
}

/// `frame_000042.x-h264.bin` -> 42
pub fn frame_index(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let tail = name.rsplit('_').next()?;
    tail.split('.').next()?.parse().ok()
}

/// Frame files in `dir` ending with `extension`, ordered by frame index.
pub fn list_frames(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, BenchError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| BenchError::io(format!("list frames in {}", dir.display()), e))?;
    let mut frames = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(extension))
        })
        .filter_map(|path| frame_index(&path).map(|index| (index, path)))
        .collect::<Vec<_>>();
    frames.sort_by_key(|(index, _)| *index);
    Ok(frames.into_iter().map(|(_, path)| path).collect())
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CapsInfo {
    pub caps: String,
    #[serde(default)]
    pub source: Option<String>,
}

impl CapsInfo {
    pub fn media_key(&self) -> &str {
        self.caps.split(',').next().unwrap_or_default()
    }
}

/// Reads the `caps.json` written next to cached input payloads.
pub fn read_caps(input_dir: &Path) -> Result<CapsInfo, BenchError> {
    let path = input_dir.join("caps.json");
    let raw = fs::read_to_string(&path)
        .map_err(|e| BenchError::io(format!("read {}", path.display()), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| BenchError::Config(format!("invalid {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_from_caps_prefix() {
        let media = media_type("video/x-h264,alignment=au,stream-format=byte-stream").unwrap();
        assert_eq!(media.frame_extension, Some("x-h264.bin"));
        assert!(media_type("metadata/objects,format=jsonl").unwrap().line_delimited);
        assert!(media_type("audio/x-raw").is_err());
    }

    #[test]
    fn frame_index_parses_suffix() {
        assert_eq!(frame_index(Path::new("/tmp/frame_000042.x-h264.bin")), Some(42));
        assert_eq!(frame_index(Path::new("stream_3.frame_000007.raw.bin")), Some(7));
        assert_eq!(frame_index(Path::new("caps.json")), None);
    }

    #[test]
    fn list_frames_sorts_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for i in [10, 2, 1] {
            fs::write(dir.path().join(format!("frame_{i:06}.raw.bin")), [0u8; 4]).unwrap();
        }
        fs::write(dir.path().join("caps.json"), "{}").unwrap();
        let frames = list_frames(dir.path(), "raw.bin").unwrap();
        let indices = frames
            .iter()
            .map(|p| frame_index(p).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(indices, vec![1, 2, 10]);
    }

    #[test]
    fn caps_json_is_read() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("caps.json"),
            r#"{"caps":"video/x-h264,alignment=au","source":"file:///media.mp4"}"#,
        )
        .unwrap();
        let caps = read_caps(dir.path()).unwrap();
        assert_eq!(caps.media_key(), "video/x-h264");
        assert_eq!(caps.source.as_deref(), Some("file:///media.mp4"));
    }
}
