use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::BenchError;

pub const FULL_FRAME: &str = "full_frame";

/// Files of one model precision, e.g. `models/yolo/FP16`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelVariant {
    pub xml: Option<PathBuf>,
    pub bin: Option<PathBuf>,
    /// Pre/post-processing description.
    pub proc: Option<PathBuf>,
}

impl ModelVariant {
    fn is_empty(&self) -> bool {
        self.xml.is_none() && self.bin.is_none() && self.proc.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelArtifacts {
    pub name: String,
    pub root: PathBuf,
    /// Keyed by the directory path relative to the model root; `""` for the root itself.
    pub variants: BTreeMap<String, ModelVariant>,
}

impl ModelArtifacts {
    pub fn variant(&self, precision: &str) -> Option<(&str, &ModelVariant)> {
        if let Some((key, variant)) = self.variants.get_key_value(precision) {
            return Some((key.as_str(), variant));
        }
        let (key, variant) = self.variants.iter().next()?;
        warn!(
            model = self.name.as_str(),
            precision,
            fallback = key.as_str(),
            "no model for requested precision, using fallback"
        );
        Some((key.as_str(), variant))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLookup {
    FullFrame,
    Found(ModelArtifacts),
    NotFound(PathBuf),
}

/// Resolves a model name against `<pipeline_root>/models/<name>`.
pub fn find_model(name: &str, pipeline_root: &Path) -> Result<ModelLookup, BenchError> {
    if name == FULL_FRAME {
        return Ok(ModelLookup::FullFrame);
    }
    let root = pipeline_root.join("models").join(name);
    if !root.is_dir() {
        return Ok(ModelLookup::NotFound(root));
    }

    let mut variants = BTreeMap::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BenchError::Config(format!("scan model root {}: {e}", root.display()))
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let variant = scan_variant(name, entry.path())?;
        if variant.is_empty() {
            continue;
        }
        let key = entry
            .path()
            .strip_prefix(&root)
            .unwrap_or(Path::new(""))
            .to_string_lossy()
            .into_owned();
        variants.insert(key, variant);
    }

    Ok(ModelLookup::Found(ModelArtifacts {
        name: name.to_string(),
        root,
        variants,
    }))
}

fn scan_variant(name: &str, dir: &Path) -> Result<ModelVariant, BenchError> {
    let files = std::fs::read_dir(dir)
        .map_err(|e| BenchError::io(format!("list {}", dir.display()), e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    Ok(ModelVariant {
        xml: pick(name, &files, "xml"),
        bin: pick(name, &files, "bin"),
        proc: pick(name, &files, "json"),
    })
}

/// `<name>.<ext>` wins; otherwise only an unambiguous single candidate.
fn pick(name: &str, files: &[PathBuf], extension: &str) -> Option<PathBuf> {
    let candidates = files
        .iter()
        .filter(|path| path.extension().is_some_and(|e| e == extension))
        .collect::<Vec<_>>();
    let preferred = format!("{name}.{extension}");
    if let Some(path) = candidates
        .iter()
        .find(|path| path.file_name().is_some_and(|n| n == preferred.as_str()))
    {
        return Some((*path).clone());
    }
    match candidates.as_slice() {
        [only] => Some((*only).clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn full_frame_needs_no_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_model(FULL_FRAME, dir.path()).unwrap(), ModelLookup::FullFrame);
    }

    #[test]
    fn missing_model_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_model("ssd", dir.path()).unwrap(),
            ModelLookup::NotFound(_)
        ));
    }

    #[test]
    fn variants_per_precision_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("models/ssd");
        touch(&root.join("ssd.json"));
        touch(&root.join("FP16/ssd.xml"));
        touch(&root.join("FP16/ssd.bin"));
        touch(&root.join("FP32/other.xml"));
        touch(&root.join("FP32/a.bin"));
        touch(&root.join("FP32/b.bin"));

        let ModelLookup::Found(artifacts) = find_model("ssd", dir.path()).unwrap() else {
            panic!("model not found");
        };
        assert_eq!(
            artifacts.variants.keys().cloned().collect::<Vec<_>>(),
            vec!["", "FP16", "FP32"]
        );
        let fp16 = &artifacts.variants["FP16"];
        assert_eq!(fp16.xml, Some(root.join("FP16/ssd.xml")));
        assert_eq!(fp16.bin, Some(root.join("FP16/ssd.bin")));
        let fp32 = &artifacts.variants["FP32"];
        assert_eq!(fp32.xml, Some(root.join("FP32/other.xml")));
        assert_eq!(fp32.bin, None);
        assert_eq!(artifacts.variants[""].proc, Some(root.join("ssd.json")));

        assert_eq!(artifacts.variant("FP32").map(|(k, _)| k), Some("FP32"));
        assert_eq!(artifacts.variant("INT8").map(|(k, _)| k), Some(""));
    }
}
