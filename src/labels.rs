use std::fs;
use std::path::Path;

use crate::errors::{Result, YoloError};

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Class names indexed by label id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    names: Vec<String>,
}

impl Default for LabelMap {
    fn default() -> Self {
        Self {
            names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Reads one class name per line; blank lines are skipped.
pub fn load_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| YoloError::FileSystem {
        path: path.to_path_buf(),
        operation: "label map read".to_string(),
        source: e,
    })?;
    let names: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(YoloError::Configuration {
            message: format!("label map {} contains no class names", path.display()),
        });
    }
    Ok(names)
}

impl LabelMap {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_names(path).map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name of `label`, or the id itself when it falls outside the map.
    pub fn name(&self, label: i64) -> String {
        usize::try_from(label)
            .ok()
            .and_then(|i| self.names.get(i))
            .cloned()
            .unwrap_or_else(|| label.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_coco() {
        let labels = LabelMap::default();
        assert_eq!(labels.len(), 80);
        assert_eq!(labels.name(0), "person");
        assert_eq!(labels.name(79), "toothbrush");
        assert_eq!(labels.name(80), "80");
        assert_eq!(labels.name(-1), "-1");
    }

    #[test]
    fn test_load_skips_blank_lines() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("names.txt");
        fs::write(&path, "cat\n\n  dog  \n")?;

        assert_eq!(load_names(&path)?, vec!["cat", "dog"]);
        let labels = LabelMap::load(&path)?;
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.name(1), "dog");
        Ok(())
    }

    #[test]
    fn test_load_errors() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let empty = temp_dir.path().join("empty.txt");
        fs::write(&empty, "\n \n")?;

        assert!(matches!(
            LabelMap::load(&empty),
            Err(YoloError::Configuration { .. })
        ));
        assert!(matches!(
            LabelMap::load(temp_dir.path().join("missing.txt")),
            Err(YoloError::FileSystem { .. })
        ));
        Ok(())
    }
}
