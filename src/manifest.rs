use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Subset of the `parameters.json` the capture tool writes at the dataset root.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureParameters {
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub maps: Vec<String>,
    #[serde(default)]
    pub imgs_per_map: Option<u64>,
    #[serde(default)]
    pub camera_res: Option<[u32; 2]>,
    #[serde(default)]
    pub camera_fov: Option<f64>,
}

impl CaptureParameters {
    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let params = serde_json::from_slice(&raw)
            .with_context(|| format!("parse capture parameters {}", path.display()))?;
        Ok(Some(params))
    }

    pub fn describes_map(&self, map: &str) -> bool {
        self.maps.is_empty() || self.maps.iter().any(|m| m == map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_reads_known_fields_and_ignores_the_rest() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("parameters.json");
        std::fs::write(
            &path,
            br#"{"host": "localhost", "port": 64256, "experiment_name": "dataset",
                "maps": ["italy", "east_coast_usa"], "imgs_per_map": 1000,
                "camera_res": [2048, 1024], "camera_fov": 70, "change_tod": true}"#,
        )
        .expect("write params");

        let params = CaptureParameters::load(&path)
            .expect("load")
            .expect("file present");
        assert_eq!(params.imgs_per_map, Some(1000));
        assert_eq!(params.camera_res, Some([2048, 1024]));
        assert!(params.describes_map("italy"));
        assert!(!params.describes_map("west_coast"));
    }

    #[test]
    fn missing_file_is_none_and_garbage_is_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("parameters.json");
        assert!(CaptureParameters::load(&path).expect("load").is_none());

        std::fs::write(&path, b"{not json").expect("write");
        let err = CaptureParameters::load(&path).expect_err("garbage must fail");
        assert!(format!("{err:#}").contains("parse capture parameters"));
    }
}
