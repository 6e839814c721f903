//! Environment spec file reading.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::environment::EnvironmentSpec;
use crate::error::{SpecError, SpecResult};

/// Reader for environment spec files.
pub struct SpecReader;

impl SpecReader {
    /// Load a spec from YAML (`.yaml`, `.yml`), TOML (`.toml`) or JSON (`.json`).
    pub fn read_environment(path: impl AsRef<Path>) -> SpecResult<EnvironmentSpec> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SpecError::NotFound(path.to_path_buf()));
        }
        debug!("Reading environment spec from {:?}", path);

        let content = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let spec = match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "toml" => toml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            _ => return Err(SpecError::UnsupportedFormat(path.to_path_buf())),
        };
        Ok(spec)
    }

    /// Write a spec as YAML.
    pub fn write_environment(spec: &EnvironmentSpec, path: impl AsRef<Path>) -> SpecResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(spec)?)?;
        debug!("Wrote environment spec to {:?}", path);
        Ok(())
    }
}
