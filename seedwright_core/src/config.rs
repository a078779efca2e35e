use crate::emitter::EmitStyle;
use crate::generator::GeneratorSettings;
use crate::sequence::SequenceFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Where the lifecycle model comes from.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ModelSource {
    /// Name of a bundled descriptor, e.g. `"sqlite"`.
    pub library: Option<String>,
    /// Path to a descriptor TOML file; wins over `library`.
    pub descriptor: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BatchSettings {
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_operate_budget")]
    pub operate_budget: usize,
    #[serde(default)]
    pub format: SequenceFormat,
    /// Keep only sequences that add new call pairs.
    #[serde(default)]
    pub minimize: bool,
}

pub fn default_count() -> usize {
    16
}
pub fn default_threads() -> usize {
    1
}
pub fn default_operate_budget() -> usize {
    8
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            count: default_count(),
            threads: default_threads(),
            seed: 0,
            operate_budget: default_operate_budget(),
            format: SequenceFormat::default(),
            minimize: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SeedwrightConfig {
    #[serde(default)]
    pub model: Option<ModelSource>,
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub emitter: EmitStyle,
}

impl SeedwrightConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SeedwrightConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }
}
