//! Simulation configuration loaded from a TOML file.
//!
//! Every table and key is optional; omitted values fall back to the
//! DDR5-4800 defaults baked into `ferrite-core`.

use std::fs;
use std::path::Path;

use anyhow::Context;
use ferrite_core::config::DramConfig;
use serde::Deserialize;

/// Last-level cache geometry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlcConfig {
    pub size_kb_per_core: usize,
    pub assoc: usize,
    /// Hit latency in host cycles.
    pub latency: u64,
    pub mshr_size: usize,
}

impl Default for LlcConfig {
    fn default() -> Self {
        Self {
            size_kb_per_core: 2048,
            assoc: 8,
            latency: 24,
            mshr_size: 512,
        }
    }
}

/// Core front-end parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub fetch_width: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self { fetch_width: 4 }
    }
}

/// Physical memory the OS hands out pages from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OsConfig {
    pub dram_size_mb: u64,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            dram_size_mb: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub dram: DramConfig,
    pub llc: LlcConfig,
    pub core: CoreConfig,
    pub os: OsConfig,
}

impl SimConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let conf: SimConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        conf.dram
            .validate()
            .with_context(|| format!("validating config {}", path.display()))?;
        Ok(conf)
    }
}
