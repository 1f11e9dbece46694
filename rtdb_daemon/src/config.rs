//! Daemon configuration file (TOML). Every field is optional; command
//! line flags override whatever the file sets.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    /// Database segment name.
    pub name: Option<String>,
    /// Heap arena size in MiB.
    pub heap_mib: Option<u64>,
    /// Object table capacity.
    pub objects: Option<u32>,
    /// Process table capacity.
    pub processes: Option<u32>,
    /// Tracer ring count.
    pub tracers: Option<u32>,
    /// Housekeeping interval in milliseconds.
    pub interval_ms: Option<u64>,
    /// Database-wide minimum purge grace in milliseconds.
    pub min_grace_ms: Option<u64>,
    /// "native", "emulated" or "auto".
    pub lock_mode: Option<String>,
    /// "freelist" or "bump".
    pub allocator: Option<String>,
    /// Directory holding the segment file.
    pub base_dir: Option<PathBuf>,
    /// Leave the segment file behind on shutdown.
    pub keep_segment: Option<bool>,
}

pub fn load(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}
