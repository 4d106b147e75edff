//! Distribution config: the manifest, per-script descriptors, and the loader
//! that turns a config directory into one immutable generation.
//!
//! Layout on disk:
//!
//! ```text
//! <config dir>/
//!   config.json            server_url, revision_file, script_config_dir
//!   revision.txt           opaque revision blob, served verbatim
//!   scripts/
//!     fisher.json          one descriptor per script
//!     miner.json
//! ```
//!
//! Failure handling is two-tier. A broken descriptor loses only that script
//! (logged and skipped); a missing manifest, unreadable revision file, or
//! unlistable script directory aborts the whole load so a reload keeps the
//! previous generation intact.

use std::fs;
use std::path::{Path, PathBuf};

use scriptcast_protocol::ScriptMetadata;
use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

pub const MANIFEST_FILE: &str = "config.json";

/// Top-level manifest, `config.json` in the config directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Base URL advertised to clients in script responses,
    /// e.g. `http://127.0.0.1:6700`.
    pub server_url: String,
    /// Path of the revision blob, relative to the config directory.
    pub revision_file: PathBuf,
    /// Directory of script descriptors, relative to the config directory.
    pub script_config_dir: PathBuf,
}

/// One script descriptor file.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptDescriptor {
    pub store_id: i32,
    pub name: String,
    pub description: String,
    pub version: f64,
    pub author: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub thread_url: String,
    /// Path of the artifact jar, relative to the config directory.
    pub jar_file: PathBuf,
    /// Path of the `key=value` options file, relative to the config
    /// directory.
    pub option_file: PathBuf,
}

/// One script as loaded into a generation: wire metadata plus the artifact
/// paths it was validated against.
#[derive(Debug, Clone)]
pub struct ScriptEntry {
    pub metadata: ScriptMetadata,
    pub jar_path: PathBuf,
    pub option_path: PathBuf,
}

/// Everything a single load produced. Immutable once built; the store swaps
/// whole values of this type.
#[derive(Debug, Clone)]
pub struct LoadedGeneration {
    pub server_url: String,
    pub revision_data: String,
    pub scripts: Vec<ScriptEntry>,
}

/// Loads a complete generation from `config_dir`.
///
/// Script ids are assigned sequentially in descriptor file-name order, so a
/// reload of an unchanged directory reproduces the same ids.
pub fn load_generation(config_dir: &Path) -> Result<LoadedGeneration, ConfigError> {
    let manifest_path = config_dir.join(MANIFEST_FILE);
    let manifest_raw = fs::read_to_string(&manifest_path)
        .map_err(|_| ConfigError::ManifestMissing(manifest_path.clone()))?;
    let manifest: Manifest =
        serde_json::from_str(&manifest_raw).map_err(|e| ConfigError::ManifestInvalid {
            path: manifest_path,
            detail: e.to_string(),
        })?;

    let revision_path = config_dir.join(&manifest.revision_file);
    let revision_data =
        fs::read_to_string(&revision_path).map_err(|e| ConfigError::RevisionUnreadable {
            path: revision_path,
            detail: e.to_string(),
        })?;

    let script_dir = config_dir.join(&manifest.script_config_dir);
    if !script_dir.is_dir() {
        return Err(ConfigError::ScriptDirMissing(script_dir));
    }
    let mut descriptor_paths: Vec<PathBuf> = fs::read_dir(&script_dir)
        .map_err(|e| ConfigError::ScriptDirUnreadable {
            path: script_dir.clone(),
            detail: e.to_string(),
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
        .collect();
    descriptor_paths.sort();

    let mut scripts = Vec::with_capacity(descriptor_paths.len());
    for path in descriptor_paths {
        match load_script(config_dir, &path, scripts.len() as i32) {
            Ok(entry) => scripts.push(entry),
            Err(detail) => {
                warn!(descriptor = %path.display(), %detail, "skipping script");
            }
        }
    }

    Ok(LoadedGeneration {
        server_url: manifest.server_url.trim_end_matches('/').to_string(),
        revision_data,
        scripts,
    })
}

fn load_script(config_dir: &Path, path: &Path, script_id: i32) -> Result<ScriptEntry, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("unreadable: {e}"))?;
    let descriptor: ScriptDescriptor =
        serde_json::from_str(&raw).map_err(|e| format!("invalid descriptor: {e}"))?;

    let jar_path = config_dir.join(&descriptor.jar_file);
    if !jar_path.is_file() {
        return Err(format!("jar missing: {}", jar_path.display()));
    }
    let option_path = config_dir.join(&descriptor.option_file);
    if !option_path.is_file() {
        return Err(format!("option file missing: {}", option_path.display()));
    }

    Ok(ScriptEntry {
        metadata: ScriptMetadata {
            script_id,
            store_id: descriptor.store_id,
            name: descriptor.name,
            description: descriptor.description,
            version: descriptor.version,
            author: descriptor.author,
            image_url: descriptor.image_url,
            thread_url: descriptor.thread_url,
        },
        jar_path,
        option_path,
    })
}
