//! Loaded-extension model and directory loader.
//!
//! An extension on disk is a directory holding `manifest.json` and `main.js`.
//! Loading assigns a stable id (the manifest name), a private data directory
//! under the host's data root, and captures the script source. The resulting
//! [`LoadedExtension`] is immutable and shared with the runtime for the
//! extension's process lifetime.

use crate::error::{Error, Result};
use crate::manifest::ExtensionManifest;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Manifest file name inside an extension directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Script file name inside an extension directory.
pub const SCRIPT_FILE: &str = "main.js";

/// An extension loaded into the host: manifest, sandbox root, script source.
#[derive(Debug, Clone)]
pub struct LoadedExtension {
    /// Stable identifier, unique within the host.
    pub id: String,
    pub manifest: ExtensionManifest,
    /// Absolute path of the extension's private data directory. All relative
    /// file-API paths resolve under it.
    pub data_dir: PathBuf,
    /// JavaScript source of the extension entry point.
    pub script: String,
}

impl LoadedExtension {
    /// Assemble a loaded extension from parts. The data directory is created
    /// if missing and normalized to an absolute path.
    pub fn new(
        id: impl Into<String>,
        manifest: ExtensionManifest,
        data_dir: impl Into<PathBuf>,
        script: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::validation("Extension id is empty"));
        }
        let data_dir = ensure_data_dir(&data_dir.into())?;
        Ok(Self {
            id,
            manifest,
            data_dir,
            script: script.into(),
        })
    }

    /// Load an extension from `ext_dir`, creating its data directory under
    /// `data_root`.
    pub fn load(ext_dir: &Path, data_root: &Path) -> Result<Self> {
        let manifest_path = ext_dir.join(MANIFEST_FILE);
        let raw = fs::read(&manifest_path).map_err(|err| {
            Error::validation(format!(
                "Failed to read {}: {err}",
                manifest_path.display()
            ))
        })?;
        let manifest = ExtensionManifest::parse(&raw)?;

        let script_path = ext_dir.join(SCRIPT_FILE);
        let script = fs::read_to_string(&script_path).map_err(|err| {
            Error::validation(format!("Failed to read {}: {err}", script_path.display()))
        })?;

        let id = manifest.name.clone();
        let data_dir = data_root.join(&id);
        let extension = Self::new(id, manifest, data_dir, script)?;

        info!(
            extension = %extension.id,
            version = %extension.manifest.version,
            "extension loaded"
        );
        Ok(extension)
    }
}

fn ensure_data_dir(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let abs = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(dir)
    };
    Ok(abs)
}
