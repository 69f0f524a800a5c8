use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fwbuild_core::{CoordinatorError, CoordinatorResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{PackageKind, PackageSpec};

pub const DOWNLOAD_SUFFIX: &str = ".download";
pub const EXTRACT_PREFIX: &str = "temp_extract_";
const MANIFEST_FILE: &str = "manifest.json";
const CONTENT_DIR: &str = "content";

/// Per-package descriptor written atomically as the final install step. Its
/// presence is the sole "installed" signal for the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryManifest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PackageKind,
    pub version: String,
    pub url: String,
    pub fingerprint: String,
    pub installed_at_epoch_secs: u64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Content-addressed package tree under the per-user cache directory.
#[derive(Debug, Clone)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic address for a (name, version, url) triple. Stable across
    /// hosts so reinstalls land on the same entry.
    pub fn cache_key(spec: &PackageSpec) -> String {
        let mut hasher = Sha256::new();
        hasher.update(spec.name.as_bytes());
        hasher.update(b"@");
        hasher.update(spec.version.as_bytes());
        hasher.update(b"@");
        hasher.update(spec.url.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }

    pub fn entry_dir(&self, spec: &PackageSpec) -> PathBuf {
        self.root.join(&spec.name).join(Self::cache_key(spec))
    }

    pub fn content_dir(&self, spec: &PackageSpec) -> PathBuf {
        self.entry_dir(spec).join(CONTENT_DIR)
    }

    pub fn manifest_path(&self, spec: &PackageSpec) -> PathBuf {
        self.entry_dir(spec).join(MANIFEST_FILE)
    }

    /// The cache-hit check: installed iff the manifest exists.
    pub fn is_installed(&self, spec: &PackageSpec) -> bool {
        self.manifest_path(spec).is_file()
    }

    pub fn read_manifest(&self, spec: &PackageSpec) -> CoordinatorResult<CacheEntryManifest> {
        let raw = std::fs::read_to_string(self.manifest_path(spec))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the manifest through a temp file + rename so a crash can never
    /// leave a manifest describing a partial entry.
    pub fn commit_manifest(
        &self,
        spec: &PackageSpec,
        fingerprint: String,
    ) -> CoordinatorResult<CacheEntryManifest> {
        let manifest = CacheEntryManifest {
            name: spec.name.clone(),
            kind: spec.kind,
            version: spec.version.clone(),
            url: spec.url.clone(),
            fingerprint,
            installed_at_epoch_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            metadata: serde_json::Map::new(),
        };

        let entry_dir = self.entry_dir(spec);
        std::fs::create_dir_all(&entry_dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(&entry_dir)?;
        temp.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
        temp.flush()?;
        temp.persist(self.manifest_path(spec))
            .map_err(|error| CoordinatorError::Io(error.to_string()))?;
        Ok(manifest)
    }

    /// Deterministic fingerprint over the extracted content: sorted relative
    /// paths plus file bytes.
    pub fn fingerprint_tree(content_dir: &Path) -> CoordinatorResult<String> {
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(content_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        let mut hasher = Sha256::new();
        for path in &files {
            let relative = path
                .strip_prefix(content_dir)
                .map_err(|error| CoordinatorError::Internal(error.to_string()))?;
            hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
            hasher.update([0]);
            let bytes = std::fs::read(path)?;
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        Ok(hex_prefix(&hasher.finalize(), 32))
    }

    /// Remove in-flight litter for an entry: partial downloads and temp
    /// extraction directories. A committed entry (manifest present) is never
    /// touched.
    pub fn cleanup_partial(&self, spec: &PackageSpec) -> std::io::Result<()> {
        let entry_dir = self.entry_dir(spec);
        if !entry_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&entry_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(DOWNLOAD_SUFFIX) {
                let _ = std::fs::remove_file(entry.path());
            } else if name.starts_with(EXTRACT_PREFIX) {
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
        if !self.is_installed(spec) && self.content_dir(spec).exists() {
            let _ = std::fs::remove_dir_all(self.content_dir(spec));
        }
        Ok(())
    }

    /// Delete cache entries, optionally restricted to one package name.
    /// Returns the number of entries removed.
    pub fn purge(&self, name: Option<&str>) -> std::io::Result<usize> {
        let mut removed = 0;
        let Ok(packages) = std::fs::read_dir(&self.root) else {
            return Ok(0);
        };
        for package_dir in packages.flatten() {
            if !package_dir.file_type()?.is_dir() {
                continue;
            }
            let package_name = package_dir.file_name();
            if let Some(filter) = name {
                if package_name.to_str() != Some(filter) {
                    continue;
                }
            }
            for entry in std::fs::read_dir(package_dir.path())?.flatten() {
                if entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(entry.path())?;
                    removed += 1;
                }
            }
            let _ = std::fs::remove_dir(package_dir.path());
        }
        Ok(removed)
    }
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}
