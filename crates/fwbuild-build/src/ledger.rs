use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use fwbuild_core::CoordinatorResult;
use sha2::{Digest, Sha256};

/// A successful build's artifact, keyed by (project, environment). Deploy
/// consults this to reuse a cached image instead of rebuilding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRecord {
    pub image_path: PathBuf,
    pub fingerprint: String,
    pub profile: String,
    pub built_at: SystemTime,
}

#[derive(Debug, Default)]
pub struct FirmwareLedger {
    records: Mutex<HashMap<(PathBuf, String), FirmwareRecord>>,
}

impl FirmwareLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        project_dir: &Path,
        environment: &str,
        image_path: PathBuf,
        profile: &str,
    ) -> CoordinatorResult<FirmwareRecord> {
        let bytes = std::fs::read(&image_path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let fingerprint = digest
            .iter()
            .take(16)
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();

        let record = FirmwareRecord {
            image_path,
            fingerprint,
            profile: profile.to_owned(),
            built_at: SystemTime::now(),
        };
        let mut records = self.records.lock().expect("ledger lock poisoned");
        records.insert(
            (project_dir.to_path_buf(), environment.to_owned()),
            record.clone(),
        );
        Ok(record)
    }

    /// The latest artifact for (project, environment), if its image file
    /// still exists on disk.
    pub fn lookup(&self, project_dir: &Path, environment: &str) -> Option<FirmwareRecord> {
        let records = self.records.lock().expect("ledger lock poisoned");
        records
            .get(&(project_dir.to_path_buf(), environment.to_owned()))
            .filter(|record| record.image_path.is_file())
            .cloned()
    }
}
