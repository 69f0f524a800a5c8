use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fwbuild_core::{CoordinatorError, CoordinatorResult};
use fwbuild_coordination::CancelToken;

use crate::cache::{PackageCache, CacheEntryManifest, DOWNLOAD_SUFFIX, EXTRACT_PREFIX};
use crate::models::{PackageSpec, PackageStage};
use crate::progress::ProgressSink;

const DOWNLOAD_CHUNK_SIZE: usize = 8 * 1024;
const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct StageTuning {
    pub download_retries: u32,
    pub download_backoff_base: Duration,
    pub unpack_retries: u32,
    pub unpack_retry_delay: Duration,
}

impl From<&fwbuild_config::PipelineTuning> for StageTuning {
    fn from(tuning: &fwbuild_config::PipelineTuning) -> Self {
        Self {
            download_retries: tuning.download_retries,
            download_backoff_base: Duration::from_millis(tuning.download_backoff_base_ms),
            unpack_retries: tuning.unpack_retries,
            unpack_retry_delay: Duration::from_millis(tuning.unpack_retry_delay_ms),
        }
    }
}

pub fn archive_file_name(url: &str) -> String {
    let tail = url.rsplit('/').next().unwrap_or(url);
    tail.split('?').next().unwrap_or(tail).to_owned()
}

/// Download the package archive into the cache entry, streaming through a
/// `.download` temp file so a partial transfer is always identifiable.
/// Transient failures retry with exponential backoff; HTTP error statuses are
/// permanent.
pub fn download_package(
    spec: &PackageSpec,
    cache: &PackageCache,
    tuning: &StageTuning,
    progress: &dyn ProgressSink,
    token: &CancelToken,
) -> CoordinatorResult<PathBuf> {
    let entry_dir = cache.entry_dir(spec);
    std::fs::create_dir_all(&entry_dir)?;
    let archive_path = entry_dir.join(archive_file_name(&spec.url));
    let temp_path = entry_dir.join(format!(
        "{}{DOWNLOAD_SUFFIX}",
        archive_file_name(&spec.url)
    ));

    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_REQUEST_TIMEOUT)
        .build()
        .map_err(|error| CoordinatorError::Http(error.to_string()))?;

    let mut last_error = CoordinatorError::TransientIo("download never attempted".to_owned());
    for attempt in 0..=tuning.download_retries {
        if attempt > 0 {
            let delay = tuning.download_backoff_base * 2u32.pow(attempt - 1);
            progress.on_progress(
                &spec.name,
                PackageStage::Downloading,
                0,
                0,
                &format!(
                    "retry {attempt}/{} after {:.0}s",
                    tuning.download_retries,
                    delay.as_secs_f64()
                ),
            );
            std::thread::sleep(delay);
        }
        if let Err(error) = token.checkpoint() {
            cleanup_temp_file(&temp_path);
            return Err(error);
        }

        match download_attempt(spec, &client, &archive_path, &temp_path, progress, token) {
            Ok(path) => return Ok(path),
            Err(error @ CoordinatorError::OperationCancelled) => {
                cleanup_temp_file(&temp_path);
                return Err(error);
            }
            Err(error @ CoordinatorError::TransientIo(_)) => {
                cleanup_temp_file(&temp_path);
                tracing::warn!(
                    package = %spec.name,
                    attempt,
                    error = %error,
                    "download attempt failed"
                );
                last_error = error;
            }
            Err(error) => {
                cleanup_temp_file(&temp_path);
                return Err(error);
            }
        }
    }
    Err(last_error)
}

fn download_attempt(
    spec: &PackageSpec,
    client: &reqwest::blocking::Client,
    archive_path: &Path,
    temp_path: &Path,
    progress: &dyn ProgressSink,
    token: &CancelToken,
) -> CoordinatorResult<PathBuf> {
    let response = client
        .get(&spec.url)
        .send()
        .map_err(classify_reqwest)?
        .error_for_status()
        .map_err(|error| {
            CoordinatorError::PermanentRemote(format!("{} returned {error}", spec.url))
        })?;

    let total = response.content_length().unwrap_or(0);
    progress.on_progress(&spec.name, PackageStage::Downloading, 0, total, "starting");

    let started = Instant::now();
    let mut reader = response;
    let mut file = std::fs::File::create(temp_path)?;
    let mut downloaded: u64 = 0;
    let mut chunk = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    loop {
        token.checkpoint()?;
        let read = reader.read(&mut chunk).map_err(|error| {
            CoordinatorError::TransientIo(format!("read from {}: {error}", spec.url))
        })?;
        if read == 0 {
            break;
        }
        file.write_all(&chunk[..read])?;
        downloaded += read as u64;
        progress.on_progress(
            &spec.name,
            PackageStage::Downloading,
            downloaded,
            total,
            &transfer_speed(downloaded, started.elapsed()),
        );
    }
    file.flush()?;
    drop(file);

    if archive_path.exists() {
        let _ = std::fs::remove_file(archive_path);
    }
    std::fs::rename(temp_path, archive_path)?;
    progress.on_progress(&spec.name, PackageStage::Downloading, total, total, "complete");
    Ok(archive_path.to_path_buf())
}

fn classify_reqwest(error: reqwest::Error) -> CoordinatorError {
    if error.is_timeout() || error.is_connect() {
        CoordinatorError::TransientIo(error.to_string())
    } else {
        CoordinatorError::Http(error.to_string())
    }
}

fn cleanup_temp_file(temp_path: &Path) {
    let _ = std::fs::remove_file(temp_path);
}

/// Extract the archive into the entry's content directory through a
/// `temp_extract_` staging directory. Permission errors (scanners holding
/// files) retry with a fixed delay; anything else is permanent.
pub fn unpack_package(
    spec: &PackageSpec,
    cache: &PackageCache,
    archive_path: &Path,
    tuning: &StageTuning,
    progress: &dyn ProgressSink,
    token: &CancelToken,
) -> CoordinatorResult<PathBuf> {
    let entry_dir = cache.entry_dir(spec);
    let archive_name = archive_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("archive");
    let temp_extract = entry_dir.join(format!("{EXTRACT_PREFIX}{archive_name}"));

    let mut last_error = CoordinatorError::Io("unpack never attempted".to_owned());
    for attempt in 0..=tuning.unpack_retries {
        if attempt > 0 {
            progress.on_progress(
                &spec.name,
                PackageStage::Unpacking,
                0,
                0,
                &format!("retry {attempt}/{}", tuning.unpack_retries),
            );
            std::thread::sleep(tuning.unpack_retry_delay);
        }
        if temp_extract.exists() {
            let _ = std::fs::remove_dir_all(&temp_extract);
        }
        std::fs::create_dir_all(&temp_extract)?;

        match unpack_attempt(spec, cache, archive_path, &temp_extract, progress, token) {
            Ok(content_dir) => {
                let _ = std::fs::remove_dir_all(&temp_extract);
                return Ok(content_dir);
            }
            Err(error @ CoordinatorError::OperationCancelled) => {
                let _ = std::fs::remove_dir_all(&temp_extract);
                return Err(error);
            }
            Err(CoordinatorError::Io(message)) if message.contains("permission denied") => {
                let _ = std::fs::remove_dir_all(&temp_extract);
                tracing::warn!(package = %spec.name, attempt, "extraction blocked by permission error");
                last_error = CoordinatorError::Io(message);
            }
            Err(error) => {
                let _ = std::fs::remove_dir_all(&temp_extract);
                return Err(error);
            }
        }
    }
    Err(last_error)
}

fn unpack_attempt(
    spec: &PackageSpec,
    cache: &PackageCache,
    archive_path: &Path,
    temp_extract: &Path,
    progress: &dyn ProgressSink,
    token: &CancelToken,
) -> CoordinatorResult<PathBuf> {
    let archive_name = archive_path.to_string_lossy().to_lowercase();
    if !archive_name.ends_with(".tar.gz") && !archive_name.ends_with(".tgz") {
        return Err(CoordinatorError::PermanentRemote(format!(
            "unsupported archive format: {}",
            archive_path.display()
        )));
    }

    progress.on_progress(&spec.name, PackageStage::Unpacking, 0, 0, "starting");
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let mut extracted: u64 = 0;
    for entry in archive
        .entries()
        .map_err(|error| map_extract_error(&error))?
    {
        token.checkpoint()?;
        let mut entry = entry.map_err(|error| map_extract_error(&error))?;
        entry
            .unpack_in(temp_extract)
            .map_err(|error| map_extract_error(&error))?;
        extracted += 1;
        if extracted % 25 == 0 {
            progress.on_progress(
                &spec.name,
                PackageStage::Unpacking,
                extracted,
                0,
                &format!("extracting ({extracted} files)"),
            );
        }
    }

    // GitHub-style archives wrap everything in a single top-level directory.
    let mut top_level: Vec<PathBuf> = std::fs::read_dir(temp_extract)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    let source_dir = if top_level.len() == 1 && top_level[0].is_dir() {
        top_level.remove(0)
    } else {
        temp_extract.to_path_buf()
    };

    let content_dir = cache.content_dir(spec);
    if content_dir.exists() {
        std::fs::remove_dir_all(&content_dir)?;
    }
    if source_dir == temp_extract {
        std::fs::create_dir_all(&content_dir)?;
        move_children(temp_extract, &content_dir)?;
    } else {
        std::fs::rename(&source_dir, &content_dir)?;
    }

    progress.on_progress(&spec.name, PackageStage::Unpacking, extracted, extracted, "complete");
    Ok(content_dir)
}

fn move_children(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        std::fs::rename(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

fn map_extract_error(error: &std::io::Error) -> CoordinatorError {
    if error.kind() == std::io::ErrorKind::PermissionDenied {
        CoordinatorError::Io(format!("permission denied: {error}"))
    } else {
        CoordinatorError::PermanentRemote(format!("archive extraction failed: {error}"))
    }
}

/// Verify the extracted tree, fingerprint it, and commit the manifest. No
/// automatic retry: a failure here is a defect signal.
pub fn install_package(
    spec: &PackageSpec,
    cache: &PackageCache,
    progress: &dyn ProgressSink,
) -> CoordinatorResult<CacheEntryManifest> {
    let content_dir = cache.content_dir(spec);
    progress.on_progress(&spec.name, PackageStage::Installing, 0, 3, "verifying contents");

    let mut file_count: u64 = 0;
    let mut total_size: u64 = 0;
    for entry in walkdir::WalkDir::new(&content_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if entry.file_type().is_file() {
            file_count += 1;
            total_size += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
    }
    if file_count == 0 {
        return Err(CoordinatorError::PermanentRemote(format!(
            "no files in extracted package: {}",
            content_dir.display()
        )));
    }
    progress.on_progress(
        &spec.name,
        PackageStage::Installing,
        1,
        3,
        &format!("{file_count} files ({})", format_size(total_size)),
    );

    progress.on_progress(&spec.name, PackageStage::Installing, 2, 3, "fingerprinting");
    let fingerprint = PackageCache::fingerprint_tree(&content_dir)?;
    if let Some(expected) = &spec.expected_fingerprint {
        if expected != &fingerprint {
            return Err(CoordinatorError::PermanentRemote(format!(
                "fingerprint mismatch for {}: expected {expected}, computed {fingerprint}",
                spec.name
            )));
        }
    }

    let manifest = cache.commit_manifest(spec, fingerprint)?;
    progress.on_progress(&spec.name, PackageStage::Installing, 3, 3, "complete");
    Ok(manifest)
}

fn transfer_speed(downloaded: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        format!("{}/s", format_size((downloaded as f64 / secs) as u64))
    } else {
        format_size(downloaded)
    }
}

fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;
    if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
