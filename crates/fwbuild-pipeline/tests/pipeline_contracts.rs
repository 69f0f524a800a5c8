use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use fwbuild_config::PipelineTuning;
use fwbuild_coordination::{CancellationRegistry, CancelToken};
use fwbuild_core::{CoordinatorError, RequestId};
use fwbuild_pipeline::{
    InstallPipeline, PackageCache, PackageKind, PackageSpec, PackageStage, PipelineOptions,
};
use fwbuild_pipeline::progress::NullProgress;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct FixtureState {
    archives: Arc<HashMap<String, Vec<u8>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    slow: Arc<HashMap<String, Duration>>,
}

async fn serve_archive(
    State(state): State<FixtureState>,
    Path(name): Path<String>,
) -> Response {
    *state.hits.lock().expect("hit counter").entry(name.clone()).or_insert(0) += 1;

    let Some(bytes) = state.archives.get(&name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(delay) = state.slow.get(&name).copied() {
        let chunks: Vec<Vec<u8>> = bytes.chunks(64).map(|chunk| chunk.to_vec()).collect();
        let stream = futures_stream(chunks, delay);
        return Response::new(Body::from_stream(stream));
    }
    Response::new(Body::from(bytes))
}

fn futures_stream(
    chunks: Vec<Vec<u8>>,
    delay: Duration,
) -> impl futures_util::Stream<Item = Result<Vec<u8>, std::io::Error>> {
    futures_util::stream::unfold(chunks.into_iter(), move |mut iter| async move {
        match iter.next() {
            Some(chunk) => {
                tokio::time::sleep(delay).await;
                Some((Ok(chunk), iter))
            }
            None => None,
        }
    })
}

async fn start_fixture(state: FixtureState) -> SocketAddr {
    let app = Router::new()
        .route("/pkgs/:name", get(serve_archive))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fixture listener");
    let addr = listener.local_addr().expect("fixture addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fixture");
    });
    addr
}

fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, *name, *data).expect("append");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

fn spec(name: &str, addr: SocketAddr, deps: &[&str]) -> PackageSpec {
    PackageSpec {
        name: name.to_owned(),
        version: "1.0".to_owned(),
        url: format!("http://{addr}/pkgs/{name}.tar.gz"),
        kind: PackageKind::Library,
        dependencies: deps.iter().map(|dep| (*dep).to_owned()).collect(),
        expected_fingerprint: None,
    }
}

fn fast_tuning() -> PipelineTuning {
    PipelineTuning {
        download_backoff_base_ms: 5,
        unpack_retry_delay_ms: 5,
        ..PipelineTuning::default()
    }
}

fn token(root: &std::path::Path, request: &str) -> (Arc<CancellationRegistry>, CancelToken) {
    let registry = Arc::new(CancellationRegistry::new(root.join("state")));
    let token = registry.token(RequestId::new(request), std::process::id());
    (registry, token)
}

fn run_pipeline(
    cache: Arc<PackageCache>,
    specs: Vec<PackageSpec>,
    options: PipelineOptions,
    token: CancelToken,
) -> Result<fwbuild_pipeline::PipelineReport, CoordinatorError> {
    InstallPipeline::new(cache).run(specs, &options, Arc::new(NullProgress), token)
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_install_commits_every_package_in_dependency_order() {
    let root = TempDir::new().expect("tempdir");
    let mut archives = HashMap::new();
    archives.insert(
        "platform-uno.tar.gz".to_owned(),
        tar_gz(&[("boards.txt", b"uno.build.mcu=atmega328p" as &[u8])]),
    );
    archives.insert(
        "toolchain-avr.tar.gz".to_owned(),
        tar_gz(&[("bin/avr-gcc", b"elf" as &[u8])]),
    );
    let state = FixtureState {
        archives: Arc::new(archives),
        ..FixtureState::default()
    };
    let addr = start_fixture(state.clone()).await;

    let cache = Arc::new(PackageCache::new(root.path().join("cache")));
    let specs = vec![
        spec("platform-uno", addr, &[]),
        spec("toolchain-avr", addr, &["platform-uno"]),
    ];
    let (_registry, cancel) = token(root.path(), "req-fresh");

    let options = PipelineOptions {
        tuning: fast_tuning(),
        continue_on_cancel: false,
    };
    let cache_for_run = Arc::clone(&cache);
    let report = tokio::task::spawn_blocking(move || {
        run_pipeline(cache_for_run, specs, options, cancel)
    })
    .await
    .expect("join")
    .expect("pipeline succeeds");

    assert!(report.success);
    assert_eq!(report.done_count(), 2);
    for name in ["platform-uno", "toolchain-avr"] {
        let spec = spec(name, addr, &[]);
        assert!(cache.is_installed(&spec), "{name} should be installed");
        let manifest = cache.read_manifest(&spec).expect("manifest");
        assert_eq!(manifest.name, name);
        assert!(!manifest.fingerprint.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn second_install_is_a_disk_no_op_served_from_cache() {
    let root = TempDir::new().expect("tempdir");
    let mut archives = HashMap::new();
    archives.insert(
        "framework-arduino.tar.gz".to_owned(),
        tar_gz(&[("cores/arduino.h", b"#pragma once" as &[u8])]),
    );
    let state = FixtureState {
        archives: Arc::new(archives),
        ..FixtureState::default()
    };
    let addr = start_fixture(state.clone()).await;

    let cache = Arc::new(PackageCache::new(root.path().join("cache")));
    let options = PipelineOptions {
        tuning: fast_tuning(),
        continue_on_cancel: false,
    };

    for run in 0..2 {
        let specs = vec![spec("framework-arduino", addr, &[])];
        let (_registry, cancel) = token(root.path(), &format!("req-rerun-{run}"));
        let cache_for_run = Arc::clone(&cache);
        let run_options = options.clone();
        let report = tokio::task::spawn_blocking(move || {
            run_pipeline(cache_for_run, specs, run_options, cancel)
        })
        .await
        .expect("join")
        .expect("pipeline succeeds");
        assert!(report.success);
    }

    let hits = state.hits.lock().expect("hits");
    assert_eq!(
        hits.get("framework-arduino.tar.gz").copied().unwrap_or(0),
        1,
        "second run must not touch the network"
    );

    let first = cache
        .read_manifest(&spec("framework-arduino", addr, &[]))
        .expect("manifest");
    assert!(!first.fingerprint.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn http_404_is_permanent_and_poisons_dependents() {
    let root = TempDir::new().expect("tempdir");
    let state = FixtureState::default();
    let addr = start_fixture(state.clone()).await;

    let cache = Arc::new(PackageCache::new(root.path().join("cache")));
    let specs = vec![
        spec("platform-missing", addr, &[]),
        spec("toolchain-blocked", addr, &["platform-missing"]),
    ];
    let (_registry, cancel) = token(root.path(), "req-404");
    let options = PipelineOptions {
        tuning: fast_tuning(),
        continue_on_cancel: false,
    };
    let cache_for_run = Arc::clone(&cache);
    let report = tokio::task::spawn_blocking(move || {
        run_pipeline(cache_for_run, specs, options, cancel)
    })
    .await
    .expect("join")
    .expect("pipeline completes with failures");

    assert!(!report.success);
    let failed: Vec<_> = report.failed_tasks().collect();
    assert_eq!(failed.len(), 2);
    let blocked = failed
        .iter()
        .find(|task| task.name == "toolchain-blocked")
        .expect("poisoned dependent");
    assert_eq!(
        blocked.error.as_deref(),
        Some("depends on failed task platform-missing")
    );

    // 4xx is never retried.
    let hits = state.hits.lock().expect("hits");
    assert_eq!(hits.get("platform-missing.tar.gz").copied(), Some(1));
    assert!(hits.get("toolchain-blocked.tar.gz").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_during_download_cleans_partials_and_skips_dependents() {
    let root = TempDir::new().expect("tempdir");
    let payload = tar_gz(&[("bin/xtensa-gcc", vec![0u8; 8 * 1024].as_slice())]);
    let mut archives = HashMap::new();
    archives.insert("toolchain-xtensa.tar.gz".to_owned(), payload);
    let mut slow = HashMap::new();
    slow.insert(
        "toolchain-xtensa.tar.gz".to_owned(),
        Duration::from_millis(50),
    );
    let state = FixtureState {
        archives: Arc::new(archives),
        hits: Arc::default(),
        slow: Arc::new(slow),
    };
    let addr = start_fixture(state).await;

    let cache = Arc::new(PackageCache::new(root.path().join("cache")));
    let toolchain = spec("toolchain-xtensa", addr, &[]);
    let framework = spec("framework-blocked", addr, &["toolchain-xtensa"]);
    let (registry, cancel) = token(root.path(), "req-cancel");
    let options = PipelineOptions {
        tuning: fast_tuning(),
        continue_on_cancel: false,
    };

    let cache_for_run = Arc::clone(&cache);
    let specs = vec![toolchain.clone(), framework.clone()];
    let pipeline = tokio::task::spawn_blocking(move || {
        run_pipeline(cache_for_run, specs, options, cancel)
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    registry
        .deliver(&RequestId::new("req-cancel"))
        .expect("deliver cancel");

    let result = pipeline.await.expect("join");
    assert!(matches!(result, Err(CoordinatorError::OperationCancelled)));

    // No partial download litter, no manifest, dependent never started.
    let entry = cache.entry_dir(&toolchain);
    if entry.exists() {
        for file in std::fs::read_dir(&entry).expect("entry dir") {
            let name = file.expect("entry").file_name();
            let name = name.to_string_lossy();
            assert!(
                !name.ends_with(".download"),
                "partial download left behind: {name}"
            );
            assert!(
                !name.starts_with("temp_extract_"),
                "extraction litter left behind: {name}"
            );
        }
    }
    assert!(!cache.is_installed(&toolchain));
    assert!(!cache.is_installed(&framework));
}

#[tokio::test(flavor = "multi_thread")]
async fn continue_policy_finishes_install_despite_cancellation() {
    let root = TempDir::new().expect("tempdir");
    let mut archives = HashMap::new();
    archives.insert(
        "lib-servo.tar.gz".to_owned(),
        tar_gz(&[("servo.h", b"class Servo;" as &[u8])]),
    );
    let mut slow = HashMap::new();
    slow.insert("lib-servo.tar.gz".to_owned(), Duration::from_millis(20));
    let state = FixtureState {
        archives: Arc::new(archives),
        hits: Arc::default(),
        slow: Arc::new(slow),
    };
    let addr = start_fixture(state).await;

    let cache = Arc::new(PackageCache::new(root.path().join("cache")));
    let library = spec("lib-servo", addr, &[]);
    let (registry, cancel) = token(root.path(), "req-continue");
    let options = PipelineOptions {
        tuning: fast_tuning(),
        continue_on_cancel: true,
    };

    let cache_for_run = Arc::clone(&cache);
    let specs = vec![library.clone()];
    let pipeline = tokio::task::spawn_blocking(move || {
        run_pipeline(cache_for_run, specs, options, cancel)
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    registry
        .deliver(&RequestId::new("req-continue"))
        .expect("deliver cancel");

    let report = pipeline
        .await
        .expect("join")
        .expect("continue policy completes");
    assert!(report.success, "cache must be populated despite cancel");
    assert!(cache.is_installed(&library));
}
