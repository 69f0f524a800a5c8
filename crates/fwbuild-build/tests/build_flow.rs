#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fwbuild_build::{
    BuildInputs, BuildOrchestrator, BuildProfile, CommandTables, EnvironmentConfig,
    FirmwareLedger, PlatformBackend, PlatformRegistry, ProjectManifest,
};
use fwbuild_compile::{CompilationPool, Parallelism};
use fwbuild_coordination::{CancellationRegistry, CancelToken};
use fwbuild_core::{BuildContext, CoordinatorError, CoordinatorResult, RequestId, Verbosity};
use fwbuild_pipeline::progress::NullProgress;
use fwbuild_pipeline::{
    EnvironmentPackages, InstallPipeline, PackageCache, PackageKind, PackageSpec, PipelineOptions,
};
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    let mut permissions = std::fs::metadata(&path).expect("script metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod script");
    path
}

struct FakeTools {
    compiler: PathBuf,
    linker: PathBuf,
    objcopy: PathBuf,
}

fn fake_tools(dir: &Path, failing_compiler: bool) -> FakeTools {
    let compiler_body = if failing_compiler {
        "#!/bin/sh\necho 'main.cpp:3: error: expected ;' >&2\nexit 1\n".to_owned()
    } else {
        concat!(
            "#!/bin/sh\n",
            "src=\"\"; obj=\"\"\n",
            "while [ \"$#\" -gt 0 ]; do\n",
            "  case \"$1\" in\n",
            "    -c) src=\"$2\"; shift ;;\n",
            "    -o) obj=\"$2\"; shift ;;\n",
            "  esac\n",
            "  shift\n",
            "done\n",
            "mkdir -p \"$(dirname \"$obj\")\"\n",
            "cp \"$src\" \"$obj\"\n",
        )
        .to_owned()
    };
    let linker_body = concat!(
        "#!/bin/sh\n",
        "out=\"\"; inputs=\"\"\n",
        "while [ \"$#\" -gt 0 ]; do\n",
        "  case \"$1\" in\n",
        "    -o) out=\"$2\"; shift ;;\n",
        "    *) inputs=\"$inputs $1\" ;;\n",
        "  esac\n",
        "  shift\n",
        "done\n",
        "cat $inputs > \"$out\"\n",
    );
    let objcopy_body = "#!/bin/sh\ncp \"$1\" \"$2\"\n";

    FakeTools {
        compiler: write_script(dir, "fakecc", &compiler_body),
        linker: write_script(dir, "fakeld", linker_body),
        objcopy: write_script(dir, "fakeobjcopy", objcopy_body),
    }
}

struct FakePlatform {
    tools: FakeTools,
}

impl PlatformBackend for FakePlatform {
    fn name(&self) -> &str {
        "fakeavr"
    }

    fn required_packages(&self, _env: &EnvironmentConfig) -> EnvironmentPackages {
        EnvironmentPackages {
            platform: PackageSpec {
                name: "platform-fakeavr".to_owned(),
                version: "1.0".to_owned(),
                url: "http://127.0.0.1:9/platform-fakeavr.tar.gz".to_owned(),
                kind: PackageKind::Platform,
                dependencies: Vec::new(),
                expected_fingerprint: None,
            },
            toolchains: Vec::new(),
            framework: None,
            libraries: Vec::new(),
        }
    }

    fn command_tables(
        &self,
        _env: &EnvironmentConfig,
        _cache: &PackageCache,
    ) -> CoordinatorResult<CommandTables> {
        Ok(CommandTables {
            compiler: self.tools.compiler.to_string_lossy().into_owned(),
            compile_flags: vec!["-Os".to_owned()],
            linker: self.tools.linker.to_string_lossy().into_owned(),
            link_flags: Vec::new(),
            objcopy: self.tools.objcopy.to_string_lossy().into_owned(),
            image_flags: Vec::new(),
            image_extension: "bin".to_owned(),
        })
    }

    fn upload_command(
        &self,
        _env: &EnvironmentConfig,
        _cache: &PackageCache,
        port: &str,
        image: &Path,
    ) -> CoordinatorResult<Vec<String>> {
        Ok(vec![
            "true".to_owned(),
            port.to_owned(),
            image.to_string_lossy().into_owned(),
        ])
    }
}

struct Fixture {
    _root: TempDir,
    project_dir: PathBuf,
    orchestrator: BuildOrchestrator,
    ledger: Arc<FirmwareLedger>,
    registry_dir: PathBuf,
}

fn fixture(failing_compiler: bool) -> Fixture {
    let root = TempDir::new().expect("tempdir");
    let tools_dir = root.path().join("tools");
    std::fs::create_dir_all(&tools_dir).expect("tools dir");
    let tools = fake_tools(&tools_dir, failing_compiler);

    let project_dir = root.path().join("blink");
    std::fs::create_dir_all(project_dir.join("src")).expect("src dir");
    std::fs::write(
        project_dir.join("src/main.cpp"),
        b"int main() { return 0; }",
    )
    .expect("main.cpp");
    std::fs::write(project_dir.join("src/util.cpp"), b"int util() { return 1; }")
        .expect("util.cpp");

    let cache = Arc::new(PackageCache::new(root.path().join("cache")));
    let platform = FakePlatform { tools };
    // Pre-commit the platform package so the pipeline takes the cache-hit
    // path instead of the network.
    let spec = platform.required_packages(&env_config()).platform;
    std::fs::create_dir_all(cache.content_dir(&spec)).expect("content dir");
    std::fs::write(cache.content_dir(&spec).join("boards.txt"), b"fake").expect("boards");
    cache
        .commit_manifest(&spec, "fp-fake".to_owned())
        .expect("commit manifest");

    let mut registry = PlatformRegistry::new();
    registry.register(Arc::new(platform));
    let ledger = Arc::new(FirmwareLedger::new());
    let orchestrator = BuildOrchestrator::new(
        Arc::new(registry),
        Arc::clone(&cache),
        InstallPipeline::new(Arc::clone(&cache)),
        Arc::clone(&ledger),
    );

    let registry_dir = root.path().join("state");
    Fixture {
        _root: root,
        project_dir,
        orchestrator,
        ledger,
        registry_dir,
    }
}

fn env_config() -> EnvironmentConfig {
    EnvironmentConfig {
        platform: "fakeavr".to_owned(),
        board: "uno".to_owned(),
        build_flags: vec!["-DBLINK=1".to_owned()],
        libraries: Vec::new(),
        src_dir: None,
    }
}

fn manifest() -> ProjectManifest {
    let mut environments = std::collections::BTreeMap::new();
    environments.insert("uno".to_owned(), env_config());
    ProjectManifest {
        name: "blink".to_owned(),
        environments,
    }
}

fn inputs(fixture: &Fixture, request: &str) -> (BuildInputs, CancelToken) {
    let registry = Arc::new(CancellationRegistry::new(fixture.registry_dir.clone()));
    let token = registry.token(RequestId::new(request), std::process::id());
    let (context, _buffer) = BuildContext::in_memory(RequestId::new(request), Verbosity::Normal);
    (
        BuildInputs {
            request_id: RequestId::new(request),
            project_dir: fixture.project_dir.clone(),
            manifest: manifest(),
            environment: "uno".to_owned(),
            profile: BuildProfile::Release,
            parallelism: Parallelism::Shared,
            context,
            pipeline_options: PipelineOptions::default(),
        },
        token,
    )
}

#[test]
fn fresh_build_compiles_links_and_stages_the_image() {
    let fixture = fixture(false);
    let pool = CompilationPool::new(2, Duration::from_secs(30));
    let (build_inputs, token) = inputs(&fixture, "req-build-1");

    let outcome = fixture
        .orchestrator
        .run(
            &pool,
            Duration::from_secs(30),
            &build_inputs,
            Arc::new(NullProgress),
            &token,
        )
        .expect("build succeeds");

    assert_eq!(outcome.compiled_units, 2);
    assert_eq!(outcome.skipped_units, 0);
    assert_eq!(pool.invocation_count(), 2);
    assert!(outcome.pipeline.success);

    let profile_dir = fixture.project_dir.join("build/uno/release");
    assert_eq!(outcome.elf_path, profile_dir.join("firmware.elf"));
    assert_eq!(outcome.image_path, profile_dir.join("firmware.bin"));
    assert!(outcome.image_path.is_file());

    let record = fixture
        .ledger
        .lookup(&fixture.project_dir, "uno")
        .expect("ledger record");
    assert_eq!(record.image_path, outcome.image_path);
    pool.shutdown();
}

#[test]
fn no_change_rebuild_skips_every_compile_but_still_links() {
    let fixture = fixture(false);
    let pool = CompilationPool::new(2, Duration::from_secs(30));

    let (first_inputs, first_token) = inputs(&fixture, "req-build-a");
    fixture
        .orchestrator
        .run(
            &pool,
            Duration::from_secs(30),
            &first_inputs,
            Arc::new(NullProgress),
            &first_token,
        )
        .expect("first build");
    assert_eq!(pool.invocation_count(), 2);

    let elf_before = std::fs::metadata(fixture.project_dir.join("build/uno/release/firmware.elf"))
        .expect("elf metadata")
        .modified()
        .expect("elf mtime");
    std::thread::sleep(Duration::from_millis(20));

    let (second_inputs, second_token) = inputs(&fixture, "req-build-b");
    let outcome = fixture
        .orchestrator
        .run(
            &pool,
            Duration::from_secs(30),
            &second_inputs,
            Arc::new(NullProgress),
            &second_token,
        )
        .expect("rebuild");

    assert_eq!(outcome.compiled_units, 0);
    assert_eq!(outcome.skipped_units, 2);
    // No new compiler invocations, but the link step still ran.
    assert_eq!(pool.invocation_count(), 2);
    let elf_after = std::fs::metadata(fixture.project_dir.join("build/uno/release/firmware.elf"))
        .expect("elf metadata")
        .modified()
        .expect("elf mtime");
    assert!(elf_after > elf_before);
    pool.shutdown();
}

#[test]
fn compiler_failure_surfaces_captured_stderr() {
    let fixture = fixture(true);
    let pool = CompilationPool::new(2, Duration::from_secs(30));
    let (build_inputs, token) = inputs(&fixture, "req-build-fail");

    let error = fixture
        .orchestrator
        .run(
            &pool,
            Duration::from_secs(30),
            &build_inputs,
            Arc::new(NullProgress),
            &token,
        )
        .expect_err("build fails");

    assert!(matches!(
        error,
        CoordinatorError::ChildNonzero { status: 1, stderr } if stderr.contains("expected ;")
    ));
    pool.shutdown();
}

#[test]
fn quick_profile_artifacts_do_not_disturb_release_artifacts() {
    let fixture = fixture(false);
    let pool = CompilationPool::new(2, Duration::from_secs(30));

    let (release_inputs, release_token) = inputs(&fixture, "req-release");
    fixture
        .orchestrator
        .run(
            &pool,
            Duration::from_secs(30),
            &release_inputs,
            Arc::new(NullProgress),
            &release_token,
        )
        .expect("release build");

    let (mut quick_inputs, quick_token) = inputs(&fixture, "req-quick");
    quick_inputs.profile = BuildProfile::Quick;
    let quick = fixture
        .orchestrator
        .run(
            &pool,
            Duration::from_secs(30),
            &quick_inputs,
            Arc::new(NullProgress),
            &quick_token,
        )
        .expect("quick build");

    // Distinct profile directories: the quick build compiles its own
    // objects instead of invalidating the release cache.
    assert_eq!(quick.compiled_units, 2);
    assert!(fixture
        .project_dir
        .join("build/uno/release/firmware.bin")
        .is_file());
    assert!(fixture
        .project_dir
        .join("build/uno/quick/firmware.bin")
        .is_file());
    pool.shutdown();
}
