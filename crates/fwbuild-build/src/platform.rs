use std::collections::BTreeMap;
use std::sync::Arc;

use fwbuild_core::{CoordinatorError, CoordinatorResult};
use fwbuild_pipeline::{EnvironmentPackages, PackageCache, PackageKind, PackageSpec};

use crate::manifest::EnvironmentConfig;

/// Flattened command templates and flag vectors for one platform. Every
/// platform exposes exactly this shape so the dispatcher never branches on
/// platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTables {
    pub compiler: String,
    pub compile_flags: Vec<String>,
    pub linker: String,
    pub link_flags: Vec<String>,
    pub objcopy: String,
    pub image_flags: Vec<String>,
    pub image_extension: String,
}

/// The uniform per-platform contract: which packages an environment needs,
/// which commands build it, and which opaque tool uploads the image.
pub trait PlatformBackend: Send + Sync {
    fn name(&self) -> &str;
    fn required_packages(&self, env: &EnvironmentConfig) -> EnvironmentPackages;
    fn command_tables(
        &self,
        env: &EnvironmentConfig,
        cache: &PackageCache,
    ) -> CoordinatorResult<CommandTables>;
    fn upload_command(
        &self,
        env: &EnvironmentConfig,
        cache: &PackageCache,
        port: &str,
        image: &std::path::Path,
    ) -> CoordinatorResult<Vec<String>>;
}

/// Platform registry keyed by name.
#[derive(Default)]
pub struct PlatformRegistry {
    backends: BTreeMap<String, Arc<dyn PlatformBackend>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AvrPlatform));
        registry.register(Arc::new(Esp32Platform));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn PlatformBackend>) {
        self.backends.insert(backend.name().to_owned(), backend);
    }

    pub fn get(&self, name: &str) -> CoordinatorResult<Arc<dyn PlatformBackend>> {
        self.backends.get(name).cloned().ok_or_else(|| {
            CoordinatorError::Configuration(format!("unknown platform: {name}"))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

fn library_specs(env: &EnvironmentConfig) -> Vec<PackageSpec> {
    env.libraries
        .iter()
        .map(|library| PackageSpec {
            name: format!("lib-{}", library.name),
            version: library.version.clone(),
            url: library.url.clone(),
            kind: PackageKind::Library,
            dependencies: Vec::new(),
            expected_fingerprint: None,
        })
        .collect()
}

fn spec(name: &str, version: &str, url: &str, kind: PackageKind) -> PackageSpec {
    PackageSpec {
        name: name.to_owned(),
        version: version.to_owned(),
        url: url.to_owned(),
        kind,
        dependencies: Vec::new(),
        expected_fingerprint: None,
    }
}

/// AVR boards (uno, nano, mega): single GCC toolchain, Arduino core.
pub struct AvrPlatform;

impl PlatformBackend for AvrPlatform {
    fn name(&self) -> &str {
        "atmelavr"
    }

    fn required_packages(&self, env: &EnvironmentConfig) -> EnvironmentPackages {
        EnvironmentPackages {
            platform: spec(
                "platform-atmelavr",
                "5.1.0",
                "https://github.com/platformio/platform-atmelavr/archive/refs/tags/v5.1.0.tar.gz",
                PackageKind::Platform,
            ),
            toolchains: vec![spec(
                "toolchain-avr-gcc",
                "7.3.0",
                "https://github.com/arduino/toolchain-avr/archive/refs/tags/7.3.0.tar.gz",
                PackageKind::Toolchain,
            )],
            framework: Some(spec(
                "framework-arduino-avr",
                "1.8.6",
                "https://github.com/arduino/ArduinoCore-avr/archive/refs/tags/1.8.6.tar.gz",
                PackageKind::Framework,
            )),
            libraries: library_specs(env),
        }
    }

    fn command_tables(
        &self,
        env: &EnvironmentConfig,
        cache: &PackageCache,
    ) -> CoordinatorResult<CommandTables> {
        let toolchain = spec(
            "toolchain-avr-gcc",
            "7.3.0",
            "https://github.com/arduino/toolchain-avr/archive/refs/tags/7.3.0.tar.gz",
            PackageKind::Toolchain,
        );
        let bin = cache.content_dir(&toolchain).join("bin");
        let mcu = format!("-mmcu={}", board_mcu_avr(&env.board));
        Ok(CommandTables {
            compiler: bin.join("avr-g++").to_string_lossy().into_owned(),
            compile_flags: vec![
                "-Os".to_owned(),
                "-Wall".to_owned(),
                "-ffunction-sections".to_owned(),
                "-fdata-sections".to_owned(),
                mcu.clone(),
            ],
            linker: bin.join("avr-gcc").to_string_lossy().into_owned(),
            link_flags: vec!["-Wl,--gc-sections".to_owned(), mcu],
            objcopy: bin.join("avr-objcopy").to_string_lossy().into_owned(),
            image_flags: vec!["-O".to_owned(), "ihex".to_owned(), "-R".to_owned(), ".eeprom".to_owned()],
            image_extension: "hex".to_owned(),
        })
    }

    fn upload_command(
        &self,
        env: &EnvironmentConfig,
        cache: &PackageCache,
        port: &str,
        image: &std::path::Path,
    ) -> CoordinatorResult<Vec<String>> {
        let toolchain = spec(
            "toolchain-avr-gcc",
            "7.3.0",
            "https://github.com/arduino/toolchain-avr/archive/refs/tags/7.3.0.tar.gz",
            PackageKind::Toolchain,
        );
        let avrdude = cache.content_dir(&toolchain).join("bin").join("avrdude");
        Ok(vec![
            avrdude.to_string_lossy().into_owned(),
            format!("-p{}", board_mcu_avr(&env.board)),
            "-carduino".to_owned(),
            format!("-P{port}"),
            "-b115200".to_owned(),
            "-D".to_owned(),
            format!("-Uflash:w:{}:i", image.display()),
        ])
    }
}

fn board_mcu_avr(board: &str) -> &'static str {
    match board {
        "mega" => "atmega2560",
        "nano" | "uno" => "atmega328p",
        _ => "atmega328p",
    }
}

/// ESP32 family (esp32, esp32c6, esp32s3): per-board toolchain plus the
/// Espressif Arduino core.
pub struct Esp32Platform;

impl Esp32Platform {
    fn toolchain_for(board: &str) -> PackageSpec {
        // RISC-V boards use the riscv32 toolchain, the rest are Xtensa.
        if board.starts_with("esp32c") || board.starts_with("esp32h") {
            spec(
                "toolchain-riscv32-esp",
                "12.2.0",
                "https://github.com/espressif/crosstool-NG/releases/download/esp-12.2.0/riscv32-esp-elf-12.2.0.tar.gz",
                PackageKind::Toolchain,
            )
        } else {
            spec(
                "toolchain-xtensa-esp-elf",
                "12.2.0",
                "https://github.com/espressif/crosstool-NG/releases/download/esp-12.2.0/xtensa-esp-elf-12.2.0.tar.gz",
                PackageKind::Toolchain,
            )
        }
    }

    fn tool_prefix(board: &str) -> &'static str {
        if board.starts_with("esp32c") || board.starts_with("esp32h") {
            "riscv32-esp-elf"
        } else {
            "xtensa-esp32-elf"
        }
    }
}

impl PlatformBackend for Esp32Platform {
    fn name(&self) -> &str {
        "espressif32"
    }

    fn required_packages(&self, env: &EnvironmentConfig) -> EnvironmentPackages {
        EnvironmentPackages {
            platform: spec(
                "platform-esp32",
                "3.3.5",
                "https://github.com/pioarduino/platform-espressif32/archive/refs/tags/53.03.05.tar.gz",
                PackageKind::Platform,
            ),
            toolchains: vec![Self::toolchain_for(&env.board)],
            framework: Some(spec(
                "framework-arduinoespressif32",
                "3.0.7",
                "https://github.com/espressif/arduino-esp32/archive/refs/tags/3.0.7.tar.gz",
                PackageKind::Framework,
            )),
            libraries: library_specs(env),
        }
    }

    fn command_tables(
        &self,
        env: &EnvironmentConfig,
        cache: &PackageCache,
    ) -> CoordinatorResult<CommandTables> {
        let toolchain = Self::toolchain_for(&env.board);
        let prefix = Self::tool_prefix(&env.board);
        let bin = cache.content_dir(&toolchain).join("bin");
        Ok(CommandTables {
            compiler: bin
                .join(format!("{prefix}-g++"))
                .to_string_lossy()
                .into_owned(),
            compile_flags: vec![
                "-Os".to_owned(),
                "-Wall".to_owned(),
                "-ffunction-sections".to_owned(),
                "-fdata-sections".to_owned(),
                format!("-DARDUINO_BOARD=\"{}\"", env.board),
            ],
            linker: bin
                .join(format!("{prefix}-gcc"))
                .to_string_lossy()
                .into_owned(),
            link_flags: vec!["-Wl,--gc-sections".to_owned()],
            objcopy: bin
                .join(format!("{prefix}-objcopy"))
                .to_string_lossy()
                .into_owned(),
            image_flags: vec!["-O".to_owned(), "binary".to_owned()],
            image_extension: "bin".to_owned(),
        })
    }

    fn upload_command(
        &self,
        _env: &EnvironmentConfig,
        cache: &PackageCache,
        port: &str,
        image: &std::path::Path,
    ) -> CoordinatorResult<Vec<String>> {
        let platform = spec(
            "platform-esp32",
            "3.3.5",
            "https://github.com/pioarduino/platform-espressif32/archive/refs/tags/53.03.05.tar.gz",
            PackageKind::Platform,
        );
        let esptool = cache.content_dir(&platform).join("tools").join("esptool");
        Ok(vec![
            esptool.to_string_lossy().into_owned(),
            "--port".to_owned(),
            port.to_owned(),
            "--baud".to_owned(),
            "460800".to_owned(),
            "write_flash".to_owned(),
            "0x10000".to_owned(),
            image.to_string_lossy().into_owned(),
        ])
    }
}
