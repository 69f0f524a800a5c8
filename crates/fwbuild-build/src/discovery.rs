use std::path::{Path, PathBuf};

use fwbuild_core::{CoordinatorError, CoordinatorResult};

const SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "cc", "ino", "S"];

/// Walk the source root for translation units, sorted for a stable plan.
pub fn discover_sources(src_root: &Path) -> CoordinatorResult<Vec<PathBuf>> {
    if !src_root.is_dir() {
        return Err(CoordinatorError::Configuration(format!(
            "source directory not found: {}",
            src_root.display()
        )));
    }
    let mut sources: Vec<PathBuf> = walkdir::WalkDir::new(src_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    sources.sort();
    Ok(sources)
}

/// One planned translation unit: the source, its object path mirrored under
/// the profile's object directory, and the full compile argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    pub source: PathBuf,
    pub object: PathBuf,
    pub command: Vec<String>,
}

/// Derive the per-unit argv vector from the platform's compile template plus
/// the environment's flag overrides.
pub fn plan_units(
    sources: &[PathBuf],
    src_root: &Path,
    object_dir: &Path,
    compiler: &str,
    base_flags: &[String],
    extra_flags: &[String],
) -> CoordinatorResult<Vec<UnitPlan>> {
    let mut plans = Vec::with_capacity(sources.len());
    for source in sources {
        let relative = source
            .strip_prefix(src_root)
            .map_err(|error| CoordinatorError::Internal(error.to_string()))?;
        let mut object = object_dir.join(relative);
        let object_name = format!(
            "{}.o",
            object
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("unit")
        );
        object.set_file_name(object_name);

        let mut command = Vec::with_capacity(base_flags.len() + extra_flags.len() + 5);
        command.push(compiler.to_owned());
        command.extend(base_flags.iter().cloned());
        command.extend(extra_flags.iter().cloned());
        command.push("-c".to_owned());
        command.push(source.to_string_lossy().into_owned());
        command.push("-o".to_owned());
        command.push(object.to_string_lossy().into_owned());

        plans.push(UnitPlan {
            source: source.clone(),
            object,
            command,
        });
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{discover_sources, plan_units};

    #[test]
    fn discovery_finds_only_translation_units_sorted() {
        let root = TempDir::new().expect("tempdir");
        let src = root.path().join("src");
        std::fs::create_dir_all(src.join("drivers")).expect("dirs");
        std::fs::write(src.join("main.cpp"), b"int main() {}").expect("main");
        std::fs::write(src.join("blink.ino"), b"void loop() {}").expect("ino");
        std::fs::write(src.join("drivers/uart.c"), b"void uart() {}").expect("uart");
        std::fs::write(src.join("notes.md"), b"docs").expect("notes");

        let sources = discover_sources(&src).expect("discover");
        let names: Vec<String> = sources
            .iter()
            .map(|path| {
                path.strip_prefix(&src)
                    .expect("relative")
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "blink.ino".to_owned(),
                "drivers/uart.c".to_owned(),
                "main.cpp".to_owned()
            ]
        );
    }

    #[test]
    fn missing_source_root_is_a_configuration_error() {
        let root = TempDir::new().expect("tempdir");
        assert!(discover_sources(&root.path().join("src")).is_err());
    }

    #[test]
    fn planned_objects_mirror_the_source_tree() {
        let root = TempDir::new().expect("tempdir");
        let src = root.path().join("src");
        std::fs::create_dir_all(src.join("drivers")).expect("dirs");
        std::fs::write(src.join("main.cpp"), b"int main() {}").expect("main");
        std::fs::write(src.join("drivers/uart.c"), b"void uart() {}").expect("uart");

        let sources = discover_sources(&src).expect("discover");
        let object_dir = root.path().join("build/objects");
        let plans = plan_units(
            &sources,
            &src,
            &object_dir,
            "avr-gcc",
            &["-Os".to_owned()],
            &["-DF_CPU=16000000L".to_owned()],
        )
        .expect("plan");

        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].object, object_dir.join("drivers/uart.o"));
        assert_eq!(plans[1].object, object_dir.join("main.o"));
        let command = &plans[1].command;
        assert_eq!(command[0], "avr-gcc");
        assert!(command.contains(&"-Os".to_owned()));
        assert!(command.contains(&"-DF_CPU=16000000L".to_owned()));
        let dash_c = command.iter().position(|arg| arg == "-c").expect("-c flag");
        assert!(command[dash_c + 1].ends_with("main.cpp"));
    }
}
