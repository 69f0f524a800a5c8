use std::collections::BTreeMap;
use std::path::Path;

use fwbuild_core::{CoordinatorError, CoordinatorResult};
use serde::{Deserialize, Serialize};

/// A third-party library requested by an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryDependency {
    pub name: String,
    pub version: String,
    pub url: String,
}

/// One named build configuration: platform, board, flags, and libraries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub platform: String,
    pub board: String,
    #[serde(default)]
    pub build_flags: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<LibraryDependency>,
    #[serde(default)]
    pub src_dir: Option<String>,
}

/// The parsed project manifest. Manifest-file syntax is an external
/// collaborator; this is the deserialized contract the coordinator consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub name: String,
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl ProjectManifest {
    pub fn from_json_file(path: &Path) -> CoordinatorResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let manifest: ProjectManifest = serde_json::from_str(&raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.name.is_empty() {
            return Err(CoordinatorError::DefectiveManifest {
                field: "name".to_owned(),
            });
        }
        if self.environments.is_empty() {
            return Err(CoordinatorError::DefectiveManifest {
                field: "environments".to_owned(),
            });
        }
        for (env_name, env) in &self.environments {
            if env.platform.is_empty() {
                return Err(CoordinatorError::DefectiveManifest {
                    field: format!("environments.{env_name}.platform"),
                });
            }
            if env.board.is_empty() {
                return Err(CoordinatorError::DefectiveManifest {
                    field: format!("environments.{env_name}.board"),
                });
            }
        }
        Ok(())
    }

    pub fn environment(&self, name: &str) -> CoordinatorResult<&EnvironmentConfig> {
        self.environments.get(name).ok_or_else(|| {
            CoordinatorError::Configuration(format!("unknown environment: {name}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fwbuild_core::CoordinatorError;

    use super::{EnvironmentConfig, ProjectManifest};

    fn manifest() -> ProjectManifest {
        let mut environments = BTreeMap::new();
        environments.insert(
            "uno".to_owned(),
            EnvironmentConfig {
                platform: "atmelavr".to_owned(),
                board: "uno".to_owned(),
                build_flags: vec!["-DF_CPU=16000000L".to_owned()],
                libraries: Vec::new(),
                src_dir: None,
            },
        );
        ProjectManifest {
            name: "blink".to_owned(),
            environments,
        }
    }

    #[test]
    fn valid_manifest_passes_validation() {
        manifest().validate().expect("valid manifest");
    }

    #[test]
    fn missing_board_is_a_defective_manifest() {
        let mut manifest = manifest();
        manifest
            .environments
            .get_mut("uno")
            .expect("uno environment")
            .board
            .clear();
        assert!(matches!(
            manifest.validate(),
            Err(CoordinatorError::DefectiveManifest { field }) if field.contains("board")
        ));
    }

    #[test]
    fn unknown_environment_lookup_fails() {
        assert!(matches!(
            manifest().environment("esp32c6"),
            Err(CoordinatorError::Configuration(_))
        ));
        assert!(manifest().environment("uno").is_ok());
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let original = manifest();
        let encoded = serde_json::to_string(&original).expect("encode");
        let decoded: ProjectManifest = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, original);
    }
}
