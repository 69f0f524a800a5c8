use crate::models::{PackageKind, PackageSpec};

/// The packages one environment needs, before dependency edges are applied.
#[derive(Debug, Clone)]
pub struct EnvironmentPackages {
    pub platform: PackageSpec,
    pub toolchains: Vec<PackageSpec>,
    pub framework: Option<PackageSpec>,
    pub libraries: Vec<PackageSpec>,
}

/// Build the install task graph for an environment. The domain ordering is
/// fixed: platform -> toolchain(s) -> framework -> libraries; the generic
/// DAG scheduler runs the rest.
pub fn environment_task_graph(packages: EnvironmentPackages) -> Vec<PackageSpec> {
    let mut specs = Vec::new();

    let mut platform = packages.platform;
    platform.kind = PackageKind::Platform;
    let platform_name = platform.name.clone();
    specs.push(platform);

    let mut toolchain_names = Vec::new();
    for mut toolchain in packages.toolchains {
        toolchain.kind = PackageKind::Toolchain;
        push_dep(&mut toolchain.dependencies, &platform_name);
        toolchain_names.push(toolchain.name.clone());
        specs.push(toolchain);
    }

    let framework_name = packages.framework.as_ref().map(|spec| spec.name.clone());
    if let Some(mut framework) = packages.framework {
        framework.kind = PackageKind::Framework;
        if toolchain_names.is_empty() {
            push_dep(&mut framework.dependencies, &platform_name);
        } else {
            for toolchain in &toolchain_names {
                push_dep(&mut framework.dependencies, toolchain);
            }
        }
        specs.push(framework);
    }

    for mut library in packages.libraries {
        library.kind = PackageKind::Library;
        match &framework_name {
            Some(framework) => push_dep(&mut library.dependencies, framework),
            None if !toolchain_names.is_empty() => {
                for toolchain in &toolchain_names {
                    push_dep(&mut library.dependencies, toolchain);
                }
            }
            None => push_dep(&mut library.dependencies, &platform_name),
        }
        specs.push(library);
    }

    specs
}

fn push_dep(deps: &mut Vec<String>, name: &str) {
    if !deps.iter().any(|dep| dep == name) {
        deps.push(name.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{PackageKind, PackageSpec};
    use crate::scheduler::DependencyScheduler;

    use super::{environment_task_graph, EnvironmentPackages};

    fn spec(name: &str) -> PackageSpec {
        PackageSpec {
            name: name.to_owned(),
            version: "1.0".to_owned(),
            url: format!("https://pkgs.example/{name}.tar.gz"),
            kind: PackageKind::Library,
            dependencies: Vec::new(),
            expected_fingerprint: None,
        }
    }

    fn esp32_packages() -> EnvironmentPackages {
        EnvironmentPackages {
            platform: spec("platform-esp32"),
            toolchains: vec![spec("toolchain-xtensa"), spec("toolchain-riscv32")],
            framework: Some(spec("framework-arduinoespressif32")),
            libraries: vec![spec("lib-servo")],
        }
    }

    #[test]
    fn adapter_orders_platform_toolchain_framework_library() {
        let specs = environment_task_graph(esp32_packages());
        let by_name = |name: &str| {
            specs
                .iter()
                .find(|spec| spec.name == name)
                .unwrap_or_else(|| panic!("missing spec {name}"))
        };

        assert!(by_name("platform-esp32").dependencies.is_empty());
        assert_eq!(
            by_name("toolchain-xtensa").dependencies,
            vec!["platform-esp32".to_owned()]
        );
        assert_eq!(
            by_name("framework-arduinoespressif32").dependencies,
            vec!["toolchain-xtensa".to_owned(), "toolchain-riscv32".to_owned()]
        );
        assert_eq!(
            by_name("lib-servo").dependencies,
            vec!["framework-arduinoespressif32".to_owned()]
        );
        assert_eq!(by_name("platform-esp32").kind, PackageKind::Platform);
        assert_eq!(by_name("lib-servo").kind, PackageKind::Library);
    }

    #[test]
    fn adapter_graph_passes_dag_validation() {
        let mut scheduler = DependencyScheduler::new();
        for spec in environment_task_graph(esp32_packages()) {
            scheduler.add_task(spec).expect("add task");
        }
        scheduler.validate().expect("valid environment graph");
        assert_eq!(scheduler.ready_tasks(), vec!["platform-esp32".to_owned()]);
    }

    #[test]
    fn libraries_fall_back_to_platform_without_framework_or_toolchain() {
        let specs = environment_task_graph(EnvironmentPackages {
            platform: spec("platform-native"),
            toolchains: Vec::new(),
            framework: None,
            libraries: vec![spec("lib-fmt")],
        });
        let library = specs.iter().find(|spec| spec.name == "lib-fmt").expect("library");
        assert_eq!(library.dependencies, vec!["platform-native".to_owned()]);
    }
}
