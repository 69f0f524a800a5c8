use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Port discovery seam; the physical transport is an external collaborator,
/// so tests inject their own enumerator.
pub trait PortEnumerator: Send + Sync {
    fn list_ports(&self) -> Vec<PortInfo>;
}

/// Default enumerator: OS serial device nodes.
#[derive(Debug, Default)]
pub struct OsPortEnumerator;

impl PortEnumerator for OsPortEnumerator {
    #[cfg(unix)]
    fn list_ports(&self) -> Vec<PortInfo> {
        let mut ports = Vec::new();
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return ports;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("ttyUSB") || name.starts_with("ttyACM") || name.starts_with("cu.")
            {
                ports.push(PortInfo {
                    name: format!("/dev/{name}"),
                    description: None,
                });
            }
        }
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        ports
    }

    #[cfg(windows)]
    fn list_ports(&self) -> Vec<PortInfo> {
        (1..=32)
            .map(|index| PortInfo {
                name: format!("COM{index}"),
                description: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{PortEnumerator, PortInfo};

    struct FixedPorts;

    impl PortEnumerator for FixedPorts {
        fn list_ports(&self) -> Vec<PortInfo> {
            vec![PortInfo {
                name: "/dev/ttyUSB0".to_owned(),
                description: Some("USB-Serial".to_owned()),
            }]
        }
    }

    #[test]
    fn enumerators_are_injectable() {
        let enumerator: Box<dyn PortEnumerator> = Box::new(FixedPorts);
        let ports = enumerator.list_ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name, "/dev/ttyUSB0");
    }
}
