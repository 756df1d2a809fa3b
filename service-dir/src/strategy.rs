use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::descriptor::{LogMode, ServiceDescriptor};
use crate::error::{ServiceError, ServiceResult};

/// Attribute key holding the services this container supervises.
const CONTAINER_SERVICE_KEY: &str = "container_service";

/// How a declared service is managed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStrategy {
    /// Not declared under `container_service`; the platform's own service
    /// handling applies.
    DefaultService,
    /// Run under runit with the given command.
    SupervisedService { command: String, log_mode: LogMode },
}

impl ServiceStrategy {
    /// The runit descriptor for a supervised service.
    pub fn descriptor(&self, name: &str) -> ServiceResult<Option<ServiceDescriptor>> {
        match self {
            Self::DefaultService => Ok(None),
            Self::SupervisedService { command, log_mode } => {
                ServiceDescriptor::new(name, command.clone(), *log_mode).map(Some)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContainerServiceEntry {
    command: String,
    #[serde(default)]
    log_mode: LogMode,
}

/// Pick the strategy for `name` from the node attributes.
///
/// A service is supervised when `container_service.<name>` exists; its
/// `command` is required and `log_mode` defaults to `stream`.
pub fn service_strategy(name: &str, attributes: &Value) -> ServiceResult<ServiceStrategy> {
    let Some(entry) = attributes
        .get(CONTAINER_SERVICE_KEY)
        .and_then(|services| services.get(name))
    else {
        return Ok(ServiceStrategy::DefaultService);
    };
    let entry = parse_entry(name, entry)?;
    Ok(ServiceStrategy::SupervisedService {
        command: entry.command,
        log_mode: entry.log_mode,
    })
}

/// Every service declared under `container_service`, keyed by name.
pub fn container_services(attributes: &Value) -> ServiceResult<BTreeMap<String, ServiceDescriptor>> {
    let Some(services) = attributes.get(CONTAINER_SERVICE_KEY) else {
        return Ok(BTreeMap::new());
    };
    let Some(services) = services.as_object() else {
        return Err(ServiceError::Attributes(format!(
            "`{CONTAINER_SERVICE_KEY}` must be an object"
        )));
    };
    let mut declared = BTreeMap::new();
    for name in services.keys() {
        if let Some(descriptor) = service_strategy(name, attributes)?.descriptor(name)? {
            declared.insert(name.clone(), descriptor);
        }
    }
    Ok(declared)
}

/// Read a JSON attributes file. A missing file means no attributes.
pub fn load_attributes(path: &Path) -> ServiceResult<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        Err(source) => {
            return Err(ServiceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map_err(|e| ServiceError::Attributes(format!("{}: {e}", path.display())))
}

fn parse_entry(name: &str, entry: &Value) -> ServiceResult<ContainerServiceEntry> {
    ContainerServiceEntry::deserialize(entry)
        .map_err(|e| ServiceError::Attributes(format!("{CONTAINER_SERVICE_KEY}.{name}: {e}")))
}
