//! Driver manifest parsing and validation
//!
//! Every driver lives in its own directory containing a `manifest.json`.
//! The directory name becomes the driver id.

use crate::types::{DriverDescriptor, ParamSpec, ProtocolKind, StepDefinition};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

/// File name looked up in each driver directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Raw manifest as written by driver authors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverManifest {
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    pub executable: Option<String>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub steps: Vec<ManifestStep>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Step entry of a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestStep {
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub description: String,
    pub action: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

/// Check that a directory name is usable as a driver id
pub fn validate_driver_id(id: &str) -> std::result::Result<(), String> {
    if id.is_empty() {
        return Err("driver id is empty".to_string());
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("driver id '{}' contains invalid character '{}'", id, c));
    }
    Ok(())
}

impl DriverManifest {
    /// Parse a manifest from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::from)
    }

    /// Validate and convert into a descriptor for the driver in `root`
    pub fn into_descriptor(self, id: &str, root: &Path) -> std::result::Result<DriverDescriptor, String> {
        validate_driver_id(id)?;

        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| "missing required field 'name'".to_string())?;
        let executable = self
            .executable
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| "missing required field 'executable'".to_string())?;
        let protocol: ProtocolKind = self.protocol.parse()?;

        let mut actions = self.actions;
        if actions.is_empty() {
            for step in &self.steps {
                if !actions.contains(&step.action) {
                    actions.push(step.action.clone());
                }
            }
        }
        if actions.is_empty() {
            return Err("manifest declares no actions".to_string());
        }

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            if step.id.trim().is_empty() {
                return Err("step with empty id".to_string());
            }
            if !seen.insert(step.id.clone()) {
                return Err(format!("duplicate step id '{}'", step.id));
            }
            if !actions.contains(&step.action) {
                return Err(format!(
                    "step '{}' references undeclared action '{}'",
                    step.id, step.action
                ));
            }
            steps.push(StepDefinition {
                id: step.id,
                driver_id: id.to_string(),
                pattern: step.pattern,
                action: step.action,
                description: step.description,
                examples: step.examples,
                parameters: step.parameters,
            });
        }

        Ok(DriverDescriptor {
            id: id.to_string(),
            name,
            description: self.description,
            version: self.version,
            author: self.author,
            license: self.license,
            executable: resolve_executable(&executable, root),
            protocol,
            capabilities: self.features.into_iter().collect::<BTreeSet<_>>(),
            actions,
            steps,
            category: self.category,
            tags: self.tags,
            root: root.to_path_buf(),
        })
    }
}

/// Load the manifest in `dir`, using the directory name as driver id
pub fn load_descriptor(dir: &Path) -> Result<DriverDescriptor> {
    let path = dir.join(MANIFEST_FILE);
    let manifest_error = |reason: String| Error::Manifest {
        path: path.display().to_string(),
        reason,
    };

    let id = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| manifest_error("directory has no name".to_string()))?;

    let content = std::fs::read_to_string(&path)
        .map_err(|e| manifest_error(format!("cannot read manifest: {}", e)))?;
    let manifest = DriverManifest::from_json(&content)
        .map_err(|e| manifest_error(format!("invalid JSON: {}", e)))?;

    manifest.into_descriptor(&id, dir).map_err(manifest_error)
}

/// Relative executables containing a path separator are resolved against the
/// driver directory; bare names are left for PATH lookup.
fn resolve_executable(executable: &str, root: &Path) -> PathBuf {
    let path = PathBuf::from(executable);
    if path.is_absolute() {
        return path;
    }
    let local = root.join(&path);
    if executable.contains('/') || local.exists() {
        local
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    const BROWSER_MANIFEST: &str = r#"{
        "name": "Browser",
        "description": "Browser automation",
        "version": "1.2.0",
        "executable": "./bin/driver",
        "protocol": "stdio",
        "features": ["execute", "health-check"],
        "actions": ["navigate", "click"],
        "steps": [
            {
                "id": "open",
                "pattern": "open the browser at (url:string)",
                "description": "Navigate to a page",
                "action": "navigate",
                "examples": ["open the browser at https://example.com"],
                "parameters": [{"name": "url", "type": "string", "required": true}]
            }
        ],
        "category": "web",
        "tags": ["ui"]
    }"#;

    #[test]
    fn test_load_descriptor() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("browser");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), BROWSER_MANIFEST).unwrap();

        let descriptor = load_descriptor(&dir).unwrap();
        assert_eq!(descriptor.id, "browser");
        assert_eq!(descriptor.name, "Browser");
        assert_eq!(descriptor.protocol, ProtocolKind::Stdio);
        assert!(descriptor.has_capability("health-check"));
        assert_eq!(descriptor.executable, dir.join("./bin/driver"));
        assert_eq!(descriptor.steps.len(), 1);
        assert_eq!(descriptor.steps[0].driver_id, "browser");
    }

    #[test_case(r#"{"executable": "x", "actions": ["a"]}"#, "name" ; "missing name")]
    #[test_case(r#"{"name": "x", "actions": ["a"]}"#, "executable" ; "missing executable")]
    #[test_case(r#"{"name": "x", "executable": "x"}"#, "no actions" ; "no actions")]
    #[test_case(r#"{"name": "x", "executable": "x", "actions": ["a"], "protocol": "carrier-pigeon"}"#, "protocol" ; "unknown protocol")]
    fn test_invalid_manifest_rejected(json: &str, expected: &str) {
        let manifest = DriverManifest::from_json(json).unwrap();
        let err = manifest
            .into_descriptor("drv", Path::new("/tmp/drv"))
            .unwrap_err();
        assert!(err.contains(expected), "unexpected error: {}", err);
    }

    #[test]
    fn test_actions_derived_from_steps() {
        let json = r#"{"name": "x", "executable": "x",
            "steps": [{"id": "a", "pattern": "do it", "action": "do"}]}"#;
        let descriptor = DriverManifest::from_json(json)
            .unwrap()
            .into_descriptor("drv", Path::new("/tmp/drv"))
            .unwrap();
        assert_eq!(descriptor.actions, vec!["do".to_string()]);
        assert_eq!(descriptor.executable, PathBuf::from("x"));
    }

    #[test]
    fn test_invalid_driver_id() {
        assert!(validate_driver_id("web-driver_2").is_ok());
        assert!(validate_driver_id("web driver").is_err());
        assert!(validate_driver_id("").is_err());
    }
}
