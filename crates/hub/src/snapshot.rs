//! On-disk JSON image of a project: `{projectKey, collections}`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use ferry_core::ResourceType;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::info;

use crate::memory::MemoryProject;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub project_key: String,
    /// Keyed by resource name (`products`) or reference type id (`product`).
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<Json>>,
}

/// Reference type id for a collection name; unknown names pass through as type ids.
fn collection_type_id(name: &str) -> String {
    match name.parse::<ResourceType>() {
        Ok(rt) => rt.reference_type_id().to_string(),
        Err(_) => name.to_string(),
    }
}

impl ProjectSnapshot {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading snapshot {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing snapshot {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("serializing snapshot")?;
        std::fs::write(path, text).with_context(|| format!("writing snapshot {}", path.display()))
    }

    pub fn into_project(self) -> MemoryProject {
        let project = MemoryProject::new(self.project_key);
        for (name, resources) in self.collections {
            let type_id = collection_type_id(&name);
            for raw in resources {
                project.put_raw_type(&type_id, raw);
            }
        }
        project
    }

    /// Collections are written under resource names where one exists.
    pub fn from_project(project: &MemoryProject) -> Self {
        let collections = project
            .type_ids()
            .into_iter()
            .map(|type_id| {
                let name = ResourceType::from_reference_type_id(&type_id)
                    .map(|rt| rt.as_str().to_string())
                    .unwrap_or_else(|| type_id.clone());
                (name, project.all_of_type(&type_id))
            })
            .collect();
        Self { project_key: project.key().to_string(), collections }
    }
}

impl MemoryProject {
    pub fn load(path: &Path) -> Result<Self> {
        let project = ProjectSnapshot::read(path)?.into_project();
        info!(project = %project.key(), path = %path.display(), "loaded project snapshot");
        Ok(project)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ProjectSnapshot::from_project(self).write(path)?;
        info!(project = %self.key(), path = %path.display(), "saved project snapshot");
        Ok(())
    }
}
