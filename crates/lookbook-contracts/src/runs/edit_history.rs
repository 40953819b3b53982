use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::TextDiff;
use uuid::Uuid;

pub const SOURCE_OPERATION: &str = "source";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditVersion {
    pub version_id: String,
    pub parent_version_id: Option<String>,
    pub operation: String,
    pub instruction: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    pub instruction_diff: Option<Vec<String>>,
    pub settings_diff: Option<Map<String, Value>>,
    pub image_path: String,
    pub created_at: String,
}

/// Version tree for one image being edited. Undo walks to the parent,
/// redo to the newest child; nothing is ever discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditHistory {
    #[serde(skip)]
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub versions: Vec<EditVersion>,
    pub current_version_id: String,
}

impl EditHistory {
    pub fn new(path: impl Into<PathBuf>, source_image: impl Into<String>) -> Self {
        let created_at = now_utc_iso();
        let root = EditVersion {
            version_id: "v0".to_string(),
            parent_version_id: None,
            operation: SOURCE_OPERATION.to_string(),
            instruction: String::new(),
            settings: Map::new(),
            instruction_diff: None,
            settings_diff: None,
            image_path: source_image.into(),
            created_at: created_at.clone(),
        };
        Self {
            path: path.into(),
            schema_version: 1,
            session_id: Uuid::new_v4().to_string(),
            created_at,
            versions: vec![root],
            current_version_id: "v0".to_string(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let mut history: EditHistory = serde_json::from_str(&raw)
            .with_context(|| format!("invalid edit history {}", path.display()))?;
        if history.versions.is_empty() {
            anyhow::bail!("edit history {} has no versions", path.display());
        }
        if history.get(&history.current_version_id).is_none() {
            history.current_version_id = history.versions[0].version_id.clone();
        }
        history.path = path;
        Ok(history)
    }

    pub fn current(&self) -> &EditVersion {
        self.get(&self.current_version_id)
            .unwrap_or(&self.versions[0])
    }

    pub fn get(&self, version_id: &str) -> Option<&EditVersion> {
        self.versions
            .iter()
            .find(|entry| entry.version_id == version_id)
    }

    pub fn children(&self, version_id: &str) -> Vec<&EditVersion> {
        self.versions
            .iter()
            .filter(|entry| entry.parent_version_id.as_deref() == Some(version_id))
            .collect()
    }

    /// Records a new version branching from the current one and makes it current.
    pub fn add_version(
        &mut self,
        operation: &str,
        instruction: &str,
        settings: Map<String, Value>,
        image_path: impl Into<String>,
    ) -> EditVersion {
        let parent = self.current().clone();
        let version = EditVersion {
            version_id: self.next_version_id(),
            parent_version_id: Some(parent.version_id.clone()),
            operation: operation.to_string(),
            instruction: instruction.to_string(),
            instruction_diff: instruction_diff(&parent.instruction, instruction),
            settings_diff: settings_diff(&parent.settings, &settings),
            settings,
            image_path: image_path.into(),
            created_at: now_utc_iso(),
        };
        self.current_version_id = version.version_id.clone();
        self.versions.push(version.clone());
        version
    }

    pub fn undo(&mut self) -> Option<&EditVersion> {
        let parent_id = self.current().parent_version_id.clone()?;
        self.current_version_id = parent_id;
        Some(self.current())
    }

    pub fn redo(&mut self) -> Option<&EditVersion> {
        let child_id = self
            .children(&self.current_version_id)
            .last()
            .map(|entry| entry.version_id.clone())?;
        self.current_version_id = child_id;
        Some(self.current())
    }

    /// Versions from the source image down to the current one.
    pub fn lineage(&self) -> Vec<&EditVersion> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = Some(self.current());
        while let Some(version) = cursor {
            if !seen.insert(version.version_id.clone()) {
                break;
            }
            chain.push(version);
            cursor = version
                .parent_version_id
                .as_deref()
                .and_then(|id| self.get(id));
        }
        chain.reverse();
        chain
    }

    pub fn save(&self) -> anyhow::Result<()> {
        write_json(&self.path, &serde_json::to_value(self)?)
    }

    fn next_version_id(&self) -> String {
        format!("v{}", self.versions.len())
    }
}

fn instruction_diff(prev: &str, curr: &str) -> Option<Vec<String>> {
    if prev.is_empty() {
        return None;
    }
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    Some(rendered.lines().map(str::to_string).collect())
}

fn settings_diff(
    prev: &Map<String, Value>,
    curr: &Map<String, Value>,
) -> Option<Map<String, Value>> {
    let keys: BTreeSet<&String> = prev.keys().chain(curr.keys()).collect();
    let mut diff = Map::new();
    for key in keys {
        let left = prev.get(key);
        let right = curr.get(key);
        if left != right {
            let mut row = Map::new();
            row.insert("from".to_string(), left.cloned().unwrap_or(Value::Null));
            row.insert("to".to_string(), right.cloned().unwrap_or(Value::Null));
            diff.insert(key.clone(), Value::Object(row));
        }
    }
    if diff.is_empty() {
        return None;
    }
    Some(diff)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn write_json(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::EditHistory;

    fn settings(key: &str, value: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        map
    }

    #[test]
    fn undo_redo_walks_the_tree() {
        let mut history = EditHistory::new("/tmp/unused.json", "shirt.png");
        let v1 = history.add_version("retouch", "remove lint", Map::new(), "v1.png");
        let v2 = history.add_version("expand", "", settings("aspect_ratio", json!("4:5")), "v2.png");
        assert_eq!(v2.parent_version_id.as_deref(), Some(v1.version_id.as_str()));

        assert_eq!(history.undo().map(|v| v.version_id.clone()), Some(v1.version_id.clone()));
        assert_eq!(history.undo().map(|v| v.version_id.clone()), Some("v0".to_string()));
        assert!(history.undo().is_none());
        assert_eq!(history.redo().map(|v| v.version_id.clone()), Some(v1.version_id.clone()));
        assert_eq!(history.redo().map(|v| v.version_id.clone()), Some(v2.version_id));
        assert!(history.redo().is_none());
    }

    #[test]
    fn edit_after_undo_branches_and_redo_follows_newest() {
        let mut history = EditHistory::new("/tmp/unused.json", "shirt.png");
        history.add_version("retouch", "remove lint", Map::new(), "a.png");
        history.undo();
        let branch = history.add_version("pose", "hands in pockets", Map::new(), "b.png");
        assert_eq!(branch.parent_version_id.as_deref(), Some("v0"));
        assert_eq!(history.children("v0").len(), 2);

        history.undo();
        assert_eq!(history.redo().map(|v| v.image_path.clone()), Some("b.png".to_string()));
        let lineage: Vec<&str> = history
            .lineage()
            .iter()
            .map(|v| v.version_id.as_str())
            .collect();
        assert_eq!(lineage, vec!["v0", "v2"]);
    }

    #[test]
    fn history_roundtrips_with_diffs() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("history.json");
        let mut history = EditHistory::new(&path, "shirt.png");
        history.add_version("retouch", "remove lint", settings("model", json!("a")), "a.png");
        history.add_version("retouch", "remove lint\nbrighten", settings("model", json!("b")), "b.png");
        history.save()?;

        let loaded = EditHistory::load(&path)?;
        assert_eq!(loaded.versions.len(), 3);
        assert_eq!(loaded.current_version_id, "v2");
        assert!(loaded.versions[1].instruction_diff.is_none());
        assert!(loaded.versions[2].instruction_diff.is_some());
        assert_eq!(
            loaded.versions[2].settings_diff.as_ref().map(|diff| diff["model"]["to"].clone()),
            Some(json!("b"))
        );
        Ok(())
    }
}
