//! JSON-file result cache keyed by a stable hash of everything that
//! influences a generation. Re-running a batch consults it so finished
//! products are not paid for twice.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct ResultCache {
    path: PathBuf,
    payload: Map<String, Value>,
    dirty_keys: Vec<String>,
}

impl ResultCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: Map::new(),
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file first so writes from other processes are visible.
    pub fn get(&mut self, key: &str) -> Option<Map<String, Value>> {
        self.refresh();
        self.payload.get(key).and_then(Value::as_object).cloned()
    }

    /// Cached entry whose `image_path` still exists on disk.
    pub fn get_existing_output(&mut self, key: &str) -> Option<Map<String, Value>> {
        let entry = self.get(key)?;
        let image_path = entry.get("image_path").and_then(Value::as_str)?;
        if Path::new(image_path).is_file() {
            return Some(entry);
        }
        None
    }

    pub fn set(&mut self, key: &str, value: Map<String, Value>) -> anyhow::Result<()> {
        self.refresh();
        let snapshot = Value::Object(value);
        if self.payload.get(key) == Some(&snapshot) {
            return Ok(());
        }
        self.payload.insert(key.to_string(), snapshot);
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        self.refresh();
        if self.payload.remove(key).is_none() {
            return Ok(());
        }
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        on_disk.remove(key);
        write_json_object(&self.path, &on_disk)?;
        self.payload = on_disk;
        Ok(())
    }

    /// Merges only the keys this instance changed into what is on disk.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = self.payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = on_disk;
        self.dirty_keys.clear();
        Ok(())
    }

    fn refresh(&mut self) {
        let mut fresh = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = self.payload.get(key) {
                fresh.insert(key.clone(), value.clone());
            }
        }
        self.payload = fresh;
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::ResultCache;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn set_then_get() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut cache = ResultCache::new(temp.path().join("cache.json"));
        cache.set("key", obj(json!({"value": 1})))?;
        assert_eq!(cache.get("key"), Some(obj(json!({"value": 1}))));
        Ok(())
    }

    #[test]
    fn merges_with_concurrent_writer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache_a = ResultCache::new(&path);
        let mut cache_b = ResultCache::new(&path);

        cache_a.set("a", obj(json!({"value": 1})))?;
        cache_b.set("b", obj(json!({"value": 2})))?;
        cache_a.set("c", obj(json!({"value": 3})))?;

        let mut reloaded = ResultCache::new(path);
        assert_eq!(reloaded.get("a"), Some(obj(json!({"value": 1}))));
        assert_eq!(reloaded.get("b"), Some(obj(json!({"value": 2}))));
        assert_eq!(reloaded.get("c"), Some(obj(json!({"value": 3}))));
        Ok(())
    }

    #[test]
    fn existing_output_requires_file_on_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = temp.path().join("out.png");
        let mut cache = ResultCache::new(temp.path().join("cache.json"));
        cache.set(
            "hit",
            obj(json!({"image_path": image.to_string_lossy().to_string()})),
        )?;
        assert!(cache.get_existing_output("hit").is_none());

        std::fs::write(&image, b"png")?;
        assert!(cache.get_existing_output("hit").is_some());

        cache.remove("hit")?;
        assert!(cache.get("hit").is_none());
        Ok(())
    }
}
