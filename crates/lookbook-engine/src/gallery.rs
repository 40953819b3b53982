//! Per-user folder/file tree. The manifest lives in `gallery.json`; file
//! bytes live under `blobs/`. Deletes are soft until the trash is purged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use lookbook_contracts::events::EventWriter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::data_url::DataUrl;
use crate::util::{extension_for_mime, map_object, mime_for_path, now_utc_iso, write_json};

pub const ROOT_ID: &str = "root";
pub const TRASH_ID: &str = "trash";
pub const MANIFEST_FILE: &str = "gallery.json";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    Folder,
    File {
        blob: String,
        mime: String,
        size: u64,
        #[serde(default)]
        meta: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub id: String,
    pub name: String,
    /// Containing folder; `None` only for the root and trash folders.
    pub parent_id: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub trashed_from: Option<String>,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl GalleryEntry {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, EntryKind::Folder)
    }

    fn folder(id: &str, name: &str, parent_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
            created_at: now_utc_iso(),
            trashed_from: None,
            kind: EntryKind::Folder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub entry: GalleryEntry,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    schema_version: u64,
    entries: BTreeMap<String, GalleryEntry>,
}

pub struct GalleryStore {
    root: PathBuf,
    manifest: Manifest,
    events: EventWriter,
}

impl GalleryStore {
    pub fn open(root: impl Into<PathBuf>, events: EventWriter) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(BLOBS_DIR))
            .with_context(|| format!("failed creating gallery at {}", root.display()))?;
        let manifest_path = root.join(MANIFEST_FILE);
        let mut manifest = if manifest_path.is_file() {
            let raw = std::fs::read_to_string(&manifest_path)
                .with_context(|| format!("failed reading {}", manifest_path.display()))?;
            serde_json::from_str::<Manifest>(&raw)
                .with_context(|| format!("invalid gallery manifest {}", manifest_path.display()))?
        } else {
            Manifest::default()
        };
        manifest.schema_version = 1;
        manifest
            .entries
            .entry(ROOT_ID.to_string())
            .or_insert_with(|| GalleryEntry::folder(ROOT_ID, "", None));
        manifest
            .entries
            .entry(TRASH_ID.to_string())
            .or_insert_with(|| GalleryEntry::folder(TRASH_ID, ".trash", None));
        let store = Self {
            root,
            manifest,
            events,
        };
        store.save()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, id: &str) -> Option<&GalleryEntry> {
        self.manifest.entries.get(id)
    }

    pub fn create_folder(&mut self, parent_id: &str, name: &str) -> Result<GalleryEntry> {
        let name = validate_name(name)?;
        self.require_live_folder(parent_id)?;
        self.require_free_name(parent_id, &name, None)?;
        let entry = GalleryEntry::folder(&new_id(), &name, Some(parent_id));
        self.insert(entry, "folder_created")
    }

    pub fn import_file(
        &mut self,
        folder_id: &str,
        path: &Path,
        meta: Map<String, Value>,
    ) -> Result<GalleryEntry> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime = mime_for_path(path)
            .map(str::to_string)
            .or_else(|| {
                image::guess_format(&bytes)
                    .ok()
                    .map(|format| format.to_mime_type().to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("upload")
            .to_string();
        self.store_blob(folder_id, &name, &mime, bytes, meta)
    }

    pub fn import_data_url(
        &mut self,
        folder_id: &str,
        name: &str,
        image: &DataUrl,
        meta: Map<String, Value>,
    ) -> Result<GalleryEntry> {
        let name = if Path::new(name).extension().is_some() {
            name.to_string()
        } else {
            format!("{}.{}", name.trim(), image.extension())
        };
        self.store_blob(folder_id, &name, &image.mime, image.bytes.clone(), meta)
    }

    /// Folders first, then files, each by name.
    pub fn list(&self, folder_id: &str) -> Result<Vec<&GalleryEntry>> {
        let Some(folder) = self.get(folder_id) else {
            bail!("no such folder: {folder_id}");
        };
        if !folder.is_folder() {
            bail!("{} is not a folder", folder.name);
        }
        let mut children = self.children(folder_id);
        children.sort_by(|left, right| {
            right
                .is_folder()
                .cmp(&left.is_folder())
                .then_with(|| left.name.to_lowercase().cmp(&right.name.to_lowercase()))
        });
        Ok(children)
    }

    /// The root tree followed by the trash tree.
    pub fn tree(&self) -> Vec<TreeNode> {
        [ROOT_ID, TRASH_ID]
            .iter()
            .filter_map(|id| self.subtree(id))
            .collect()
    }

    pub fn rename(&mut self, id: &str, new_name: &str) -> Result<GalleryEntry> {
        require_unreserved(id)?;
        let name = validate_name(new_name)?;
        let parent_id = self.require_entry(id)?.parent_id.clone().unwrap_or_default();
        self.require_free_name(&parent_id, &name, Some(id))?;
        let entry = self.entry_mut(id)?;
        entry.name = name;
        let updated = entry.clone();
        self.commit(&updated, "renamed")?;
        Ok(updated)
    }

    pub fn move_entry(&mut self, id: &str, new_parent_id: &str) -> Result<GalleryEntry> {
        require_unreserved(id)?;
        if new_parent_id == TRASH_ID {
            bail!("use delete to move items into the trash");
        }
        let entry = self.require_entry(id)?.clone();
        if self.is_in_trash(id) {
            bail!("{} is in the trash; restore it first", entry.name);
        }
        self.require_live_folder(new_parent_id)?;
        if id == new_parent_id || self.is_ancestor(id, new_parent_id) {
            bail!("cannot move {} into itself", entry.name);
        }
        self.require_free_name(new_parent_id, &entry.name, Some(id))?;
        let moved = self.entry_mut(id)?;
        moved.parent_id = Some(new_parent_id.to_string());
        let updated = moved.clone();
        self.commit(&updated, "moved")?;
        Ok(updated)
    }

    /// Soft delete: moves the entry into the trash and remembers where it was.
    pub fn delete(&mut self, id: &str) -> Result<GalleryEntry> {
        require_unreserved(id)?;
        if self.is_in_trash(id) {
            bail!("{id} is already in the trash");
        }
        let entry = self.entry_mut(id)?;
        entry.trashed_from = entry.parent_id.take();
        entry.parent_id = Some(TRASH_ID.to_string());
        let updated = entry.clone();
        self.commit(&updated, "trashed")?;
        Ok(updated)
    }

    /// Returns an entry from the trash to its old folder, or to the root
    /// when that folder is gone or itself trashed.
    pub fn restore(&mut self, id: &str) -> Result<GalleryEntry> {
        let entry = self.require_entry(id)?.clone();
        if entry.parent_id.as_deref() != Some(TRASH_ID) {
            bail!("{} is not in the trash", entry.name);
        }
        let target = entry
            .trashed_from
            .as_deref()
            .filter(|parent| {
                self.get(parent).is_some_and(GalleryEntry::is_folder) && !self.is_in_trash(parent)
            })
            .unwrap_or(ROOT_ID)
            .to_string();
        let name = self.free_name(&target, &entry.name, Some(id));
        let restored = self.entry_mut(id)?;
        restored.parent_id = Some(target);
        restored.trashed_from = None;
        restored.name = name;
        let updated = restored.clone();
        self.commit(&updated, "restored")?;
        Ok(updated)
    }

    /// Hard delete of a trashed entry and everything under it. Returns the
    /// number of entries removed.
    pub fn purge(&mut self, id: &str) -> Result<usize> {
        let entry = self.require_entry(id)?.clone();
        if entry.parent_id.as_deref() != Some(TRASH_ID) {
            bail!("{} must be deleted before it can be purged", entry.name);
        }
        let mut doomed = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let children: Vec<String> = self
                .children(&doomed[cursor])
                .into_iter()
                .map(|child| child.id.clone())
                .collect();
            doomed.extend(children);
            cursor += 1;
        }
        let blob_paths: Vec<PathBuf> = doomed
            .iter()
            .filter_map(|doomed_id| match &self.get(doomed_id)?.kind {
                EntryKind::File { blob, .. } => Some(self.root.join(BLOBS_DIR).join(blob)),
                EntryKind::Folder => None,
            })
            .collect();
        let mut entries = self.manifest.entries.clone();
        for doomed_id in &doomed {
            entries.remove(doomed_id);
        }
        let kept = std::mem::replace(&mut self.manifest.entries, entries);
        if let Err(err) = self.save() {
            self.manifest.entries = kept;
            return Err(err);
        }
        for blob_path in blob_paths {
            match std::fs::remove_file(&blob_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed removing {}", blob_path.display()))
                }
            }
        }
        self.announce(&entry, "purged")?;
        Ok(doomed.len())
    }

    pub fn empty_trash(&mut self) -> Result<usize> {
        let trashed: Vec<String> = self
            .children(TRASH_ID)
            .into_iter()
            .map(|entry| entry.id.clone())
            .collect();
        let mut removed = 0;
        for id in trashed {
            removed += self.purge(&id)?;
        }
        Ok(removed)
    }

    /// Slash-separated path from the root; trashed items live under `/.trash`.
    pub fn resolve_path(&self, id: &str) -> Result<String> {
        let mut names = Vec::new();
        let mut cursor = Some(self.require_entry(id)?);
        while let Some(entry) = cursor {
            if entry.id == ROOT_ID {
                break;
            }
            names.push(entry.name.clone());
            if names.len() > self.manifest.entries.len() {
                bail!("gallery manifest has a cycle at {id}");
            }
            cursor = entry.parent_id.as_deref().and_then(|parent| self.get(parent));
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Looks up an entry by slash path from the root (`/` is the root).
    pub fn find_by_path(&self, path: &str) -> Option<&GalleryEntry> {
        let mut current = self.get(ROOT_ID)?;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current = if segment == ".trash" && current.id == ROOT_ID {
                self.get(TRASH_ID)?
            } else {
                self.find_child(&current.id, segment)?
            };
        }
        Some(current)
    }

    pub fn read_bytes(&self, id: &str) -> Result<Vec<u8>> {
        let entry = self.require_entry(id)?;
        let EntryKind::File { blob, .. } = &entry.kind else {
            bail!("{} is a folder", entry.name);
        };
        let path = self.root.join(BLOBS_DIR).join(blob);
        std::fs::read(&path).with_context(|| format!("failed reading {}", path.display()))
    }

    /// Walks `names` from the root, creating missing folders, and returns the
    /// id of the last one.
    pub fn ensure_folder_path(&mut self, names: &[&str]) -> Result<String> {
        let mut parent = ROOT_ID.to_string();
        for name in names {
            let name = validate_name(name)?;
            parent = match self.find_child(&parent, &name) {
                Some(existing) if existing.is_folder() => existing.id.clone(),
                Some(existing) => bail!("{} is a file, not a folder", existing.name),
                None => self.create_folder(&parent, &name)?.id,
            };
        }
        Ok(parent)
    }

    fn store_blob(
        &mut self,
        folder_id: &str,
        name: &str,
        mime: &str,
        bytes: Vec<u8>,
        meta: Map<String, Value>,
    ) -> Result<GalleryEntry> {
        let name = validate_name(name)?;
        self.require_live_folder(folder_id)?;
        let name = self.free_name(folder_id, &name, None);
        let id = new_id();
        let blob = format!("{id}.{}", extension_for_mime(mime));
        let blob_path = self.root.join(BLOBS_DIR).join(&blob);
        std::fs::write(&blob_path, &bytes)
            .with_context(|| format!("failed writing {}", blob_path.display()))?;
        let entry = GalleryEntry {
            id,
            name,
            parent_id: Some(folder_id.to_string()),
            created_at: now_utc_iso(),
            trashed_from: None,
            kind: EntryKind::File {
                blob,
                mime: mime.to_string(),
                size: bytes.len() as u64,
                meta,
            },
        };
        self.insert(entry, "file_imported")
    }

    fn insert(&mut self, entry: GalleryEntry, action: &str) -> Result<GalleryEntry> {
        self.manifest
            .entries
            .insert(entry.id.clone(), entry.clone());
        self.commit(&entry, action)?;
        Ok(entry)
    }

    fn commit(&self, entry: &GalleryEntry, action: &str) -> Result<()> {
        self.save()?;
        self.announce(entry, action)
    }

    fn announce(&self, entry: &GalleryEntry, action: &str) -> Result<()> {
        self.events.emit(
            "gallery_changed",
            map_object(json!({
                "action": action,
                "id": entry.id,
                "name": entry.name,
                "parent_id": entry.parent_id,
            })),
        )?;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        write_json(
            &self.root.join(MANIFEST_FILE),
            &serde_json::to_value(&self.manifest)?,
        )
    }

    fn children(&self, parent_id: &str) -> Vec<&GalleryEntry> {
        self.manifest
            .entries
            .values()
            .filter(|entry| entry.parent_id.as_deref() == Some(parent_id))
            .collect()
    }

    fn find_child(&self, parent_id: &str, name: &str) -> Option<&GalleryEntry> {
        self.children(parent_id)
            .into_iter()
            .find(|entry| entry.name == name)
    }

    fn subtree(&self, id: &str) -> Option<TreeNode> {
        let entry = self.get(id)?.clone();
        let children = self
            .list(id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|child| self.subtree(&child.id))
            .collect();
        Some(TreeNode { entry, children })
    }

    fn require_entry(&self, id: &str) -> Result<&GalleryEntry> {
        self.get(id)
            .with_context(|| format!("no such gallery entry: {id}"))
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut GalleryEntry> {
        self.manifest
            .entries
            .get_mut(id)
            .with_context(|| format!("no such gallery entry: {id}"))
    }

    fn require_live_folder(&self, id: &str) -> Result<()> {
        let entry = self.require_entry(id)?;
        if !entry.is_folder() {
            bail!("{} is not a folder", entry.name);
        }
        if id == TRASH_ID || self.is_in_trash(id) {
            bail!("cannot add items to the trash");
        }
        Ok(())
    }

    fn require_free_name(&self, parent_id: &str, name: &str, except: Option<&str>) -> Result<()> {
        if let Some(existing) = self.find_child(parent_id, name) {
            if Some(existing.id.as_str()) != except {
                bail!("an item named '{name}' already exists here");
            }
        }
        Ok(())
    }

    /// `name`, or `stem (n).ext` with the first free `n`.
    fn free_name(&self, parent_id: &str, name: &str, except: Option<&str>) -> String {
        let taken = |candidate: &str| {
            self.find_child(parent_id, candidate)
                .is_some_and(|existing| Some(existing.id.as_str()) != except)
        };
        if !taken(name) {
            return name.to_string();
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
            _ => (name, String::new()),
        };
        let mut counter = 2;
        loop {
            let candidate = format!("{stem} ({counter}){ext}");
            if !taken(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    fn is_in_trash(&self, id: &str) -> bool {
        self.is_ancestor(TRASH_ID, id)
    }

    /// True when `ancestor` appears strictly above `id`.
    fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut cursor = self.get(id).and_then(|entry| entry.parent_id.clone());
        let mut steps = 0;
        while let Some(parent) = cursor {
            if parent == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.manifest.entries.len() {
                return false;
            }
            cursor = self.get(&parent).and_then(|entry| entry.parent_id.clone());
        }
        false
    }
}

fn require_unreserved(id: &str) -> Result<()> {
    if id == ROOT_ID || id == TRASH_ID {
        bail!("the {id} folder cannot be changed");
    }
    Ok(())
}

fn validate_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.contains('/') || name == "." || name == ".." {
        bail!("invalid name '{name}'");
    }
    Ok(name.to_string())
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use lookbook_contracts::events::{read_events, EventWriter};
    use serde_json::{Map, Value};

    use super::{EntryKind, GalleryStore, ROOT_ID, TRASH_ID};
    use crate::data_url::DataUrl;

    fn store(root: &std::path::Path) -> anyhow::Result<GalleryStore> {
        GalleryStore::open(
            root.join("gallery"),
            EventWriter::new(root.join("events.jsonl"), "gallery-test"),
        )
    }

    #[test]
    fn folders_nest_and_names_stay_unique() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut gallery = store(temp.path())?;
        let spring = gallery.create_folder(ROOT_ID, " Spring ")?;
        assert_eq!(spring.name, "Spring");
        let shirts = gallery.create_folder(&spring.id, "Shirts")?;
        assert!(gallery.create_folder(ROOT_ID, "Spring").is_err());
        assert!(gallery.create_folder(ROOT_ID, "a/b").is_err());
        assert!(gallery.create_folder(ROOT_ID, "   ").is_err());
        assert!(gallery.create_folder(TRASH_ID, "x").is_err());

        assert_eq!(gallery.resolve_path(&shirts.id)?, "/Spring/Shirts");
        assert!(gallery.move_entry(&spring.id, &shirts.id).is_err());
        assert!(gallery.move_entry(&spring.id, &spring.id).is_err());
        assert!(gallery.rename(ROOT_ID, "top").is_err());
        assert!(gallery.delete(TRASH_ID).is_err());

        let renamed = gallery.rename(&shirts.id, "Tops")?;
        assert_eq!(gallery.resolve_path(&renamed.id)?, "/Spring/Tops");
        assert_eq!(gallery.find_by_path("/Spring/Tops").map(|e| e.id.clone()), Some(shirts.id));

        let reopened = store(temp.path())?;
        assert_eq!(reopened.list(&spring.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn imports_store_blobs_and_avoid_name_clashes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut gallery = store(temp.path())?;
        let source = temp.path().join("look.png");
        std::fs::write(&source, [137, 80, 78, 71])?;

        let first = gallery.import_file(ROOT_ID, &source, Map::new())?;
        let second = gallery.import_file(ROOT_ID, &source, Map::new())?;
        assert_eq!(first.name, "look.png");
        assert_eq!(second.name, "look (2).png");
        assert_eq!(gallery.read_bytes(&first.id)?, vec![137, 80, 78, 71]);

        let data = DataUrl::new("image/png", vec![1, 2, 3]);
        let from_url = gallery.import_data_url(ROOT_ID, "generated", &data, Map::new())?;
        assert_eq!(from_url.name, "generated.png");
        assert!(gallery.read_bytes(ROOT_ID).is_err());

        let folder = gallery.ensure_folder_path(&["Batch A", "TS1001"])?;
        assert_eq!(gallery.ensure_folder_path(&["Batch A", "TS1001"])?, folder);
        assert_eq!(gallery.resolve_path(&folder)?, "/Batch A/TS1001");
        let names: Vec<String> = gallery.list(ROOT_ID)?.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names[0], "Batch A");
        Ok(())
    }

    #[test]
    fn delete_restore_and_purge() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut gallery = store(temp.path())?;
        let folder = gallery.create_folder(ROOT_ID, "Drafts")?;
        let source = temp.path().join("a.png");
        std::fs::write(&source, [1])?;
        let file = gallery.import_file(&folder.id, &source, Map::new())?;

        let trashed = gallery.delete(&file.id)?;
        assert_eq!(trashed.parent_id.as_deref(), Some(TRASH_ID));
        assert_eq!(trashed.trashed_from.as_deref(), Some(folder.id.as_str()));
        assert!(gallery.delete(&file.id).is_err());
        assert!(gallery.move_entry(&file.id, ROOT_ID).is_err());
        let restored = gallery.restore(&file.id)?;
        assert_eq!(restored.parent_id.as_deref(), Some(folder.id.as_str()));
        assert!(gallery.restore(&file.id).is_err());

        gallery.delete(&file.id)?;
        gallery.delete(&folder.id)?;
        let orphan = gallery.restore(&file.id)?;
        assert_eq!(orphan.parent_id.as_deref(), Some(ROOT_ID));

        gallery.delete(&orphan.id)?;
        assert!(gallery.purge(&folder.id).is_ok());
        assert_eq!(gallery.empty_trash()?, 1);
        assert!(gallery.list(TRASH_ID)?.is_empty());
        let blobs = std::fs::read_dir(gallery.root().join("blobs"))?.count();
        assert_eq!(blobs, 0);

        let changes = read_events(&temp.path().join("events.jsonl"))?
            .iter()
            .filter(|row| row.get("type").and_then(Value::as_str) == Some("gallery_changed"))
            .count();
        assert!(changes >= 8);
        Ok(())
    }

    #[test]
    fn purge_saves_manifest_before_removing_blobs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut gallery = store(temp.path())?;
        let source = temp.path().join("a.png");
        std::fs::write(&source, [1])?;
        let file = gallery.import_file(ROOT_ID, &source, Map::new())?;
        let EntryKind::File { blob, .. } = &file.kind else {
            anyhow::bail!("imported entry should be a file");
        };
        let blob_path = gallery.root().join("blobs").join(blob);
        std::fs::remove_file(&blob_path)?;
        std::fs::create_dir(&blob_path)?;
        std::fs::write(blob_path.join("keep"), [0])?;

        gallery.delete(&file.id)?;
        assert!(gallery.purge(&file.id).is_err());
        assert!(gallery.get(&file.id).is_none());
        assert!(store(temp.path())?.get(&file.id).is_none());
        Ok(())
    }
}
