//! Resource Manager (§4.7): filesystem↔store sync for prompt-augmenting
//! resources (design docs, guardrails, standards), optimistic-locked edits,
//! and version history.
//!
//! The optimistic-lock and snapshot logic lives in `projectstore::ProjectStore`
//! (`update_workflow_resource`, `restore_resource_version`); this module is
//! the filesystem-facing half: directory layout, mtime-based sync, and
//! file-level safety checks (symlinks, empty files, oversized files).

use std::fs;
use std::path::{Path, PathBuf};

use projectstore::{
    NewResource, ProjectStore, Resource, ResourceEdit, ResourceFilter, ResourceType, ResourceUpdateOutcome,
    ResourceVersion, StoreError,
};
use thiserror::Error;

/// Resource files larger than this are rejected during sync and load (§4.7 "File-level safety").
pub const MAX_RESOURCE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("resource file {0} is a symlink, refusing to sync")]
    SymlinkRejected(PathBuf),
    #[error("resource file {0} is empty")]
    EmptyFile(PathBuf),
    #[error("resource file {0} exceeds max size ({1} bytes > {2})")]
    TooLarge(PathBuf, u64, u64),
    #[error("resource {0} not found")]
    NotFound(String),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

/// One filesystem change discovered by a sync pass.
#[derive(Debug, Clone)]
pub enum SyncChange {
    Added(String),
    Updated(String),
    Removed(String),
}

pub struct ResourceManager<'a> {
    store: &'a ProjectStore,
    project_root: PathBuf,
}

impl<'a> ResourceManager<'a> {
    pub fn new(store: &'a ProjectStore, project_root: impl Into<PathBuf>) -> Self {
        Self { store, project_root: project_root.into() }
    }

    fn resources_dir(&self) -> PathBuf {
        self.project_root.join(".ralphx").join("resources")
    }

    fn file_path(resources_dir: &Path, resource_type: ResourceType, name: &str) -> PathBuf {
        resources_dir.join(resource_type.as_str()).join(format!("{name}.md"))
    }

    /// Validates a resource file against the file-level safety rules (§4.7):
    /// symlinks, empty files, and oversized files are all rejected outright.
    fn check_file_safety(path: &Path) -> ResourceResult<u64> {
        let meta = fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Err(ResourceError::SymlinkRejected(path.to_path_buf()));
        }
        let size = meta.len();
        if size == 0 {
            return Err(ResourceError::EmptyFile(path.to_path_buf()));
        }
        if size > MAX_RESOURCE_BYTES {
            return Err(ResourceError::TooLarge(path.to_path_buf(), size, MAX_RESOURCE_BYTES));
        }
        Ok(size)
    }

    /// Bidirectional sync between `<project>/.ralphx/resources/` and the store
    /// (§4.7 "Sync"). Idempotent: running twice with no filesystem changes in
    /// between produces no further `SyncChange`s.
    pub fn sync(&self) -> ResourceResult<Vec<SyncChange>> {
        let dir = self.resources_dir();
        let mut changes = Vec::new();
        let known = self.store.list_resources(&ResourceFilter::default())?;

        let mut seen_paths = std::collections::HashSet::new();

        for resource_type in [
            ResourceType::DesignDoc,
            ResourceType::Architecture,
            ResourceType::CodingStandards,
            ResourceType::DomainKnowledge,
            ResourceType::Custom,
        ] {
            let type_dir = dir.join(resource_type.as_str());
            if !type_dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&type_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let name = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(n) => n.to_string(),
                    None => continue,
                };

                let safety = Self::check_file_safety(&path);
                seen_paths.insert(path.clone());

                let existing = known.iter().find(|r| r.name == name && r.resource_type == resource_type);
                match (existing, safety) {
                    (None, Ok(_)) => {
                        let content = fs::read_to_string(&path)?;
                        self.store.create_resource(NewResource {
                            name: name.clone(),
                            resource_type,
                            file_path: path.to_string_lossy().to_string(),
                            injection_position: Default::default(),
                            enabled: true,
                            inherit_default: true,
                            priority: 100,
                        })?;
                        let _ = content;
                        changes.push(SyncChange::Added(name));
                    }
                    (Some(resource), Ok(_)) => {
                        let file_mtime = fs::metadata(&path)?.modified().ok();
                        let row_updated = resource.updated_at;
                        let is_newer = file_mtime
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_secs() as i64 > row_updated)
                            .unwrap_or(false);
                        if is_newer {
                            let content = fs::read_to_string(&path)?;
                            self.store.update_workflow_resource(
                                resource.id,
                                ResourceEdit {
                                    content: Some(content),
                                    expected_updated_at: Some(resource.updated_at),
                                    ..Default::default()
                                },
                            )?;
                            changes.push(SyncChange::Updated(name));
                        }
                    }
                    (_, Err(err)) => {
                        tracing::warn!(path = %path.display(), error = %err, "resource sync: skipping unsafe file");
                    }
                }
            }
        }

        for resource in &known {
            let path = PathBuf::from(&resource.file_path);
            if !seen_paths.contains(&path) && !path.exists() {
                self.store.delete_resource(resource.id)?;
                changes.push(SyncChange::Removed(resource.name.clone()));
            }
        }

        Ok(changes)
    }

    pub fn list(&self, filter: &ResourceFilter) -> ResourceResult<Vec<Resource>> {
        Ok(self.store.list_resources(filter)?)
    }

    pub fn get(&self, name: &str) -> ResourceResult<Resource> {
        self.store.get_resource_by_name(name)?.ok_or_else(|| ResourceError::NotFound(name.to_string()))
    }

    pub fn load_content(&self, resource: &Resource) -> ResourceResult<String> {
        let path = Path::new(&resource.file_path);
        Self::check_file_safety(path)?;
        Ok(fs::read_to_string(path)?)
    }

    /// Creates a brand-new resource on disk and in the store.
    pub fn create(&self, resource_type: ResourceType, name: &str, content: &str) -> ResourceResult<Resource> {
        let dir = self.resources_dir().join(resource_type.as_str());
        fs::create_dir_all(&dir)?;
        let path = Self::file_path(&self.resources_dir(), resource_type, name);
        fs::write(&path, content)?;
        Ok(self.store.create_resource(NewResource {
            name: name.to_string(),
            resource_type,
            file_path: path.to_string_lossy().to_string(),
            injection_position: Default::default(),
            enabled: true,
            inherit_default: true,
            priority: 100,
        })?)
    }

    /// Optimistic-locked edit (§4.7 "Edit with optimistic concurrency"). On
    /// success the new content (if any) is also written to disk so the store
    /// and filesystem never disagree about live content.
    pub fn edit(&self, id: i64, edit: ResourceEdit) -> ResourceResult<ResourceUpdateOutcome> {
        let outcome = self.store.update_workflow_resource(id, edit.clone())?;
        if let ResourceUpdateOutcome::Updated(resource) = &outcome
            && let Some(content) = &edit.content
        {
            fs::write(&resource.file_path, content)?;
        }
        Ok(outcome)
    }

    pub fn versions(&self, resource_id: i64) -> ResourceResult<Vec<ResourceVersion>> {
        Ok(self.store.list_resource_versions(resource_id)?)
    }

    /// Restores a resource to a prior version (§4.7 "Versioning"): snapshots
    /// the current row first, then overwrites content from the chosen version.
    pub fn restore(&self, resource_id: i64, version_id: i64) -> ResourceResult<Resource> {
        let restored = self
            .store
            .restore_resource_version(resource_id, version_id)?
            .ok_or_else(|| ResourceError::NotFound(format!("resource {resource_id} version {version_id}")))?;
        fs::write(&restored.file_path, &restored_content(self.store, resource_id, version_id)?)?;
        Ok(restored)
    }
}

fn restored_content(store: &ProjectStore, resource_id: i64, version_id: i64) -> ResourceResult<String> {
    let versions = store.list_resource_versions(resource_id)?;
    versions
        .into_iter()
        .find(|v| v.id == version_id)
        .map(|v| v.content)
        .ok_or_else(|| ResourceError::NotFound(format!("resource {resource_id} version {version_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use projectstore::ProjectStore;
    use tempfile::tempdir;

    fn store() -> ProjectStore {
        ProjectStore::open_in_memory().expect("open store")
    }

    #[test]
    fn sync_discovers_new_files() {
        let dir = tempdir().unwrap();
        let design_dir = dir.path().join(".ralphx/resources/design_doc");
        fs::create_dir_all(&design_dir).unwrap();
        fs::write(design_dir.join("architecture.md"), "# Architecture\n\nDetails.").unwrap();

        let store = store();
        let manager = ResourceManager::new(&store, dir.path());
        let changes = manager.sync().unwrap();
        assert!(matches!(&changes[..], [SyncChange::Added(name)] if name == "architecture"));

        let again = manager.sync().unwrap();
        assert!(again.is_empty(), "second sync pass must be a no-op");
    }

    #[test]
    fn sync_rejects_empty_files() {
        let dir = tempdir().unwrap();
        let custom_dir = dir.path().join(".ralphx/resources/custom");
        fs::create_dir_all(&custom_dir).unwrap();
        fs::write(custom_dir.join("blank.md"), "").unwrap();

        let store = store();
        let manager = ResourceManager::new(&store, dir.path());
        let changes = manager.sync().unwrap();
        assert!(changes.is_empty());
        assert!(manager.get("blank").is_err());
    }

    #[test]
    fn create_then_edit_round_trips_content() {
        let dir = tempdir().unwrap();
        let store = store();
        let manager = ResourceManager::new(&store, dir.path());
        let resource = manager.create(ResourceType::Custom, "guardrails", "be careful").unwrap();

        let outcome = manager
            .edit(
                resource.id,
                ResourceEdit {
                    content: Some("be very careful".into()),
                    expected_updated_at: Some(resource.updated_at),
                    ..Default::default()
                },
            )
            .unwrap();

        let ResourceUpdateOutcome::Updated(updated) = outcome else { panic!("expected update") };
        assert_eq!(manager.load_content(&updated).unwrap(), "be very careful");
        assert_eq!(manager.versions(resource.id).unwrap().len(), 1);
    }
}
