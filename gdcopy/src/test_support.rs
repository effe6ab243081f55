use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use gdrive_core::{DriveError, DriveFile, FOLDER_MIME_TYPE, FileList, StatusCode};

use crate::remote::store::RemoteStore;
use crate::report::{SyncEvent, SyncObserver};

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl SyncObserver for RecordingObserver {
    fn notify(&self, event: &SyncEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Default)]
struct FakeState {
    files: Vec<DriveFile>,
    next_id: u64,
    calls: HashMap<&'static str, usize>,
    failures: Vec<(&'static str, StatusCode)>,
}

/// In-memory Drive: listing order is `name`, folders first, then creation order.
#[derive(Default)]
pub(crate) struct FakeDrive {
    state: Mutex<FakeState>,
}

impl FakeDrive {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_folder(&self, name: &str, parent: Option<&str>) -> String {
        self.insert(name, FOLDER_MIME_TYPE, None, parent.unwrap_or("root"))
    }

    pub(crate) fn add_file(&self, name: &str, parent: &str, size: u64) -> String {
        self.insert(name, "application/octet-stream", Some(size), parent)
    }

    pub(crate) fn add_parent(&self, id: &str, parent: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(file) = state.files.iter_mut().find(|file| file.id == id) {
            file.parents.push(parent.to_string());
        }
    }

    /// Makes the next call of `op` fail with `status`. Queued per op, in order.
    pub(crate) fn fail_next(&self, op: &'static str, status: StatusCode) {
        self.state.lock().unwrap().failures.push((op, status));
    }

    pub(crate) fn calls(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn file(&self, id: &str) -> Option<DriveFile> {
        let state = self.state.lock().unwrap();
        state.files.iter().find(|file| file.id == id).cloned()
    }

    /// Non-trashed children of `parent` in listing order.
    pub(crate) fn children(&self, parent: &str) -> Vec<DriveFile> {
        let state = self.state.lock().unwrap();
        let mut children: Vec<DriveFile> = state
            .files
            .iter()
            .filter(|file| !file.trashed && file.parents.iter().any(|p| p == parent))
            .cloned()
            .collect();
        children.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| b.is_folder().cmp(&a.is_folder()))
        });
        children
    }

    pub(crate) fn child_names(&self, parent: &str) -> Vec<String> {
        self.children(parent)
            .into_iter()
            .map(|file| file.name)
            .collect()
    }

    pub(crate) fn child_named(&self, parent: &str, name: &str) -> Option<DriveFile> {
        self.children(parent)
            .into_iter()
            .find(|file| file.name == name)
    }

    pub(crate) fn total_files(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    fn insert(&self, name: &str, mime_type: &str, size: Option<u64>, parent: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{:04}", state.next_id);
        state.files.push(DriveFile {
            id: id.clone(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size,
            parents: vec![parent.to_string()],
            trashed: false,
            created_time: None,
        });
        id
    }

    fn begin(&self, op: &'static str) -> Result<(), DriveError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(index) = state.failures.iter().position(|(failing, _)| *failing == op) {
            let (_, status) = state.failures.remove(index);
            return Err(DriveError::Api {
                status,
                body: format!("injected failure for {op}"),
            });
        }
        Ok(())
    }

    fn not_found(id: &str) -> DriveError {
        DriveError::Api {
            status: StatusCode::NOT_FOUND,
            body: format!("File not found: {id}."),
        }
    }

    fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut DriveFile),
    ) -> Result<DriveFile, DriveError> {
        let mut state = self.state.lock().unwrap();
        let file = state
            .files
            .iter_mut()
            .find(|file| file.id == id)
            .ok_or_else(|| Self::not_found(id))?;
        apply(file);
        Ok(file.clone())
    }
}

impl RemoteStore for FakeDrive {
    async fn get_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        self.begin("get_file")?;
        self.file(file_id).ok_or_else(|| Self::not_found(file_id))
    }

    async fn list_children_page(
        &self,
        folder_id: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        self.begin("list_children_page")?;
        let children = self.children(folder_id);
        let offset = page_token
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + page_size as usize).min(children.len());
        Ok(FileList {
            files: children[offset.min(end)..end].to_vec(),
            next_page_token: (end < children.len()).then(|| end.to_string()),
        })
    }

    async fn find_by_name(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<FileList, DriveError> {
        self.begin("find_by_name")?;
        let files = match parent_id {
            Some(parent) => self
                .children(parent)
                .into_iter()
                .filter(|file| file.name == name)
                .collect(),
            None => {
                let state = self.state.lock().unwrap();
                state
                    .files
                    .iter()
                    .filter(|file| !file.trashed && file.name == name)
                    .cloned()
                    .collect()
            }
        };
        Ok(FileList {
            files,
            next_page_token: None,
        })
    }

    async fn create_folder(&self, name: &str) -> Result<DriveFile, DriveError> {
        self.begin("create_folder")?;
        let id = self.add_folder(name, None);
        self.file(&id).ok_or_else(|| Self::not_found(&id))
    }

    async fn copy_file(
        &self,
        file_id: &str,
        name: &str,
        parent_id: &str,
    ) -> Result<DriveFile, DriveError> {
        self.begin("copy_file")?;
        let source = self.file(file_id).ok_or_else(|| Self::not_found(file_id))?;
        let id = self.insert(name, &source.mime_type, source.size, parent_id);
        self.file(&id).ok_or_else(|| Self::not_found(&id))
    }

    async fn update_parents(
        &self,
        file_id: &str,
        add_parent: &str,
        remove_parents: &[String],
    ) -> Result<DriveFile, DriveError> {
        self.begin("update_parents")?;
        self.update(file_id, |file| {
            file.parents.retain(|parent| !remove_parents.contains(parent));
            if !file.parents.iter().any(|parent| parent == add_parent) {
                file.parents.push(add_parent.to_string());
            }
        })
    }

    async fn trash_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        self.begin("trash_file")?;
        self.update(file_id, |file| file.trashed = true)
    }

    async fn download_to_path(&self, file_id: &str, target: &Path) -> Result<u64, DriveError> {
        self.begin("download_to_path")?;
        let file = self.file(file_id).ok_or_else(|| Self::not_found(file_id))?;
        let content = format!("content of {}", file.name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, content.as_bytes()).await?;
        Ok(content.len() as u64)
    }
}
