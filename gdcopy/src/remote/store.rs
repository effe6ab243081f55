use std::path::Path;

use gdrive_core::{DriveClient, DriveError, DriveFile, FileList};
use tracing::debug;

use super::executor::{CallError, RemoteOp, ResilientCaller};

pub type StoreError = CallError<DriveError>;

const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Raw remote capabilities. Each method is exactly one API request.
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    async fn get_file(&self, file_id: &str) -> Result<DriveFile, DriveError>;

    async fn list_children_page(
        &self,
        folder_id: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError>;

    async fn find_by_name(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<FileList, DriveError>;

    async fn create_folder(&self, name: &str) -> Result<DriveFile, DriveError>;

    async fn copy_file(
        &self,
        file_id: &str,
        name: &str,
        parent_id: &str,
    ) -> Result<DriveFile, DriveError>;

    async fn update_parents(
        &self,
        file_id: &str,
        add_parent: &str,
        remove_parents: &[String],
    ) -> Result<DriveFile, DriveError>;

    async fn trash_file(&self, file_id: &str) -> Result<DriveFile, DriveError>;

    async fn download_to_path(&self, file_id: &str, target: &Path) -> Result<u64, DriveError>;
}

impl RemoteStore for DriveClient {
    async fn get_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        DriveClient::get_file(self, file_id).await
    }

    async fn list_children_page(
        &self,
        folder_id: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        DriveClient::list_children_page(self, folder_id, page_size, page_token).await
    }

    async fn find_by_name(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<FileList, DriveError> {
        DriveClient::find_by_name(self, name, parent_id).await
    }

    async fn create_folder(&self, name: &str) -> Result<DriveFile, DriveError> {
        DriveClient::create_folder(self, name).await
    }

    async fn copy_file(
        &self,
        file_id: &str,
        name: &str,
        parent_id: &str,
    ) -> Result<DriveFile, DriveError> {
        DriveClient::copy_file(self, file_id, name, parent_id).await
    }

    async fn update_parents(
        &self,
        file_id: &str,
        add_parent: &str,
        remove_parents: &[String],
    ) -> Result<DriveFile, DriveError> {
        DriveClient::update_parents(self, file_id, add_parent, remove_parents).await
    }

    async fn trash_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        DriveClient::trash_file(self, file_id).await
    }

    async fn download_to_path(&self, file_id: &str, target: &Path) -> Result<u64, DriveError> {
        DriveClient::download_to_path(self, file_id, target).await
    }
}

/// Typed operations over a [`RemoteStore`]; every request goes through the
/// resilient caller.
pub struct StoreClient<S> {
    store: S,
    caller: ResilientCaller,
    page_size: u32,
}

impl<S: RemoteStore> StoreClient<S> {
    pub fn new(store: S, caller: ResilientCaller) -> Self {
        Self {
            store,
            caller,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn caller(&self) -> &ResilientCaller {
        &self.caller
    }

    /// Fetches metadata for `id`; an id that does not resolve yields `None`.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<DriveFile>, StoreError> {
        match self
            .caller
            .execute(RemoteOp::GetFile, || self.store.get_file(id))
            .await
        {
            Ok(file) => Ok(Some(file)),
            Err(CallError::Remote { source, .. }) if source.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Looks a name up, optionally inside `parent_id`.
    ///
    /// Names are not unique in Drive. When several items match, the first one
    /// in `name, folder, createdTime` order wins.
    pub async fn find_by_name(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<Option<DriveFile>, StoreError> {
        let list = self
            .caller
            .execute(RemoteOp::FindByName, || {
                self.store.find_by_name(name, parent_id)
            })
            .await?;
        if list.files.len() > 1 {
            debug!(
                name,
                matches = list.files.len(),
                "ambiguous name lookup, using first match"
            );
        }
        Ok(list.files.into_iter().next())
    }

    /// Lists every child of `folder_id`, following page tokens to the end.
    pub async fn list_children(&self, folder_id: &str) -> Result<Vec<DriveFile>, StoreError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.as_deref();
            let page = self
                .caller
                .execute(RemoteOp::ListChildren, || {
                    self.store
                        .list_children_page(folder_id, self.page_size, token)
                })
                .await?;
            items.extend(page.files);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Returns the folder named `name` under `parent_id`, creating it if absent.
    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<DriveFile, StoreError> {
        if let Some(existing) = self.find_by_name(name, parent_id).await?
            && existing.is_folder()
        {
            return Ok(existing);
        }

        let created = self
            .caller
            .execute(RemoteOp::CreateFolder, || self.store.create_folder(name))
            .await?;
        match parent_id {
            Some(parent_id) => self.move_folder(&created.id, parent_id).await,
            None => Ok(created),
        }
    }

    pub async fn copy_file(
        &self,
        item: &DriveFile,
        destination_folder_id: &str,
    ) -> Result<DriveFile, StoreError> {
        self.caller
            .execute(RemoteOp::CopyFile, || {
                self.store
                    .copy_file(&item.id, &item.name, destination_folder_id)
            })
            .await
    }

    /// Makes `new_parent_id` the only parent of `id`.
    pub async fn move_folder(&self, id: &str, new_parent_id: &str) -> Result<DriveFile, StoreError> {
        let current = self
            .caller
            .execute(RemoteOp::GetFile, || self.store.get_file(id))
            .await?;
        if current.parents.len() == 1 && current.parents[0] == new_parent_id {
            return Ok(current);
        }
        let previous: Vec<String> = current
            .parents
            .into_iter()
            .filter(|parent| parent != new_parent_id)
            .collect();
        self.caller
            .execute(RemoteOp::MoveFolder, || {
                self.store.update_parents(id, new_parent_id, &previous)
            })
            .await
    }

    pub async fn trash_file(&self, id: &str) -> Result<DriveFile, StoreError> {
        self.caller
            .execute(RemoteOp::TrashFile, || self.store.trash_file(id))
            .await
    }

    pub async fn download_file(&self, id: &str, local_path: &Path) -> Result<u64, StoreError> {
        self.caller
            .execute(RemoteOp::Download, || {
                self.store.download_to_path(id, local_path)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::backoff::Backoff;
    use crate::remote::executor::RetryPolicy;
    use crate::remote::rate_limit::{RateLimitConfig, RateLimiter};
    use crate::report::NullObserver;
    use crate::test_support::FakeDrive;
    use gdrive_core::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;

    fn client(fake: FakeDrive) -> StoreClient<FakeDrive> {
        let observer = Arc::new(NullObserver);
        let caller = ResilientCaller::new(
            RateLimiter::new(RateLimitConfig::default(), observer.clone()),
            Backoff::new(Duration::from_millis(10), false),
            RetryPolicy::default(),
            observer,
        );
        StoreClient::new(fake, caller)
    }

    #[tokio::test(start_paused = true)]
    async fn get_by_id_maps_not_found_to_none() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let store = client(fake);

        assert!(store.get_by_id(&root).await.unwrap().is_some());
        assert!(store.get_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn get_by_id_propagates_other_failures() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        fake.fail_next("get_file", StatusCode::BAD_REQUEST);
        let store = client(fake);

        let err = store.get_by_id(&root).await.expect_err("400 is fatal");
        assert_eq!(err.op(), RemoteOp::GetFile);
    }

    #[tokio::test(start_paused = true)]
    async fn list_children_follows_pages() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        for name in ["c.txt", "a.txt", "e.txt", "b.txt", "d.txt"] {
            fake.add_file(name, &root, 1);
        }
        let store = client(fake).with_page_size(2);

        let names: Vec<_> = store
            .list_children(&root)
            .await
            .unwrap()
            .into_iter()
            .map(|file| file.name)
            .collect();

        assert_eq!(names, ["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"]);
        assert_eq!(store.inner().calls("list_children_page"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn list_children_of_empty_folder_is_empty() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let store = client(fake);

        assert!(store.list_children(&root).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn find_by_name_takes_first_match() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let first = fake.add_file("dup.txt", &root, 1);
        fake.add_file("dup.txt", &root, 2);
        let store = client(fake);

        let found = store.find_by_name("dup.txt", Some(root.as_str())).await.unwrap();
        assert_eq!(found.map(|file| file.id), Some(first));
        assert!(store.find_by_name("none", Some(root.as_str())).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn create_folder_reuses_existing_folder() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let existing = fake.add_folder("Photos", Some(root.as_str()));
        let store = client(fake);

        let folder = store.create_folder("Photos", Some(root.as_str())).await.unwrap();

        assert_eq!(folder.id, existing);
        assert_eq!(store.inner().calls("create_folder"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_folder_creates_and_reparents() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let store = client(fake);

        let folder = store.create_folder("Photos", Some(root.as_str())).await.unwrap();

        assert!(folder.is_folder());
        assert_eq!(folder.parents, vec![root.clone()]);
        assert_eq!(store.inner().calls("create_folder"), 1);
        assert_eq!(store.inner().calls("update_parents"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn move_folder_replaces_all_parents() {
        let fake = FakeDrive::new();
        let a = fake.add_folder("A", None);
        let b = fake.add_folder("B", None);
        let target = fake.add_folder("Target", None);
        let moving = fake.add_folder("Moving", Some(a.as_str()));
        fake.add_parent(&moving, &b);
        let store = client(fake);

        let moved = store.move_folder(&moving, &target).await.unwrap();

        assert_eq!(moved.parents, vec![target]);
    }

    #[tokio::test(start_paused = true)]
    async fn copy_file_leaves_source_untouched() {
        let fake = FakeDrive::new();
        let src = fake.add_folder("Src", None);
        let dest = fake.add_folder("Dest", None);
        let file = fake.add_file("a.txt", &src, 3);
        let store = client(fake);

        let source = store.get_by_id(&file).await.unwrap().unwrap();
        let copy = store.copy_file(&source, &dest).await.unwrap();

        assert_ne!(copy.id, source.id);
        assert_eq!(copy.name, "a.txt");
        assert_eq!(copy.size, Some(3));
        assert_eq!(copy.parents, vec![dest]);
        assert_eq!(store.get_by_id(&file).await.unwrap().unwrap(), source);
    }

    #[tokio::test(start_paused = true)]
    async fn download_file_writes_content() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let file = fake.add_file("a.txt", &root, 3);
        let store = client(fake);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub/a.txt");

        let written = store.download_file(&file, &target).await.unwrap();

        assert_eq!(written, std::fs::metadata(&target).unwrap().len());
    }
}
