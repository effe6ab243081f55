use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::CopyConfig;
use crate::folder_ref::FolderId;
use crate::ledger::LedgerStore;
use crate::remote::executor::ResilientCaller;
use crate::remote::rate_limit::RateLimiter;
use crate::remote::store::{RemoteStore, StoreClient};
use crate::report::SyncObserver;
use crate::session::DriveSession;
use crate::sync::engine::{SyncStats, TreeSynchronizer, resolve_roots};
use crate::sync::filter::IgnoreFilter;

/// Everything one `gdcopy` invocation needs, built once at startup. The
/// ledger is only opened once a copy's folders have been resolved.
pub struct CopyRuntime<S = DriveSession> {
    config: CopyConfig,
    store: StoreClient<S>,
    filter: IgnoreFilter,
    observer: Arc<dyn SyncObserver>,
}

impl CopyRuntime<DriveSession> {
    pub fn bootstrap(config: CopyConfig, observer: Arc<dyn SyncObserver>) -> anyhow::Result<Self> {
        let session = DriveSession::from_config(&config).with_context(|| {
            format!(
                "failed to set up Drive session from {}",
                config.credentials_path.display()
            )
        })?;
        Self::from_parts(config, session, observer)
    }
}

impl<S: RemoteStore> CopyRuntime<S> {
    pub fn from_parts(
        config: CopyConfig,
        store: S,
        observer: Arc<dyn SyncObserver>,
    ) -> anyhow::Result<Self> {
        let filter = config
            .ignore_filter()
            .context("invalid ignored_file_extension_regexes")?;
        let caller = ResilientCaller::new(
            RateLimiter::new(config.rate_limit_config(), observer.clone()),
            config.backoff(),
            config.retry_policy(),
            observer.clone(),
        );
        let store = StoreClient::new(store, caller).with_page_size(config.sync.page_size);
        Ok(Self {
            config,
            store,
            filter,
            observer,
        })
    }

    pub async fn copy(self, source: &FolderId, destination: &FolderId) -> anyhow::Result<SyncStats> {
        self.copy_folders(source.as_str(), destination.as_str()).await
    }

    async fn copy_folders(self, source_id: &str, destination_id: &str) -> anyhow::Result<SyncStats> {
        info!(
            application = %self.config.application_name,
            source = source_id,
            destination = destination_id,
            "copying folder tree"
        );
        let roots = resolve_roots(&self.store, source_id, destination_id).await?;
        let ledger = LedgerStore::open(&self.config.ledger_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open ledger at {}",
                    self.config.ledger_path.display()
                )
            })?;
        let options = self.config.sync_options();
        let sync = TreeSynchronizer::new(self.store, ledger, self.filter, options, self.observer);
        Ok(sync.run_resolved(roots).await?)
    }

    /// Downloads one file. Without a target, or with a directory as target,
    /// the file keeps its remote name; the default directory is `tmp_path`.
    pub async fn download(&self, file_id: &str, target: Option<&Path>) -> anyhow::Result<(PathBuf, u64)> {
        let file = self
            .store
            .get_by_id(file_id)
            .await?
            .with_context(|| format!("file not found: {file_id}"))?;
        anyhow::ensure!(!file.is_folder(), "{} is a folder, not a file", file.name);

        let target = match target {
            Some(path) => {
                let is_dir = tokio::fs::metadata(path)
                    .await
                    .is_ok_and(|metadata| metadata.is_dir());
                if is_dir {
                    path.join(&file.name)
                } else {
                    path.to_path_buf()
                }
            }
            None => self.config.tmp_path.join(&file.name),
        };
        let bytes = self
            .store
            .download_file(&file.id, &target)
            .await
            .with_context(|| format!("failed to download {} to {}", file.name, target.display()))?;
        info!(file = %file.name, path = %target.display(), bytes, "downloaded");
        Ok((target, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::NullObserver;
    use crate::sync::engine::SyncError;
    use crate::test_support::FakeDrive;

    fn runtime(fake: FakeDrive, config: CopyConfig) -> CopyRuntime<FakeDrive> {
        CopyRuntime::from_parts(config, fake, Arc::new(NullObserver)).unwrap()
    }

    fn config_in(dir: &Path) -> CopyConfig {
        CopyConfig {
            ledger_path: dir.join("state/ledger.sqlite"),
            tmp_path: dir.join("tmp"),
            ..CopyConfig::default()
        }
    }

    #[tokio::test]
    async fn copy_applies_configured_filter_and_records_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeDrive::new();
        let src = fake.add_folder("Src", None);
        let dest = fake.add_folder("Dest", None);
        fake.add_file("a.txt", &src, 1);
        fake.add_file("b.tmp", &src, 1);
        let config = CopyConfig {
            ignored_file_extension_regexes: vec!["tmp$".into()],
            ..config_in(dir.path())
        };

        // Fake ids are not real Drive ids, so bypass FolderId parsing.
        let stats = runtime(fake, config).copy_folders(&src, &dest).await.unwrap();

        assert_eq!(stats.copied, 1);
        assert_eq!(stats.ignored, 1);
        let ledger = LedgerStore::open(&dir.path().join("state/ledger.sqlite"))
            .await
            .unwrap();
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_folders_leave_no_ledger_behind() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeDrive::new();
        let dest = fake.add_folder("Dest", None);
        let ledger_path = dir.path().join("state/ledger.sqlite");

        let err = runtime(fake, config_in(dir.path()))
            .copy_folders("missing", &dest)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::SourceNotFound(id)) if id == "missing"
        ));
        assert!(!ledger_path.exists());
        assert!(!dir.path().join("state").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_pattern_fails_construction() {
        let config = CopyConfig {
            ignored_file_extension_regexes: vec!["(".into()],
            ..CopyConfig::default()
        };

        let result = CopyRuntime::from_parts(config, FakeDrive::new(), Arc::new(NullObserver));

        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn download_defaults_to_tmp_path_and_remote_name() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let file = fake.add_file("report.pdf", &root, 3);
        let runtime = runtime(fake, config_in(dir.path()));

        let (path, bytes) = runtime.download(&file, None).await.unwrap();

        assert_eq!(path, dir.path().join("tmp/report.pdf"));
        assert_eq!(bytes, std::fs::metadata(&path).unwrap().len());
        assert!(!dir.path().join("state").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn download_into_directory_keeps_remote_name() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let file = fake.add_file("report.pdf", &root, 3);
        let runtime = runtime(fake, CopyConfig::default());

        let (path, _) = runtime.download(&file, Some(dir.path())).await.unwrap();

        assert_eq!(path, dir.path().join("report.pdf"));
        assert!(path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn download_to_new_path_uses_it_as_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let file = fake.add_file("report.pdf", &root, 3);
        let runtime = runtime(fake, CopyConfig::default());
        let target = dir.path().join("out/renamed.pdf");

        let (path, _) = runtime.download(&file, Some(&target)).await.unwrap();

        assert_eq!(path, target);
        assert!(target.is_file());
    }

    #[tokio::test(start_paused = true)]
    async fn download_rejects_missing_files_and_folders() {
        let fake = FakeDrive::new();
        let root = fake.add_folder("Root", None);
        let runtime = runtime(fake, CopyConfig::default());

        let missing = runtime.download("missing", None).await.unwrap_err();
        let folder = runtime.download(&root, None).await.unwrap_err();

        assert!(missing.to_string().contains("file not found"));
        assert!(folder.to_string().contains("is a folder"));
    }
}
