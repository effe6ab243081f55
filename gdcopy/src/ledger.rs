use std::{fs, path::Path};

use sqlx::{
    SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable set of source file ids that were copied successfully.
#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the ledger database at `path`, creating the file and its parent
    /// directory when missing.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), LedgerError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn exists(&self, file_id: &str) -> Result<bool, LedgerError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT file_id FROM copied_files WHERE file_id = ?1")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Records `file_id`. Recording an id twice is a no-op.
    pub async fn record(&self, file_id: &str) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO copied_files (file_id) VALUES (?1) ON CONFLICT(file_id) DO NOTHING")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, LedgerError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM copied_files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) async fn memory_ledger() -> LedgerStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let ledger = LedgerStore::from_pool(pool);
    ledger.init().await.unwrap();
    ledger
}

/// Makes every later insert fail, leaving reads working.
#[cfg(test)]
pub(crate) async fn reject_inserts(ledger: &LedgerStore) {
    sqlx::query(
        "CREATE TRIGGER reject_inserts BEFORE INSERT ON copied_files \
         BEGIN SELECT RAISE(ABORT, 'ledger is read-only'); END",
    )
    .execute(ledger.pool())
    .await
    .unwrap();
}
