//! SQLite persistent store: quotes, city aliases and ignored link domains.
//!
//! The database runs in WAL mode, so [`Store::export`] can take an online
//! snapshot on its own connection while queries keep running.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub rating: i64,
    pub lines: Vec<String>,
}

impl Quote {
    /// Header line followed by the quote text.
    pub fn reply_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.lines.len() + 1);
        lines.push(format!(
            "#{} :: {} :: Rating: {}",
            self.id,
            self.date.format("%Y-%m-%d %H:%M"),
            self.rating
        ));
        lines.extend(self.lines.iter().cloned());
        lines
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct City {
    pub name: String,
    pub country: String,
}

impl City {
    /// `Name,CC` as the weather service expects it.
    pub fn query(&self) -> String {
        format!("{},{}", self.name, self.country)
    }
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DB: {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to set DB pragmas")?;
        Self::init_schema(&conn).context("Failed to initialise DB schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS quotes (
                id      INTEGER PRIMARY KEY,
                date    INTEGER NOT NULL DEFAULT 0,
                rating  INTEGER NOT NULL DEFAULT 0,
                text    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS cities (
                alias   TEXT PRIMARY KEY,
                city    TEXT NOT NULL,
                country TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ignored_domains (
                domain  TEXT PRIMARY KEY
            );",
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock())).await?
    }

    pub async fn quote(&self, id: i64) -> StoreResult<Quote> {
        if id <= 0 {
            return Err(StoreError::NotFound);
        }
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, date, rating, text FROM quotes WHERE id = ?1",
                params![id],
                row_to_quote,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    pub async fn random_quote(&self) -> StoreResult<Quote> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, date, rating, text FROM quotes
                 LIMIT 1 OFFSET ABS(RANDOM()) % MAX((SELECT COUNT(id) FROM quotes), 1)",
                [],
                row_to_quote,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    pub async fn city(&self, alias: &str) -> StoreResult<City> {
        let alias = alias.to_lowercase();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT city, country FROM cities WHERE alias = ?1",
                params![alias],
                |row| {
                    Ok(City {
                        name: row.get(0)?,
                        country: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    pub async fn is_ignored_domain(&self, domain: &str) -> StoreResult<bool> {
        let domain = domain.to_lowercase();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM ignored_domains WHERE domain = ?1",
                    params![domain],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    pub async fn insert_quote(&self, date: DateTime<Utc>, rating: i64, text: &str) -> StoreResult<i64> {
        let text = text.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO quotes (date, rating, text) VALUES (?1, ?2, ?3)",
                params![date.timestamp(), rating, text],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn insert_city(&self, alias: &str, city: &str, country: &str) -> StoreResult<()> {
        let (alias, city, country) = (alias.to_lowercase(), city.to_string(), country.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cities (alias, city, country) VALUES (?1, ?2, ?3)",
                params![alias, city, country],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn ignore_domain(&self, domain: &str) -> StoreResult<()> {
        let domain = domain.to_lowercase();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO ignored_domains (domain) VALUES (?1)",
                params![domain],
            )?;
            Ok(())
        })
        .await
    }

    /// Online snapshot of the whole database into `dest`, which must not
    /// exist yet. Runs on a fresh read-only connection so the shared one is
    /// never held for the duration of the copy.
    pub async fn export(&self, dest: &Path) -> anyhow::Result<()> {
        let source = self.path.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = Connection::open_with_flags(
                &source,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("Failed to open DB for export: {}", source.display()))?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy()])
                .with_context(|| format!("VACUUM INTO {} failed", dest.display()))?;
            Ok(())
        })
        .await?
    }
}

fn row_to_quote(row: &rusqlite::Row<'_>) -> rusqlite::Result<Quote> {
    let timestamp: i64 = row.get(1)?;
    let text: String = row.get(3)?;
    Ok(Quote {
        id: row.get(0)?,
        date: DateTime::from_timestamp(timestamp, 0).unwrap_or_default(),
        rating: row.get(2)?,
        lines: text.lines().map(str::to_string).collect(),
    })
}
