//! SQLite-backed persistence store.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::store::{ExpectedKey, PersistenceStore, RecordQuery, StoreError};
use super::types::{CacheEntry, CacheScope, CachedFileRecord, DateKey};

/// SQLite-backed store shared by every cache in the process.
pub struct SqlitePersistenceStore {
    conn: Mutex<Connection>,
}

impl SqlitePersistenceStore {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cached_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                revision INTEGER NOT NULL,
                namespace TEXT NOT NULL,
                stage TEXT NOT NULL,
                data_name TEXT NOT NULL,
                path TEXT NOT NULL,
                year INTEGER NOT NULL,
                day_of_year INTEGER NOT NULL,
                date_ordinal INTEGER NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                cached_at TEXT NOT NULL,
                UNIQUE (namespace, stage, data_name, year, day_of_year)
            );

            CREATE INDEX IF NOT EXISTS idx_cached_files_revision
                ON cached_files(namespace, stage, revision);
            CREATE INDEX IF NOT EXISTS idx_cached_files_date
                ON cached_files(namespace, stage, date_ordinal);
            CREATE INDEX IF NOT EXISTS idx_cached_files_global_revision
                ON cached_files(revision);

            CREATE TABLE IF NOT EXISTS expected_counts (
                project TEXT NOT NULL,
                plugin TEXT NOT NULL,
                stage TEXT NOT NULL,
                item TEXT NOT NULL,
                value INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (project, plugin, stage, item)
            );
            "#,
        )?;
        Ok(())
    }

    fn build_where_clause(
        scope: &CacheScope,
        query: &RecordQuery,
    ) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = vec!["namespace = ?", "stage = ?"];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(scope.namespace.clone()),
            Box::new(scope.stage.as_str().to_string()),
        ];

        if let Some(ref data_name) = query.data_name {
            conditions.push("data_name = ?");
            params.push(Box::new(data_name.clone()));
        }

        if let Some(ref prefix) = query.data_name_prefix {
            conditions.push("substr(data_name, 1, ?) = ?");
            params.push(Box::new(prefix.chars().count() as i64));
            params.push(Box::new(prefix.clone()));
        }

        if let Some(from) = query.from {
            conditions.push("date_ordinal >= ?");
            params.push(Box::new(from.ordinal()));
        }

        if let Some(to) = query.to {
            conditions.push("date_ordinal <= ?");
            params.push(Box::new(to.ordinal()));
        }

        if let Some(after) = query.after_seq {
            conditions.push("revision > ?");
            params.push(Box::new(after));
        }

        if query.unprocessed_only {
            conditions.push("processed = 0");
        }

        (format!("WHERE {}", conditions.join(" AND ")), params)
    }
}

impl PersistenceStore for SqlitePersistenceStore {
    fn upsert_records(
        &self,
        scope: &CacheScope,
        records: &[CachedFileRecord],
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO cached_files
                    (revision, namespace, stage, data_name, path, year, day_of_year,
                     date_ordinal, processed, cached_at)
                VALUES
                    ((SELECT COALESCE(MAX(revision), 0) + 1 FROM cached_files),
                     ?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
                ON CONFLICT (namespace, stage, data_name, year, day_of_year) DO UPDATE SET
                    path = excluded.path,
                    revision = excluded.revision,
                    processed = 0,
                    cached_at = excluded.cached_at
                WHERE cached_files.path <> excluded.path
                "#,
            )?;
            for record in records {
                changed += stmt.execute(params![
                    scope.namespace,
                    scope.stage.as_str(),
                    record.data_name,
                    record.path.to_string_lossy().into_owned(),
                    record.date.year,
                    record.date.day_of_year,
                    record.date.ordinal(),
                    now,
                ])?;
            }
        }
        tx.commit()?;

        Ok(changed)
    }

    fn query_records(
        &self,
        scope: &CacheScope,
        query: &RecordQuery,
    ) -> Result<Vec<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let (where_clause, params) = Self::build_where_clause(scope, query);
        let sql = format!(
            "SELECT revision, data_name, path, year, day_of_year FROM cached_files {} ORDER BY revision",
            where_clause
        );
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(param_refs.as_slice(), |row| {
                let path: String = row.get(2)?;
                Ok(CacheEntry {
                    seq: row.get(0)?,
                    record: CachedFileRecord {
                        data_name: row.get(1)?,
                        path: PathBuf::from(path),
                        date: DateKey::new(row.get(3)?, row.get(4)?),
                        stage: scope.stage,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn mark_processed(
        &self,
        scope: &CacheScope,
        date: DateKey,
        up_to_seq: i64,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE cached_files SET processed = 1
            WHERE namespace = ?1 AND stage = ?2 AND date_ordinal = ?3
              AND revision <= ?4 AND processed = 0
            "#,
            params![scope.namespace, scope.stage.as_str(), date.ordinal(), up_to_seq],
        )?;
        Ok(updated)
    }

    fn count_records(&self, scope: &CacheScope, query: &RecordQuery) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let (where_clause, params) = Self::build_where_clause(scope, query);
        let sql = format!("SELECT COUNT(*) FROM cached_files {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count: i64 = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_dates(&self, scope: &CacheScope, query: &RecordQuery) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let (where_clause, params) = Self::build_where_clause(scope, query);
        let sql = format!(
            "SELECT COUNT(DISTINCT date_ordinal) FROM cached_files {}",
            where_clause
        );
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count: i64 = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
        Ok(count as u64)
    }

    fn date_span(&self, scope: &CacheScope) -> Result<Option<(DateKey, DateKey)>, StoreError> {
        let conn = self.conn.lock();
        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(date_ordinal), MAX(date_ordinal) FROM cached_files WHERE namespace = ?1 AND stage = ?2",
            params![scope.namespace, scope.stage.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(min
            .zip(max)
            .map(|(min, max)| (DateKey::from_ordinal(min), DateKey::from_ordinal(max))))
    }

    fn expected_count(&self, key: &ExpectedKey) -> Result<Option<u64>, StoreError> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM expected_counts WHERE project = ?1 AND plugin = ?2 AND stage = ?3 AND item = ?4",
                params![key.project, key.plugin, key.stage.as_str(), key.item],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u64))
    }

    fn set_expected_count(&self, key: &ExpectedKey, value: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO expected_counts (project, plugin, stage, item, value, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (project, plugin, stage, item) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![
                key.project,
                key.plugin,
                key.stage.as_str(),
                key.item,
                value as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}
