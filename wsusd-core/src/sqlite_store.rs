//! SQLite-backed metadata store
//!
//! Single `packages` table with WAL mode for concurrent readers. The dense
//! index is the integer primary key, assigned in insertion order under the
//! connection lock. Enumeration runs inside an explicit read transaction so
//! it observes a consistent snapshot.

use crate::identity::{RevisionIndex, UpdateIdentity};
use crate::package::{FileReference, Package, PackageRecord, PartitionRegistry};
use crate::store::{Error, MetadataStore, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS packages (
            idx INTEGER PRIMARY KEY,
            guid TEXT NOT NULL,
            revision INTEGER NOT NULL,
            partition TEXT NOT NULL,
            record TEXT NOT NULL,
            xml BLOB NOT NULL,
            files TEXT NOT NULL,
            UNIQUE (guid, revision)
        );",
    )?;
    Ok(conn)
}

/// Embedded-SQL backed metadata store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path, registry: &PartitionRegistry) -> Result<Self> {
        let conn = open_db(path)?;
        // A store written by a build with more partitions must fail loudly.
        {
            let mut stmt = conn.prepare("SELECT DISTINCT partition FROM packages")?;
            let names: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            for name in names {
                if registry.get(&name).is_none() {
                    return Err(Error::UnknownPartition(name));
                }
            }
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn row_to_package(
        record: String,
        xml: Vec<u8>,
        files: String,
    ) -> Result<Package> {
        let record: PackageRecord =
            serde_json::from_str(&record).map_err(Error::serialization)?;
        let files: Vec<FileReference> =
            serde_json::from_str(&files).map_err(Error::serialization)?;
        Ok(record.into_package(Bytes::from(xml), files))
    }

    fn query_index(conn: &Connection, id: &UpdateIdentity) -> Result<Option<RevisionIndex>> {
        let idx: Option<u32> = conn
            .query_row(
                "SELECT idx FROM packages WHERE guid = ?1 AND revision = ?2",
                rusqlite::params![id.guid.to_string(), id.revision],
                |row| row.get(0),
            )
            .optional()?;
        Ok(idx.map(RevisionIndex))
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn add_package(&self, pkg: &Package) -> Result<RevisionIndex> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if let Some(existing) = Self::query_index(&tx, &pkg.identity)? {
            return Ok(existing);
        }
        let next: u32 = tx.query_row(
            "SELECT COALESCE(MAX(idx), 0) + 1 FROM packages",
            [],
            |row| row.get(0),
        )?;
        let record =
            serde_json::to_string(&PackageRecord::from_package(pkg)).map_err(Error::serialization)?;
        let files = serde_json::to_string(&pkg.files).map_err(Error::serialization)?;
        tx.execute(
            "INSERT INTO packages (idx, guid, revision, partition, record, xml, files)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                next,
                pkg.identity.guid.to_string(),
                pkg.identity.revision,
                pkg.kind.partition(),
                record,
                pkg.xml.as_ref(),
                files
            ],
        )?;
        tx.commit()?;
        Ok(RevisionIndex(next))
    }

    async fn metadata(&self, id: &UpdateIdentity) -> Result<Bytes> {
        let conn = self.conn();
        let xml: Option<Vec<u8>> = conn
            .query_row(
                "SELECT xml FROM packages WHERE guid = ?1 AND revision = ?2",
                rusqlite::params![id.guid.to_string(), id.revision],
                |row| row.get(0),
            )
            .optional()?;
        xml.map(Bytes::from)
            .ok_or_else(|| Error::PackageNotFound(id.to_string()))
    }

    async fn files(&self, id: &UpdateIdentity) -> Result<Vec<FileReference>> {
        let conn = self.conn();
        let files: Option<String> = conn
            .query_row(
                "SELECT files FROM packages WHERE guid = ?1 AND revision = ?2",
                rusqlite::params![id.guid.to_string(), id.revision],
                |row| row.get(0),
            )
            .optional()?;
        let files = files.ok_or_else(|| Error::PackageNotFound(id.to_string()))?;
        serde_json::from_str(&files).map_err(Error::serialization)
    }

    async fn package(&self, id: &UpdateIdentity) -> Result<Package> {
        let conn = self.conn();
        let row: Option<(String, Vec<u8>, String)> = conn
            .query_row(
                "SELECT record, xml, files FROM packages WHERE guid = ?1 AND revision = ?2",
                rusqlite::params![id.guid.to_string(), id.revision],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (record, xml, files) =
            row.ok_or_else(|| Error::PackageNotFound(id.to_string()))?;
        Self::row_to_package(record, xml, files)
    }

    async fn package_by_index(&self, index: RevisionIndex) -> Result<Package> {
        let conn = self.conn();
        let row: Option<(String, Vec<u8>, String)> = conn
            .query_row(
                "SELECT record, xml, files FROM packages WHERE idx = ?1",
                rusqlite::params![index.get()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (record, xml, files) = row.ok_or(Error::InvalidRevisionIndex(index.get()))?;
        Self::row_to_package(record, xml, files)
    }

    async fn package_index(&self, id: &UpdateIdentity) -> Result<Option<RevisionIndex>> {
        Self::query_index(&self.conn(), id)
    }

    async fn package_identity(&self, index: RevisionIndex) -> Result<Option<UpdateIdentity>> {
        let conn = self.conn();
        let row: Option<(String, u32)> = conn
            .query_row(
                "SELECT guid, revision FROM packages WHERE idx = ?1",
                rusqlite::params![index.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((guid, revision)) => {
                let guid = Uuid::parse_str(&guid)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Ok(Some(UpdateIdentity::new(guid, revision)))
            }
        }
    }

    async fn contains_package(&self, id: &UpdateIdentity) -> Result<bool> {
        Ok(Self::query_index(&self.conn(), id)?.is_some())
    }

    async fn identities(&self) -> Result<Vec<(UpdateIdentity, RevisionIndex)>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut out = Vec::new();
        {
            let mut stmt =
                tx.prepare_cached("SELECT idx, guid, revision FROM packages ORDER BY idx")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let idx: u32 = row.get(0)?;
                let guid: String = row.get(1)?;
                let revision: u32 = row.get(2)?;
                let guid = Uuid::parse_str(&guid)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                out.push((UpdateIdentity::new(guid, revision), RevisionIndex(idx)));
            }
        }
        tx.commit()?;
        Ok(out)
    }

    async fn package_count(&self) -> Result<u32> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM packages", [], |row| row.get(0))?)
    }

    async fn flush(&self) -> Result<()> {
        // WAL checkpointing is handled by SQLite; nothing buffered here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageKind;
    use tempfile::TempDir;

    fn test_package() -> Package {
        Package {
            identity: UpdateIdentity::new(Uuid::new_v4(), 2),
            kind: PackageKind::Software,
            title: Some("Cumulative update".into()),
            kb_article: Some("5031234".into()),
            prerequisites: Vec::new(),
            bundled_with: Vec::new(),
            bundled_updates: Vec::new(),
            files: Vec::new(),
            driver_ids: Vec::new(),
            xml: Bytes::from_static(b"<Update/>"),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_and_persistence() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("store.db");
        let reg = PartitionRegistry::builtin();
        let pkg = test_package();
        {
            let store = SqliteStore::open(&db, &reg).unwrap();
            let idx = store.add_package(&pkg).await.unwrap();
            assert_eq!(idx, RevisionIndex(1));
        }
        let store = SqliteStore::open(&db, &reg).unwrap();
        let loaded = store.package(&pkg.identity).await.unwrap();
        assert_eq!(loaded.identity, pkg.identity);
        assert_eq!(loaded.xml, pkg.xml);
        assert_eq!(
            store.package_identity(RevisionIndex(1)).await.unwrap(),
            Some(pkg.identity)
        );
    }

    #[tokio::test]
    async fn test_duplicate_add_returns_existing_index() {
        let tmp = TempDir::new().unwrap();
        let store =
            SqliteStore::open(&tmp.path().join("store.db"), &PartitionRegistry::builtin()).unwrap();
        let pkg = test_package();
        let a = store.add_package(&pkg).await.unwrap();
        let b = store.add_package(&pkg).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.package_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_identities_in_index_order() {
        let tmp = TempDir::new().unwrap();
        let store =
            SqliteStore::open(&tmp.path().join("store.db"), &PartitionRegistry::builtin()).unwrap();
        let mut expected = Vec::new();
        for _ in 0..5 {
            let pkg = test_package();
            let idx = store.add_package(&pkg).await.unwrap();
            expected.push((pkg.identity, idx));
        }
        assert_eq!(store.identities().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_unknown_partition_at_open() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("store.db");
        {
            let conn = open_db(&db).unwrap();
            conn.execute(
                "INSERT INTO packages (idx, guid, revision, partition, record, xml, files)
                 VALUES (1, 'g', 1, 'printer', '{}', x'', '[]')",
                [],
            )
            .unwrap();
        }
        match SqliteStore::open(&db, &PartitionRegistry::builtin()) {
            Err(Error::UnknownPartition(name)) => assert_eq!(name, "printer"),
            other => panic!("expected UnknownPartition, got {:?}", other.map(|_| ())),
        }
    }
}
