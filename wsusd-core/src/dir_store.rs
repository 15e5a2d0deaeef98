//! Plain-directory metadata store
//!
//! One XML file per identity under a 256-way shard keyed by the last byte of
//! the GUID. Package records and external file metadata live in parallel
//! sharded trees; the dense index order is persisted in `index.json`.
//!
//! Layout on disk:
//! ```text
//! {root}/
//!   index.json     — identity per index (index order)
//!   types.json     — partition name per index
//!   metadata/partitions/{partition}/{shard}/{guid}.{rev}.xml
//!   packages/{shard}/{guid}.{rev}.json
//!   filemetadata/{shard}/{guid}.{rev}.json
//! ```

use crate::identity::{RevisionIndex, UpdateIdentity};
use crate::package::{FileReference, Package, PackageRecord, PartitionRegistry};
use crate::store::{Error, MetadataStore, Result};
use crate::util::{read_json_opt, write_json_atomic};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Record file contents. File descriptors are inline unless the partition
/// keeps them in the filemetadata tree.
#[derive(Debug, Serialize, Deserialize)]
struct DirRecord {
    record: PackageRecord,
    files: Option<Vec<FileReference>>,
}

struct Inner {
    index_map: HashMap<UpdateIdentity, RevisionIndex>,
    by_index: Vec<UpdateIdentity>,
    partitions: Vec<String>,
    dirty: bool,
}

/// Directory-tree backed metadata store.
pub struct DirStore {
    root: PathBuf,
    registry: PartitionRegistry,
    inner: RwLock<Inner>,
}

fn shard(id: &UpdateIdentity) -> String {
    hex::encode([id.guid.as_bytes()[15]])
}

impl DirStore {
    pub fn open(path: &Path, registry: &PartitionRegistry) -> Result<Self> {
        fs::create_dir_all(path)?;
        let by_index: Vec<UpdateIdentity> =
            read_json_opt(&path.join("index.json"))?.unwrap_or_default();
        let partitions: Vec<String> =
            read_json_opt(&path.join("types.json"))?.unwrap_or_default();

        if by_index.len() != partitions.len() {
            return Err(Error::Serialization(format!(
                "index.json has {} entries but types.json has {}",
                by_index.len(),
                partitions.len()
            )));
        }
        for name in &partitions {
            if registry.get(name).is_none() {
                return Err(Error::UnknownPartition(name.clone()));
            }
        }

        let index_map = by_index
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, RevisionIndex(i as u32 + 1)))
            .collect();

        Ok(Self {
            root: path.to_path_buf(),
            registry: registry.clone(),
            inner: RwLock::new(Inner {
                index_map,
                by_index,
                partitions,
                dirty: false,
            }),
        })
    }

    fn xml_path(&self, partition: &str, id: &UpdateIdentity) -> PathBuf {
        self.root
            .join("metadata")
            .join("partitions")
            .join(partition)
            .join(shard(id))
            .join(format!("{}.{}.xml", id.guid, id.revision))
    }

    fn record_path(&self, id: &UpdateIdentity) -> PathBuf {
        self.root
            .join("packages")
            .join(shard(id))
            .join(format!("{}.{}.json", id.guid, id.revision))
    }

    fn filemeta_path(&self, id: &UpdateIdentity) -> PathBuf {
        self.root
            .join("filemetadata")
            .join(shard(id))
            .join(format!("{}.{}.json", id.guid, id.revision))
    }

    fn partition_of(&self, id: &UpdateIdentity) -> Result<String> {
        let inner = self.inner.read().unwrap();
        let index = inner
            .index_map
            .get(id)
            .ok_or_else(|| Error::PackageNotFound(id.to_string()))?;
        Ok(inner.partitions[index.get() as usize - 1].clone())
    }

    fn load_record(&self, id: &UpdateIdentity) -> Result<DirRecord> {
        read_json_opt(&self.record_path(id))?
            .ok_or_else(|| Error::PackageNotFound(id.to_string()))
    }

    fn load_files(&self, id: &UpdateIdentity, record: &DirRecord) -> Result<Vec<FileReference>> {
        if let Some(files) = &record.files {
            return Ok(files.clone());
        }
        Ok(read_json_opt(&self.filemeta_path(id))?.unwrap_or_default())
    }

    fn load_package(&self, id: &UpdateIdentity) -> Result<Package> {
        let partition = self.partition_of(id)?;
        let record = self.load_record(id)?;
        let xml = fs::read(self.xml_path(&partition, id))?;
        let files = self.load_files(id, &record)?;
        Ok(record.record.into_package(Bytes::from(xml), files))
    }
}

#[async_trait]
impl MetadataStore for DirStore {
    async fn add_package(&self, pkg: &Package) -> Result<RevisionIndex> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.index_map.get(&pkg.identity) {
            return Ok(*existing);
        }

        let partition = pkg.kind.partition();
        let external_files = self
            .registry
            .get(partition)
            .map(|p| p.has_external_file_metadata)
            .unwrap_or(false);

        let xml_path = self.xml_path(partition, &pkg.identity);
        fs::create_dir_all(xml_path.parent().unwrap())?;
        fs::write(&xml_path, &pkg.xml)?;

        let record = DirRecord {
            record: PackageRecord::from_package(pkg),
            files: if external_files { None } else { Some(pkg.files.clone()) },
        };
        write_json_atomic(&self.record_path(&pkg.identity), &record)?;
        if external_files {
            write_json_atomic(&self.filemeta_path(&pkg.identity), &pkg.files)?;
        }

        let index = RevisionIndex(inner.by_index.len() as u32 + 1);
        inner.index_map.insert(pkg.identity, index);
        inner.by_index.push(pkg.identity);
        inner.partitions.push(partition.to_string());
        inner.dirty = true;
        Ok(index)
    }

    async fn metadata(&self, id: &UpdateIdentity) -> Result<Bytes> {
        let partition = self.partition_of(id)?;
        Ok(Bytes::from(fs::read(self.xml_path(&partition, id))?))
    }

    async fn files(&self, id: &UpdateIdentity) -> Result<Vec<FileReference>> {
        let record = self.load_record(id)?;
        self.load_files(id, &record)
    }

    async fn package(&self, id: &UpdateIdentity) -> Result<Package> {
        self.load_package(id)
    }

    async fn package_by_index(&self, index: RevisionIndex) -> Result<Package> {
        let id = self
            .package_identity(index)
            .await?
            .ok_or(Error::InvalidRevisionIndex(index.get()))?;
        self.load_package(&id)
    }

    async fn package_index(&self, id: &UpdateIdentity) -> Result<Option<RevisionIndex>> {
        Ok(self.inner.read().unwrap().index_map.get(id).copied())
    }

    async fn package_identity(&self, index: RevisionIndex) -> Result<Option<UpdateIdentity>> {
        if index.get() == 0 {
            return Ok(None);
        }
        let inner = self.inner.read().unwrap();
        Ok(inner.by_index.get(index.get() as usize - 1).copied())
    }

    async fn contains_package(&self, id: &UpdateIdentity) -> Result<bool> {
        Ok(self.inner.read().unwrap().index_map.contains_key(id))
    }

    async fn identities(&self) -> Result<Vec<(UpdateIdentity, RevisionIndex)>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .by_index
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, RevisionIndex(i as u32 + 1)))
            .collect())
    }

    async fn package_count(&self) -> Result<u32> {
        Ok(self.inner.read().unwrap().by_index.len() as u32)
    }

    async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.dirty {
            return Ok(());
        }
        write_json_atomic(&self.root.join("index.json"), &inner.by_index)?;
        write_json_atomic(&self.root.join("types.json"), &inner.partitions)?;
        inner.dirty = false;
        Ok(())
    }
}
