//! Compressed-delta metadata store
//!
//! Append-only backend: each `flush()` writes the packages added since the
//! previous flush into a new numbered pack section, zstd-compressed per
//! entry. `toc.json` keeps the running prefix-sum of package counts per
//! section so an index lookup binary-searches the section list instead of
//! scanning it.
//!
//! Layout on disk:
//! ```text
//! {root}/
//!   toc.json       — version + running package counts per section
//!   types.json     — partition name per index (index order)
//!   {N}.pack       — section files, numbered from 0
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
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Section file format version.
const PACK_VERSION: u32 = 1;

/// Zstd level for section entries. Metadata XML compresses heavily.
const COMPRESSION_LEVEL: i32 = 3;

/// Table of contents persisted at `toc.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Toc {
    version: u32,
    /// Running total of packages after each section: `counts[i]` is the
    /// highest index stored in sections `0..=i`.
    counts: Vec<u32>,
}

impl Toc {
    fn total(&self) -> u32 {
        self.counts.last().copied().unwrap_or(0)
    }

    /// Locate the section holding a 1-based index, plus the entry's ordinal
    /// within that section.
    fn locate(&self, index: u32) -> Option<(usize, u32)> {
        if index == 0 || index > self.total() {
            return None;
        }
        let section = self.counts.partition_point(|&c| c < index);
        let before = if section == 0 { 0 } else { self.counts[section - 1] };
        Some((section, index - before - 1))
    }
}

/// One package as serialized into a section.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SectionEntry {
    identity: UpdateIdentity,
    partition: String,
    record: PackageRecord,
    xml: Vec<u8>,
    files: Vec<FileReference>,
}

impl SectionEntry {
    fn from_package(pkg: &Package) -> Self {
        Self {
            identity: pkg.identity,
            partition: pkg.kind.partition().to_string(),
            record: PackageRecord::from_package(pkg),
            xml: pkg.xml.to_vec(),
            files: pkg.files.clone(),
        }
    }

    fn into_package(self) -> Package {
        self.record.into_package(Bytes::from(self.xml), self.files)
    }
}

struct Inner {
    toc: Toc,
    /// Identity → index for every stored package, flushed or pending.
    index_map: HashMap<UpdateIdentity, RevisionIndex>,
    /// Dense index order; `by_index[i]` holds index `i + 1`.
    by_index: Vec<UpdateIdentity>,
    /// Partition name per index, persisted as `types.json`.
    partitions: Vec<String>,
    /// Packages added since the last flush, in index order.
    pending: Vec<SectionEntry>,
}

/// Compressed-delta backed metadata store.
pub struct DeltaStore {
    root: PathBuf,
    inner: RwLock<Inner>,
}

impl DeltaStore {
    /// Open or create a store rooted at `path`, validating stored partitions
    /// against the registry.
    pub fn open(path: &Path, registry: &PartitionRegistry) -> Result<Self> {
        fs::create_dir_all(path)?;
        let toc: Toc = read_json_opt(&path.join("toc.json"))?.unwrap_or(Toc {
            version: PACK_VERSION,
            counts: Vec::new(),
        });
        if toc.version != PACK_VERSION {
            return Err(Error::Serialization(format!(
                "unknown toc version {}",
                toc.version
            )));
        }
        let partitions: Vec<String> =
            read_json_opt(&path.join("types.json"))?.unwrap_or_default();

        for name in &partitions {
            if registry.get(name).is_none() {
                return Err(Error::UnknownPartition(name.clone()));
            }
        }

        // Rebuild the identity map by scanning section headers. Sections are
        // immutable once written, so index order is the scan order.
        let mut index_map = HashMap::new();
        let mut by_index = Vec::with_capacity(toc.total() as usize);
        for section in 0..toc.counts.len() {
            for entry in read_section(&section_path(path, section))? {
                let index = RevisionIndex(by_index.len() as u32 + 1);
                index_map.insert(entry.identity, index);
                by_index.push(entry.identity);
            }
        }

        if by_index.len() != toc.total() as usize {
            return Err(Error::Serialization(format!(
                "toc.json count {} disagrees with section contents {}",
                toc.total(),
                by_index.len()
            )));
        }

        Ok(Self {
            root: path.to_path_buf(),
            inner: RwLock::new(Inner {
                toc,
                index_map,
                by_index,
                partitions,
                pending: Vec::new(),
            }),
        })
    }

    fn read_entry(&self, inner: &Inner, index: RevisionIndex) -> Result<SectionEntry> {
        let flushed = inner.toc.total();
        let idx = index.get();
        if idx > flushed {
            let ordinal = (idx - flushed - 1) as usize;
            return inner
                .pending
                .get(ordinal)
                .cloned()
                .ok_or(Error::InvalidRevisionIndex(idx));
        }
        let (section, ordinal) = inner
            .toc
            .locate(idx)
            .ok_or(Error::InvalidRevisionIndex(idx))?;
        read_section_entry(&section_path(&self.root, section), ordinal)
    }

    fn entry_for(&self, id: &UpdateIdentity) -> Result<SectionEntry> {
        let inner = self.inner.read().unwrap();
        let index = *inner
            .index_map
            .get(id)
            .ok_or_else(|| Error::PackageNotFound(id.to_string()))?;
        self.read_entry(&inner, index)
    }
}

fn section_path(root: &Path, section: usize) -> PathBuf {
    root.join(format!("{}.pack", section))
}

fn write_section(path: &Path, entries: &[SectionEntry]) -> Result<()> {
    let tmp = path.with_extension("pack.tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&PACK_VERSION.to_le_bytes())?;
    file.write_all(&(entries.len() as u32).to_le_bytes())?;
    for entry in entries {
        let raw = bincode::serialize(entry).map_err(Error::serialization)?;
        let compressed = zstd::encode_all(&raw[..], COMPRESSION_LEVEL)?;
        file.write_all(&(compressed.len() as u32).to_le_bytes())?;
        file.write_all(&compressed)?;
    }
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_section(path: &Path) -> Result<Vec<SectionEntry>> {
    let mut file = fs::File::open(path)?;
    let count = read_section_header(&mut file, path)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(read_next_entry(&mut file)?);
    }
    Ok(entries)
}

fn read_section_entry(path: &Path, ordinal: u32) -> Result<SectionEntry> {
    let mut file = fs::File::open(path)?;
    let count = read_section_header(&mut file, path)?;
    if ordinal >= count {
        return Err(Error::Serialization(format!(
            "entry {} out of range in {:?}",
            ordinal, path
        )));
    }
    for _ in 0..ordinal {
        let len = read_u32(&mut file)?;
        std::io::copy(&mut (&mut file).take(len as u64), &mut std::io::sink())?;
    }
    read_next_entry(&mut file)
}

fn read_section_header(file: &mut fs::File, path: &Path) -> Result<u32> {
    let version = read_u32(file)?;
    if version != PACK_VERSION {
        return Err(Error::Serialization(format!(
            "unknown pack version {} in {:?}",
            version, path
        )));
    }
    read_u32(file)
}

fn read_next_entry(file: &mut fs::File) -> Result<SectionEntry> {
    let len = read_u32(file)?;
    let mut compressed = vec![0u8; len as usize];
    file.read_exact(&mut compressed)?;
    let raw = zstd::decode_all(&compressed[..])?;
    bincode::deserialize(&raw).map_err(Error::serialization)
}

fn read_u32(file: &mut fs::File) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[async_trait]
impl MetadataStore for DeltaStore {
    async fn add_package(&self, pkg: &Package) -> Result<RevisionIndex> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.index_map.get(&pkg.identity) {
            return Ok(*existing);
        }
        let index = RevisionIndex(inner.by_index.len() as u32 + 1);
        inner.index_map.insert(pkg.identity, index);
        inner.by_index.push(pkg.identity);
        inner.partitions.push(pkg.kind.partition().to_string());
        inner.pending.push(SectionEntry::from_package(pkg));
        Ok(index)
    }

    async fn metadata(&self, id: &UpdateIdentity) -> Result<Bytes> {
        Ok(Bytes::from(self.entry_for(id)?.xml))
    }

    async fn files(&self, id: &UpdateIdentity) -> Result<Vec<FileReference>> {
        Ok(self.entry_for(id)?.files)
    }

    async fn package(&self, id: &UpdateIdentity) -> Result<Package> {
        Ok(self.entry_for(id)?.into_package())
    }

    async fn package_by_index(&self, index: RevisionIndex) -> Result<Package> {
        let inner = self.inner.read().unwrap();
        Ok(self.read_entry(&inner, index)?.into_package())
    }

    async fn package_index(&self, id: &UpdateIdentity) -> Result<Option<RevisionIndex>> {
        Ok(self.inner.read().unwrap().index_map.get(id).copied())
    }

    async fn package_identity(&self, index: RevisionIndex) -> Result<Option<UpdateIdentity>> {
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
        if inner.pending.is_empty() {
            return Ok(());
        }
        let section = inner.toc.counts.len();
        write_section(&section_path(&self.root, section), &inner.pending)?;
        let total = inner.by_index.len() as u32;
        inner.toc.counts.push(total);
        inner.pending.clear();
        write_json_atomic(&self.root.join("toc.json"), &inner.toc)?;
        write_json_atomic(&self.root.join("types.json"), &inner.partitions)?;
        tracing::debug!(section, total, "flushed delta section");
        Ok(())
    }
}
