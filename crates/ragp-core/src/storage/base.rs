//! Chunked base store: the durable, random-access outgoing-synapse table.
//!
//! `base.bin` carries a fixed header and a fixed-width node index; each
//! chunk file `base_<lo>_<hi>.bin` holds the synapse records for senders
//! whose ids fall in `[lo, hi]`, sorted by `(sender, receiver)`. Records
//! are fixed-width so a sender's adjacency is one seek plus one read.
//!
//! All rewrites go through temporary files and atomic renames; the manifest
//! is fsynced before and after its rename so a cold restart after any
//! successful write reads the same state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::registry::{NodeId, NodeKind};
use crate::storage::{sync_dir, SynapseRec};

// ============================================================================
// ON-DISK LAYOUT
// ============================================================================

/// Manifest magic
pub(crate) const BASE_MAGIC: [u8; 4] = *b"RAGP";
/// On-disk format version
pub(crate) const FORMAT_VERSION: u16 = 1;
/// Header: magic + format version + chunk size + node count + registry version
pub(crate) const BASE_HEADER_LEN: usize = 4 + 2 + 4 + 4 + 2;
/// Index entry: node id + chunk file index + offset + out degree + kind
pub(crate) const INDEX_ENTRY_LEN: usize = 8 + 4 + 8 + 4 + 1;
/// Chunk record: receiver + weight + tick
pub(crate) const CHUNK_RECORD_LEN: usize = 8 + 4 + 4;

/// Sentinel for "no chunk": empty adjacency, or legacy in-manifest records
const NO_CHUNK: u32 = u32::MAX;
/// Sentinel offset for empty adjacency
const NO_OFFSET: u64 = u64::MAX;

/// One node index entry
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexEntry {
    pub(crate) chunk_file_index: u32,
    pub(crate) offset: u64,
    pub(crate) out_degree: u32,
    pub(crate) kind: NodeKind,
}

impl IndexEntry {
    fn empty(kind: NodeKind) -> Self {
        Self {
            chunk_file_index: NO_CHUNK,
            offset: NO_OFFSET,
            out_degree: 0,
            kind,
        }
    }
}

// ============================================================================
// BASE STORE
// ============================================================================

/// Persistent, random-access outgoing-synapse table
#[derive(Debug)]
pub(crate) struct BaseStore {
    dir: PathBuf,
    manifest_path: PathBuf,
    chunk_span: u32,
    registry_version: u16,
    index: HashMap<NodeId, IndexEntry>,
    /// Lower bounds of chunk files present on disk, sorted
    chunk_los: BTreeSet<u64>,
}

impl BaseStore {
    /// Open (or initialize empty) a base store rooted at `dir`.
    ///
    /// A monolithic single-file base left behind by an earlier layout is
    /// rechunked before the store is handed out.
    pub(crate) fn open(dir: &Path, chunk_span: u32) -> Result<Self> {
        let mut store = Self {
            dir: dir.to_path_buf(),
            manifest_path: dir.join("base.bin"),
            chunk_span,
            registry_version: 0,
            index: HashMap::new(),
            chunk_los: BTreeSet::new(),
        };
        store.load_manifest()?;
        store.scan_chunk_files();
        store.legacy_migrate()?;
        Ok(store)
    }

    /// Registry version embedded in the manifest (0 when no manifest exists)
    pub(crate) fn registry_version(&self) -> u16 {
        self.registry_version
    }

    /// Number of indexed nodes
    pub(crate) fn node_count(&self) -> usize {
        self.index.len()
    }

    /// Number of chunk files on disk
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunk_los.len()
    }

    /// Persisted `(id, kind)` pairs, for registry reconstruction on boot
    pub(crate) fn stored_nodes(&self) -> Vec<(NodeId, NodeKind)> {
        self.index.iter().map(|(id, e)| (*id, e.kind)).collect()
    }

    /// Out-degree recorded for a sender (0 when unindexed)
    pub(crate) fn out_degree(&self, sender: NodeId) -> u32 {
        self.index.get(&sender).map_or(0, |e| e.out_degree)
    }

    /// Highest tick stamped on any base record. Scanned once at boot so
    /// the engine never issues a tick older than a persisted one.
    pub(crate) fn max_tick(&self) -> Result<u32> {
        let mut max = 0_u32;
        for lo in &self.chunk_los {
            let path = self.chunk_path(*lo);
            let bytes = fs::read(&path)
                .map_err(|e| EngineError::io(format!("scanning {}", path.display()), e))?;
            for rec in bytes.chunks_exact(CHUNK_RECORD_LEN) {
                let tick = u32::from_le_bytes(rec[12..16].try_into().unwrap());
                max = max.max(tick);
            }
        }
        Ok(max)
    }

    fn chunk_lo(&self, sender: NodeId) -> u64 {
        (sender / self.chunk_span as u64) * self.chunk_span as u64
    }

    fn chunk_path(&self, lo: u64) -> PathBuf {
        let hi = lo + self.chunk_span as u64 - 1;
        self.dir.join(format!("base_{lo:06}_{hi:06}.bin"))
    }

    // ------------------------------------------------------------------
    // READ PATH
    // ------------------------------------------------------------------

    /// Read all outgoing synapses for `sender`, sorted by receiver.
    pub(crate) fn read_outgoing(&self, sender: NodeId) -> Result<Vec<SynapseRec>> {
        let entry = self
            .index
            .get(&sender)
            .ok_or(EngineError::UnknownNode { id: sender, role: "sender" })?;
        if entry.out_degree == 0 {
            return Ok(Vec::new());
        }

        let path = if entry.chunk_file_index == NO_CHUNK {
            // Legacy monolithic layout: records live in the manifest file.
            self.manifest_path.clone()
        } else {
            let lo = self
                .chunk_los
                .iter()
                .nth(entry.chunk_file_index as usize)
                .copied()
                .ok_or_else(|| {
                    EngineError::io(
                        format!("node index references missing chunk for sender {sender}"),
                        std::io::Error::from(std::io::ErrorKind::NotFound),
                    )
                })?;
            self.chunk_path(lo)
        };

        let mut f = File::open(&path)
            .map_err(|e| EngineError::io(format!("opening {}", path.display()), e))?;
        f.seek(SeekFrom::Start(entry.offset))
            .map_err(|e| EngineError::io(format!("seeking in {}", path.display()), e))?;

        let mut out = Vec::with_capacity(entry.out_degree as usize);
        let mut buf = [0_u8; CHUNK_RECORD_LEN];
        for _ in 0..entry.out_degree {
            f.read_exact(&mut buf)
                .map_err(|e| EngineError::io(format!("reading synapses for sender {sender}"), e))?;
            out.push(SynapseRec {
                receiver: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
                weight: f32::from_le_bytes(buf[8..12].try_into().unwrap()),
                tick: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // WRITE PATH
    // ------------------------------------------------------------------

    /// Replace the adjacency of one sender. Used only by consolidation.
    #[allow(dead_code)]
    pub(crate) fn rewrite_sender(&mut self, sender: NodeId, list: Vec<SynapseRec>) -> Result<()> {
        let mut changed = BTreeMap::new();
        changed.insert(sender, list);
        self.rewrite_senders(changed)
    }

    /// Replace the adjacency of a set of senders, atomically per chunk.
    ///
    /// Unchanged senders sharing a chunk with a changed one are carried
    /// over; affected chunks are written to a temp file and swapped by
    /// rename, then the manifest is rewritten and fsynced.
    pub(crate) fn rewrite_senders(
        &mut self,
        changed: BTreeMap<NodeId, Vec<SynapseRec>>,
    ) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }

        let affected: BTreeSet<u64> = changed.keys().map(|s| self.chunk_lo(*s)).collect();

        // Gather the full record set per affected chunk before touching disk.
        let mut per_chunk: BTreeMap<u64, BTreeMap<NodeId, Vec<SynapseRec>>> = BTreeMap::new();
        let senders: Vec<NodeId> = self.index.keys().copied().collect();
        for sender in senders {
            let lo = self.chunk_lo(sender);
            if !affected.contains(&lo) {
                continue;
            }
            let list = match changed.get(&sender) {
                Some(list) => list.clone(),
                None => self.read_outgoing(sender)?,
            };
            per_chunk.entry(lo).or_default().insert(sender, list);
        }

        for (lo, chunk_data) in &per_chunk {
            self.write_chunk(*lo, chunk_data)?;
        }
        self.write_manifest()?;
        sync_dir(&self.dir)
    }

    /// Rewrite the entire base: node set, kinds, adjacency and registry
    /// version. Used by bootstrap and registry migration.
    pub(crate) fn write_full(
        &mut self,
        data: &BTreeMap<NodeId, Vec<SynapseRec>>,
        kinds: &HashMap<NodeId, NodeKind>,
        registry_version: u16,
    ) -> Result<()> {
        // Stale chunks from removed senders must not survive the rewrite.
        for lo in std::mem::take(&mut self.chunk_los) {
            let _ = fs::remove_file(self.chunk_path(lo));
        }
        self.index = data
            .keys()
            .map(|id| {
                let kind = kinds.get(id).copied().unwrap_or_default();
                (*id, IndexEntry::empty(kind))
            })
            .collect();
        self.registry_version = registry_version;

        let mut per_chunk: BTreeMap<u64, BTreeMap<NodeId, Vec<SynapseRec>>> = BTreeMap::new();
        for (sender, list) in data {
            per_chunk
                .entry(self.chunk_lo(*sender))
                .or_default()
                .insert(*sender, list.clone());
        }
        for (lo, chunk_data) in &per_chunk {
            self.write_chunk(*lo, chunk_data)?;
        }
        self.write_manifest()?;
        sync_dir(&self.dir)
    }

    /// Serialize one chunk file. Records are laid out senders-ascending,
    /// receivers-ascending; index entries for the chunk's senders are
    /// refreshed in memory.
    fn write_chunk(&mut self, lo: u64, data: &BTreeMap<NodeId, Vec<SynapseRec>>) -> Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        let mut placements: Vec<(NodeId, u64, u32)> = Vec::new();

        for (sender, list) in data {
            let mut records = list.clone();
            records.sort_by_key(|r| r.receiver);
            let offset = buf.len() as u64;
            for rec in &records {
                buf.extend_from_slice(&rec.receiver.to_le_bytes());
                buf.extend_from_slice(&rec.weight.to_le_bytes());
                buf.extend_from_slice(&rec.tick.to_le_bytes());
            }
            placements.push((*sender, offset, records.len() as u32));
        }

        let path = self.chunk_path(lo);
        if buf.is_empty() {
            // Every sender in range is now edgeless: drop the chunk file.
            let _ = fs::remove_file(&path);
            self.chunk_los.remove(&lo);
        } else {
            let tmp = path.with_extension("bin.tmp");
            let mut f = File::create(&tmp)
                .map_err(|e| EngineError::io(format!("creating {}", tmp.display()), e))?;
            f.write_all(&buf)
                .map_err(|e| EngineError::io(format!("writing {}", tmp.display()), e))?;
            f.sync_all()
                .map_err(|e| EngineError::io(format!("syncing {}", tmp.display()), e))?;
            fs::rename(&tmp, &path)
                .map_err(|e| EngineError::io(format!("renaming {}", tmp.display()), e))?;
            self.chunk_los.insert(lo);
        }

        // chunk_file_index values are resolved against the final chunk set
        // when the manifest is written; stash offset/degree here.
        for (sender, offset, degree) in placements {
            let kind = self.index.get(&sender).map(|e| e.kind).unwrap_or_default();
            let entry = if degree == 0 {
                IndexEntry::empty(kind)
            } else {
                IndexEntry {
                    chunk_file_index: 0, // fixed up in write_manifest
                    offset,
                    out_degree: degree,
                    kind,
                }
            };
            self.index.insert(sender, entry);
        }
        Ok(())
    }

    /// Serialize the manifest (header + node index), atomically.
    fn write_manifest(&mut self) -> Result<()> {
        // Resolve chunk_file_index against the sorted chunk list.
        let chunk_pos: HashMap<u64, u32> = self
            .chunk_los
            .iter()
            .enumerate()
            .map(|(i, lo)| (*lo, i as u32))
            .collect();
        let ids: Vec<NodeId> = {
            let mut v: Vec<NodeId> = self.index.keys().copied().collect();
            v.sort_unstable();
            v
        };
        for id in &ids {
            let lo = self.chunk_lo(*id);
            if let Some(entry) = self.index.get_mut(id) {
                if entry.out_degree > 0 {
                    entry.chunk_file_index = *chunk_pos.get(&lo).unwrap_or(&NO_CHUNK);
                }
            }
        }

        let mut buf: Vec<u8> =
            Vec::with_capacity(BASE_HEADER_LEN + ids.len() * INDEX_ENTRY_LEN);
        buf.extend_from_slice(&BASE_MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.chunk_span.to_le_bytes());
        buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.registry_version.to_le_bytes());
        for id in &ids {
            let entry = &self.index[id];
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&entry.chunk_file_index.to_le_bytes());
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&entry.out_degree.to_le_bytes());
            buf.push(entry.kind.to_u8());
        }

        let tmp = self.dir.join("base.bin.tmp");
        let mut f = File::create(&tmp)
            .map_err(|e| EngineError::io("creating manifest temp file", e))?;
        f.write_all(&buf)
            .map_err(|e| EngineError::io("writing manifest", e))?;
        f.sync_all()
            .map_err(|e| EngineError::io("syncing manifest", e))?;
        fs::rename(&tmp, &self.manifest_path)
            .map_err(|e| EngineError::io("renaming manifest into place", e))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // BOOT
    // ------------------------------------------------------------------

    fn load_manifest(&mut self) -> Result<()> {
        let mut f = match File::open(&self.manifest_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(EngineError::io("opening base.bin", e)),
        };

        let mut header = [0_u8; BASE_HEADER_LEN];
        if f.read_exact(&mut header).is_err() {
            warn!("base.bin shorter than its header; starting from an empty base");
            return Ok(());
        }
        if header[0..4] != BASE_MAGIC {
            warn!("base.bin has a foreign magic; starting from an empty base");
            return Ok(());
        }
        let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
        if version != FORMAT_VERSION {
            warn!(version, "unsupported base format version; starting from an empty base");
            return Ok(());
        }
        let chunk_span = u32::from_le_bytes(header[6..10].try_into().unwrap());
        if chunk_span > 0 {
            self.chunk_span = chunk_span;
        }
        let node_count = u32::from_le_bytes(header[10..14].try_into().unwrap());
        self.registry_version = u16::from_le_bytes(header[14..16].try_into().unwrap());

        let mut rec = [0_u8; INDEX_ENTRY_LEN];
        for _ in 0..node_count {
            if f.read_exact(&mut rec).is_err() {
                warn!("truncated node index in base.bin; keeping the entries read so far");
                break;
            }
            let node_id = u64::from_le_bytes(rec[0..8].try_into().unwrap());
            self.index.insert(
                node_id,
                IndexEntry {
                    chunk_file_index: u32::from_le_bytes(rec[8..12].try_into().unwrap()),
                    offset: u64::from_le_bytes(rec[12..20].try_into().unwrap()),
                    out_degree: u32::from_le_bytes(rec[20..24].try_into().unwrap()),
                    kind: NodeKind::from_u8(rec[24]),
                },
            );
        }
        Ok(())
    }

    fn scan_chunk_files(&mut self) {
        self.chunk_los.clear();
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("base_") || !name.ends_with(".bin") {
                continue;
            }
            let parts: Vec<&str> = name.trim_end_matches(".bin").split('_').collect();
            if parts.len() == 3 {
                if let Ok(lo) = parts[1].parse::<u64>() {
                    self.chunk_los.insert(lo);
                }
            }
        }
    }

    /// Detect a monolithic single-file base (records appended to the
    /// manifest itself, no chunk files) and rechunk it in place.
    fn legacy_migrate(&mut self) -> Result<()> {
        if self.index.is_empty() || !self.chunk_los.is_empty() {
            return Ok(());
        }
        let has_legacy = self
            .index
            .values()
            .any(|e| e.out_degree > 0 && e.chunk_file_index == NO_CHUNK && e.offset != NO_OFFSET);
        if !has_legacy {
            return Ok(());
        }

        let mut data: BTreeMap<NodeId, Vec<SynapseRec>> = BTreeMap::new();
        let ids: Vec<NodeId> = self.index.keys().copied().collect();
        for id in ids {
            data.insert(id, self.read_outgoing(id)?);
        }
        let kinds: HashMap<NodeId, NodeKind> = self.stored_nodes().into_iter().collect();
        let version = self.registry_version;
        self.write_full(&data, &kinds, version)?;
        info!(nodes = data.len(), "migrated monolithic base into chunked layout");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn kinds_for(ids: &[NodeId]) -> HashMap<NodeId, NodeKind> {
        ids.iter().map(|id| (*id, NodeKind::Internal)).collect()
    }

    fn rec(receiver: NodeId, weight: f32, tick: u32) -> SynapseRec {
        SynapseRec { receiver, weight, tick }
    }

    #[test]
    fn empty_store_boots_with_no_nodes() {
        let dir = TempDir::new().unwrap();
        let store = BaseStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.node_count(), 0);
        assert_eq!(store.chunk_count(), 0);
        assert!(matches!(
            store.read_outgoing(1),
            Err(EngineError::UnknownNode { id: 1, .. })
        ));
    }

    #[test]
    fn write_full_then_cold_reopen_reads_same_state() {
        let dir = TempDir::new().unwrap();
        let mut data = BTreeMap::new();
        data.insert(1, vec![rec(2, 0.5, 1), rec(3, 0.25, 2)]);
        data.insert(2, vec![]);
        data.insert(150, vec![rec(1, 0.9, 3)]);

        {
            let mut store = BaseStore::open(dir.path(), 100).unwrap();
            store.write_full(&data, &kinds_for(&[1, 2, 150]), 7).unwrap();
        }

        let store = BaseStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.node_count(), 3);
        assert_eq!(store.registry_version(), 7);
        // Senders 1 and 150 land in different chunk ranges.
        assert_eq!(store.chunk_count(), 2);
        assert!(dir.path().join("base_000000_000099.bin").exists());
        assert!(dir.path().join("base_000100_000199.bin").exists());

        assert_eq!(
            store.read_outgoing(1).unwrap(),
            vec![rec(2, 0.5, 1), rec(3, 0.25, 2)]
        );
        assert_eq!(store.read_outgoing(2).unwrap(), vec![]);
        assert_eq!(store.read_outgoing(150).unwrap(), vec![rec(1, 0.9, 3)]);
    }

    #[test]
    fn rewrite_sender_preserves_chunk_mates() {
        let dir = TempDir::new().unwrap();
        let mut store = BaseStore::open(dir.path(), 100).unwrap();
        let mut data = BTreeMap::new();
        data.insert(5, vec![rec(6, 0.4, 1)]);
        data.insert(6, vec![rec(5, 0.6, 1)]);
        store.write_full(&data, &kinds_for(&[5, 6]), 1).unwrap();

        store.rewrite_sender(5, vec![rec(6, 0.8, 2), rec(7, 0.1, 2)]).unwrap();

        assert_eq!(
            store.read_outgoing(5).unwrap(),
            vec![rec(6, 0.8, 2), rec(7, 0.1, 2)]
        );
        // The chunk-mate's records survive the rewrite untouched.
        assert_eq!(store.read_outgoing(6).unwrap(), vec![rec(5, 0.6, 1)]);

        let reopened = BaseStore::open(dir.path(), 100).unwrap();
        assert_eq!(
            reopened.read_outgoing(5).unwrap(),
            vec![rec(6, 0.8, 2), rec(7, 0.1, 2)]
        );
    }

    #[test]
    fn records_are_sorted_by_receiver_on_disk() {
        let dir = TempDir::new().unwrap();
        let mut store = BaseStore::open(dir.path(), 100).unwrap();
        let mut data = BTreeMap::new();
        data.insert(1, vec![rec(9, 0.1, 1), rec(2, 0.2, 1), rec(5, 0.3, 1)]);
        store.write_full(&data, &kinds_for(&[1]), 1).unwrap();

        let out = store.read_outgoing(1).unwrap();
        let receivers: Vec<NodeId> = out.iter().map(|r| r.receiver).collect();
        assert_eq!(receivers, vec![2, 5, 9]);
    }

    #[test]
    fn emptied_chunk_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let mut store = BaseStore::open(dir.path(), 100).unwrap();
        let mut data = BTreeMap::new();
        data.insert(150, vec![rec(1, 0.9, 1)]);
        data.insert(1, vec![rec(2, 0.5, 1)]);
        store.write_full(&data, &kinds_for(&[1, 150]), 1).unwrap();
        assert!(dir.path().join("base_000100_000199.bin").exists());

        store.rewrite_sender(150, vec![]).unwrap();
        assert!(!dir.path().join("base_000100_000199.bin").exists());
        assert_eq!(store.chunk_count(), 1);
        assert_eq!(store.read_outgoing(150).unwrap(), vec![]);
    }

    #[test]
    fn kinds_survive_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = BaseStore::open(dir.path(), 100).unwrap();
        let mut data = BTreeMap::new();
        data.insert(1, vec![]);
        data.insert(45, vec![]);
        let mut kinds = HashMap::new();
        kinds.insert(1, NodeKind::Sensor);
        kinds.insert(45, NodeKind::Action);
        store.write_full(&data, &kinds, 1).unwrap();

        let reopened = BaseStore::open(dir.path(), 100).unwrap();
        let stored: HashMap<NodeId, NodeKind> = reopened.stored_nodes().into_iter().collect();
        assert_eq!(stored[&1], NodeKind::Sensor);
        assert_eq!(stored[&45], NodeKind::Action);
    }
}
