//! Append-only delta log.
//!
//! Each record is length-prefixed and CRC-protected:
//! `(len u32, sender u64, receiver u64, weight f32, tick u32, crc32 u32)`,
//! with the CRC computed over the payload (everything between the length
//! prefix and the checksum). Replay scans from the start and stops at the
//! first record whose declared CRC disagrees with the recomputed one,
//! truncating the file there; a partial tail is tolerated, never trusted.
//!
//! Appends are buffered by the OS; the log is fsynced at consolidation
//! boundaries or on an explicit [`DeltaLog::sync`]. A successful
//! consolidation truncates the file to zero bytes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{EngineError, Result};
use crate::registry::{NodeId, Tick};

/// Payload bytes of one record (sender + receiver + weight + tick)
const PAYLOAD_LEN: usize = 8 + 8 + 4 + 4;
/// Full record: length prefix + payload + crc
pub(crate) const DELTA_RECORD_LEN: u64 = 4 + PAYLOAD_LEN as u64 + 4;

/// One replayed or pending delta record
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DeltaRecord {
    pub(crate) sender: NodeId,
    pub(crate) receiver: NodeId,
    pub(crate) weight: f32,
    pub(crate) tick: Tick,
}

// ============================================================================
// DELTA LOG
// ============================================================================

/// Append handle over `delta.bin`
#[derive(Debug)]
pub(crate) struct DeltaLog {
    path: PathBuf,
    file: File,
    records: u64,
}

impl DeltaLog {
    /// Open (creating if absent) the log and replay any existing records.
    ///
    /// Returns the log plus everything replayed, in append order.
    pub(crate) fn open(path: &Path) -> Result<(Self, Vec<DeltaRecord>)> {
        let replayed = replay_and_truncate(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::io("opening delta.bin for append", e))?;
        let log = Self {
            path: path.to_path_buf(),
            file,
            records: replayed.len() as u64,
        };
        Ok((log, replayed))
    }

    /// Records currently in the log
    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.records
    }

    /// Append one record. Durability is deferred to [`Self::sync`].
    pub(crate) fn append(&mut self, rec: &DeltaRecord) -> Result<()> {
        let mut payload = [0_u8; PAYLOAD_LEN];
        payload[0..8].copy_from_slice(&rec.sender.to_le_bytes());
        payload[8..16].copy_from_slice(&rec.receiver.to_le_bytes());
        payload[16..20].copy_from_slice(&rec.weight.to_le_bytes());
        payload[20..24].copy_from_slice(&rec.tick.to_le_bytes());
        let crc = crc32fast::hash(&payload);

        let mut buf = [0_u8; DELTA_RECORD_LEN as usize];
        buf[0..4].copy_from_slice(&(PAYLOAD_LEN as u32).to_le_bytes());
        buf[4..4 + PAYLOAD_LEN].copy_from_slice(&payload);
        buf[4 + PAYLOAD_LEN..].copy_from_slice(&crc.to_le_bytes());

        self.file
            .write_all(&buf)
            .map_err(|e| EngineError::io("appending delta record", e))?;
        self.records += 1;
        Ok(())
    }

    /// fsync the log (consolidation boundary or explicit flush).
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| EngineError::io("syncing delta.bin", e))
    }

    /// Truncate the log to zero bytes after a consolidation commit.
    pub(crate) fn truncate(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .map_err(|e| EngineError::io("truncating delta.bin", e))?;
        self.file
            .sync_all()
            .map_err(|e| EngineError::io("syncing truncated delta.bin", e))?;
        self.records = 0;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Scan the log from the start, collect CRC-valid records and cut the file
/// at the first bad one.
fn replay_and_truncate(path: &Path) -> Result<Vec<DeltaRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::io("opening delta.bin for replay", e)),
    };

    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_end: u64 = 0;

    loop {
        let mut len_buf = [0_u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(EngineError::io("reading delta record length", e)),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len != PAYLOAD_LEN {
            warn!(offset = valid_end, len, "delta record with foreign length; truncating log here");
            break;
        }

        let mut payload = [0_u8; PAYLOAD_LEN];
        let mut crc_buf = [0_u8; 4];
        if reader.read_exact(&mut payload).is_err() || reader.read_exact(&mut crc_buf).is_err() {
            warn!(offset = valid_end, "partial delta record tail; truncating log here");
            break;
        }
        let declared = u32::from_le_bytes(crc_buf);
        if crc32fast::hash(&payload) != declared {
            warn!(offset = valid_end, "delta record failed CRC; truncating log here");
            break;
        }

        records.push(DeltaRecord {
            sender: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
            receiver: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
            weight: f32::from_le_bytes(payload[16..20].try_into().unwrap()),
            tick: u32::from_le_bytes(payload[20..24].try_into().unwrap()),
        });
        valid_end += DELTA_RECORD_LEN;
    }

    let actual_len = std::fs::metadata(path)
        .map_err(|e| EngineError::io("stat delta.bin", e))?
        .len();
    if actual_len > valid_end {
        let f = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| EngineError::io("opening delta.bin for truncation", e))?;
        f.set_len(valid_end)
            .map_err(|e| EngineError::io("truncating corrupt delta tail", e))?;
        f.sync_all()
            .map_err(|e| EngineError::io("syncing truncated delta.bin", e))?;
    }
    Ok(records)
}

// ============================================================================
// DELTA INDEX
// ============================================================================

/// In-memory view of the log: `sender → receiver → (weight, tick)`,
/// last-write-wins by tick.
#[derive(Debug, Default)]
pub(crate) struct DeltaIndex {
    by_sender: HashMap<NodeId, HashMap<NodeId, (f32, Tick)>>,
    entries: usize,
}

impl DeltaIndex {
    /// Apply one record; older ticks never overwrite newer ones.
    pub(crate) fn apply(&mut self, rec: &DeltaRecord) {
        let slots = self.by_sender.entry(rec.sender).or_default();
        match slots.get(&rec.receiver) {
            Some((_, existing)) if *existing > rec.tick => {}
            Some(_) => {
                slots.insert(rec.receiver, (rec.weight, rec.tick));
            }
            None => {
                slots.insert(rec.receiver, (rec.weight, rec.tick));
                self.entries += 1;
            }
        }
    }

    /// Overlay entries for one sender
    pub(crate) fn for_sender(&self, sender: NodeId) -> Option<&HashMap<NodeId, (f32, Tick)>> {
        self.by_sender.get(&sender)
    }

    /// Senders with at least one pending entry
    pub(crate) fn senders(&self) -> Vec<NodeId> {
        self.by_sender.keys().copied().collect()
    }

    /// Number of distinct `(sender, receiver)` slots pending
    #[inline]
    pub(crate) fn entries(&self) -> usize {
        self.entries
    }

    /// Number of senders touched
    #[inline]
    pub(crate) fn sender_count(&self) -> usize {
        self.by_sender.len()
    }

    /// Highest tick seen, for tick recovery on boot
    pub(crate) fn max_tick(&self) -> Option<Tick> {
        self.by_sender
            .values()
            .flat_map(|m| m.values().map(|(_, t)| *t))
            .max()
    }

    /// Drop everything (post-consolidation)
    pub(crate) fn clear(&mut self) {
        self.by_sender.clear();
        self.entries = 0;
    }

    /// Number of pending entries for one sender
    pub(crate) fn entries_for(&self, sender: NodeId) -> usize {
        self.by_sender.get(&sender).map_or(0, |m| m.len())
    }
}
