//! Redo entries, batches and the `EntryManager` ring (spec §4.2).
//!
//! Entry file layout (bit-exact, little-endian):
//! header `[magic:u64, version:u16, kind:u8, count:u32, minScn:u64,
//! maxScn:u64]`, body of `count` fixed-size records, trailer `crc32:u32`
//! over the body. File name: `entry_<minScn>_<maxScn>_<kind>.redo`.

use crate::store::error::{Result, StoreError};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// `"KRATILOG"` read as 8 little-endian bytes — a printable-ASCII magic
/// constant in the style of other length-prefixed binary formats.
pub const REDO_MAGIC: u64 = u64::from_le_bytes(*b"KRATILOG");
pub const REDO_FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 8 + 2 + 1 + 4 + 8 + 8;
const NORMAL_RECORD_LEN: usize = 4 + 8 + 8 + 8;
const COMPACTION_RECORD_LEN: usize = 4 + 8 + 8;
const TRAILER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoKind {
    /// Records the old address too, for compaction reversal checks.
    Normal,
    /// Marks the update as originating from segment-copy compaction.
    Compaction,
}

impl RedoKind {
    fn code(self) -> u8 {
        match self {
            RedoKind::Normal => 0,
            RedoKind::Compaction => 1,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(RedoKind::Normal),
            1 => Ok(RedoKind::Compaction),
            other => Err(StoreError::RedoCorrupted(format!(
                "unknown redo entry kind code {other}"
            ))),
        }
    }

    fn file_tag(self) -> &'static str {
        match self {
            RedoKind::Normal => "normal",
            RedoKind::Compaction => "compaction",
        }
    }

    fn record_len(self) -> usize {
        match self {
            RedoKind::Normal => NORMAL_RECORD_LEN,
            RedoKind::Compaction => COMPACTION_RECORD_LEN,
        }
    }
}

/// A single address-array mutation within a batch.
#[derive(Debug, Clone, Copy)]
pub struct RedoRecord {
    pub index: u32,
    pub new_address: u64,
    /// Only meaningful (and only serialized) for `RedoKind::Normal`.
    pub old_address: u64,
    pub scn: u64,
}

/// An in-progress batch of redo records, not yet sealed to disk.
pub struct RedoBatchBuilder {
    kind: RedoKind,
    records: Vec<RedoRecord>,
}

impl RedoBatchBuilder {
    fn new(kind: RedoKind) -> Self {
        Self {
            kind,
            records: Vec::new(),
        }
    }

    fn push(&mut self, record: RedoRecord) {
        debug_assert!(
            self.records.last().map(|r| r.scn <= record.scn).unwrap_or(true),
            "redo batch entries must be non-decreasing in scn"
        );
        self.records.push(record);
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    /// Seals the batch: encodes it, writes + forces it to a uniquely
    /// named file, and returns the metadata needed to track it as a
    /// sealed-but-unapplied batch.
    fn seal(self, dir: &Path) -> Result<SealedBatch> {
        debug_assert!(!self.records.is_empty());
        let min_scn = self.records.first().unwrap().scn;
        let max_scn = self.records.last().unwrap().scn;
        let path = dir.join(format!(
            "entry_{}_{}_{}.redo",
            min_scn,
            max_scn,
            self.kind.file_tag()
        ));
        let bytes = encode_batch(self.kind, min_scn, max_scn, &self.records);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(SealedBatch {
            path,
            kind: self.kind,
            min_scn,
            max_scn,
            records: self.records,
        })
    }
}

/// A sealed batch, either freshly rotated in this process or recovered
/// from an existing `*.redo` file on disk.
pub struct SealedBatch {
    pub path: PathBuf,
    pub kind: RedoKind,
    pub min_scn: u64,
    pub max_scn: u64,
    pub records: Vec<RedoRecord>,
}

fn encode_batch(kind: RedoKind, min_scn: u64, max_scn: u64, records: &[RedoRecord]) -> Vec<u8> {
    let mut body = Vec::with_capacity(records.len() * kind.record_len());
    for r in records {
        body.extend_from_slice(&r.index.to_le_bytes());
        body.extend_from_slice(&r.new_address.to_le_bytes());
        if kind == RedoKind::Normal {
            body.extend_from_slice(&r.old_address.to_le_bytes());
        }
        body.extend_from_slice(&r.scn.to_le_bytes());
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + TRAILER_LEN);
    out.extend_from_slice(&REDO_MAGIC.to_le_bytes());
    out.extend_from_slice(&REDO_FORMAT_VERSION.to_le_bytes());
    out.push(kind.code());
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    out.extend_from_slice(&min_scn.to_le_bytes());
    out.extend_from_slice(&max_scn.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Decodes and CRC-validates a `*.redo` file.
pub fn decode_file(path: &Path) -> Result<SealedBatch> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    if buf.len() < HEADER_LEN + TRAILER_LEN {
        return Err(StoreError::RedoCorrupted(format!(
            "{}: file shorter than header+trailer",
            path.display()
        )));
    }

    let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    if magic != REDO_MAGIC {
        return Err(StoreError::RedoCorrupted(format!(
            "{}: bad magic",
            path.display()
        )));
    }
    let version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
    if version != REDO_FORMAT_VERSION {
        return Err(StoreError::RedoCorrupted(format!(
            "{}: unsupported format version {}",
            path.display(),
            version
        )));
    }
    let kind = RedoKind::from_code(buf[10])?;
    let count = u32::from_le_bytes(buf[11..15].try_into().unwrap()) as usize;
    let min_scn = u64::from_le_bytes(buf[15..23].try_into().unwrap());
    let max_scn = u64::from_le_bytes(buf[23..31].try_into().unwrap());

    let record_len = kind.record_len();
    let body_len = count * record_len;
    let body_start = HEADER_LEN;
    let body_end = body_start + body_len;
    if buf.len() < body_end + TRAILER_LEN {
        return Err(StoreError::RedoCorrupted(format!(
            "{}: truncated body",
            path.display()
        )));
    }
    let body = &buf[body_start..body_end];
    let expected_crc = u32::from_le_bytes(
        buf[body_end..body_end + TRAILER_LEN].try_into().unwrap(),
    );
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    let computed_crc = hasher.finalize();
    if computed_crc != expected_crc {
        return Err(StoreError::RedoCorrupted(format!(
            "{}: crc mismatch (expected {:08x}, computed {:08x})",
            path.display(),
            expected_crc,
            computed_crc
        )));
    }

    let mut records = Vec::with_capacity(count);
    let mut off = 0usize;
    for _ in 0..count {
        let index = u32::from_le_bytes(body[off..off + 4].try_into().unwrap());
        off += 4;
        let new_address = u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
        off += 8;
        let old_address = if kind == RedoKind::Normal {
            let v = u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
            off += 8;
            v
        } else {
            0
        };
        let scn = u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
        off += 8;
        records.push(RedoRecord {
            index,
            new_address,
            old_address,
            scn,
        });
    }

    Ok(SealedBatch {
        path: path.to_path_buf(),
        kind,
        min_scn,
        max_scn,
        records,
    })
}

/// Manages the bounded ring of in-progress and sealed-but-unapplied
/// redo batches for one `AddressArray`.
///
/// Normal and compaction mutations are tracked in separate in-progress
/// builders (a redo file's kind byte is singular, so a file can't mix
/// the two), but they share one `sealed_pending` ring and are applied
/// together in ascending scn order.
pub struct EntryManager {
    dir: PathBuf,
    batch_size: usize,
    max_entries: usize,
    current_normal: RedoBatchBuilder,
    current_compaction: RedoBatchBuilder,
    sealed_pending: Vec<SealedBatch>,
}

impl EntryManager {
    pub fn new(dir: PathBuf, batch_size: usize, max_entries: usize) -> Self {
        Self {
            dir,
            batch_size,
            max_entries,
            current_normal: RedoBatchBuilder::new(RedoKind::Normal),
            current_compaction: RedoBatchBuilder::new(RedoKind::Compaction),
            sealed_pending: Vec::new(),
        }
    }

    /// Appends a record, rotating the relevant in-progress batch if it
    /// just reached `batch_size`. Returns any batches that became
    /// eligible for apply-and-prune as a result (caller applies them
    /// into `indexes.dat`).
    pub fn record(&mut self, kind: RedoKind, rec: RedoRecord) -> Result<Vec<SealedBatch>> {
        let builder = match kind {
            RedoKind::Normal => &mut self.current_normal,
            RedoKind::Compaction => &mut self.current_compaction,
        };
        builder.push(rec);

        if builder.len() >= self.batch_size {
            self.rotate(kind)?;
        }

        if self.sealed_pending.len() >= self.max_entries {
            Ok(self.drain_pending())
        } else {
            Ok(Vec::new())
        }
    }

    fn rotate(&mut self, kind: RedoKind) -> Result<()> {
        let builder = match kind {
            RedoKind::Normal => std::mem::replace(
                &mut self.current_normal,
                RedoBatchBuilder::new(RedoKind::Normal),
            ),
            RedoKind::Compaction => std::mem::replace(
                &mut self.current_compaction,
                RedoBatchBuilder::new(RedoKind::Compaction),
            ),
        };
        if !builder.is_empty() {
            let sealed = builder.seal(&self.dir)?;
            log::debug!(
                "sealed redo batch {} ({} records, scn {}..={})",
                sealed.path.display(),
                sealed.records.len(),
                sealed.min_scn,
                sealed.max_scn
            );
            self.sealed_pending.push(sealed);
        }
        Ok(())
    }

    /// Forces both in-progress batches to disk (even if under
    /// `batch_size`) and returns every sealed-but-unapplied batch for
    /// the caller to apply. Used by `sync()` and `save_hw_mark()`.
    pub fn flush(&mut self) -> Result<Vec<SealedBatch>> {
        self.rotate(RedoKind::Normal)?;
        self.rotate(RedoKind::Compaction)?;
        Ok(self.drain_pending())
    }

    fn drain_pending(&mut self) -> Vec<SealedBatch> {
        std::mem::take(&mut self.sealed_pending)
    }

    /// Deletes a batch's backing file once it has been applied into
    /// `indexes.dat`.
    pub fn delete_applied(&self, batch: &SealedBatch) -> Result<()> {
        if batch.path.exists() {
            fs::remove_file(&batch.path)?;
        }
        Ok(())
    }

    /// Zeros all in-memory state and removes every `*.redo` file —
    /// used by `AddressArray::clear()`.
    pub fn clear(&mut self) -> Result<()> {
        self.current_normal = RedoBatchBuilder::new(RedoKind::Normal);
        self.current_compaction = RedoBatchBuilder::new(RedoKind::Compaction);
        self.sealed_pending.clear();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("redo") {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn pending_batch_count(&self) -> usize {
        self.sealed_pending.len()
    }
}

/// Parses `(minScn, maxScn)` out of a `entry_<min>_<max>_<kind>.redo`
/// filename without trusting or even reading the file's contents —
/// used to decide whether a corrupt file is eligible for discard
/// during recovery.
pub fn parse_filename_scn_range(path: &Path) -> Option<(u64, u64)> {
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix("entry_")?;
    let mut parts = rest.splitn(3, '_');
    let min_scn = parts.next()?.parse().ok()?;
    let max_scn = parts.next()?.parse().ok()?;
    Some((min_scn, max_scn))
}

