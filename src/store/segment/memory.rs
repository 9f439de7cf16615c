//! Memory-backed [`Segment`]: the whole segment lives in a heap buffer
//! and is flushed to its backing file only on `force`.

use super::{SegResult, Segment, SegmentError, SegmentHeader, SegmentMode, DATA_START_POSITION};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct MemorySegment {
    id: u32,
    path: PathBuf,
    initial_size: u64,
    buf: Vec<u8>,
    append_pos: u64,
    mode: SegmentMode,
    header: SegmentHeader,
}

impl MemorySegment {
    /// Creates a brand-new segment file of `initial_size` bytes.
    pub fn create(dir: &Path, id: u32, initial_size: u64) -> SegResult<Self> {
        let path = segment_path(dir, id);
        let header = SegmentHeader::new();
        let mut buf = Vec::with_capacity(initial_size as usize);
        buf.extend_from_slice(&header.to_bytes());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&buf)?;
        file.sync_all()?;

        Ok(Self {
            id,
            path,
            initial_size,
            buf,
            append_pos: 0,
            mode: SegmentMode::ReadWrite,
            header,
        })
    }

    /// Opens an existing segment file, loading its full contents into
    /// memory. `initial_size` is the configured segment capacity, not
    /// the current on-disk length (segment files are never pre-extended
    /// to their full capacity, so the two routinely differ).
    pub fn open(dir: &Path, id: u32, mode: SegmentMode, initial_size: u64) -> SegResult<Self> {
        let path = segment_path(dir, id);
        let mut file = File::open(&path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if (buf.len() as u64) < DATA_START_POSITION {
            return Err(SegmentError::Io(std::io::Error::other(
                "segment file shorter than header",
            )));
        }
        let header = SegmentHeader::from_bytes(&buf[..DATA_START_POSITION as usize])
            .map_err(|e| SegmentError::Io(std::io::Error::other(e.to_string())))?;
        let append_pos = buf.len() as u64 - DATA_START_POSITION;
        Ok(Self {
            id,
            path,
            initial_size,
            buf,
            append_pos,
            mode,
            header,
        })
    }

    fn remaining(&self) -> u64 {
        self.initial_size
            .saturating_sub(DATA_START_POSITION)
            .saturating_sub(self.append_pos)
    }
}

fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{}.seg", id))
}

impl Segment for MemorySegment {
    fn id(&self) -> u32 {
        self.id
    }

    fn append(&mut self, bytes: &[u8]) -> SegResult<u32> {
        if self.mode == SegmentMode::ReadOnly {
            return Err(SegmentError::ReadOnly);
        }
        let needed = 4u64 + bytes.len() as u64;
        if needed > self.remaining() {
            return Err(SegmentError::Overflow);
        }
        let abs_offset = DATA_START_POSITION + self.append_pos;
        self.buf
            .extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
        self.append_pos += needed;
        Ok(abs_offset as u32)
    }

    fn read(&self, offset: u32, length: u16) -> SegResult<Vec<u8>> {
        let offset = offset as usize;
        let declared_len_bytes = self
            .buf
            .get(offset..offset + 4)
            .ok_or_else(|| SegmentError::Io(std::io::Error::other("offset out of range")))?;
        let declared_len = u32::from_be_bytes(declared_len_bytes.try_into().unwrap()) as usize;
        if declared_len != length as usize {
            return Err(SegmentError::Io(std::io::Error::other(
                "address length disagrees with record header",
            )));
        }
        let start = offset + 4;
        let end = start + declared_len;
        self.buf
            .get(start..end)
            .map(|b| b.to_vec())
            .ok_or_else(|| SegmentError::Io(std::io::Error::other("truncated record")))
    }

    fn force(&mut self) -> SegResult<()> {
        self.header.last_forced_time = now_millis();
        self.buf[0..DATA_START_POSITION as usize].copy_from_slice(&self.header.to_bytes());
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.write_all(&self.buf)?;
        file.sync_all()?;
        Ok(())
    }

    fn as_read_only(&mut self) {
        self.mode = SegmentMode::ReadOnly;
    }

    fn mode(&self) -> SegmentMode {
        self.mode
    }

    fn load_size(&self) -> u64 {
        self.append_pos
    }

    fn initial_size(&self) -> u64 {
        self.initial_size
    }

    fn append_position(&self) -> u64 {
        DATA_START_POSITION + self.append_pos
    }

    fn last_forced_time(&self) -> u64 {
        self.header.last_forced_time
    }

    fn free(&mut self) -> SegResult<()> {
        self.buf.clear();
        self.buf.shrink_to_fit();
        Ok(())
    }

    fn rewind_to(&mut self, pos: u64) -> SegResult<()> {
        self.append_pos = pos;
        self.buf.truncate((DATA_START_POSITION + pos) as usize);
        Ok(())
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut seg = MemorySegment::create(dir.path(), 0, 1024).unwrap();
        let off_a = seg.append(b"hello").unwrap();
        let off_b = seg.append(b"world!!").unwrap();
        assert_eq!(seg.read(off_a, 5).unwrap(), b"hello");
        assert_eq!(seg.read(off_b, 7).unwrap(), b"world!!");
        assert_eq!(seg.load_size(), (4 + 5) + (4 + 7));
    }

    #[test]
    fn overflow_when_remaining_capacity_too_small() {
        let dir = tempdir().unwrap();
        let mut seg = MemorySegment::create(dir.path(), 0, 64).unwrap();
        // header is 32 bytes, so 32 bytes remain for payload+prefixes.
        seg.append(&[0u8; 20]).unwrap();
        match seg.append(&[0u8; 20]) {
            Err(SegmentError::Overflow) => {}
            other => panic!("expected Overflow, got {other:?}"),
        }
    }

    #[test]
    fn sealed_segment_rejects_append() {
        let dir = tempdir().unwrap();
        let mut seg = MemorySegment::create(dir.path(), 0, 1024).unwrap();
        seg.as_read_only();
        match seg.append(b"x") {
            Err(SegmentError::ReadOnly) => {}
            other => panic!("expected ReadOnly, got {other:?}"),
        }
    }

    #[test]
    fn force_then_reopen_preserves_bytes_and_forced_time() {
        let dir = tempdir().unwrap();
        let mut seg = MemorySegment::create(dir.path(), 7, 1024).unwrap();
        let off = seg.append(b"durable").unwrap();
        seg.force().unwrap();
        assert!(seg.last_forced_time() > 0);

        let reopened = MemorySegment::open(dir.path(), 7, SegmentMode::ReadOnly, 1024).unwrap();
        assert_eq!(reopened.read(off, 7).unwrap(), b"durable");
        assert_eq!(reopened.last_forced_time(), seg.last_forced_time());
        assert_eq!(reopened.initial_size(), 1024);
    }

    #[test]
    fn rewind_to_truncates_tail() {
        let dir = tempdir().unwrap();
        let mut seg = MemorySegment::create(dir.path(), 0, 1024).unwrap();
        seg.append(b"aaa").unwrap();
        let keep_at = seg.load_size();
        seg.append(b"bbb").unwrap();
        seg.rewind_to(keep_at).unwrap();
        assert_eq!(seg.load_size(), keep_at);
    }
}
