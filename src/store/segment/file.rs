//! Write-buffered, file-backed [`Segment`]. Writes accumulate in a
//! bounded `BufWriter` over the OS file; reads go through a fresh
//! positioned read so they never contend with the writer's buffer.

use super::{SegResult, Segment, SegmentError, SegmentHeader, SegmentMode, DATA_START_POSITION};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FileSegment {
    id: u32,
    path: PathBuf,
    initial_size: u64,
    writer: Option<BufWriter<File>>,
    append_pos: u64,
    mode: SegmentMode,
    header: SegmentHeader,
}

impl FileSegment {
    pub fn create(dir: &Path, id: u32, initial_size: u64) -> SegResult<Self> {
        let path = segment_path(dir, id);
        let header = SegmentHeader::new();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&header.to_bytes())?;
        file.flush()?;
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            id,
            path,
            initial_size,
            writer: Some(BufWriter::new(file)),
            append_pos: 0,
            mode: SegmentMode::ReadWrite,
            header,
        })
    }

    /// Opens an existing segment file. `append_pos` is derived from the
    /// file's current length, which the manager may have already
    /// rewound past a truncated tail record during recovery.
    /// `initial_size` is the configured segment capacity, not the
    /// current on-disk length (segment files are never pre-extended to
    /// their full capacity, so the two routinely differ).
    pub fn open(dir: &Path, id: u32, mode: SegmentMode, initial_size: u64) -> SegResult<Self> {
        let path = segment_path(dir, id);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < DATA_START_POSITION {
            return Err(SegmentError::Io(std::io::Error::other(
                "segment file shorter than header",
            )));
        }
        let mut header_buf = vec![0u8; DATA_START_POSITION as usize];
        file.read_exact(&mut header_buf)?;
        let header = SegmentHeader::from_bytes(&header_buf)
            .map_err(|e| SegmentError::Io(std::io::Error::other(e.to_string())))?;
        file.seek(SeekFrom::End(0))?;
        let append_pos = len - DATA_START_POSITION;

        let writer = if mode == SegmentMode::ReadWrite {
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            id,
            path,
            initial_size,
            writer,
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

impl Segment for FileSegment {
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
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SegmentError::Io(std::io::Error::other("no writer for this segment")))?;
        let abs_offset = DATA_START_POSITION + self.append_pos;
        writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
        writer.write_all(bytes)?;
        // Flush (not fsync) so a reader opening a fresh file handle on
        // this path sees the bytes immediately; durability across a
        // crash is still `force`'s job.
        writer.flush()?;
        self.append_pos += needed;
        Ok(abs_offset as u32)
    }

    fn read(&self, offset: u32, length: u16) -> SegResult<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let declared_len = u32::from_be_bytes(len_buf) as usize;
        if declared_len != length as usize {
            return Err(SegmentError::Io(std::io::Error::other(
                "address length disagrees with record header",
            )));
        }
        let mut payload = vec![0u8; declared_len];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn force(&mut self) -> SegResult<()> {
        self.header.last_forced_time = now_millis();
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            let file = writer.get_mut();
            let pos = file.stream_position()?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&self.header.to_bytes())?;
            file.seek(SeekFrom::Start(pos))?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn as_read_only(&mut self) {
        self.mode = SegmentMode::ReadOnly;
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
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
        self.writer = None;
        Ok(())
    }

    fn rewind_to(&mut self, pos: u64) -> SegResult<()> {
        self.append_pos = pos;
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            let file = writer.get_mut();
            file.set_len(DATA_START_POSITION + pos)?;
            file.seek(SeekFrom::End(0))?;
        }
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
        let mut seg = FileSegment::create(dir.path(), 0, 1024).unwrap();
        let off_a = seg.append(b"hello").unwrap();
        let off_b = seg.append(b"world!!").unwrap();
        assert_eq!(seg.read(off_a, 5).unwrap(), b"hello");
        assert_eq!(seg.read(off_b, 7).unwrap(), b"world!!");
    }

    #[test]
    fn overflow_when_remaining_capacity_too_small() {
        let dir = tempdir().unwrap();
        let mut seg = FileSegment::create(dir.path(), 0, 64).unwrap();
        seg.append(&[0u8; 20]).unwrap();
        match seg.append(&[0u8; 20]) {
            Err(SegmentError::Overflow) => {}
            other => panic!("expected Overflow, got {other:?}"),
        }
    }

    #[test]
    fn sealed_segment_rejects_append() {
        let dir = tempdir().unwrap();
        let mut seg = FileSegment::create(dir.path(), 0, 1024).unwrap();
        seg.as_read_only();
        match seg.append(b"x") {
            Err(SegmentError::ReadOnly) => {}
            other => panic!("expected ReadOnly, got {other:?}"),
        }
    }

    #[test]
    fn force_then_reopen_preserves_bytes() {
        let dir = tempdir().unwrap();
        let mut seg = FileSegment::create(dir.path(), 3, 1024).unwrap();
        let off = seg.append(b"durable").unwrap();
        seg.force().unwrap();
        drop(seg);

        let reopened = FileSegment::open(dir.path(), 3, SegmentMode::ReadOnly, 1024).unwrap();
        assert_eq!(reopened.read(off, 7).unwrap(), b"durable");
        assert_eq!(reopened.initial_size(), 1024);
    }

    #[test]
    fn rewind_to_truncates_tail_on_disk() {
        let dir = tempdir().unwrap();
        let mut seg = FileSegment::create(dir.path(), 0, 1024).unwrap();
        seg.append(b"aaa").unwrap();
        let keep_at = seg.load_size();
        seg.append(b"bbb").unwrap();
        seg.rewind_to(keep_at).unwrap();
        assert_eq!(seg.load_size(), keep_at);

        let path = dir.path().join("0.seg");
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, DATA_START_POSITION + keep_at);
    }
}
