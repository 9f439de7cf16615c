//! Segment Manager: owns the `segs/` directory, tracks the single
//! writable segment, and allocates/reclaims segment ids.

use super::file::FileSegment;
use super::memory::MemorySegment;
use super::{Segment, SegmentMode, DATA_START_POSITION, MAX_SEGMENTS};
use crate::store::config::SegmentFactoryKind;
use crate::store::error::{Result, StoreError};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

pub struct SegmentManager {
    dir: PathBuf,
    initial_size: u64,
    kind: SegmentFactoryKind,
    segments: BTreeMap<u32, Box<dyn Segment>>,
    current_id: u32,
}

impl SegmentManager {
    /// Opens (or creates) the `segs/` directory and resumes the
    /// writable segment per spec §4.1.
    pub fn open(home_dir: &Path, initial_size: u64, kind: SegmentFactoryKind) -> Result<Self> {
        let dir = home_dir.join("segs");
        fs::create_dir_all(&dir)?;

        let mut found: Vec<(u32, u64)> = Vec::new(); // (id, lastForcedTime)
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(id) = parse_segment_id(&path) {
                let last_forced = read_last_forced_time(&path)?;
                found.push((id, last_forced));
            }
        }
        found.sort_by_key(|(id, _)| *id);

        let mut segments: BTreeMap<u32, Box<dyn Segment>> = BTreeMap::new();
        for (id, _) in &found {
            let seg = open_segment(&dir, *id, SegmentMode::ReadOnly, kind, initial_size)?;
            segments.insert(*id, seg);
        }

        // Pick the resume target: largest lastForcedTime whose append
        // position is still below initial_size.
        let resume_id = found
            .iter()
            .filter(|(id, _)| {
                segments
                    .get(id)
                    .map(|s| s.append_position() < s.initial_size())
                    .unwrap_or(false)
            })
            .max_by_key(|(_, last_forced)| *last_forced)
            .map(|(id, _)| *id);

        let current_id = match resume_id {
            Some(id) => {
                let mut seg = segments.remove(&id).unwrap();
                reopen_writable(&dir, &mut seg, kind, initial_size)?;
                segments.insert(id, seg);
                id
            }
            None => {
                let next_id = found.last().map(|(id, _)| id + 1).unwrap_or(0);
                if next_id >= MAX_SEGMENTS {
                    return Err(StoreError::OutOfSegments);
                }
                let seg = create_segment(&dir, next_id, initial_size, kind)?;
                segments.insert(next_id, seg);
                next_id
            }
        };

        log::info!(
            "segment manager resumed at segment {} ({} segments on disk)",
            current_id,
            segments.len()
        );

        Ok(Self {
            dir,
            initial_size,
            kind,
            segments,
            current_id,
        })
    }

    pub fn current_mut(&mut self) -> &mut (dyn Segment + 'static) {
        self.segments
            .get_mut(&self.current_id)
            .expect("current segment always present")
            .as_mut()
    }

    pub fn current_id(&self) -> u32 {
        self.current_id
    }

    pub fn get(&self, seg_id: u32) -> Option<&dyn Segment> {
        self.segments.get(&seg_id).map(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, seg_id: u32) -> Option<&mut (dyn Segment + 'static)> {
        self.segments.get_mut(&seg_id).map(|b| b.as_mut())
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.segments.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Seals the current segment and allocates a new writable one with
    /// the smallest free id.
    pub fn next_segment(&mut self) -> Result<u32> {
        self.current_mut().force().map_err(StoreError::from)?;
        self.current_mut().as_read_only();

        let new_id = smallest_free_id(self.segments.keys().copied());
        if new_id >= MAX_SEGMENTS {
            return Err(StoreError::OutOfSegments);
        }
        let seg = create_segment(&self.dir, new_id, self.initial_size, self.kind)?;
        self.segments.insert(new_id, seg);
        self.current_id = new_id;
        log::debug!("rotated to new segment {}", new_id);
        Ok(new_id)
    }

    /// Allocates a target segment for the compactor to copy into; must
    /// differ from the writer's current segment.
    pub fn allocate_compaction_target(&mut self) -> Result<u32> {
        let new_id = smallest_free_id(self.segments.keys().copied());
        if new_id >= MAX_SEGMENTS || new_id == self.current_id {
            return Err(StoreError::OutOfSegments);
        }
        let seg = create_segment(&self.dir, new_id, self.initial_size, self.kind)?;
        self.segments.insert(new_id, seg);
        Ok(new_id)
    }

    /// Releases and unlinks a segment. Only valid once the caller
    /// (the compactor) has established it has zero live references.
    pub fn free_segment(&mut self, seg_id: u32) -> Result<()> {
        if seg_id == self.current_id {
            return Err(StoreError::IOError(std::io::Error::other(
                "cannot free the active writable segment",
            )));
        }
        if let Some(mut seg) = self.segments.remove(&seg_id) {
            seg.free().map_err(StoreError::from)?;
        }
        let path = self.dir.join(format!("{}.seg", seg_id));
        if path.exists() {
            fs::remove_file(&path)?;
        }
        log::info!("freed segment {}", seg_id);
        Ok(())
    }

    pub fn force_all(&mut self) -> Result<()> {
        for seg in self.segments.values_mut() {
            seg.force().map_err(StoreError::from)?;
        }
        Ok(())
    }
}

fn smallest_free_id(existing: impl Iterator<Item = u32>) -> u32 {
    let used: std::collections::BTreeSet<u32> = existing.collect();
    let mut candidate = 0u32;
    while used.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

fn parse_segment_id(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let id_str = name.strip_suffix(".seg")?;
    id_str.parse::<u32>().ok()
}

fn read_last_forced_time(path: &Path) -> Result<u64> {
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; DATA_START_POSITION as usize];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf[0..8].try_into().unwrap()))
}

fn create_segment(
    dir: &Path,
    id: u32,
    initial_size: u64,
    kind: SegmentFactoryKind,
) -> Result<Box<dyn Segment>> {
    let seg: Box<dyn Segment> = match kind {
        SegmentFactoryKind::Memory => Box::new(
            MemorySegment::create(dir, id, initial_size).map_err(StoreError::from)?,
        ),
        SegmentFactoryKind::WriteBuffer | SegmentFactoryKind::Channel | SegmentFactoryKind::Mapped => {
            Box::new(FileSegment::create(dir, id, initial_size).map_err(StoreError::from)?)
        }
    };
    Ok(seg)
}

fn open_segment(
    dir: &Path,
    id: u32,
    mode: SegmentMode,
    kind: SegmentFactoryKind,
    initial_size: u64,
) -> Result<Box<dyn Segment>> {
    let seg: Box<dyn Segment> = match kind {
        SegmentFactoryKind::Memory => {
            Box::new(MemorySegment::open(dir, id, mode, initial_size).map_err(StoreError::from)?)
        }
        SegmentFactoryKind::WriteBuffer | SegmentFactoryKind::Channel | SegmentFactoryKind::Mapped => {
            Box::new(FileSegment::open(dir, id, mode, initial_size).map_err(StoreError::from)?)
        }
    };
    Ok(seg)
}

/// Re-validates the chosen resume segment record-by-record from the
/// header onward, rewinding past any torn tail record (spec §8
/// scenario 5: crash mid-append leaves a truncated length-prefixed
/// record at the tail).
fn reopen_writable(
    dir: &Path,
    seg: &mut Box<dyn Segment>,
    kind: SegmentFactoryKind,
    initial_size: u64,
) -> Result<()> {
    let id = seg.id();
    let valid_len = scan_valid_length(&dir.join(format!("{}.seg", id)))?;
    // Reopen in read-write mode (it was opened read-only during the scan).
    let mut writable = open_segment(dir, id, SegmentMode::ReadWrite, kind, initial_size)?;
    if valid_len < writable.load_size() {
        log::warn!(
            "segment {} tail record truncated: rewinding from {} to {} bytes",
            id,
            writable.load_size(),
            valid_len
        );
        writable.rewind_to(valid_len).map_err(StoreError::from)?;
    }
    *seg = writable;
    Ok(())
}

fn scan_valid_length(path: &Path) -> Result<u64> {
    let mut file = fs::File::open(path)?;
    let total_len = file.metadata()?.len();
    if total_len < DATA_START_POSITION {
        return Ok(0);
    }
    let mut pos = DATA_START_POSITION;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut valid = 0u64;
    loop {
        let start = pos as usize;
        if start + 4 > buf.len() {
            break;
        }
        let len = u32::from_be_bytes(buf[start..start + 4].try_into().unwrap()) as u64;
        let record_end = start as u64 + 4 + len;
        if record_end > total_len {
            break;
        }
        pos = record_end;
        valid = pos - DATA_START_POSITION;
    }
    Ok(valid)
}
