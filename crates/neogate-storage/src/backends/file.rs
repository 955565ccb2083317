//! Append-only file event storage.
//!
//! Records are written as base64 lines into segment files `data_<n>.log`, rolling over
//! every `max_records_per_file` lines. The read cursor `{file, line}` lives in
//! `state.json` and is replaced atomically when a pack is confirmed. Segments entirely
//! behind the cursor are deleted.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::EventStorage;
use crate::error::{Error, Result};

const STATE_FILE: &str = "state.json";
const SEGMENT_PREFIX: &str = "data_";
const SEGMENT_SUFFIX: &str = ".log";

/// Persisted read position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
struct Cursor {
    file: u64,
    line: usize,
}

#[derive(Debug)]
struct Pack {
    records: Vec<Vec<u8>>,
    end: Cursor,
    lines: usize,
}

#[derive(Debug)]
struct FileQueue {
    /// Segment id → line count.
    segments: BTreeMap<u64, usize>,
    writer: Option<File>,
    cursor: Cursor,
    pending: Option<Pack>,
    unread: usize,
}

/// Directory of append-only segment files.
#[derive(Debug)]
pub struct FileEventStorage {
    dir: PathBuf,
    max_file_count: usize,
    max_records_per_file: usize,
    read_records: usize,
    queue: Mutex<FileQueue>,
    stopped: AtomicBool,
}

fn segment_name(id: u64) -> String {
    format!("{SEGMENT_PREFIX}{id}{SEGMENT_SUFFIX}")
}

fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Count complete lines, terminating a torn final line so later appends stay aligned.
fn count_lines(path: &Path) -> Result<usize> {
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    let mut lines = content.iter().filter(|&&b| b == b'\n').count();
    if content.last().is_some_and(|&b| b != b'\n') {
        file.seek(SeekFrom::End(0))?;
        file.write_all(b"\n")?;
        lines += 1;
        warn!(path = %path.display(), "Terminated incomplete record line");
    }
    Ok(lines)
}

impl FileEventStorage {
    /// Open or create the storage directory, resuming from the persisted cursor.
    pub fn open(
        dir: impl AsRef<Path>,
        max_file_count: usize,
        max_records_per_file: usize,
        read_records: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
                segments.insert(id, count_lines(&entry.path())?);
            }
        }

        let state_path = dir.join(STATE_FILE);
        let mut cursor = if state_path.exists() {
            serde_json::from_slice::<Cursor>(&fs::read(&state_path)?)?
        } else {
            Cursor::default()
        };

        // Segments behind the cursor were consumed before a crash interrupted cleanup.
        let consumed: Vec<u64> = segments.range(..cursor.file).map(|(id, _)| *id).collect();
        for id in consumed {
            segments.remove(&id);
            fs::remove_file(dir.join(segment_name(id)))?;
        }
        match segments.keys().next() {
            Some(&first) if first > cursor.file => cursor = Cursor { file: first, line: 0 },
            None => cursor.line = 0,
            _ => {}
        }

        let unread = segments
            .iter()
            .map(|(&id, &lines)| if id == cursor.file { lines.saturating_sub(cursor.line) } else { lines })
            .sum();

        let writer = match segments.keys().next_back() {
            Some(&last) => Some(OpenOptions::new().append(true).open(dir.join(segment_name(last)))?),
            None => None,
        };

        debug!(dir = %dir.display(), segments = segments.len(), unread, "Opened file event storage");

        Ok(Self {
            dir,
            max_file_count: max_file_count.max(1),
            max_records_per_file: max_records_per_file.max(1),
            read_records: read_records.max(1),
            queue: Mutex::new(FileQueue {
                segments,
                writer,
                cursor,
                pending: None,
                unread,
            }),
            stopped: AtomicBool::new(false),
        })
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.dir.join(segment_name(id))
    }

    fn save_cursor(&self, cursor: Cursor) -> Result<()> {
        let path = self.dir.join(STATE_FILE);
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec(&cursor)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read up to `read_records` lines starting at the queue cursor.
    fn read_pack(&self, queue: &FileQueue) -> Result<Pack> {
        let mut records = Vec::new();
        let mut cur = queue.cursor;
        let mut lines = 0;

        while lines < self.read_records {
            let Some(&total) = queue.segments.get(&cur.file) else {
                break;
            };
            if cur.line < total {
                let want = (total - cur.line).min(self.read_records - lines);
                let reader = BufReader::new(File::open(self.segment_path(cur.file))?);
                for line in reader.lines().skip(cur.line).take(want) {
                    let line = line?;
                    match STANDARD.decode(line.trim_end()) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!(segment = cur.file, error = %e, "Skipping corrupt record"),
                    }
                }
                cur.line += want;
                lines += want;
            }
            if cur.line < total {
                continue;
            }
            // Move on only once the writer has rolled past this segment.
            match queue.segments.range(cur.file + 1..).next() {
                Some((&next, _)) => cur = Cursor { file: next, line: 0 },
                None => break,
            }
        }

        Ok(Pack {
            records,
            end: cur,
            lines,
        })
    }

    fn confirm(&self, queue: &mut FileQueue, pack: Pack) -> Result<()> {
        self.save_cursor(pack.end)?;
        queue.cursor = pack.end;
        queue.unread = queue.unread.saturating_sub(pack.lines);

        let consumed: Vec<u64> = queue.segments.range(..pack.end.file).map(|(id, _)| *id).collect();
        for id in consumed {
            queue.segments.remove(&id);
            if let Err(e) = fs::remove_file(self.segment_path(id)) {
                warn!(segment = id, error = %e, "Failed to remove consumed segment");
            }
        }
        Ok(())
    }

    /// Slots left before `QueueFull`: room in the open segment plus every segment not yet
    /// created.
    fn free_slots(&self, queue: &FileQueue) -> usize {
        let open_room = match queue.segments.iter().next_back() {
            Some((_, &lines)) if queue.writer.is_some() => {
                self.max_records_per_file.saturating_sub(lines)
            }
            _ => 0,
        };
        let unopened = self.max_file_count.saturating_sub(queue.segments.len());
        open_room + unopened * self.max_records_per_file
    }

    fn append_locked(&self, queue: &mut FileQueue, record: &[u8]) -> Result<()> {
        let last = queue.segments.iter().next_back().map(|(&id, &lines)| (id, lines));
        let target = match last {
            Some((id, lines)) if lines < self.max_records_per_file && queue.writer.is_some() => id,
            _ => {
                if queue.segments.len() >= self.max_file_count {
                    return Err(Error::QueueFull);
                }
                let id = last.map_or(queue.cursor.file, |(id, _)| id + 1);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.segment_path(id))?;
                queue.segments.insert(id, 0);
                queue.writer = Some(file);
                debug!(segment = id, "Started new event segment");
                id
            }
        };

        let mut line = STANDARD.encode(record).into_bytes();
        line.push(b'\n');
        let writer = queue
            .writer
            .as_mut()
            .ok_or_else(|| Error::Storage("no open segment".into()))?;
        writer.write_all(&line)?;
        writer.flush()?;

        if let Some(lines) = queue.segments.get_mut(&target) {
            *lines += 1;
        }
        queue.unread += 1;
        Ok(())
    }
}

impl EventStorage for FileEventStorage {
    fn put(&self, record: &[u8]) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut queue = self.queue.lock();
        self.append_locked(&mut queue, record)
    }

    fn put_all(&self, records: &[Vec<u8>]) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut queue = self.queue.lock();
        if self.free_slots(&queue) < records.len() {
            return Err(Error::QueueFull);
        }
        for record in records {
            self.append_locked(&mut queue, record)?;
        }
        Ok(())
    }

    fn get_event_pack(&self) -> Result<Vec<Vec<u8>>> {
        let mut queue = self.queue.lock();
        if let Some(pack) = &queue.pending {
            return Ok(pack.records.clone());
        }
        loop {
            let pack = self.read_pack(&queue)?;
            if pack.records.is_empty() && pack.lines > 0 {
                // Nothing but corrupt lines: consume them and keep reading.
                self.confirm(&mut queue, pack)?;
                continue;
            }
            let records = pack.records.clone();
            if !records.is_empty() {
                queue.pending = Some(pack);
            }
            return Ok(records);
        }
    }

    fn event_pack_processing_done(&self) -> Result<()> {
        let mut queue = self.queue.lock();
        match queue.pending.take() {
            Some(pack) => self.confirm(&mut queue, pack),
            None => Ok(()),
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().unread
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(writer) = self.queue.lock().writer.as_mut()
            && let Err(e) = writer.sync_all()
        {
            warn!(error = %e, "Failed to sync event segment on stop");
        }
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> FileEventStorage {
        FileEventStorage::open(dir, 3, 4, 3).unwrap()
    }

    #[test]
    fn test_segments_roll_and_get_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path());
        for i in 0..10u8 {
            storage.put(&[i]).unwrap();
        }
        assert_eq!(storage.len(), 10);
        assert!(dir.path().join("data_2.log").exists());

        let mut seen = Vec::new();
        loop {
            let pack = storage.get_event_pack().unwrap();
            if pack.is_empty() {
                break;
            }
            seen.extend(pack.into_iter().flatten());
            storage.event_pack_processing_done().unwrap();
        }
        assert_eq!(seen, (0..10u8).collect::<Vec<_>>());
        assert!(storage.is_empty());
        assert!(!dir.path().join("data_0.log").exists());
        assert!(!dir.path().join("data_1.log").exists());
    }

    #[test]
    fn test_full_when_file_limit_reached() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path());
        for i in 0..12u8 {
            storage.put(&[i]).unwrap();
        }
        assert!(matches!(storage.put(b"x"), Err(Error::QueueFull)));

        storage.get_event_pack().unwrap();
        storage.event_pack_processing_done().unwrap();
        storage.get_event_pack().unwrap();
        storage.event_pack_processing_done().unwrap();
        // The first segment is gone, so a new one can be started.
        storage.put(b"x").unwrap();
    }

    #[test]
    fn test_unconfirmed_pack_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(dir.path());
            for i in 0..5u8 {
                storage.put(&[i]).unwrap();
            }
            assert_eq!(storage.get_event_pack().unwrap(), vec![vec![0], vec![1], vec![2]]);
            storage.event_pack_processing_done().unwrap();
            assert_eq!(storage.get_event_pack().unwrap(), vec![vec![3], vec![4]]);
        }
        let storage = open(dir.path());
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.get_event_pack().unwrap(), vec![vec![3], vec![4]]);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(dir.path());
            storage.put(b"good").unwrap();
        }
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join("data_0.log"))
                .unwrap();
            file.write_all(b"@@not-base64").unwrap();
        }
        let storage = open(dir.path());
        storage.put(b"after").unwrap();
        assert_eq!(
            storage.get_event_pack().unwrap(),
            vec![b"good".to_vec(), b"after".to_vec()]
        );
    }
}
