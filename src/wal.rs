use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Change;

/// Encode one change as `[len][bincode][crc32]`.
fn encode_change(writer: &mut impl Write, change: &Change) -> io::Result<()> {
    let payload =
        bincode::serialize(change).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next valid record, or `None` at the end of the usable log.
fn decode_change(reader: &mut impl Read) -> io::Result<Option<Change>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Change>(&payload).ok())
}

/// Append-only write-ahead log of committed changes.
///
/// Format per record: `[u32: len][bincode: Change][u32: crc32]`, little endian.
/// A torn or corrupt tail (crash mid-write) ends replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one record. The engine goes through `append_buffered`
    /// + `flush_sync` instead, one fsync per batch.
    #[cfg(test)]
    pub fn append(&mut self, change: &Change) -> io::Result<()> {
        self.append_buffered(change)?;
        self.flush_sync()
    }

    /// Buffer a record without flushing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, change: &Change) -> io::Result<()> {
        encode_change(&mut self.writer, change)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log next to `path` and fsync it. Does not touch the live log.
    pub fn write_compact_file(path: &Path, changes: &[Change]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for change in changes {
            encode_change(&mut writer, change)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, changes: &[Change]) -> io::Result<()> {
        Self::write_compact_file(&self.path, changes)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All valid records in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Change>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut changes = Vec::new();
        while let Some(change) = decode_change(&mut reader)? {
            changes.push(change);
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Allocation, Event, Resource, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("clashd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn resource_created(id: u64, name: &str) -> Change {
        Change::ResourceCreated {
            resource: Resource {
                id,
                name: name.into(),
                kind: "room".into(),
            },
        }
    }

    fn event_created(id: u64, resource_id: u64) -> Change {
        Change::EventCreated {
            event: Event {
                id,
                title: format!("event {id}"),
                span: Span::new(1_000, 2_000),
                description: String::new(),
            },
            allocations: vec![Allocation {
                id: Ulid::new(),
                event_id: id,
                resource_id,
            }],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let changes = vec![resource_created(1, "Room A"), event_created(1, 1)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &changes {
                wal.append(c).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), changes);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let change = resource_created(1, "Room A");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&change).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            // Length prefix promising more bytes than follow.
            f.write_all(&64u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![change]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_crc_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = resource_created(1, "Room A");
        let bad = Change::ResourceDeleted {
            id: 1,
            allocations: vec![],
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
            // A valid record after the corrupt one is not reached.
            let mut tail = Vec::new();
            encode_change(&mut tail, &resource_created(2, "Room B")).unwrap();
            f.write_all(&tail).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact_history.wal");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&resource_created(1, "Room A")).unwrap();
            for id in 1..=10 {
                wal.append(&event_created(id, 1)).unwrap();
                wal.append(&Change::EventDeleted {
                    id,
                    allocations: vec![Ulid::new()],
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let live = vec![resource_created(1, "Room A")];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&live).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), live);
        assert!(!path.with_extension("wal.tmp").exists());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn appends_after_compact_land_in_new_file() {
        let path = tmp_path("compact_then_append.wal");
        let live = vec![resource_created(1, "Room A")];
        let later = event_created(1, 1);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&live[0]).unwrap();
            wal.append(&resource_created(2, "gone")).unwrap();
            wal.compact(&live).unwrap();
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![live[0].clone(), later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_counted_and_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let changes: Vec<Change> = (1..=5).map(|i| resource_created(i, "r")).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &changes {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), changes);
        let _ = fs::remove_file(&path);
    }
}
