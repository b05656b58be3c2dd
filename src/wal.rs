use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Length prefix plus checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one record as `[u32 len][bincode payload][u32 crc32]`.
fn write_frame<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<()> {
    let payload = bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record larger than 4 GiB"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` marks the end of the usable log: clean EOF, a
/// torn tail from a crash, or a checksum mismatch.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
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
    Ok(Some(payload))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only journal of `R` records.
///
/// Appends are buffered; `flush_sync` makes everything buffered so far durable
/// in one fsync, which is what the store's group commit relies on.
pub struct Wal<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(R)>,
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &R) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, record: &R) -> io::Result<()> {
        write_frame(&mut self.writer, record)?;
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

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Rewrite the journal as exactly `records`: write a sibling temp file,
    /// fsync it, then rename it over the live file and reopen for append.
    pub fn compact(&mut self, records: &[R]) -> io::Result<()> {
        let tmp = self.compact_path();
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for record in records {
                write_frame(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// All intact records in the journal, oldest first. A missing file is an
    /// empty journal. Anything after the first damaged frame is dropped and
    /// truncated away, so later appends stay readable.
    pub fn replay(path: &Path) -> io::Result<Vec<R>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut intact: u64 = 0;
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<R>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            intact += FRAME_OVERHEAD + payload.len() as u64;
        }
        if intact < file_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - intact,
                "journal has a damaged tail, truncating"
            );
            OpenOptions::new().write(true).open(path)?.set_len(intact)?;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("ticketsync_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn calendar_created(name: &str) -> Event {
        Event::CalendarCreated {
            id: Ulid::new(),
            name: name.into(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            calendar_created("Support"),
            Event::RuleRemoved {
                id: Ulid::new(),
                calendar_id: Ulid::new(),
            },
        ];
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let event = calendar_created("Support");
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn appends_after_a_torn_tail_survive_restart() {
        let path = tmp_path("torn_then_append.wal");
        let first = calendar_created("first");
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0]).unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![first.clone()]);

        let second = calendar_created("second");
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn checksum_mismatch_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let first = calendar_created("first");
        let second = calendar_created("second");
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::<Event>::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_replaces_contents_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let mut wal = Wal::<Event>::open(&path).unwrap();
        for i in 0..5 {
            wal.append(&calendar_created(&format!("c{i}"))).unwrap();
        }
        let kept = calendar_created("kept");
        wal.compact(std::slice::from_ref(&kept)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = calendar_created("after");
        wal.append(&after).unwrap();
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![kept, after]);
        assert!(!path.with_extension("wal.tmp").exists());
    }
}
