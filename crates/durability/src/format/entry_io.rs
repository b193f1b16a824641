//! Streaming encoder/decoder for log entries.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use limestone_core::{Error, LogEntry, WriteVersion};
use std::io::{self, Read, Write};
use std::path::Path;

use super::tag;

/// Errors from decoding an entry stream.
///
/// The decoder keeps file/offset context out of this type; callers attach
/// the path when converting into [`limestone_core::Error`] via
/// [`CodecError::into_error`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Bytes remain after the last complete record, but not enough for a
    /// full one. `offset` is the last good record boundary.
    #[error("truncated record at offset {offset}")]
    Truncated {
        /// Last complete record boundary.
        offset: u64,
    },

    /// The stream contains a byte that is not a known record tag.
    #[error("unknown entry tag {tag:#04x} at offset {offset}")]
    UnknownTag {
        /// The unrecognized tag byte.
        tag: u8,
        /// Offset of the record that carried it.
        offset: u64,
    },

    /// Underlying read failure (never `UnexpectedEof`; that is reported as
    /// `Truncated`).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Attach the file path and convert into the engine error type.
    pub fn into_error(self, path: &Path) -> Error {
        match self {
            CodecError::Truncated { offset } => Error::Truncated {
                path: path.to_path_buf(),
                offset,
            },
            CodecError::UnknownTag { tag, offset } => Error::io(
                path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown entry tag {:#04x} at offset {}", tag, offset),
                ),
            ),
            CodecError::Io(source) => Error::io(path, source),
        }
    }
}

/// Append one entry to a writer.
pub fn write_entry<W: Write>(w: &mut W, entry: &LogEntry) -> io::Result<()> {
    match entry {
        LogEntry::Normal {
            storage,
            key,
            value,
            write_version,
        } => {
            w.write_u8(tag::NORMAL)?;
            w.write_u64::<LittleEndian>(*storage)?;
            write_bytes(w, key)?;
            write_bytes(w, value)?;
            write_version_fields(w, *write_version)?;
        }
        LogEntry::RemoveEntry {
            storage,
            key,
            write_version,
        } => {
            w.write_u8(tag::REMOVE_ENTRY)?;
            w.write_u64::<LittleEndian>(*storage)?;
            write_bytes(w, key)?;
            write_version_fields(w, *write_version)?;
        }
        LogEntry::ClearStorage {
            storage,
            write_version,
        } => {
            w.write_u8(tag::CLEAR_STORAGE)?;
            w.write_u64::<LittleEndian>(*storage)?;
            write_version_fields(w, *write_version)?;
        }
        LogEntry::AddStorage {
            storage,
            write_version,
        } => {
            w.write_u8(tag::ADD_STORAGE)?;
            w.write_u64::<LittleEndian>(*storage)?;
            write_version_fields(w, *write_version)?;
        }
        LogEntry::RemoveStorage {
            storage,
            write_version,
        } => {
            w.write_u8(tag::REMOVE_STORAGE)?;
            w.write_u64::<LittleEndian>(*storage)?;
            write_version_fields(w, *write_version)?;
        }
        LogEntry::NormalWithBlob {
            storage,
            key,
            blob_ids,
            write_version,
        } => {
            w.write_u8(tag::NORMAL_WITH_BLOB)?;
            w.write_u64::<LittleEndian>(*storage)?;
            write_bytes(w, key)?;
            w.write_u32::<LittleEndian>(blob_ids.len() as u32)?;
            for id in blob_ids {
                w.write_u64::<LittleEndian>(*id)?;
            }
            write_version_fields(w, *write_version)?;
        }
        LogEntry::BeginSession { epoch } => {
            w.write_u8(tag::BEGIN_SESSION)?;
            w.write_u64::<LittleEndian>(*epoch)?;
        }
        LogEntry::EndSession { epoch } => {
            w.write_u8(tag::END_SESSION)?;
            w.write_u64::<LittleEndian>(*epoch)?;
        }
        LogEntry::DurableEpoch { epoch } => {
            w.write_u8(tag::DURABLE_EPOCH)?;
            w.write_u64::<LittleEndian>(*epoch)?;
        }
        LogEntry::InvalidatedSession => {
            w.write_u8(tag::INVALIDATED_SESSION)?;
        }
    }
    Ok(())
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)
}

fn write_version_fields<W: Write>(w: &mut W, version: WriteVersion) -> io::Result<()> {
    w.write_u64::<LittleEndian>(version.major)?;
    w.write_u64::<LittleEndian>(version.minor)
}

/// Streaming entry decoder.
///
/// `read_entry` returns `Ok(Some(entry))` per record, `Ok(None)` at a clean
/// end of stream, and `Err(Truncated)` when bytes remain but do not form a
/// complete record. [`EntryReader::offset`] always points at the last good
/// record boundary, which is where recovery truncates a torn file.
pub struct EntryReader<R> {
    inner: R,
    /// Current read position.
    cursor: u64,
    /// End of the last fully decoded record.
    offset: u64,
}

impl<R: Read> EntryReader<R> {
    /// Wrap a reader positioned at a record boundary.
    pub fn new(inner: R) -> Self {
        EntryReader {
            inner,
            cursor: 0,
            offset: 0,
        }
    }

    /// Wrap a reader positioned at a record boundary `offset` bytes into
    /// the stream (used after seeking).
    pub fn with_offset(inner: R, offset: u64) -> Self {
        EntryReader {
            inner,
            cursor: offset,
            offset,
        }
    }

    /// Offset of the last complete record boundary.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the next entry.
    pub fn read_entry(&mut self) -> Result<Option<LogEntry>, CodecError> {
        let start = self.offset;

        let mut tag_byte = [0u8; 1];
        match self.inner.read_exact(&mut tag_byte) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.cursor += 1;

        let entry = match tag_byte[0] {
            tag::NORMAL => {
                let storage = self.read_u64(start)?;
                let key = self.read_bytes(start)?;
                let value = self.read_bytes(start)?;
                let write_version = self.read_version(start)?;
                LogEntry::Normal {
                    storage,
                    key,
                    value,
                    write_version,
                }
            }
            tag::REMOVE_ENTRY => {
                let storage = self.read_u64(start)?;
                let key = self.read_bytes(start)?;
                let write_version = self.read_version(start)?;
                LogEntry::RemoveEntry {
                    storage,
                    key,
                    write_version,
                }
            }
            tag::CLEAR_STORAGE => {
                let storage = self.read_u64(start)?;
                let write_version = self.read_version(start)?;
                LogEntry::ClearStorage {
                    storage,
                    write_version,
                }
            }
            tag::ADD_STORAGE => {
                let storage = self.read_u64(start)?;
                let write_version = self.read_version(start)?;
                LogEntry::AddStorage {
                    storage,
                    write_version,
                }
            }
            tag::REMOVE_STORAGE => {
                let storage = self.read_u64(start)?;
                let write_version = self.read_version(start)?;
                LogEntry::RemoveStorage {
                    storage,
                    write_version,
                }
            }
            tag::NORMAL_WITH_BLOB => {
                let storage = self.read_u64(start)?;
                let key = self.read_bytes(start)?;
                let count = self.read_u32(start)? as usize;
                let mut blob_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    blob_ids.push(self.read_u64(start)?);
                }
                let write_version = self.read_version(start)?;
                LogEntry::NormalWithBlob {
                    storage,
                    key,
                    blob_ids,
                    write_version,
                }
            }
            tag::BEGIN_SESSION => LogEntry::BeginSession {
                epoch: self.read_u64(start)?,
            },
            tag::END_SESSION => LogEntry::EndSession {
                epoch: self.read_u64(start)?,
            },
            tag::DURABLE_EPOCH => LogEntry::DurableEpoch {
                epoch: self.read_u64(start)?,
            },
            tag::INVALIDATED_SESSION => LogEntry::InvalidatedSession,
            other => {
                return Err(CodecError::UnknownTag {
                    tag: other,
                    offset: start,
                })
            }
        };

        self.offset = self.cursor;
        Ok(Some(entry))
    }

    fn truncated_on_eof(&self, e: io::Error, start: u64) -> CodecError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Truncated { offset: start }
        } else {
            CodecError::Io(e)
        }
    }

    fn read_u32(&mut self, start: u64) -> Result<u32, CodecError> {
        let v = self
            .inner
            .read_u32::<LittleEndian>()
            .map_err(|e| self.truncated_on_eof(e, start))?;
        self.cursor += 4;
        Ok(v)
    }

    fn read_u64(&mut self, start: u64) -> Result<u64, CodecError> {
        let v = self
            .inner
            .read_u64::<LittleEndian>()
            .map_err(|e| self.truncated_on_eof(e, start))?;
        self.cursor += 8;
        Ok(v)
    }

    fn read_version(&mut self, start: u64) -> Result<WriteVersion, CodecError> {
        let major = self.read_u64(start)?;
        let minor = self.read_u64(start)?;
        Ok(WriteVersion { major, minor })
    }

    fn read_bytes(&mut self, start: u64) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32(start)? as usize;
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .map_err(|e| self.truncated_on_eof(e, start))?;
        self.cursor += len as u64;
        Ok(buf)
    }
}

/// Read every entry of a file, failing on truncation.
///
/// Convenience for readers of files that are published atomically and must
/// never be torn (catalog-adjacent artifacts, tests).
pub fn read_all_entries(path: &Path) -> Result<Vec<LogEntry>, Error> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = EntryReader::new(std::io::BufReader::new(file));
    let mut entries = Vec::new();
    while let Some(entry) = reader.read_entry().map_err(|e| e.into_error(path))? {
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use limestone_core::WriteVersion;
    use proptest::prelude::*;

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry::BeginSession { epoch: 5 },
            LogEntry::Normal {
                storage: 1,
                key: b"a".to_vec(),
                value: b"x".to_vec(),
                write_version: WriteVersion::new(5, 0),
            },
            LogEntry::RemoveEntry {
                storage: 1,
                key: b"b".to_vec(),
                write_version: WriteVersion::new(5, 1),
            },
            LogEntry::ClearStorage {
                storage: 2,
                write_version: WriteVersion::new(5, 2),
            },
            LogEntry::AddStorage {
                storage: 3,
                write_version: WriteVersion::new(5, 3),
            },
            LogEntry::RemoveStorage {
                storage: 3,
                write_version: WriteVersion::new(5, 4),
            },
            LogEntry::NormalWithBlob {
                storage: 1,
                key: b"c".to_vec(),
                blob_ids: vec![17, 42],
                write_version: WriteVersion::new(5, 5),
            },
            LogEntry::EndSession { epoch: 5 },
            LogEntry::DurableEpoch { epoch: 5 },
            LogEntry::InvalidatedSession,
        ]
    }

    fn encode(entries: &[LogEntry]) -> Vec<u8> {
        let mut buf = Vec::new();
        for e in entries {
            write_entry(&mut buf, e).unwrap();
        }
        buf
    }

    #[test]
    fn test_round_trip_all_variants() {
        let entries = sample_entries();
        let buf = encode(&entries);

        let mut reader = EntryReader::new(&buf[..]);
        let mut decoded = Vec::new();
        while let Some(e) = reader.read_entry().unwrap() {
            decoded.push(e);
        }
        assert_eq!(decoded, entries);
        assert_eq!(reader.offset(), buf.len() as u64);
    }

    #[test]
    fn test_clean_eof_returns_none() {
        let mut reader = EntryReader::new(&[][..]);
        assert!(reader.read_entry().unwrap().is_none());
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn test_torn_tail_reports_last_good_boundary() {
        let entries = sample_entries();
        let buf = encode(&entries);

        // Cut mid-way through the second record
        let first_len = encode(&entries[..1]).len();
        let cut = &buf[..first_len + 3];

        let mut reader = EntryReader::new(cut);
        assert!(reader.read_entry().unwrap().is_some());
        match reader.read_entry() {
            Err(CodecError::Truncated { offset }) => assert_eq!(offset, first_len as u64),
            other => panic!("expected Truncated, got {:?}", other.map(|_| ())),
        }
        assert_eq!(reader.offset(), first_len as u64);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut buf = encode(&sample_entries()[..1]);
        let boundary = buf.len() as u64;
        buf.push(0xEE);

        let mut reader = EntryReader::new(&buf[..]);
        assert!(reader.read_entry().unwrap().is_some());
        match reader.read_entry() {
            Err(CodecError::UnknownTag { tag, offset }) => {
                assert_eq!(tag, 0xEE);
                assert_eq!(offset, boundary);
            }
            other => panic!("expected UnknownTag, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_truncated_converts_with_path_context() {
        let err = CodecError::Truncated { offset: 9 }.into_error(Path::new("/x/pwal_0000"));
        assert!(err.is_truncation());
        assert!(err.to_string().contains("/x/pwal_0000"));
    }

    #[test]
    fn test_empty_key_and_value() {
        let entry = LogEntry::Normal {
            storage: 0,
            key: Vec::new(),
            value: Vec::new(),
            write_version: WriteVersion::default(),
        };
        let buf = encode(std::slice::from_ref(&entry));
        let mut reader = EntryReader::new(&buf[..]);
        assert_eq!(reader.read_entry().unwrap(), Some(entry));
    }

    proptest! {
        #[test]
        fn prop_normal_entry_round_trips(
            storage in any::<u64>(),
            key in proptest::collection::vec(any::<u8>(), 0..64),
            value in proptest::collection::vec(any::<u8>(), 0..256),
            major in any::<u64>(),
            minor in any::<u64>(),
        ) {
            let entry = LogEntry::Normal {
                storage,
                key,
                value,
                write_version: WriteVersion::new(major, minor),
            };
            let buf = encode(std::slice::from_ref(&entry));
            let mut reader = EntryReader::new(&buf[..]);
            prop_assert_eq!(reader.read_entry().unwrap(), Some(entry));
            prop_assert!(reader.read_entry().unwrap().is_none());
        }

        #[test]
        fn prop_any_prefix_cut_is_truncation_not_garbage(
            cut in 1usize..10,
        ) {
            // Cutting inside the final record must yield Truncated at the
            // prior boundary, never a bogus decoded entry.
            let entries = sample_entries();
            let buf = encode(&entries);
            // The last record is 1 byte (InvalidatedSession); cut inside the
            // 9-byte DurableEpoch record before it.
            let boundary = encode(&entries[..entries.len() - 2]).len();
            let cut_at = boundary + cut.min(8);
            let mut reader = EntryReader::new(&buf[..cut_at]);
            let mut last_ok = 0u64;
            loop {
                match reader.read_entry() {
                    Ok(Some(_)) => last_ok = reader.offset(),
                    Ok(None) => break,
                    Err(CodecError::Truncated { offset }) => {
                        prop_assert_eq!(offset, boundary as u64);
                        prop_assert_eq!(last_ok, boundary as u64);
                        break;
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }
    }
}
