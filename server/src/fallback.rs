//! Append-only log of mutations the database never confirmed.
//!
//! Each record is the bincode encoding of the original [`Request`], the same
//! bytes the transport sends, preceded by its length as a little-endian
//! `u32`. There is no header and no index; recovery scans the file from the
//! start and resubmits every record.

use log::error;
use shared::rpc::{encode_length_prefixed, Request, MAX_FRAME_LEN};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("fallback log I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode fallback record: {0}")]
    Encode(#[from] bincode::Error),
    #[error("truncated fallback record at offset {offset}")]
    Truncated { offset: u64 },
    #[error("fallback record of {len} bytes at offset {offset} exceeds limit")]
    TooLarge { offset: u64, len: usize },
}

pub fn encode_record(request: &Request) -> Result<Vec<u8>, FallbackError> {
    Ok(bincode::serialize(request)?)
}

pub fn decode_record(record: &[u8]) -> Result<Request, FallbackError> {
    Ok(bincode::deserialize(record)?)
}

/// Destination for fallback records.
pub trait FallbackSink {
    fn append(&mut self, record: &[u8]) -> Result<(), FallbackError>;
}

/// File-backed sink. Every record is synced to disk before `append` returns.
#[derive(Debug)]
pub struct FallbackLog {
    path: PathBuf,
    file: File,
}

impl FallbackLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FallbackError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FallbackSink for FallbackLog {
    fn append(&mut self, record: &[u8]) -> Result<(), FallbackError> {
        append_frame(&mut self.file, record)
    }
}

/// Byte storage under a fallback log.
trait LogStorage: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogStorage for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Writes one framed record. A write that fails partway is cut back off so
/// the next record still starts on a frame boundary.
fn append_frame<S: LogStorage>(storage: &mut S, record: &[u8]) -> Result<(), FallbackError> {
    let start = storage.size()?;
    let written = storage
        .write_all(&encode_length_prefixed(record))
        .and_then(|()| storage.sync());
    if let Err(e) = written {
        if let Err(rollback) = storage.truncate(start) {
            error!(
                "Failed to cut partial fallback record at offset {}: {}",
                start, rollback
            );
        }
        return Err(e.into());
    }
    Ok(())
}

/// In-memory sink. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryFallback {
    records: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Vec<u8>> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Decodes every record, dropping the ones that fail to decode.
    pub fn requests(&self) -> Vec<Request> {
        self.records()
            .iter()
            .filter_map(|record| decode_record(record).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FallbackSink for MemoryFallback {
    fn append(&mut self, record: &[u8]) -> Result<(), FallbackError> {
        match self.records.lock() {
            Ok(mut records) => records.push(record.to_vec()),
            Err(poisoned) => poisoned.into_inner().push(record.to_vec()),
        }
        Ok(())
    }
}

/// Encodes `request` and appends it. Failures are logged and swallowed:
/// there is nothing left to fall back to.
pub fn record_request(sink: &mut dyn FallbackSink, request: &Request) -> bool {
    let result = encode_record(request).and_then(|record| sink.append(&record));
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to record {} in fallback log: {}", request.verb(), e);
            false
        }
    }
}

/// Sequential reader over a fallback log.
pub struct FallbackReader<R> {
    reader: R,
    offset: u64,
    finished: bool,
}

impl FallbackReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FallbackError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> FallbackReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            finished: false,
        }
    }

    /// Offset of the next record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.reader.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    /// Returns the next raw record, `None` at a clean end of file.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FallbackError> {
        let mut header = [0u8; 4];
        let got = self.read_full(&mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < header.len() {
            return Err(FallbackError::Truncated {
                offset: self.offset,
            });
        }

        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FallbackError::TooLarge {
                offset: self.offset,
                len,
            });
        }

        let mut body = vec![0u8; len];
        if self.read_full(&mut body)? < len {
            return Err(FallbackError::Truncated {
                offset: self.offset,
            });
        }
        self.offset += (header.len() + len) as u64;
        Ok(Some(body))
    }
}

impl<R: Read> Iterator for FallbackReader<R> {
    type Item = Result<Request, FallbackError>;

    /// Yields decoded requests; stops after the first framing error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(decode_record(&record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::rpc::{SavedTee, TeamLoadRequest, TeamSave};
    use std::io::Cursor;

    fn save_request(code: &str) -> Request {
        Request::SaveTeam(TeamSave {
            code: code.to_string(),
            map_name: "Tutorial".to_string(),
            team_locked: false,
            tees: vec![SavedTee {
                name: "nameless tee".to_string(),
                race_time: 42.0,
                checkpoints: vec![1.0, 2.0],
            }],
        })
    }

    #[test]
    fn test_file_log_appends_and_scans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.log");

        {
            let mut log = FallbackLog::open(&path).unwrap();
            assert!(record_request(&mut log, &save_request("a")));
            assert!(record_request(&mut log, &save_request("b")));
        }
        // Reopening appends instead of truncating.
        {
            let mut log = FallbackLog::open(&path).unwrap();
            let done = Request::LoadingTeamDone(TeamLoadRequest {
                code: "c".to_string(),
                map_name: "Tutorial".to_string(),
            });
            assert!(record_request(&mut log, &done));
        }

        let requests: Vec<Request> = FallbackReader::open(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0], save_request("a"));
        assert_eq!(requests[1], save_request("b"));
        assert_eq!(requests[2].verb(), "loading_team_done");
    }

    /// In-memory storage that accepts a limited number of bytes.
    struct FullDisk {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogStorage for FullDisk {
        fn size(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_leaves_no_partial_record() {
        let record = encode_record(&save_request("a")).unwrap();
        let mut disk = FullDisk {
            data: Vec::new(),
            budget: usize::MAX,
        };
        append_frame(&mut disk, &record).unwrap();

        disk.budget = 6;
        assert!(matches!(
            append_frame(&mut disk, &encode_record(&save_request("b")).unwrap()),
            Err(FallbackError::Io(_))
        ));
        assert_eq!(disk.data.len(), record.len() + 4);

        disk.budget = usize::MAX;
        append_frame(&mut disk, &encode_record(&save_request("c")).unwrap()).unwrap();

        let requests: Vec<Request> = FallbackReader::new(Cursor::new(disk.data))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(requests, vec![save_request("a"), save_request("c")]);
    }

    #[test]
    fn test_truncated_tail_stops_scan() {
        let record = encode_record(&save_request("a")).unwrap();
        let mut bytes = encode_length_prefixed(&record);
        let full = bytes.len();
        bytes.extend_from_slice(&encode_length_prefixed(&record));
        bytes.truncate(full + 6);

        let mut reader = FallbackReader::new(Cursor::new(bytes));
        assert_eq!(reader.next().unwrap().unwrap(), save_request("a"));
        match reader.next() {
            Some(Err(FallbackError::Truncated { offset })) => assert_eq!(offset, full as u64),
            other => panic!("expected truncation, got {:?}", other),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_empty_log_has_no_records() {
        let mut reader = FallbackReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_next().unwrap().is_none());
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn test_memory_sink_is_shared_between_clones() {
        let sink = MemoryFallback::new();
        let mut writer = sink.clone();
        assert!(record_request(&mut writer, &save_request("x")));

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.requests(), vec![save_request("x")]);
    }
}
