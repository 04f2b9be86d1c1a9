//! Append-only operation log.
//!
//! Every acknowledged write lands here before the client is told anything,
//! but the log is only fsynced in batches by the durability worker;
//! witnesses cover the unsynced tail. Records are length-prefixed with a
//! CRC32 checksum, and a torn final record from a crash is dropped on load.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;

pub struct OpLog {
    path: PathBuf,
    file: Mutex<File>,
    /// Count of records appended so far; doubles as the write sequence
    /// number handed to the durability worker.
    seq: AtomicU64,
}

impl OpLog {
    /// Open or create the log and position the sequence counter after the
    /// last complete record.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("open oplog for append")?;
        let existing = read_entries(&path)?.len() as u64;
        Ok(Self {
            path,
            file: Mutex::new(file),
            seq: AtomicU64::new(existing),
        })
    }

    /// Append one executed command and return the new sequence number.
    pub fn append(&self, args: &[Vec<u8>]) -> anyhow::Result<u64> {
        let record = frame_entry(args);
        let mut file = self.file.lock().expect("oplog file lock");
        file.write_all(&record).context("append oplog record")?;
        file.flush().context("flush oplog")?;
        Ok(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Current write sequence number (count of appended records).
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Fsync appended data.
    pub fn sync(&self) -> std::io::Result<()> {
        let file = self.file.lock().expect("oplog file lock");
        file.sync_data()
    }

    /// Read all complete records for startup replay.
    pub fn load(&self) -> anyhow::Result<Vec<Vec<Vec<u8>>>> {
        read_entries(&self.path)
    }
}

/// Frame one command entry as a log record: u32 payload length, u32 CRC32
/// of the payload, then the encoded arguments. Building the whole record in
/// one buffer keeps the append a single write, so a crash can only tear the
/// tail.
fn frame_entry(args: &[Vec<u8>]) -> Vec<u8> {
    let payload = encode_entry(args);
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Read and decode all complete records. A record cut short by a crash ends
/// the log without error; a checksum mismatch on a complete record is
/// corruption and fails the load.
fn read_entries(path: &Path) -> anyhow::Result<Vec<Vec<Vec<u8>>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).context("open oplog for read"),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("read oplog record length"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        let mut payload = vec![0u8; len];
        // A short read here is a torn tail from a crash mid-append.
        if !read_exact_or_eof(&mut reader, &mut crc_buf)?
            || !read_exact_or_eof(&mut reader, &mut payload)?
        {
            break;
        }
        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(hasher.finalize() == expected_crc, "oplog checksum mismatch");
        entries.push(decode_entry(&payload)?);
    }
    Ok(entries)
}

/// Read exactly `buf.len()` bytes, reporting a clean short read as `false`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> anyhow::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err).context("read oplog record"),
    }
}

/// Encode a command argument vector: u32 argc, then u32 length + bytes per
/// argument, big-endian throughout.
fn encode_entry(args: &[Vec<u8>]) -> Vec<u8> {
    let mut size = 4;
    for arg in args {
        size += 4 + arg.len();
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(args.len() as u32).to_be_bytes());
    for arg in args {
        out.extend_from_slice(&(arg.len() as u32).to_be_bytes());
        out.extend_from_slice(arg);
    }
    out
}

fn decode_entry(buf: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut offset = 0usize;
    let argc = read_u32_at(buf, &mut offset)? as usize;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        let len = read_u32_at(buf, &mut offset)? as usize;
        anyhow::ensure!(offset + len <= buf.len(), "oplog entry short argument");
        args.push(buf[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(args)
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "oplog entry short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn appended_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");

        let log = OpLog::open(&path).unwrap();
        assert_eq!(log.append(&args(&["SET", "a", "1", "7", "1"])).unwrap(), 1);
        assert_eq!(log.append(&args(&["DEL", "a", "7", "2"])).unwrap(), 2);
        log.sync().unwrap();
        drop(log);

        let log = OpLog::open(&path).unwrap();
        assert_eq!(log.sequence(), 2);
        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], args(&["SET", "a", "1", "7", "1"]));
        assert_eq!(entries[1], args(&["DEL", "a", "7", "2"]));
    }

    #[test]
    fn torn_final_record_is_dropped_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");

        let log = OpLog::open(&path).unwrap();
        log.append(&args(&["SET", "a", "1", "7", "1"])).unwrap();
        log.append(&args(&["SET", "b", "2", "7", "2"])).unwrap();
        drop(log);

        // Simulate a crash mid-append by truncating into the last record.
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 5]).unwrap();

        let log = OpLog::open(&path).unwrap();
        assert_eq!(log.sequence(), 1);
        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], args(&["SET", "a", "1", "7", "1"]));
    }

    #[test]
    fn corrupted_record_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");

        let log = OpLog::open(&path).unwrap();
        log.append(&args(&["SET", "a", "1", "7", "1"])).unwrap();
        drop(log);

        // Flip a payload byte in place; lengths stay intact so the record
        // still reads as complete.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(&bytes).unwrap();
        drop(file);

        assert!(OpLog::open(&path).is_err());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = OpLog::open(dir.path().join("oplog")).unwrap();
        assert_eq!(log.sequence(), 0);
        assert!(log.load().unwrap().is_empty());
    }
}
