//! Recovery stream reader.
//!
//! A witness answers a recovery request with a header line `*<N>` declaring
//! the record count, then per record a `*<M>` argument-count line followed by
//! M argument frames, each `$<L>` then exactly L bytes and a 2-byte
//! terminator. This module turns that byte stream into typed records,
//! distinguishing malformed frames from short reads from clean end-of-stream.

use std::io::{BufRead, ErrorKind, Read};

use crate::witness::types::RecoveryRecord;

/// Bytes trailing every bulk argument (CRLF). Read and discarded.
const ARG_TERMINATOR_LEN: usize = 2;

/// Fault classes for a witness stream that was opened successfully. Both are
/// unrecoverable for the recovery attempt that hit them; the data contract
/// with witnesses is assumed reliable, so either implies an operational
/// fault.
#[derive(Debug, thiserror::Error)]
pub enum StreamFault {
    /// Malformed frame header: wrong sigil, unparseable count, or a count
    /// outside its allowed range.
    #[error("format fault: {0}")]
    Format(String),
    /// Short or failed read that did not coincide with a clean end-of-stream.
    #[error("read fault: {0}")]
    Read(#[source] std::io::Error),
}

impl StreamFault {
    fn unexpected_eof(what: &str) -> Self {
        Self::Read(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("stream ended while reading {what}"),
        ))
    }
}

/// Typed reader over a witness recovery response.
pub struct RecordReader<R> {
    inner: R,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the stream header `*<N>` giving the declared record count. An
    /// opened stream must announce a count, so end-of-stream here is a
    /// format fault rather than a clean end.
    pub fn read_record_count(&mut self) -> Result<usize, StreamFault> {
        match self.read_header_line()? {
            Some(line) => parse_count(&line, b'*', "record count"),
            None => Err(StreamFault::Format(
                "stream ended before the record-count header".to_string(),
            )),
        }
    }

    /// Read the next record. Clean end-of-stream at the record boundary is
    /// the normal end of recovery data and yields `Ok(None)`; end-of-stream
    /// anywhere inside a record is a read fault.
    pub fn read_record(&mut self) -> Result<Option<RecoveryRecord>, StreamFault> {
        let header = match self.read_header_line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        let argc = parse_count(&header, b'*', "argument count")?;
        if argc < 1 {
            return Err(StreamFault::Format(
                "record argument count must be at least 1".to_string(),
            ));
        }

        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let header = self
                .read_header_line()?
                .ok_or_else(|| StreamFault::unexpected_eof("an argument header"))?;
            let len = parse_count(&header, b'$', "argument length")?;

            let mut arg = vec![0u8; len];
            self.inner
                .read_exact(&mut arg)
                .map_err(StreamFault::Read)?;

            let mut terminator = [0u8; ARG_TERMINATOR_LEN];
            self.inner
                .read_exact(&mut terminator)
                .map_err(StreamFault::Read)?;

            args.push(arg);
        }
        Ok(Some(RecoveryRecord { args }))
    }

    /// Read one `\n`-terminated header line, trimming the line ending.
    /// `Ok(None)` means the stream ended cleanly before any byte of the
    /// line; a line that starts but never terminates is malformed.
    fn read_header_line(&mut self) -> Result<Option<Vec<u8>>, StreamFault> {
        let mut line = Vec::new();
        let n = self
            .inner
            .read_until(b'\n', &mut line)
            .map_err(StreamFault::Read)?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(StreamFault::Format(
                "unterminated header line".to_string(),
            ));
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// Parse a `<sigil><base-10 integer>` header. A missing sigil or an empty or
/// non-numeric count field is a format fault.
fn parse_count(line: &[u8], sigil: u8, what: &str) -> Result<usize, StreamFault> {
    if line.first() != Some(&sigil) {
        return Err(StreamFault::Format(format!(
            "{what} header missing '{}' sigil",
            sigil as char
        )));
    }
    let digits = &line[1..];
    if digits.is_empty() {
        return Err(StreamFault::Format(format!("{what} field is empty")));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            StreamFault::Format(format!(
                "{what} field is not a base-10 integer: {:?}",
                String::from_utf8_lossy(digits)
            ))
        })
}
