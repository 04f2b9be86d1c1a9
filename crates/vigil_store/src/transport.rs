//! Blocking TCP links to witness replicas.
//!
//! Recovery runs synchronously at startup before the async runtime serves
//! clients, and GC dispatch happens on the durability worker thread, so the
//! witness transport is plain blocking I/O with socket timeouts.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use vigil_witness::witness::WitnessLink;

/// Command name a witness answers with its held recovery records.
const RECOVER_COMMAND: &[u8] = b"WRECOVER";
/// Command name carrying a GC payload of discardable records.
const GC_COMMAND: &[u8] = b"WGC";

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpWitnessLink {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpWitnessLink {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_timeout(addr, DEFAULT_IO_TIMEOUT)
    }

    pub fn with_timeout(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }
}

impl WitnessLink for TcpWitnessLink {
    fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    fn fetch_recovery_stream(&self, requester_index: &str) -> std::io::Result<Box<dyn Read>> {
        let mut stream = self.connect()?;
        let request = encode_bulk_array(&[RECOVER_COMMAND, requester_index.as_bytes()]);
        stream.write_all(&request)?;
        stream.flush()?;
        Ok(Box::new(stream))
    }

    fn send_gc(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut stream = self.connect()?;
        let request = encode_bulk_array(&[GC_COMMAND, payload]);
        stream.write_all(&request)?;
        stream.flush()
    }
}

/// Encode an argument list as an array of length-prefixed bulk values, each
/// terminated by CRLF: `*<N>`, then per element `$<len>` + bytes + CRLF.
pub fn encode_bulk_array(args: &[&[u8]]) -> Vec<u8> {
    let mut size = 16;
    for arg in args {
        size += 16 + arg.len();
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parse the comma-separated witness endpoint list from the CLI.
pub fn parse_witness_list(raw: &str) -> anyhow::Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let addr: SocketAddr = part
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid witness endpoint {part:?}: {err}"))?;
        out.push(addr);
    }
    Ok(out)
}
