//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::io::{self, Read};
use std::sync::Mutex;

use vigil_witness::witness::WitnessLink;

/// Build a command argument vector from string parts.
pub fn args(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// Encode one recovery record (argument-count header plus bulk frames).
pub fn wire_record(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        out.extend_from_slice(part.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Encode a full recovery response: declared-count header plus records.
pub fn wire_stream(declared: usize, records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{declared}\r\n").into_bytes();
    for record in records {
        out.extend_from_slice(record);
    }
    out
}

/// In-memory witness: serves a scripted recovery response (or refuses the
/// connection) and captures GC payloads.
pub struct ScriptedLink {
    response: Option<Vec<u8>>,
    pub gc_payloads: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedLink {
    pub fn serving(response: Vec<u8>) -> Self {
        Self {
            response: Some(response),
            gc_payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            response: None,
            gc_payloads: Mutex::new(Vec::new()),
        }
    }
}

impl WitnessLink for ScriptedLink {
    fn endpoint(&self) -> String {
        "scripted:0".to_string()
    }

    fn fetch_recovery_stream(&self, _requester_index: &str) -> io::Result<Box<dyn Read>> {
        match &self.response {
            Some(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "witness unreachable",
            )),
        }
    }

    fn send_gc(&self, payload: &[u8]) -> io::Result<()> {
        self.gc_payloads.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}
