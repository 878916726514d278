//! File message exchange: a file-per-message queue in a shared directory,
//! used between the reader session engine and HTTP worker processes.
//!
//! Every message is a JSON envelope `{type, data, md5}` written atomically
//! (temp file, fsync, rename). The filename itself is self-describing:
//!
//! `R<sec:10><usec:6><TYP><crc32 of payload:8 hex>[<from>][<to>]<crc32 of name:8 hex>.json`
//!
//! so receivers can select and verify their messages without locks. A
//! partially written or corrupted file fails the CRC/MD5 checks and is
//! ignored. A second, `STATIC` mode uses a caller-chosen filename with no
//! routing metadata in the name.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde_json::{json, Value};

use crate::time;

pub const STATIC_TYPE: &str = "STATIC";
const NAME_MIN_LEN: usize = 47;

#[derive(Debug, Clone, PartialEq)]
pub enum FmeError {
    BadId(String),
    UnknownType(String),
    BadData(String),
    Io(String),
    Sync(String),
}

impl fmt::Display for FmeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FmeError::BadId(text) => write!(f, "bad exchange id: {}", text),
            FmeError::UnknownType(text) => write!(f, "unknown message type: {}", text),
            FmeError::BadData(text) => write!(f, "bad message data: {}", text),
            FmeError::Io(text) => write!(f, "message file io error: {}", text),
            FmeError::Sync(text) => write!(f, "exchange sync problem: {}", text),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub data: Value,
    pub timestamp: f64,
    pub from: String,
}

pub struct FileMessageExchange {
    own_id: String,
    dir: PathBuf,
    types: Vec<String>,
    received: Vec<ReceivedMessage>,
}

fn check_id(id: &str) -> Result<(), FmeError> {
    if id.is_empty() {
        return Err(FmeError::BadId("id must be at least 1 symbol".to_string()));
    }
    if id.contains('[') || id.contains(']') {
        return Err(FmeError::BadId(format!("'{}' contains [ or ]", id)));
    }
    Ok(())
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Serialize the on-disk envelope; the md5 covers the serialized `data`
/// field alone, so the receiver can re-derive it from the parsed JSON.
fn envelope(msg_type: &str, data: &Value) -> Result<Vec<u8>, FmeError> {
    let data_text = serde_json::to_string(data).map_err(|err| FmeError::BadData(err.to_string()))?;
    let payload = json!({
        "type": msg_type,
        "data": data,
        "md5": md5_hex(data_text.as_bytes()),
    });
    serde_json::to_string(&payload)
        .map(String::into_bytes)
        .map_err(|err| FmeError::BadData(err.to_string()))
}

impl FileMessageExchange {
    /// `own_id` is the name this instance sends and receives under; the
    /// caller is responsible for picking a unique one. `types` lists the
    /// allowed 3-letter message type codes.
    pub fn new(own_id: &str, dir: &Path, types: &[&str]) -> Result<FileMessageExchange, FmeError> {
        check_id(own_id)?;
        for code in types {
            if code.len() != 3 {
                return Err(FmeError::UnknownType(format!(
                    "type code '{}' must be 3 symbols",
                    code
                )));
            }
        }
        Ok(FileMessageExchange {
            own_id: own_id.to_string(),
            dir: dir.to_path_buf(),
            types: types.iter().map(|code| code.to_string()).collect(),
            received: Vec::new(),
        })
    }

    pub fn own_id(&self) -> &str {
        &self.own_id
    }

    fn build_name(&self, to: &str, msg_type: &str, payload: &[u8]) -> Result<String, FmeError> {
        let (seconds, micros) = time::timestamp_parts();
        if seconds > 9_999_999_999 {
            return Err(FmeError::Sync("timestamp does not fit 10 digits".to_string()));
        }
        let mut name = format!(
            "R{:010}{:06}{}{:08x}[{}][{}]",
            seconds,
            micros,
            msg_type,
            crc32fast::hash(payload),
            self.own_id,
            to
        );
        let name_crc = crc32fast::hash(name.as_bytes());
        name.push_str(&format!("{:08x}.json", name_crc));
        Ok(name)
    }

    fn write_atomic(&self, name: &str, payload: &[u8]) -> Result<(), FmeError> {
        let temp_name = format!("*{}", &name[1..]);
        let temp_path = self.dir.join(&temp_name);
        let final_path = self.dir.join(name);
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(payload)?;
            file.flush()?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp_path, &final_path)?;
            Ok(())
        })();
        result.map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            FmeError::Io(format!("{}: {}", final_path.display(), err))
        })
    }

    /// Send a message of one of the registered types to `to`.
    pub fn send(&self, to: &str, msg_type: &str, data: &Value) -> Result<(), FmeError> {
        check_id(to)?;
        if msg_type == STATIC_TYPE || !self.types.iter().any(|code| code == msg_type) {
            return Err(FmeError::UnknownType(msg_type.to_string()));
        }
        let payload = envelope(msg_type, data)?;
        // The name embeds microseconds and the payload checksum; retry on
        // the off chance a concurrent sender produced the same name.
        loop {
            let name = self.build_name(to, msg_type, &payload)?;
            if self.dir.join(&name).exists() || self.dir.join(format!("*{}", &name[1..])).exists() {
                continue;
            }
            return self.write_atomic(&name, &payload);
        }
    }

    /// Send under a caller-chosen filename with no routing metadata.
    pub fn send_static(&self, name: &str, data: &Value) -> Result<(), FmeError> {
        if name.len() < 3 {
            return Err(FmeError::BadId(format!("static name '{}' too short", name)));
        }
        let payload = envelope(STATIC_TYPE, data)?;
        self.write_atomic(name, &payload)
    }

    /// Scan the directory for messages of `msg_type` addressed to this
    /// instance from `from` (`"*"` accepts any sender). Accepted messages
    /// accumulate in the internal list; with `cutoff` only messages whose
    /// embedded timestamp is at or after it are kept, though older files
    /// are still erased when `erase_after_read` is set. Returns the number
    /// of messages accepted by this call.
    pub fn receive(
        &mut self,
        from: &str,
        msg_type: &str,
        erase_after_read: bool,
        cutoff: Option<f64>,
    ) -> Result<usize, FmeError> {
        if !self.types.iter().any(|code| code == msg_type) {
            return Err(FmeError::UnknownType(msg_type.to_string()));
        }
        if from != "*" {
            check_id(from)?;
        }
        let mut accepted = 0usize;
        let entries = fs::read_dir(&self.dir)
            .map_err(|err| FmeError::Io(format!("{}: {}", self.dir.display(), err)))?;
        for entry in entries.flatten() {
            if !entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let (timestamp, payload_crc, sender) =
                match parse_name(&name, from, &self.own_id, msg_type) {
                    Some(parsed) => parsed,
                    None => continue,
                };
            // The name addresses this instance; from here on the file is
            // ours to consume, valid or not.
            if let Some(data) = read_payload(&entry.path(), msg_type, Some(payload_crc)) {
                if cutoff.map_or(true, |limit| timestamp >= limit) {
                    self.received.push(ReceivedMessage {
                        data,
                        timestamp,
                        from: sender,
                    });
                    accepted += 1;
                }
            }
            if erase_after_read {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(accepted)
    }

    /// Receive the single message stored under a static filename. More than
    /// one candidate with that name is a sync problem.
    pub fn receive_static(
        &mut self,
        name: &str,
        erase_after_read: bool,
    ) -> Result<usize, FmeError> {
        if name.len() < 3 {
            return Err(FmeError::BadId(format!("static name '{}' too short", name)));
        }
        let path = self.dir.join(name);
        if !path.is_file() {
            return Ok(0);
        }
        let mut accepted = 0usize;
        if let Some(data) = read_payload(&path, STATIC_TYPE, None) {
            self.received.push(ReceivedMessage {
                data,
                timestamp: 0.0,
                from: String::new(),
            });
            accepted = 1;
        }
        if erase_after_read {
            let _ = fs::remove_file(&path);
        }
        Ok(accepted)
    }

    /// Drain every accepted message.
    pub fn take_all(&mut self) -> Vec<ReceivedMessage> {
        std::mem::take(&mut self.received)
    }

    /// Drain the message with the oldest embedded timestamp.
    pub fn take_oldest(&mut self) -> Option<ReceivedMessage> {
        if self.received.is_empty() {
            return None;
        }
        let mut oldest = 0usize;
        for (index, message) in self.received.iter().enumerate() {
            if message.timestamp < self.received[oldest].timestamp {
                oldest = index;
            }
        }
        Some(self.received.remove(oldest))
    }

    pub fn pending(&self) -> usize {
        self.received.len()
    }

    pub fn clear_received(&mut self) {
        self.received.clear();
    }
}

/// Validate a filename against the grammar and the routing expectations.
/// Returns the embedded timestamp, the payload CRC-32 and the sender.
fn parse_name(name: &str, from: &str, own_id: &str, msg_type: &str) -> Option<(f64, u32, String)> {
    if !name.is_ascii() || name.len() < NAME_MIN_LEN {
        return None;
    }
    let bytes = name.as_bytes();
    if bytes[0] != b'R' {
        return None;
    }
    if !name[name.len() - 5..].eq_ignore_ascii_case(".json") {
        return None;
    }
    if name.matches('[').count() != 2
        || name.matches(']').count() != 2
        || name.matches("][").count() != 1
    {
        return None;
    }
    if bytes[28] != b'[' || bytes[name.len() - 14] != b']' {
        return None;
    }
    let delimiter = name.find("][")?;
    if delimiter < 30 || delimiter > name.len() - 17 {
        return None;
    }
    let sender = &name[29..delimiter];
    let recipient = &name[delimiter + 2..name.len() - 14];
    if from != "*" && sender != from {
        return None;
    }
    if recipient != own_id {
        return None;
    }
    let seconds: u64 = name[1..11].parse().ok()?;
    let micros: u32 = name[11..17].parse().ok()?;
    if &name[17..20] != msg_type {
        return None;
    }
    let payload_crc = u32::from_str_radix(&name[20..28], 16).ok()?;
    let name_crc = u32::from_str_radix(&name[name.len() - 13..name.len() - 5], 16).ok()?;
    if name_crc != crc32fast::hash(name[..name.len() - 13].as_bytes()) {
        return None;
    }
    Some((
        seconds as f64 + micros as f64 / 1_000_000.0,
        payload_crc,
        sender.to_string(),
    ))
}

/// Read and verify a message file. `payload_crc` comes from the filename
/// for routed messages and is skipped for static ones.
fn read_payload(path: &Path, msg_type: &str, payload_crc: Option<u32>) -> Option<Value> {
    let raw = fs::read(path).ok()?;
    if let Some(expected) = payload_crc {
        if crc32fast::hash(&raw) != expected {
            return None;
        }
    }
    let parsed: Value = serde_json::from_slice(&raw).ok()?;
    if parsed.get("type").and_then(Value::as_str) != Some(msg_type) {
        return None;
    }
    let data = parsed.get("data")?;
    if !data.is_object() {
        return None;
    }
    let claimed = parsed.get("md5").and_then(Value::as_str)?;
    let data_text = serde_json::to_string(data).ok()?;
    if claimed != md5_hex(data_text.as_bytes()) {
        return None;
    }
    Some(data.clone())
}
