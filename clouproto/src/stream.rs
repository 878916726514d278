//! Reassembly of the raw TCP byte stream into whole frames.
//!
//! Chunks received from the socket are appended to an internal buffer and
//! `unpack` carves complete, CRC-valid frames out of it. Bytes sitting in
//! front of an accepted frame are kept aside as unknown inter-frame noise,
//! and an incomplete frame tail stays buffered until more data arrives.

use byteorder::{BigEndian, ByteOrder};

use crate::crc::crc16;
use crate::frame::{FRAME_HEAD, MAX_DATA_LEN};

enum Scan {
    Found { start: usize, end: usize },
    NeedMore,
}

pub struct RawStream {
    frames: Vec<Vec<u8>>,
    unknowns: Vec<Vec<u8>>,
    raw: Vec<u8>,
    parse_limit: usize,
    rs485_mark: usize,
}

impl RawStream {
    /// `parse_limit` caps the number of frames carved out per `unpack` call
    /// so a single call cannot monopolize the engine tick.
    pub fn new(parse_limit: usize, rs485_mark: u8) -> RawStream {
        RawStream {
            frames: Vec::new(),
            unknowns: Vec::new(),
            raw: Vec::new(),
            parse_limit: parse_limit.max(1),
            rs485_mark: (rs485_mark & 1) as usize,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.raw.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet consumed into frames.
    pub fn pending_len(&self) -> usize {
        self.raw.len()
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.frames.clear();
        self.unknowns.clear();
    }

    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.frames)
    }

    pub fn take_unknowns(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.unknowns)
    }

    /// Carve up to `parse_limit` frames out of the buffered stream.
    pub fn unpack(&mut self) {
        for _ in 0..self.parse_limit {
            if self.raw.len() < self.min_frame_len() {
                break;
            }
            match self.scan_one() {
                Scan::Found { start, end } => {
                    if start > 0 {
                        self.unknowns.push(self.raw[..start].to_vec());
                    }
                    self.frames.push(self.raw[start..end].to_vec());
                    self.raw.drain(..end);
                }
                Scan::NeedMore => break,
            }
        }
    }

    fn min_frame_len(&self) -> usize {
        7 + self.rs485_mark
    }

    /// Look for the next complete, CRC-valid frame. A candidate with a bad
    /// CRC or an oversized declared length only advances the header search
    /// by one byte, so a `0xAA` inside a garbage run can still be tried as
    /// a frame start later.
    fn scan_one(&self) -> Scan {
        let min_len = self.min_frame_len();
        let mut search = 0usize;
        loop {
            let head = match self.raw[search..].iter().position(|&b| b == FRAME_HEAD) {
                Some(offset) => search + offset,
                None => return Scan::NeedMore,
            };
            if self.raw.len() - head < min_len {
                return Scan::NeedMore;
            }
            search = head + 1;
            let length_at = head + 3 + self.rs485_mark;
            let declared = BigEndian::read_u16(&self.raw[length_at..length_at + 2]) as usize;
            if declared > MAX_DATA_LEN {
                continue;
            }
            let total = min_len + declared;
            if self.raw.len() - head < total {
                // Not enough bytes for this candidate. A later 0xAA may
                // still form a complete frame (this one may be noise), so
                // keep hunting; a genuine partial frame simply finds no
                // other candidate and stays buffered.
                continue;
            }
            let end = head + total;
            let checksum = crc16(&self.raw[head + 1..end - 2]);
            if checksum == BigEndian::read_u16(&self.raw[end - 2..end]) {
                return Scan::Found { start: head, end };
            }
        }
    }
}
