//! Encoding and decoding of a single reader frame:
//!
//! `|0xAA|control word|RS-485 address|data length|data|CRC-16|`
//!
//! The control word packs the message type in the low nibble of its first
//! byte, the initiated-by-reader flag in bit 4, the RS-485 flag in bit 5
//! (bits 6..7 stay zero) and the message id in its second byte. The RS-485
//! address byte is present only when the flag is set. Length and CRC are
//! big-endian; the CRC covers everything after the `0xAA` up to the CRC
//! itself.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::constants;
use crate::crc::crc16;

pub const FRAME_HEAD: u8 = 0xAA;
pub const MAX_DATA_LEN: usize = 4096;
pub const MIN_FRAME_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    NoHeader,
    CrcMismatch,
    TooShort,
    BadType,
    ReservedBits,
    UnknownMid,
    LengthMismatch,
}

impl FrameError {
    /// Numeric code as reported on the wire-facing log lines.
    pub fn code(&self) -> u8 {
        match self {
            FrameError::NoHeader => 1,
            FrameError::CrcMismatch => 2,
            FrameError::TooShort => 3,
            FrameError::BadType => 4,
            FrameError::ReservedBits => 5,
            FrameError::UnknownMid => 6,
            FrameError::LengthMismatch => 8,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            FrameError::NoHeader => "No 0xAA frame header symbol",
            FrameError::CrcMismatch => "CRC error",
            FrameError::TooShort => "Frame len < minimum required bytes",
            FrameError::BadType => "Message type > 5",
            FrameError::ReservedBits => "Reserved bits in control word are not 0",
            FrameError::UnknownMid => "Wrong MID number for control word",
            FrameError::LengthMismatch => "Frame data len parameter not match frame data len",
        };
        f.write_str(text)
    }
}

/// One reader frame. After `decode` the `data_bytes` still carry the two
/// length bytes at offsets 0..1; the tag decoder and the template codec
/// start their cursors at offset 2 accordingly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub message_id: u8,
    pub message_type: u8,
    pub init_by_reader: u8,
    pub rs485_mark: u8,
    pub rs485_id: u8,
    pub data_bytes: Vec<u8>,
}

/// Control word fields recovered from a 2-byte parameter, used to identify
/// the request an error-warning frame refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlWord {
    pub message_id: u8,
    pub message_type: u8,
    pub init_by_reader: u8,
    pub rs485_mark: u8,
}

impl Frame {
    pub fn new(message_id: u8, message_type: u8, init_by_reader: u8, data_bytes: Vec<u8>) -> Frame {
        Frame {
            message_id,
            message_type,
            init_by_reader,
            rs485_mark: constants::RS485_NOT_USED,
            rs485_id: 0,
            data_bytes,
        }
    }

    /// Serialize the frame. With `start_data_with_len` the 2-byte length of
    /// `data_bytes` is prepended into the data region, which is how normal
    /// commands are built; callers that already carry the length bytes in
    /// `data_bytes` pass `false`.
    pub fn encode(&self, start_data_with_len: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_bytes.len() + 9);
        out.push(FRAME_HEAD);
        out.push(self.message_type | (self.init_by_reader << 4) | (self.rs485_mark << 5));
        out.push(self.message_id);
        if self.rs485_mark == constants::RS485_USED {
            out.push(self.rs485_id);
        }
        if start_data_with_len {
            let mut length = [0u8; 2];
            BigEndian::write_u16(&mut length, self.data_bytes.len() as u16);
            out.extend_from_slice(&length);
        }
        out.extend_from_slice(&self.data_bytes);
        let mut checksum = [0u8; 2];
        BigEndian::write_u16(&mut checksum, crc16(&out[1..]));
        out.extend_from_slice(&checksum);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
        if raw.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort);
        }
        if raw[0] != FRAME_HEAD {
            return Err(FrameError::NoHeader);
        }
        let checksum = crc16(&raw[1..raw.len() - 2]);
        if checksum != BigEndian::read_u16(&raw[raw.len() - 2..]) {
            return Err(FrameError::CrcMismatch);
        }
        let control = raw[1];
        let message_type = control & 0x0F;
        if message_type > constants::TYPE_TEST {
            return Err(FrameError::BadType);
        }
        let init_by_reader = (control >> 4) & 0x01;
        let rs485_mark = (control >> 5) & 0x01;
        if control >> 6 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let mut rs485_id = 0u8;
        let mut data_offset = 3usize;
        if rs485_mark == constants::RS485_USED {
            rs485_id = raw[3];
            data_offset += 1;
        }
        let data_bytes = raw[data_offset..raw.len() - 2].to_vec();
        if data_bytes.len() < 2
            || data_bytes.len() - 2 != BigEndian::read_u16(&data_bytes[..2]) as usize
        {
            return Err(FrameError::LengthMismatch);
        }
        Ok(Frame {
            message_id: raw[2],
            message_type,
            init_by_reader,
            rs485_mark,
            rs485_id,
            data_bytes,
        })
    }
}

/// Decode the two bytes of a control word alone.
pub fn decode_control_word(word: &[u8]) -> Result<ControlWord, FrameError> {
    if word.len() != 2 {
        return Err(FrameError::TooShort);
    }
    let control = word[0];
    let message_type = control & 0x0F;
    if message_type > constants::TYPE_TEST {
        return Err(FrameError::BadType);
    }
    if control >> 6 != 0 {
        return Err(FrameError::ReservedBits);
    }
    Ok(ControlWord {
        message_id: word[1],
        message_type,
        init_by_reader: (control >> 4) & 0x01,
        rs485_mark: (control >> 5) & 0x01,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = Frame::new(
            constants::MAN_CONN_CONFIRM,
            constants::TYPE_CONF_MANAGE,
            constants::INIT_BY_USER,
            vec![0x00, 0x11, 0x22, 0x33],
        );
        let raw = frame.encode(true);
        assert_eq!(raw[0], FRAME_HEAD);

        let decoded = Frame::decode(&raw).unwrap();
        assert_eq!(decoded.message_id, frame.message_id);
        assert_eq!(decoded.message_type, frame.message_type);
        assert_eq!(decoded.init_by_reader, frame.init_by_reader);
        assert_eq!(decoded.rs485_mark, constants::RS485_NOT_USED);
        // The length prefix stays in the decoded data bytes.
        assert_eq!(decoded.data_bytes, vec![0x00, 0x04, 0x00, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_encode_rs485_address_byte() {
        let mut frame = Frame::new(0x01, constants::TYPE_CONF_MANAGE, constants::INIT_BY_USER, vec![]);
        frame.rs485_mark = constants::RS485_USED;
        frame.rs485_id = 0x2A;
        let raw = frame.encode(true);
        assert_eq!(raw[3], 0x2A);

        let decoded = Frame::decode(&raw).unwrap();
        assert_eq!(decoded.rs485_mark, constants::RS485_USED);
        assert_eq!(decoded.rs485_id, 0x2A);
        assert_eq!(decoded.data_bytes, vec![0x00, 0x00]);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(Frame::decode(&[0xAA, 0x01, 0x02]), Err(FrameError::TooShort));
    }

    #[test]
    fn test_decode_no_header() {
        let mut raw = Frame::new(0x00, 0, constants::INIT_BY_READER, vec![]).encode(true);
        raw[0] = 0xAB;
        assert_eq!(Frame::decode(&raw), Err(FrameError::NoHeader));
    }

    #[test]
    fn test_decode_crc_mismatch() {
        let mut raw =
            Frame::new(0x10, constants::TYPE_CONF_MANAGE, constants::INIT_BY_USER, vec![0x05])
                .encode(true);
        let tail = raw.len() - 1;
        raw[tail] ^= 0xFF;
        assert_eq!(Frame::decode(&raw), Err(FrameError::CrcMismatch));
    }

    #[test]
    fn test_decode_bad_type() {
        let mut frame = Frame::new(0x00, 0, constants::INIT_BY_USER, vec![]);
        frame.message_type = 0x07;
        let raw = frame.encode(true);
        assert_eq!(Frame::decode(&raw), Err(FrameError::BadType));
    }

    #[test]
    fn test_decode_reserved_bits() {
        let frame = Frame::new(0x00, constants::TYPE_CONF_MANAGE, constants::INIT_BY_USER, vec![]);
        let mut raw = frame.encode(true);
        raw[1] |= 0x40;
        // Re-seal the checksum so only the reserved bit trips.
        let body_end = raw.len() - 2;
        let checksum = crc16(&raw[1..body_end]);
        BigEndian::write_u16(&mut raw[body_end..], checksum);
        assert_eq!(Frame::decode(&raw), Err(FrameError::ReservedBits));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let frame = Frame {
            message_id: 0x01,
            message_type: constants::TYPE_CONF_MANAGE,
            init_by_reader: constants::INIT_BY_USER,
            rs485_mark: 0,
            rs485_id: 0,
            // Claims 9 data bytes but carries 2.
            data_bytes: vec![0x00, 0x09, 0xDE, 0xAD],
        };
        let raw = frame.encode(false);
        assert_eq!(Frame::decode(&raw), Err(FrameError::LengthMismatch));
    }

    #[test]
    fn test_connection_confirm_ping_shape() {
        // The reader's keepalive ping as it appears on the wire.
        let ping = Frame::new(
            constants::MAN_READER_CONN_CONFIRM,
            constants::TYPE_CONF_MANAGE,
            constants::INIT_BY_READER,
            vec![0x00, 0x11, 0x22, 0x33],
        )
        .encode(true);
        assert_eq!(&ping[..5], &[0xAA, 0x11, 0x12, 0x00, 0x04]);

        let decoded = Frame::decode(&ping).unwrap();
        assert_eq!(decoded.init_by_reader, constants::INIT_BY_READER);
        assert_eq!(decoded.data_bytes.len(), 6);
        assert_eq!(&decoded.data_bytes[2..], &[0x00, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_decode_control_word() {
        let frame = Frame::new(0xFF, constants::TYPE_CONF_OPERATE, constants::INIT_BY_USER, vec![]);
        let raw = frame.encode(true);
        let word = decode_control_word(&raw[1..3]).unwrap();
        assert_eq!(word.message_id, 0xFF);
        assert_eq!(word.message_type, constants::TYPE_CONF_OPERATE);
        assert_eq!(word.init_by_reader, constants::INIT_BY_USER);

        assert_eq!(decode_control_word(&[0x02]), Err(FrameError::TooShort));
        assert_eq!(decode_control_word(&[0x0F, 0x00]), Err(FrameError::BadType));
        assert_eq!(decode_control_word(&[0x42, 0x00]), Err(FrameError::ReservedBits));
    }
}
