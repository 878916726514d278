use std::fmt::Write as _;

/// Bytes as contiguous upper-case hex, the way EPC codes are shown.
pub fn hex_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// Bytes as space-separated upper-case hex for log lines.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (index, byte) in data.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// Decode a hex string into raw bytes. ASCII whitespace is ignored; an odd
/// number of digits or a non-hex character yields `None`.
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() / 2);
    let mut high: Option<u8> = None;
    for ch in text.chars() {
        if ch.is_ascii_whitespace() {
            continue;
        }
        let digit = ch.to_digit(16)? as u8;
        match high.take() {
            Some(value) => out.push((value << 4) | digit),
            None => high = Some(digit),
        }
    }
    if high.is_some() {
        return None;
    }
    Some(out)
}
