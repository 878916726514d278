//! Clock sanity check against an NTP server (RFC 4330 client exchange) and
//! the bounded log of observed offsets.

use std::collections::VecDeque;
use std::fmt;
use std::net::UdpSocket;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use clouproto::time;

pub const NTP_PORT: u16 = 123;
/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;
const PACKET_LEN: usize = 48;
/// At most this many offset samples are kept; the oldest is evicted.
pub const OFFSET_LOG_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum NtpError {
    Io(String),
    Malformed(String),
}

impl fmt::Display for NtpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NtpError::Io(text) => write!(f, "ntp query failed: {}", text),
            NtpError::Malformed(text) => write!(f, "ntp reply malformed: {}", text),
        }
    }
}

fn write_timestamp(buf: &mut [u8], moment: f64) {
    let seconds = moment.floor();
    BigEndian::write_u32(&mut buf[0..4], seconds as u32);
    BigEndian::write_u32(&mut buf[4..8], ((moment - seconds) * 4_294_967_296.0) as u32);
}

fn read_timestamp(buf: &[u8]) -> f64 {
    let seconds = BigEndian::read_u32(&buf[0..4]) as f64;
    let fraction = BigEndian::read_u32(&buf[4..8]) as f64 / 4_294_967_296.0;
    seconds + fraction
}

/// One client/server exchange; returns the local clock offset in seconds
/// (positive when the local clock is behind the server).
pub fn query(host: &str, timeout: Duration) -> Result<f64, NtpError> {
    let address = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, NTP_PORT)
    };
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|err| NtpError::Io(err.to_string()))?;
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|err| NtpError::Io(err.to_string()))?;
    socket
        .connect(&address)
        .map_err(|err| NtpError::Io(format!("{}: {}", address, err)))?;

    let mut request = [0u8; PACKET_LEN];
    request[0] = 0x1B; // LI 0, version 3, mode 3 (client)
    let originate = time::timestamp() + NTP_UNIX_DELTA;
    write_timestamp(&mut request[40..48], originate);

    socket
        .send(&request)
        .map_err(|err| NtpError::Io(err.to_string()))?;
    let mut reply = [0u8; PACKET_LEN];
    let received = socket
        .recv(&mut reply)
        .map_err(|err| NtpError::Io(err.to_string()))?;
    let destination = time::timestamp() + NTP_UNIX_DELTA;

    if received < PACKET_LEN {
        return Err(NtpError::Malformed(format!("{} bytes", received)));
    }
    let mode = reply[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(NtpError::Malformed(format!("mode {}", mode)));
    }
    // The server copies our transmit timestamp into the originate field.
    if reply[24..32] != request[40..48] {
        return Err(NtpError::Malformed("originate timestamp mismatch".to_string()));
    }
    let receive = read_timestamp(&reply[32..40]);
    let transmit = read_timestamp(&reply[40..48]);
    if transmit == 0.0 {
        return Err(NtpError::Malformed("zero transmit timestamp".to_string()));
    }

    Ok(((receive - originate) + (transmit - destination)) / 2.0)
}

/// Ring of absolute offset samples, capped at `OFFSET_LOG_LIMIT`.
#[derive(Debug, Default)]
pub struct OffsetLog {
    samples: VecDeque<f64>,
}

impl OffsetLog {
    pub fn new() -> OffsetLog {
        OffsetLog {
            samples: VecDeque::with_capacity(OFFSET_LOG_LIMIT),
        }
    }

    pub fn push(&mut self, offset: f64) {
        if self.samples.len() == OFFSET_LOG_LIMIT {
            self.samples.pop_front();
        }
        self.samples.push_back(offset.abs());
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().cloned().fold(None, |best, sample| {
            Some(best.map_or(sample, |value: f64| value.max(sample)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_codec_round_trip() {
        let mut buf = [0u8; 8];
        let moment = 3_820_000_000.262144;
        write_timestamp(&mut buf, moment);
        let back = read_timestamp(&buf);
        assert!((back - moment).abs() < 1e-6);
    }

    #[test]
    fn test_offset_log_cap_and_stats() {
        let mut log = OffsetLog::new();
        assert_eq!(log.average(), None);
        assert_eq!(log.max(), None);

        log.push(-0.5);
        log.push(0.25);
        assert_eq!(log.len(), 2);
        assert_eq!(log.average(), Some(0.375));
        assert_eq!(log.max(), Some(0.5));

        for sample in 0..200 {
            log.push(sample as f64 / 1000.0);
        }
        assert_eq!(log.len(), OFFSET_LOG_LIMIT);
        // Only the newest hundred samples remain.
        assert_eq!(log.max(), Some(0.199));
    }
}
