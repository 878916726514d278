//! Protocol stack for Clou Hopeland UHF RFID readers plus the file message
//! exchange used to couple the reader session engine with external HTTP
//! workers.

pub mod constants;
pub mod crc;
pub mod fme;
pub mod frame;
pub mod logging;
pub mod stream;
pub mod tagdata;
pub mod template;
pub mod time;
pub mod util;
