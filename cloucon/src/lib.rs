//! Reader session engine for Clou Hopeland UHF RFID readers: one process
//! keeps one long-lived TCP session with one reader, answers its
//! protocol-obligated confirmations, collects tag reports and serves
//! command and status requests arriving over the file message exchange.

pub mod config;
pub mod engine;
pub mod ntp;
pub mod transport;
