//! Passive Modbus RTU capture over serial-to-TCP gateways.
//!
//! tapsrv attaches to the TCP side of serial device servers (Moxa
//! NPort and friends), observes the RTU traffic a third-party poller
//! generates, and reassembles it into frames without ever transmitting.
//! Frames are summarized for diagnostics, surveyed for live slave
//! addresses, decoded against configured register maps and optionally
//! written to InfluxDB.

pub mod collector;
pub mod config;
pub mod coordinator;
pub mod dustiq;
pub mod error;
pub mod frame;
pub mod handler;
pub mod listener;
pub mod registers;
pub mod storage;

pub use config::{Config, GatewayConfig, Mode, SubMode};
pub use error::{Result, TapSrvError};
