//! Service configuration loaded from YAML.
//!
//! One flat file describes the run mode, the gateways to observe and
//! the storage destinations. The structure is immutable after load;
//! each gateway entry is handed to exactly one listener task.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TapSrvError};
use crate::registers::RegisterKind;

/// Fallback idle gap when neither `idle_gap_ms` nor serial timing is configured.
pub const DEFAULT_IDLE_GAP: Duration = Duration::from_millis(5);

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_READ_BUFFER_BYTES: usize = 1024;
const DEFAULT_MAX_FRAME_BYTES: usize = 4096;

/// Top-level run mode. Only passive listening is implemented; the
/// service never transmits on the observed socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    PassiveListening,
}

/// Sub-mode under passive listening.
///
/// `Test` summarizes and logs frames only; `Store` additionally runs
/// the storage fan-out behind the completion barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubMode {
    #[default]
    Test,
    Store,
}

/// Service configuration root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,

    #[serde(default)]
    pub sub_mode: SubMode,

    /// In test sub-mode, stop the whole process after this many seconds (0 = run until signalled).
    #[serde(default)]
    pub test_duration_seconds: u64,

    /// Global override forcing `skip_invalid_crc` on every gateway.
    #[serde(default)]
    pub test_only_valid_crc: bool,

    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Connection parameters for a single serial-over-TCP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub name: String,
    pub host: String,
    pub port: u16,

    /// Optional hint selecting a device-specific decoder (e.g. "dustiq").
    #[serde(default)]
    pub device_type: Option<String>,

    /// Explicit silence duration delimiting frames; derived from serial timing when absent.
    #[serde(default)]
    pub idle_gap_ms: Option<u64>,

    #[serde(default)]
    pub serial: Option<SerialSettings>,

    #[serde(default)]
    pub dial_timeout_ms: Option<u64>,

    #[serde(default)]
    pub reconnect_delay_ms: Option<u64>,

    #[serde(default)]
    pub read_buffer_bytes: Option<usize>,

    /// Guardrail closing a frame that grows past this size without a gap.
    #[serde(default)]
    pub max_frame_bytes: Option<usize>,

    /// Dump each closed frame as hex.
    #[serde(default)]
    pub log_frame_hex: bool,

    /// Emit a heartbeat log line on idle timeouts with no pending frame.
    #[serde(default)]
    pub connection_keep_log: bool,

    /// Drop frames with a bad or missing CRC before decoding.
    #[serde(default)]
    pub skip_invalid_crc: bool,

    /// Known register maps, keyed by slave address.
    #[serde(default)]
    pub slaves: Vec<SlaveSpec>,

    /// Expected slave roster for the store sub-mode completion barrier.
    #[serde(default)]
    pub expected_slaves: Vec<u8>,
}

impl GatewayConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Quiet period that closes a frame.
    ///
    /// Explicit configuration wins; otherwise 3.5 character times are
    /// derived from the serial link parameters, falling back to
    /// [`DEFAULT_IDLE_GAP`].
    pub fn idle_gap(&self) -> Duration {
        if let Some(ms) = self.idle_gap_ms {
            if ms > 0 {
                return Duration::from_millis(ms);
            }
        }
        self.serial
            .as_ref()
            .and_then(SerialSettings::idle_gap)
            .unwrap_or(DEFAULT_IDLE_GAP)
    }

    pub fn dial_timeout(&self) -> Duration {
        millis_or(self.dial_timeout_ms, DEFAULT_DIAL_TIMEOUT)
    }

    pub fn reconnect_delay(&self) -> Duration {
        millis_or(self.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY)
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_bytes
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_READ_BUFFER_BYTES)
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_bytes
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Look up the configured register map for a slave address.
    pub fn slave(&self, address: u8) -> Option<&SlaveSpec> {
        self.slaves.iter().find(|s| s.address == address)
    }
}

fn millis_or(ms: Option<u64>, fallback: Duration) -> Duration {
    match ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => fallback,
    }
}

/// RS485/RTU timing parameters of the serial side of the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud: u32,

    #[serde(default)]
    pub data_bits: Option<u32>,

    #[serde(default)]
    pub parity: Option<Parity>,

    /// 1, 1.5 or 2.
    #[serde(default)]
    pub stop_bits: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

impl SerialSettings {
    /// 3.5 character times, the classic RTU inter-frame silence.
    ///
    /// RTU characters are 11 bits on the wire: start bit, data bits,
    /// parity bit, stop bit(s) — links without parity carry a second
    /// stop bit instead.
    pub fn idle_gap(&self) -> Option<Duration> {
        if self.baud == 0 {
            return None;
        }
        let data_bits = f64::from(self.data_bits.filter(|&b| b > 0).unwrap_or(8));
        let parity_bits = match self.parity {
            Some(Parity::Even) | Some(Parity::Odd) | Some(Parity::Mark) | Some(Parity::Space) => {
                1.0
            }
            Some(Parity::None) | None => 0.0,
        };
        let mut stop_bits = self.stop_bits.filter(|&s| s > 0.0).unwrap_or(1.0);
        if parity_bits == 0.0 && stop_bits < 2.0 {
            stop_bits = 2.0;
        }
        let bits_per_char = 1.0 + data_bits + parity_bits + stop_bits;
        let char_time = bits_per_char / f64::from(self.baud);
        let gap = Duration::from_secs_f64(char_time * 3.5);
        if gap.is_zero() {
            None
        } else {
            Some(gap)
        }
    }
}

/// A slave address together with its known register layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveSpec {
    pub address: u8,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub registers: Vec<RegisterSpec>,
}

/// A known register mapping for easier decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub register: u16,

    pub register_name: String,

    #[serde(default)]
    pub register_type: RegisterKind,

    /// Register width in words; only 1 is supported, others are skipped.
    #[serde(default = "default_register_count")]
    pub register_count: u16,
}

fn default_register_count() -> u16 {
    1
}

/// Local and remote storage destinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub local: Vec<StorageTarget>,

    #[serde(default)]
    pub remotes: Vec<StorageTarget>,
}

impl StorageConfig {
    /// All targets in declaration order, locals first.
    pub fn targets(&self) -> impl Iterator<Item = &StorageTarget> {
        self.local.iter().chain(self.remotes.iter())
    }
}

/// A single time-series database destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageTarget {
    pub name: String,

    #[serde(rename = "db-type")]
    pub db_type: String,

    #[serde(rename = "db-url")]
    pub db_url: String,

    #[serde(rename = "db-token", default)]
    pub db_token: String,

    #[serde(rename = "db-org")]
    pub db_org: String,

    #[serde(rename = "db-bucket")]
    pub db_bucket: String,

    /// Defaults to "registers" when absent.
    #[serde(rename = "db-measurement", default)]
    pub db_measurement: Option<String>,
}

/// Read and parse the YAML configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| {
        TapSrvError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    let cfg: Config = serde_yaml::from_str(&raw)?;
    Ok(cfg)
}

impl Config {
    /// Startup validation; any failure here terminates the process
    /// before listeners are spawned.
    pub fn validate(&self) -> Result<()> {
        if self.gateways.is_empty() {
            return Err(TapSrvError::config("no gateways configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for gw in &self.gateways {
            if gw.name.is_empty() {
                return Err(TapSrvError::config("gateway with empty name"));
            }
            if gw.host.is_empty() {
                return Err(TapSrvError::config(format!(
                    "gateway {:?} has no host",
                    gw.name
                )));
            }
            if gw.port == 0 {
                return Err(TapSrvError::config(format!(
                    "gateway {:?} has no port",
                    gw.name
                )));
            }
            if !seen.insert(gw.name.as_str()) {
                return Err(TapSrvError::config(format!(
                    "duplicate gateway name {:?}",
                    gw.name
                )));
            }
        }
        Ok(())
    }
}
