//! InfluxDB v2 storage fan-out.
//!
//! Decoded register values are serialized to line protocol and posted
//! to every configured destination. A failing destination is logged
//! and skipped; capture never stops because a database is down.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use tracing::{error, warn};

use crate::config::{StorageConfig, StorageTarget};
use crate::error::{Result, TapSrvError};
use crate::registers::RegisterValue;

const DEFAULT_MEASUREMENT: &str = "registers";
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct InfluxDestination {
    name: String,
    write_url: Url,
    token: String,
    measurement: String,
    client: Client,
}

pub struct StorageManager {
    dests: Vec<InfluxDestination>,
}

impl StorageManager {
    /// Build destinations from the config, skipping unsupported or
    /// incomplete targets with a warning. Fails when nothing usable
    /// remains.
    pub fn new(cfg: &StorageConfig) -> Result<Self> {
        let mut dests = Vec::new();
        for target in cfg.targets() {
            match Self::destination(target) {
                Ok(Some(dest)) => dests.push(dest),
                Ok(None) => {
                    warn!(
                        target = %target.name,
                        "skipping storage target (unsupported type or missing fields)"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if dests.is_empty() {
            return Err(TapSrvError::storage("no usable storage destinations configured"));
        }
        Ok(Self { dests })
    }

    fn destination(target: &StorageTarget) -> Result<Option<InfluxDestination>> {
        if !target.db_type.eq_ignore_ascii_case("influxdb2") {
            return Ok(None);
        }
        if target.db_url.is_empty() || target.db_org.is_empty() || target.db_bucket.is_empty() {
            return Ok(None);
        }

        let base = target.db_url.trim_end_matches('/');
        let write_url = Url::parse_with_params(
            &format!("{base}/api/v2/write"),
            [
                ("org", target.db_org.as_str()),
                ("bucket", target.db_bucket.as_str()),
                ("precision", "ns"),
            ],
        )
        .map_err(|e| {
            TapSrvError::storage(format!("target {:?}: invalid db-url: {e}", target.name))
        })?;

        let client = Client::builder().timeout(WRITE_TIMEOUT).build()?;
        let measurement = target
            .db_measurement
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MEASUREMENT.to_string());

        Ok(Some(InfluxDestination {
            name: target.name.clone(),
            write_url,
            token: target.db_token.clone(),
            measurement,
            client,
        }))
    }

    pub fn destination_count(&self) -> usize {
        self.dests.len()
    }

    /// Write one slave's readings to every destination. Failures are
    /// logged per destination and do not propagate.
    pub async fn store(
        &self,
        gateway: &str,
        slave: u8,
        slave_name: Option<&str>,
        values: &[RegisterValue],
        ts: DateTime<Utc>,
    ) {
        if values.is_empty() {
            return;
        }

        for dest in &self.dests {
            let body = build_line_protocol(&dest.measurement, gateway, slave, slave_name, values, ts);
            if body.is_empty() {
                continue;
            }

            let mut request = dest
                .client
                .post(dest.write_url.clone())
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(body);
            if !dest.token.is_empty() {
                request = request.header("Authorization", format!("Token {}", dest.token));
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    error!(
                        target = %dest.name,
                        %status,
                        "write rejected: {}",
                        detail.trim()
                    );
                }
                Err(e) => {
                    error!(target = %dest.name, "write error: {e}");
                }
            }
        }
    }
}

/// Serialize readings as line protocol, one point per register:
/// `<measurement>,port=<gw>,slave=<id>[,slave_name=<n>],register=<r>,register_name=<name> <key>=<value> <ns>`.
fn build_line_protocol(
    measurement: &str,
    gateway: &str,
    slave: u8,
    slave_name: Option<&str>,
    values: &[RegisterValue],
    ts: DateTime<Utc>,
) -> String {
    if measurement.is_empty() {
        return String::new();
    }
    let timestamp = ts.timestamp_nanos_opt().unwrap_or_default();
    let mut out = String::new();
    for v in values {
        if v.name.is_empty() {
            continue;
        }
        let _ = write!(out, "{},port={}", escape_tag(measurement), escape_tag(gateway));
        let _ = write!(out, ",slave={slave}");
        if let Some(name) = slave_name.filter(|n| !n.is_empty()) {
            let _ = write!(out, ",slave_name={}", escape_tag(name));
        }
        let _ = write!(out, ",register={}", v.register);
        let _ = write!(out, ",register_name={}", escape_tag(&v.name));
        let _ = write!(out, " {}={}", field_key(v), field_value(v));
        let _ = writeln!(out, " {timestamp}");
    }
    out
}

fn field_value(v: &RegisterValue) -> String {
    if v.is_integral() {
        format!("{}i", v.value as i64)
    } else {
        format!("{}", v.value)
    }
}

fn field_key(v: &RegisterValue) -> String {
    let name = v.name.trim();
    if name.is_empty() {
        format!("register_{}", v.register)
    } else {
        escape_tag(&name.to_lowercase())
    }
}

/// Escape the characters line protocol reserves in tag keys and values.
fn escape_tag(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace(' ', "\\ ")
        .replace(',', "\\,")
        .replace('=', "\\=")
}
