//! One-shot completion barrier for the store sub-mode.
//!
//! The coordinator holds the latest decoded reading per expected slave
//! and flushes everything to storage exactly once, as soon as every
//! expected slave on every gateway has reported. After the flush it
//! cancels the run token so the listeners wind down.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, TapSrvError};
use crate::registers::RegisterValue;
use crate::storage::StorageManager;

struct Reading {
    slave_name: Option<String>,
    values: Vec<RegisterValue>,
    ts: DateTime<Utc>,
}

#[derive(Default)]
struct BarrierState {
    last: HashMap<String, HashMap<u8, Reading>>,
    done: bool,
}

pub struct StoreCoordinator {
    expected: HashMap<String, BTreeSet<u8>>,
    state: Mutex<BarrierState>,
    storage: Arc<StorageManager>,
    cancel: CancellationToken,
}

impl StoreCoordinator {
    /// Build the barrier from the configured slave rosters. Fails when
    /// no gateway lists any expected slave, since the barrier could
    /// never complete.
    pub fn new(
        cfg: &Config,
        storage: Arc<StorageManager>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut expected: HashMap<String, BTreeSet<u8>> = HashMap::new();
        for gw in &cfg.gateways {
            if gw.expected_slaves.is_empty() {
                continue;
            }
            expected.insert(gw.name.clone(), gw.expected_slaves.iter().copied().collect());
        }
        if expected.is_empty() {
            return Err(TapSrvError::config(
                "store sub-mode requires expected_slaves on at least one gateway",
            ));
        }
        Ok(Self {
            expected,
            state: Mutex::new(BarrierState::default()),
            storage,
            cancel,
        })
    }

    /// Record the latest reading for a slave. Later readings replace
    /// earlier ones until the barrier trips. Readings from gateways or
    /// slaves outside the roster are ignored, as are empty value sets
    /// and anything arriving after completion.
    pub async fn record(
        &self,
        gateway: &str,
        slave: u8,
        slave_name: Option<&str>,
        values: &[RegisterValue],
    ) {
        if values.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        if state.done {
            return;
        }
        let Some(roster) = self.expected.get(gateway) else {
            return;
        };
        if !roster.contains(&slave) {
            return;
        }

        state.last.entry(gateway.to_string()).or_default().insert(
            slave,
            Reading {
                slave_name: slave_name.map(str::to_string),
                values: values.to_vec(),
                ts: Utc::now(),
            },
        );

        if !self.all_seen(&state) {
            return;
        }

        // Flush while still holding the lock so a racing record cannot
        // slip in between the check and the store.
        info!("all expected slaves reported, storing snapshot");
        for (gw, slaves) in &state.last {
            for (id, reading) in slaves {
                self.storage
                    .store(gw, *id, reading.slave_name.as_deref(), &reading.values, reading.ts)
                    .await;
            }
        }
        state.done = true;
        self.cancel.cancel();
    }

    fn all_seen(&self, state: &BarrierState) -> bool {
        self.expected.iter().all(|(gateway, roster)| {
            state
                .last
                .get(gateway)
                .is_some_and(|seen| roster.iter().all(|s| seen.contains_key(s)))
        })
    }

    pub async fn is_done(&self) -> bool {
        self.state.lock().await.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, StorageConfig, StorageTarget, SubMode};
    use crate::registers::RegisterKind;

    fn gateway(name: &str, expected: Vec<u8>) -> GatewayConfig {
        GatewayConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 4001,
            device_type: None,
            idle_gap_ms: None,
            serial: None,
            dial_timeout_ms: None,
            reconnect_delay_ms: None,
            read_buffer_bytes: None,
            max_frame_bytes: None,
            log_frame_hex: false,
            connection_keep_log: false,
            skip_invalid_crc: false,
            slaves: Vec::new(),
            expected_slaves: expected,
        }
    }

    fn config(gateways: Vec<GatewayConfig>) -> Config {
        Config {
            mode: Default::default(),
            sub_mode: SubMode::Store,
            test_duration_seconds: 0,
            test_only_valid_crc: false,
            gateways,
            storage: StorageConfig::default(),
        }
    }

    // Write failures are logged and ignored, so a dead endpoint is
    // enough for barrier tests.
    fn storage() -> Arc<StorageManager> {
        let cfg = StorageConfig {
            local: vec![StorageTarget {
                name: "dead".to_string(),
                db_type: "influxdb2".to_string(),
                db_url: "http://127.0.0.1:1".to_string(),
                db_token: String::new(),
                db_org: "org".to_string(),
                db_bucket: "bucket".to_string(),
                db_measurement: None,
            }],
            remotes: Vec::new(),
        };
        Arc::new(StorageManager::new(&cfg).unwrap())
    }

    fn reading(value: f64) -> Vec<RegisterValue> {
        vec![RegisterValue {
            register: 0,
            name: "temp".to_string(),
            kind: RegisterKind::Int16,
            value,
        }]
    }

    #[test]
    fn requires_at_least_one_roster() {
        let cfg = config(vec![gateway("np", Vec::new())]);
        let err = StoreCoordinator::new(&cfg, storage(), CancellationToken::new());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn ignores_readings_outside_the_roster() {
        let cfg = config(vec![gateway("np", vec![1, 2])]);
        let sc = StoreCoordinator::new(&cfg, storage(), CancellationToken::new()).unwrap();

        sc.record("other", 1, None, &reading(1.0)).await;
        sc.record("np", 9, None, &reading(1.0)).await;
        sc.record("np", 1, None, &[]).await;

        let state = sc.state.lock().await;
        assert!(state.last.is_empty());
        assert!(!state.done);
    }

    #[tokio::test]
    async fn last_reading_wins_and_barrier_trips_once() {
        let cfg = config(vec![gateway("np", vec![1, 2])]);
        let cancel = CancellationToken::new();
        let sc = StoreCoordinator::new(&cfg, storage(), cancel.clone()).unwrap();

        sc.record("np", 1, Some("inv"), &reading(1.0)).await;
        sc.record("np", 1, Some("inv"), &reading(5.0)).await;
        assert!(!sc.is_done().await);
        assert!(!cancel.is_cancelled());
        {
            let state = sc.state.lock().await;
            assert_eq!(state.last["np"][&1].values[0].value, 5.0);
        }

        sc.record("np", 2, None, &reading(2.0)).await;
        assert!(sc.is_done().await);
        assert!(cancel.is_cancelled());

        // Late readings no longer replace the stored snapshot.
        sc.record("np", 1, Some("inv"), &reading(9.0)).await;
        let state = sc.state.lock().await;
        assert_eq!(state.last["np"][&1].values[0].value, 5.0);
    }

    #[tokio::test]
    async fn barrier_spans_all_gateways() {
        let cfg = config(vec![gateway("a", vec![1]), gateway("b", vec![1])]);
        let cancel = CancellationToken::new();
        let sc = StoreCoordinator::new(&cfg, storage(), cancel.clone()).unwrap();

        sc.record("a", 1, None, &reading(1.0)).await;
        assert!(!sc.is_done().await);

        sc.record("b", 1, None, &reading(1.0)).await;
        assert!(sc.is_done().await);
        assert!(cancel.is_cancelled());
    }
}
