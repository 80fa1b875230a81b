//! End-to-end capture tests over real sockets.
//!
//! A local TCP server plays the role of the serial device server,
//! replaying RTU bytes with pauses longer than the configured idle
//! gap. A second local server acts as the InfluxDB write endpoint and
//! records every request body it receives.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use tapsrv::collector::SlaveCollector;
use tapsrv::config::{
    Config, GatewayConfig, RegisterSpec, SlaveSpec, StorageConfig, StorageTarget, SubMode,
};
use tapsrv::coordinator::StoreCoordinator;
use tapsrv::frame::crc16;
use tapsrv::listener::run_gateway;
use tapsrv::registers::{RegisterKind, RegisterValue};
use tapsrv::storage::StorageManager;

const IDLE_GAP_MS: u64 = 25;
const FRAME_PAUSE: Duration = Duration::from_millis(80);

fn gateway(name: &str, port: u16) -> GatewayConfig {
    GatewayConfig {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        device_type: None,
        idle_gap_ms: Some(IDLE_GAP_MS),
        serial: None,
        dial_timeout_ms: Some(1000),
        reconnect_delay_ms: Some(100),
        read_buffer_bytes: None,
        max_frame_bytes: None,
        log_frame_hex: false,
        connection_keep_log: false,
        skip_invalid_crc: false,
        slaves: Vec::new(),
        expected_slaves: Vec::new(),
    }
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// A function 0x03 response carrying the given register words.
fn read_response(slave: u8, words: &[u16]) -> Vec<u8> {
    let mut frame = vec![slave, 0x03, (words.len() * 2) as u8];
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    with_crc(frame)
}

/// Bind a fake gateway that writes each frame as one burst, separated
/// by pauses longer than the idle gap, then holds the socket open.
async fn spawn_bus(frames: Vec<Vec<u8>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        for frame in frames {
            socket.write_all(&frame).await.unwrap();
            sleep(FRAME_PAUSE).await;
        }
        sleep(Duration::from_secs(30)).await;
        drop(socket);
    });
    port
}

/// Minimal InfluxDB v2 write endpoint answering 204 and forwarding
/// every request body on a channel.
async fn spawn_influx_sink() -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    // Accumulate until a full request (headers plus
                    // Content-Length body) is buffered.
                    let body = loop {
                        if let Some(body) = extract_request_body(&buf) {
                            break body;
                        }
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    };
                    buf.clear();
                    let _ = tx.send(body);
                    let _ = socket
                        .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                        .await;
                }
            });
        }
    });
    (port, rx)
}

fn extract_request_body(buf: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(buf).ok()?;
    let header_end = text.find("\r\n\r\n")?;
    let headers = &text[..header_end];
    let content_length: usize = headers
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim())
        })
        .and_then(|v| v.parse().ok())?;
    let body = &buf[header_end + 4..];
    if body.len() < content_length {
        return None;
    }
    String::from_utf8(body[..content_length].to_vec()).ok()
}

fn storage_for(port: u16) -> Arc<StorageManager> {
    let cfg = StorageConfig {
        local: vec![StorageTarget {
            name: "sink".to_string(),
            db_type: "influxdb2".to_string(),
            db_url: format!("http://127.0.0.1:{port}"),
            db_token: "secret".to_string(),
            db_org: "org".to_string(),
            db_bucket: "bucket".to_string(),
            db_measurement: None,
        }],
        remotes: Vec::new(),
    };
    Arc::new(StorageManager::new(&cfg).unwrap())
}

#[tokio::test]
async fn storage_keeps_writing_when_a_destination_is_down() {
    let (influx_port, mut bodies) = spawn_influx_sink().await;

    // The unreachable target comes first in write order; its failure
    // must be swallowed before the live target is attempted.
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
        remotes: vec![StorageTarget {
            name: "sink".to_string(),
            db_type: "influxdb2".to_string(),
            db_url: format!("http://127.0.0.1:{influx_port}"),
            db_token: String::new(),
            db_org: "org".to_string(),
            db_bucket: "bucket".to_string(),
            db_measurement: None,
        }],
    };
    let storage = StorageManager::new(&cfg).unwrap();
    assert_eq!(storage.destination_count(), 2);

    let values = vec![RegisterValue {
        register: 0,
        name: "temp".to_string(),
        kind: RegisterKind::Int16,
        value: 21.0,
    }];
    storage.store("np", 1, None, &values, chrono::Utc::now()).await;

    let body = timeout(Duration::from_secs(2), bodies.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(body.contains("registers,port=np,slave=1,register=0,register_name=temp temp=21i"));
}

#[tokio::test]
async fn detects_slaves_from_gapped_bursts() {
    let frames = vec![
        read_response(1, &[42]),
        read_response(2, &[7]),
        // Bad CRC must not be recorded.
        {
            let mut bad = read_response(3, &[1]);
            let last = bad.len() - 1;
            bad[last] ^= 0xFF;
            bad
        },
        read_response(1, &[43]),
    ];
    let port = spawn_bus(frames).await;

    let cancel = CancellationToken::new();
    let collector = Arc::new(SlaveCollector::new());
    let task = tokio::spawn(run_gateway(
        cancel.clone(),
        gateway("np", port),
        SubMode::Test,
        Arc::clone(&collector),
        None,
        None,
    ));

    sleep(Duration::from_millis(600)).await;
    cancel.cancel();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    let report = collector.report();
    assert_eq!(report["np"], vec![1, 2]);
}

#[tokio::test]
async fn store_barrier_flushes_once_and_stops_the_run() {
    let (influx_port, mut bodies) = spawn_influx_sink().await;
    let storage = storage_for(influx_port);

    let register_map = vec![SlaveSpec {
        address: 1,
        name: Some("inv-a".to_string()),
        registers: vec![RegisterSpec {
            register: 0,
            register_name: "temp".to_string(),
            register_type: RegisterKind::Int16,
            register_count: 1,
        }],
    }, SlaveSpec {
        address: 2,
        name: None,
        registers: vec![RegisterSpec {
            register: 0,
            register_name: "current".to_string(),
            register_type: RegisterKind::Uint16,
            register_count: 1,
        }],
    }];

    // Slave 1 reports twice; only the second reading may be stored.
    let frames = vec![
        read_response(1, &[100]),
        read_response(1, &[200]),
        read_response(2, &[7]),
        read_response(1, &[999]),
    ];
    let bus_port = spawn_bus(frames).await;

    let mut gw = gateway("np", bus_port);
    gw.slaves = register_map;
    gw.expected_slaves = vec![1, 2];

    let cfg = Config {
        mode: Default::default(),
        sub_mode: SubMode::Store,
        test_duration_seconds: 0,
        test_only_valid_crc: false,
        gateways: vec![gw.clone()],
        storage: StorageConfig::default(),
    };

    let cancel = CancellationToken::new();
    let coordinator =
        Arc::new(StoreCoordinator::new(&cfg, Arc::clone(&storage), cancel.clone()).unwrap());
    let collector = Arc::new(SlaveCollector::new());

    let task = tokio::spawn(run_gateway(
        cancel.clone(),
        gw,
        SubMode::Store,
        collector,
        Some(storage),
        Some(Arc::clone(&coordinator)),
    ));

    // The barrier cancels the token once both slaves reported.
    timeout(Duration::from_secs(5), cancel.cancelled())
        .await
        .unwrap();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(coordinator.is_done().await);

    let mut all = String::new();
    while let Ok(body) = bodies.try_recv() {
        all.push_str(&body);
    }
    // One point per slave, with the last reading winning for slave 1.
    assert!(all.contains("slave=1,slave_name=inv-a,register=0,register_name=temp temp=200i"));
    assert!(all.contains("slave=2,register=0,register_name=current current=7i"));
    assert!(!all.contains("temp=100i"));
    assert!(!all.contains("temp=999i"));
}

#[tokio::test]
async fn dustiq_cycle_is_stored_and_listener_stops() {
    let (influx_port, mut bodies) = spawn_influx_sink().await;
    let storage = storage_for(influx_port);

    // 23 single-register responses starting at the device type marker,
    // then one more marker to flush the buffered cycle.
    let mut frames: Vec<Vec<u8>> = (0..23u16)
        .map(|i| read_response(5, &[if i == 0 { 800 } else { 100 + i }]))
        .collect();
    frames.push(read_response(5, &[800]));
    let bus_port = spawn_bus(frames).await;

    let mut gw = gateway("np", bus_port);
    gw.device_type = Some("dustiq".to_string());

    let cancel = CancellationToken::new();
    let collector = Arc::new(SlaveCollector::new());
    let task = tokio::spawn(run_gateway(
        cancel.clone(),
        gw,
        SubMode::Store,
        collector,
        Some(storage),
        None,
    ));

    // The handler stores the completed cycle and stops on its own,
    // without cancellation.
    timeout(Duration::from_secs(10), task).await.unwrap().unwrap();

    let body = timeout(Duration::from_secs(2), bodies.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(body.contains("register_name=ir_device_type ir_device_type=800i"));
    assert!(body.contains("slave=5"));
    // The reserved slot is never written.
    assert!(!body.contains("register=10,"));
    assert_eq!(body.lines().count(), 22);
}
