//! Passive per-gateway capture loop.
//!
//! Each gateway gets one task that dials the serial-over-TCP endpoint,
//! groups the byte stream into frames separated by the idle gap, and
//! feeds every frame through logging, detection, decoding and storage.
//! The task reconnects forever until cancelled or until a device
//! handler reports that it is finished.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::SlaveCollector;
use crate::config::{GatewayConfig, SubMode};
use crate::coordinator::StoreCoordinator;
use crate::error::{Result, TapSrvError};
use crate::frame::{self, FrameSummary};
use crate::handler::{self, DeviceHandler, HandlerFlow};
use crate::registers::{self, RegisterValue};
use crate::storage::StorageManager;

/// Why a connection's frame stream ended without an error.
enum StreamEnd {
    Cancelled,
    HandlerStop,
}

/// Run the capture loop for one gateway until cancellation or handler
/// completion. Dial failures and dropped connections retry forever.
pub async fn run_gateway(
    cancel: CancellationToken,
    gateway: GatewayConfig,
    sub_mode: SubMode,
    collector: Arc<SlaveCollector>,
    storage: Option<Arc<StorageManager>>,
    coordinator: Option<Arc<StoreCoordinator>>,
) {
    let endpoint = gateway.endpoint();
    let idle_gap = gateway.idle_gap();
    let reconnect_delay = gateway.reconnect_delay();
    debug!(
        gateway = %gateway.name,
        %endpoint,
        idle_gap_us = idle_gap.as_micros() as u64,
        "starting listener"
    );

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut stream = match timeout(gateway.dial_timeout(), TcpStream::connect(&endpoint)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(
                    gateway = %gateway.name,
                    "dial failed: {e} (retrying in {reconnect_delay:?})"
                );
                if wait_or_cancel(&cancel, reconnect_delay).await {
                    return;
                }
                continue;
            }
            Err(_) => {
                warn!(
                    gateway = %gateway.name,
                    "dial timed out (retrying in {reconnect_delay:?})"
                );
                if wait_or_cancel(&cancel, reconnect_delay).await {
                    return;
                }
                continue;
            }
        };

        info!(gateway = %gateway.name, "connected to {endpoint}");
        // Device handler state never outlives a connection.
        let mut handler = handler::for_gateway(&gateway, sub_mode, storage.clone());
        let result = stream_frames(
            &cancel,
            &mut stream,
            &gateway,
            &collector,
            storage.as_deref(),
            coordinator.as_deref(),
            &mut handler,
        )
        .await;

        if let Some(h) = handler.as_mut() {
            h.on_disconnect();
        }

        match result {
            Ok(StreamEnd::Cancelled) => return,
            Ok(StreamEnd::HandlerStop) => {
                info!(gateway = %gateway.name, "device handler finished, stopping listener");
                return;
            }
            Err(e) => {
                warn!(gateway = %gateway.name, "connection closed: {e}");
            }
        }

        if wait_or_cancel(&cancel, reconnect_delay).await {
            return;
        }
    }
}

/// Sleep for `delay`, returning true when cancelled first.
async fn wait_or_cancel(cancel: &CancellationToken, delay: std::time::Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = sleep(delay) => false,
    }
}

/// Read the socket and delimit frames by idle gap, dispatching each
/// complete frame. A read pause of one idle gap closes the pending
/// frame; hitting the max frame size closes it without a gap.
#[allow(clippy::too_many_arguments)]
async fn stream_frames(
    cancel: &CancellationToken,
    stream: &mut TcpStream,
    gateway: &GatewayConfig,
    collector: &SlaveCollector,
    storage: Option<&StorageManager>,
    coordinator: Option<&StoreCoordinator>,
    handler: &mut Option<Box<dyn DeviceHandler>>,
) -> Result<StreamEnd> {
    let idle_gap = gateway.idle_gap();
    let max_frame = gateway.max_frame_size();
    let mut buf = vec![0u8; gateway.read_buffer_size()];
    let mut frame: Vec<u8> = Vec::new();

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            read = timeout(idle_gap, stream.read(&mut buf)) => read,
        };

        match read {
            // Idle gap elapsed: the pending frame is complete.
            Err(_) => {
                if frame.is_empty() {
                    if gateway.connection_keep_log {
                        info!(gateway = %gateway.name, "idle");
                    }
                    continue;
                }
                if dispatch_frame(gateway, &frame, collector, storage, coordinator, handler).await
                    == HandlerFlow::Stop
                {
                    return Ok(StreamEnd::HandlerStop);
                }
                frame.clear();
            }
            Ok(Ok(0)) => return Err(TapSrvError::connection("peer closed connection")),
            Ok(Ok(n)) => {
                frame.extend_from_slice(&buf[..n]);
                if frame.len() >= max_frame {
                    if dispatch_frame(gateway, &frame, collector, storage, coordinator, handler)
                        .await
                        == HandlerFlow::Stop
                    {
                        return Ok(StreamEnd::HandlerStop);
                    }
                    frame.clear();
                }
            }
            Ok(Err(e)) => return Err(TapSrvError::connection(format!("read error: {e}"))),
        }
    }
}

/// Log, record, decode and store one delimited frame, then hand it to
/// the device handler.
async fn dispatch_frame(
    gateway: &GatewayConfig,
    frame: &[u8],
    collector: &SlaveCollector,
    storage: Option<&StorageManager>,
    coordinator: Option<&StoreCoordinator>,
    handler: &mut Option<Box<dyn DeviceHandler>>,
) -> HandlerFlow {
    let summary = examine_frame(gateway, frame, collector, storage, coordinator).await;
    match handler.as_mut() {
        Some(h) => h.on_frame(frame, &summary).await,
        None => HandlerFlow::Continue,
    }
}

async fn examine_frame(
    gateway: &GatewayConfig,
    frame: &[u8],
    collector: &SlaveCollector,
    storage: Option<&StorageManager>,
    coordinator: Option<&StoreCoordinator>,
) -> FrameSummary {
    let summary = frame::summarize(frame);
    if gateway.skip_invalid_crc && !summary.is_valid() {
        return summary;
    }
    if let (true, Some(slave)) = (summary.is_valid(), summary.slave_id) {
        collector.record(&gateway.name, slave);
    }

    let payload = decode_payload(gateway, frame, &summary);
    log_frame(gateway, frame, &summary, &payload);

    if !payload.values.is_empty() {
        if let Some(slave) = summary.slave_id {
            if let Some(coordinator) = coordinator {
                coordinator
                    .record(&gateway.name, slave, payload.slave_name.as_deref(), &payload.values)
                    .await;
            } else if let Some(storage) = storage {
                storage
                    .store(
                        &gateway.name,
                        slave,
                        payload.slave_name.as_deref(),
                        &payload.values,
                        chrono::Utc::now(),
                    )
                    .await;
            }
        }
    }

    summary
}

#[derive(Default)]
struct DecodedPayload {
    data_dec: Option<String>,
    parser_lines: Vec<String>,
    register_lines: Vec<String>,
    values: Vec<RegisterValue>,
    slave_name: Option<String>,
}

/// Extract and interpret the payload of a valid frame.
fn decode_payload(gateway: &GatewayConfig, frame: &[u8], summary: &FrameSummary) -> DecodedPayload {
    let mut out = DecodedPayload::default();
    if !summary.is_valid() || frame.len() <= 4 {
        return out;
    }

    // Skip address and function code, plus the byte count when present.
    let start = if summary.byte_count.is_some() { 3 } else { 2 };
    if start >= frame.len() - 2 {
        return out;
    }
    let data = &frame[start..frame.len() - 2];
    out.data_dec = Some(frame::decimal_dump(data));

    let whole_payload = summary.byte_count.map(usize::from) == Some(data.len());
    if whole_payload && data.len() % 2 == 0 {
        out.parser_lines = frame::register_parser_lines(data);
        if let Some(slave) = summary.slave_id.and_then(|id| gateway.slave(id)) {
            let (lines, values) = registers::decode(slave, data);
            out.slave_name = slave.name.clone();
            out.register_lines = lines;
            out.values = values;
        }
    }
    out
}

fn log_frame(
    gateway: &GatewayConfig,
    frame: &[u8],
    summary: &FrameSummary,
    payload: &DecodedPayload,
) {
    let mut rendered = summary.to_string();
    if gateway.log_frame_hex {
        rendered.push_str(" | hex: ");
        rendered.push_str(&frame::to_hex(frame));
    }
    if let Some(data_dec) = &payload.data_dec {
        rendered.push_str("\n  data_dec: ");
        rendered.push_str(data_dec);
    }
    if !payload.parser_lines.is_empty() {
        rendered.push_str("\n  parsers:");
        for line in &payload.parser_lines {
            rendered.push_str("\n    ");
            rendered.push_str(line);
        }
    }
    if !payload.register_lines.is_empty() {
        rendered.push_str("\n  registers:");
        for line in &payload.register_lines {
            rendered.push_str("\n    ");
            rendered.push_str(line);
        }
    }
    info!(gateway = %gateway.name, "frame: {rendered}");
}
