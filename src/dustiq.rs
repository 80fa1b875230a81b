//! DustIQ soiling sensor cycle reassembly.
//!
//! The sensor's poller reads its input registers one at a time, so a
//! full readout arrives as 23 consecutive single-register responses
//! from the same slave. The device type register (always 800) marks
//! the start of a cycle; everything until the next marker belongs to
//! the same readout.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::SubMode;
use crate::frame::FrameSummary;
use crate::handler::{DeviceHandler, HandlerFlow};
use crate::registers::{RegisterKind, RegisterValue};
use crate::storage::StorageManager;

/// Frames per complete readout cycle.
pub const CYCLE_FRAMES: usize = 23;

/// Device type register value that opens every cycle.
const CYCLE_MARKER: u16 = 800;

#[derive(Debug, Clone, Copy)]
enum Conv {
    U16,
    U16Div10,
    I16,
    I16Div10,
    /// Decikelvin to degrees Celsius.
    BackpanelTemp,
    /// Millivolts to volts.
    DeviceVoltage,
}

impl Conv {
    fn apply(self, raw: u16) -> f64 {
        match self {
            Conv::U16 => f64::from(raw),
            Conv::U16Div10 => f64::from(raw) / 10.0,
            Conv::I16 => f64::from(raw as i16),
            Conv::I16Div10 => f64::from(raw as i16) / 10.0,
            Conv::BackpanelTemp => f64::from(raw) / 10.0 - 273.15,
            Conv::DeviceVoltage => f64::from(raw as i16) / 1000.0,
        }
    }
}

struct Slot {
    name: &'static str,
    conv: Conv,
    kind: RegisterKind,
}

const fn slot(name: &'static str, conv: Conv, kind: RegisterKind) -> Option<Slot> {
    Some(Slot { name, conv, kind })
}

/// Register map of one cycle, in poll order. Index 10 is reserved by
/// the device and never stored.
const SLOTS: [Option<Slot>; CYCLE_FRAMES] = [
    slot("ir_device_type", Conv::U16, RegisterKind::Uint16),
    slot("ir_datamodel_version", Conv::U16, RegisterKind::Uint16),
    slot("ir_software_version", Conv::U16, RegisterKind::Uint16),
    slot("ir_batch_number", Conv::U16, RegisterKind::Uint16),
    slot("ir_serial_number", Conv::U16, RegisterKind::Uint16),
    slot("ir_hardware_version", Conv::U16, RegisterKind::Uint16),
    slot("ir_soiling_ratio_sensor1", Conv::U16Div10, RegisterKind::Float),
    slot("ir_tr_loss_sensor1", Conv::I16Div10, RegisterKind::Float),
    slot("ir_soiling_ratio_sensor2", Conv::U16Div10, RegisterKind::Float),
    slot("ir_tr_loss_sensor2", Conv::I16Div10, RegisterKind::Float),
    None,
    slot("ir_backpanel_temp", Conv::BackpanelTemp, RegisterKind::Float),
    slot("ir_calibration_year", Conv::U16, RegisterKind::Uint16),
    slot("ir_calibration_month", Conv::U16, RegisterKind::Uint16),
    slot("ir_calibration_day", Conv::U16, RegisterKind::Uint16),
    slot("ir_tilt_x_direction", Conv::I16Div10, RegisterKind::Float),
    slot("ir_tilt_y_direction", Conv::I16Div10, RegisterKind::Float),
    slot("ir_calibration_flags", Conv::U16, RegisterKind::Uint16),
    slot("ir_device_voltage", Conv::DeviceVoltage, RegisterKind::Float),
    slot("ir_operational_mode", Conv::I16, RegisterKind::Int16),
    slot("ir_dust_tilt_sensor_1", Conv::U16, RegisterKind::Uint16),
    slot("ir_dust_tilt_sensor_2", Conv::U16, RegisterKind::Uint16),
    slot("placeholder_22", Conv::U16, RegisterKind::Uint16),
];

/// Stateful reassembler for DustIQ readout cycles.
pub struct DustIqHandler {
    gateway: String,
    store: bool,
    storage: Option<Arc<StorageManager>>,
    cycle: Vec<Vec<u8>>,
    current_slave: u8,
}

impl DustIqHandler {
    pub fn new(gateway: String, sub_mode: SubMode, storage: Option<Arc<StorageManager>>) -> Self {
        let store = sub_mode == SubMode::Store && storage.is_some();
        Self {
            gateway,
            store,
            storage,
            cycle: Vec::with_capacity(CYCLE_FRAMES),
            current_slave: 0,
        }
    }

    fn reset(&mut self) {
        self.cycle.clear();
        self.current_slave = 0;
    }

    /// Decode and emit the buffered cycle. Returns true when a stored
    /// cycle means the listener can stop.
    async fn flush(&mut self) -> bool {
        if self.cycle.is_empty() {
            return false;
        }
        if self.cycle.len() < CYCLE_FRAMES {
            warn!(
                gateway = %self.gateway,
                "discarding incomplete cycle: expected {CYCLE_FRAMES} frames, got {}",
                self.cycle.len()
            );
            self.reset();
            return false;
        }

        let (values, warnings) = decode_cycle(&self.cycle);
        info!(
            gateway = %self.gateway,
            slave = self.current_slave,
            "dustiq cycle complete: {}",
            render_values(&values)
        );
        for warning in &warnings {
            warn!(gateway = %self.gateway, "dustiq: {warning}");
        }

        let mut stop = false;
        if self.store && !values.is_empty() {
            if let Some(storage) = &self.storage {
                storage
                    .store(&self.gateway, self.current_slave, None, &values, Utc::now())
                    .await;
            }
            stop = true;
        }
        self.reset();
        stop
    }
}

#[async_trait]
impl DeviceHandler for DustIqHandler {
    async fn on_frame(&mut self, frame: &[u8], summary: &FrameSummary) -> HandlerFlow {
        // Only valid single-register read responses participate.
        if frame.len() != 7 || !summary.is_valid() || summary.byte_count != Some(2) {
            return HandlerFlow::Continue;
        }

        let value = u16::from_be_bytes([frame[3], frame[4]]);
        if value == CYCLE_MARKER {
            if self.flush().await {
                return HandlerFlow::Stop;
            }
            self.current_slave = frame[0];
            self.cycle.push(frame.to_vec());
            return HandlerFlow::Continue;
        }

        if self.cycle.is_empty() {
            return HandlerFlow::Continue;
        }
        if summary.slave_id != Some(self.current_slave) {
            if self.flush().await {
                return HandlerFlow::Stop;
            }
            self.reset();
            return HandlerFlow::Continue;
        }

        self.cycle.push(frame.to_vec());
        HandlerFlow::Continue
    }

    fn on_disconnect(&mut self) {
        if !self.cycle.is_empty() {
            warn!(
                gateway = %self.gateway,
                "connection lost with {} buffered frames, discarding cycle",
                self.cycle.len()
            );
            self.reset();
        }
    }
}

/// Convert a buffered cycle into register values via the slot map.
fn decode_cycle(frames: &[Vec<u8>]) -> (Vec<RegisterValue>, Vec<String>) {
    let mut values = Vec::with_capacity(SLOTS.len());
    let mut warnings = Vec::new();

    for (idx, entry) in SLOTS.iter().enumerate() {
        let Some(slot) = entry else { continue };
        let Some(frame) = frames.get(idx) else {
            warnings.push(format!("reg {idx} ({}) missing frame", slot.name));
            continue;
        };
        let Some(pair) = frame.get(3..5) else {
            warnings.push(format!("reg {idx} ({}) invalid frame", slot.name));
            continue;
        };
        let raw = u16::from_be_bytes([pair[0], pair[1]]);
        values.push(RegisterValue {
            register: idx as u16,
            name: slot.name.to_string(),
            kind: slot.kind,
            value: slot.conv.apply(raw),
        });
    }

    (values, warnings)
}

fn render_values(values: &[RegisterValue]) -> String {
    values
        .iter()
        .map(|v| format!("{}={}", v.name, v.value))
        .collect::<Vec<_>>()
        .join(" ")
}
