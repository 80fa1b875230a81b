//! Decoding of read-holding-register payloads against a configured map.

use serde::{Deserialize, Serialize};

use crate::config::SlaveSpec;

/// Interpretation of a single 16-bit register word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Int16,
    Uint16,
    Float,
}

/// One decoded register reading.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterValue {
    pub register: u16,
    pub name: String,
    pub kind: RegisterKind,
    pub value: f64,
}

impl RegisterValue {
    /// Whether the value should be serialized as an integer field.
    pub fn is_integral(&self) -> bool {
        !matches!(self.kind, RegisterKind::Float)
    }
}

/// Decode the payload of a register read response using the slave's
/// configured map.
///
/// Each mapped register addresses a word offset into the payload.
/// Entries spanning more than one word or falling outside the payload
/// are skipped. Returns human-readable lines for the frame log and the
/// structured values for storage.
pub fn decode(slave: &SlaveSpec, data: &[u8]) -> (Vec<String>, Vec<RegisterValue>) {
    let mut lines = Vec::new();
    let mut values = Vec::new();

    for spec in &slave.registers {
        if spec.register_count != 1 {
            continue;
        }
        let offset = usize::from(spec.register) * 2;
        let Some(pair) = data.get(offset..offset + 2) else {
            continue;
        };
        let raw = u16::from_be_bytes([pair[0], pair[1]]);
        // Unknown scalar types read as signed, like the int16 default.
        let (label, value) = match spec.register_type {
            RegisterKind::Uint16 => ("uint16", f64::from(raw)),
            RegisterKind::Int16 | RegisterKind::Float => ("int16", f64::from(raw as i16)),
        };
        lines.push(format!(
            "reg={} name={} {label}={}",
            spec.register,
            spec.register_name,
            value as i64
        ));
        values.push(RegisterValue {
            register: spec.register,
            name: spec.register_name.clone(),
            kind: spec.register_type,
            value,
        });
    }

    (lines, values)
}
