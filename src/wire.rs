//! Streamed joint command ingress
//!
//! Clients stream position or velocity commands over latest-value wires;
//! each tick the multiplexer pulls the most recent payload, validates its
//! sequence numbers and lengths, and converts the per-joint units to
//! radians. Invalid payloads are dropped silently and the next valid one
//! wins.

use crate::transport::ClientEndpoint;
use serde::{Deserialize, Serialize};

/// Staleness window for the client-echoed tick counter: payloads whose
/// `state_seqno` is further than this many ticks from the controller's are
/// rejected.
pub(crate) const STATE_SEQNO_WINDOW: u64 = 10;

/// Encoder ticks per joint rotation for the tick-based units.
pub(crate) const TICKS_PER_ROTATION: f64 = (1u64 << 20) as f64;

const NANOTICKS_PER_ROTATION: f64 = TICKS_PER_ROTATION * 1e9;

const TWO_PI: f64 = 2.0 * std::f64::consts::PI;

/// One streamed joint command.
///
/// `command` must have length N; `units` is either empty (implicit units)
/// or per-joint with length N. `state_seqno` echoes the tick counter the
/// client last observed in telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointCommandPayload {
    pub seqno: u64,
    pub state_seqno: u64,
    pub command: Vec<f64>,
    #[serde(default)]
    pub units: Vec<u8>,
}

/// Position unit codes accepted on the position command wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PositionUnits {
    Implicit = 0,
    Radian = 1,
    Degree = 2,
    TicksRot = 3,
    NanoticksRot = 4,
}

/// Velocity unit codes accepted on the velocity command wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VelocityUnits {
    Implicit = 0,
    RadianSecond = 1,
    DegreeSecond = 2,
    TicksRotSecond = 3,
    NanoticksRotSecond = 4,
}

/// Effort unit codes, used only in published state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EffortUnits {
    Implicit = 0,
    NewtonMeter = 1,
}

fn position_to_radians(value: f64, unit_code: u8) -> Option<f64> {
    match unit_code {
        c if c == PositionUnits::Implicit as u8 || c == PositionUnits::Radian as u8 => Some(value),
        c if c == PositionUnits::Degree as u8 => Some(value.to_radians()),
        c if c == PositionUnits::TicksRot as u8 => Some(value / TICKS_PER_ROTATION * TWO_PI),
        c if c == PositionUnits::NanoticksRot as u8 => Some(value / NANOTICKS_PER_ROTATION * TWO_PI),
        _ => None,
    }
}

fn velocity_to_radians_per_second(value: f64, unit_code: u8) -> Option<f64> {
    match unit_code {
        c if c == VelocityUnits::Implicit as u8 || c == VelocityUnits::RadianSecond as u8 => {
            Some(value)
        }
        c if c == VelocityUnits::DegreeSecond as u8 => Some(value.to_radians()),
        c if c == VelocityUnits::TicksRotSecond as u8 => Some(value / TICKS_PER_ROTATION * TWO_PI),
        c if c == VelocityUnits::NanoticksRotSecond as u8 => {
            Some(value / NANOTICKS_PER_ROTATION * TWO_PI)
        }
        _ => None,
    }
}

fn convert(
    command: &[f64],
    units: &[u8],
    convert_one: impl Fn(f64, u8) -> Option<f64>,
) -> Option<Vec<f64>> {
    if units.is_empty() {
        return Some(command.to_vec());
    }
    command
        .iter()
        .zip(units.iter())
        .map(|(&value, &unit)| convert_one(value, unit))
        .collect()
}

/// Convert a position command to radians; `None` rejects the whole payload.
pub(crate) fn convert_position_command(command: &[f64], units: &[u8]) -> Option<Vec<f64>> {
    convert(command, units, position_to_radians)
}

/// Convert a velocity command to radians per second; `None` rejects the
/// whole payload.
pub(crate) fn convert_velocity_command(command: &[f64], units: &[u8]) -> Option<Vec<f64>> {
    convert(command, units, velocity_to_radians_per_second)
}

/// Per-direction wire bookkeeping.
///
/// Sequence numbers are scoped to the (client endpoint, direction) pair;
/// a new endpoint on the wire resets the accepted watermark to zero.
#[derive(Debug, Default)]
pub(crate) struct WireCommandState {
    /// Most recent payload posted by a client, with its endpoint id.
    pub slot: Option<(ClientEndpoint, JointCommandPayload)>,
    pub last_endpoint: Option<ClientEndpoint>,
    pub last_seqno: u64,
    /// Whether a payload from this wire was accepted on the current tick.
    pub sent_this_tick: bool,
}
