use serde::{Deserialize, Serialize};

/// top of the sensor's adc range (12-bit)
pub const ADC_MAX: i64 = 4095;

/// readings strictly above this keep the guardian alive.
/// 1500 of 4095 is ~36.6% of range, not the 50% older notes mention.
pub const MOISTURE_THRESHOLD: i64 = 1500;

/// a single raw moisture sample from the sensor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoistureReading {
    /// sensor-native adc value, nominally 0..=4095
    pub value: i64,
}

impl MoistureReading {
    pub fn new(value: i64) -> Self {
        Self { value }
    }

    /// value mapped onto 0-100 against `adc_max`
    pub fn percent(&self, adc_max: i64) -> f64 {
        moisture_percent(self.value, adc_max)
    }

    pub fn is_alive(&self, threshold: i64) -> bool {
        self.value > threshold
    }
}

pub fn moisture_percent(value: i64, adc_max: i64) -> f64 {
    (value as f64 / adc_max as f64) * 100.0
}

/// last known moisture and derived alive flag.
///
/// `is_alive` is only ever written together with `current_moisture`
/// (see `ViewState::from_reading`), never on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewState {
    pub current_moisture: i64,
    pub is_alive: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self { current_moisture: 0, is_alive: true }
    }
}

impl ViewState {
    pub fn from_reading(reading: MoistureReading, threshold: i64) -> Self {
        Self {
            current_moisture: reading.value,
            is_alive: reading.is_alive(threshold),
        }
    }
}

/// messages pushed to browser clients over the live channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// a tap on the vase; payload is forwarded untouched
    TapEvent { data: String },
    /// moisture changed (or the initial snapshot, with `changed = false`)
    MoistureUpdate {
        value: i64,
        percent: f64,
        alive: bool,
        changed: bool,
    },
}

impl ClientMessage {
    /// snapshot of `view` as sent to a freshly connected client
    pub fn snapshot(view: &ViewState, adc_max: i64) -> Self {
        ClientMessage::MoistureUpdate {
            value: view.current_moisture,
            percent: moisture_percent(view.current_moisture, adc_max),
            alive: view.is_alive,
            changed: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::TapEvent { .. } => "tap_event",
            ClientMessage::MoistureUpdate { .. } => "moisture_update",
        }
    }
}
