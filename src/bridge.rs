//! The sensor-to-browser bridge.
//!
//! One inbound broker message in, at most one view-state update, at most one
//! broadcast out. The bridge is the only writer of [`ViewState`]; websocket
//! sessions only read it when they join.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::classify::{classify, SensorMessage};
use crate::config::MoistureConfig;
use crate::domain::{ClientMessage, MoistureReading, ViewState};
use crate::feed::SensorSink;
use crate::hub::{ClientHandle, ClientHub};

pub struct Bridge {
    view: RwLock<ViewState>,
    hub: Arc<ClientHub>,
    threshold: i64,
    adc_max: i64,
    echo_readings: bool,
}

impl Bridge {
    pub fn new(moisture: &MoistureConfig, client_queue: usize) -> Self {
        Self {
            view: RwLock::new(ViewState::default()),
            hub: Arc::new(ClientHub::new(client_queue)),
            threshold: moisture.threshold,
            adc_max: moisture.adc_max,
            echo_readings: true,
        }
    }

    /// Log every reading at info (on) or debug (off).
    pub fn with_sensor_echo(mut self, echo: bool) -> Self {
        self.echo_readings = echo;
        self
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> ViewState {
        *self.view.read().await
    }

    /// current state as a `moisture_update` with `changed = false`
    pub async fn snapshot_message(&self) -> ClientMessage {
        let view = self.view.read().await;
        ClientMessage::snapshot(&view, self.adc_max)
    }

    pub fn connected_clients(&self) -> usize {
        self.hub.len()
    }

    /// Register a new live client, seeded with the current state.
    ///
    /// The read lock is held across registration, so a reading that is being
    /// applied either lands before the snapshot or is broadcast after it.
    pub async fn join(&self) -> ClientHandle {
        let view = self.view.read().await;
        self.hub.register(ClientMessage::snapshot(&view, self.adc_max))
    }

    /// Classify and apply one broker message.
    ///
    /// Returns the message that was broadcast, or `None` when the payload was
    /// discarded.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Option<ClientMessage> {
        match classify(topic, payload) {
            Ok(SensorMessage::Tap(data)) => Some(self.tap(data)),
            Ok(SensorMessage::Moisture(reading)) => Some(self.apply_reading(reading).await),
            Err(e) => {
                warn!(topic, "{}", e);
                None
            }
        }
    }

    fn tap(&self, data: String) -> ClientMessage {
        info!(payload = %data, "tap event received");
        let message = ClientMessage::TapEvent { data };
        let report = self.hub.broadcast(&message);
        debug!(delivered = report.delivered, dropped = report.dropped, "tap_event broadcast");
        message
    }

    async fn apply_reading(&self, reading: MoistureReading) -> ClientMessage {
        // write lock spans the broadcast so joiners never see a half-applied
        // update; broadcast itself never awaits
        let mut view = self.view.write().await;

        let next = ViewState::from_reading(reading, self.threshold);
        let changed = next.is_alive != view.is_alive;
        *view = next;

        let percent = reading.percent(self.adc_max);
        let status = if next.is_alive { "alive" } else { "dead" };
        if self.echo_readings {
            info!(value = reading.value, percent = %format!("{percent:.1}"), status, changed, "moisture reading");
        } else {
            debug!(value = reading.value, percent = %format!("{percent:.1}"), status, changed, "moisture reading");
        }

        let message = ClientMessage::MoistureUpdate {
            value: reading.value,
            percent,
            alive: next.is_alive,
            changed,
        };
        let report = self.hub.broadcast(&message);
        debug!(delivered = report.delivered, dropped = report.dropped, "moisture_update broadcast");
        message
    }
}

#[async_trait]
impl SensorSink for Bridge {
    async fn on_message(&self, topic: &str, payload: &[u8]) {
        self.handle(topic, payload).await;
    }
}
