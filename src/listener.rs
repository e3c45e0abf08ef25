//! Console listener: prints every sensor message to the terminal.
//!
//! Used with `plant-guardian listen` to watch the vase without starting the
//! web viewer. Payloads are shown as received; nothing is parsed or stored.

use async_trait::async_trait;
use chrono::Local;
use colored::Colorize;

use crate::classify::{decode_payload, is_event_topic};
use crate::feed::SensorSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Tap,
    Moisture,
}

/// Plain (uncoloured) terminal line for one message.
pub fn render_line(time: &str, topic: &str, payload: &str) -> (LineKind, String) {
    if is_event_topic(topic) {
        (LineKind::Tap, format!("[{time}] 💥 TAP -> {payload}"))
    } else {
        (LineKind::Moisture, format!("[{time}] 🌿 Moisture -> {payload}"))
    }
}

#[derive(Debug, Default)]
pub struct ConsoleListener;

#[async_trait]
impl SensorSink for ConsoleListener {
    async fn on_message(&self, topic: &str, payload: &[u8]) {
        let time = Local::now().format("%H:%M:%S").to_string();
        let payload = decode_payload(payload);

        match render_line(&time, topic, &payload) {
            (LineKind::Tap, line) => println!("{}", line.yellow()),
            (LineKind::Moisture, line) => println!("{}", line.green()),
        }
    }
}
