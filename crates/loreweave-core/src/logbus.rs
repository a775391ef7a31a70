//! Log fan-out for external monitors.
//!
//! Every `tracing` event (via [`BusLayer`]) and every explicitly published
//! event (director previews, status snapshots) is broadcast to all
//! subscribers. A bounded replay buffer lets a monitor that connects late
//! catch up on recent activity.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer};

const BROADCAST_CAPACITY: usize = 256;
const REPLAY_CAPACITY: usize = 200;

/// One monitor-facing event, serialised as-is onto the WS log socket.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: String,
}

impl LogEvent {
    pub fn log(level: &str, msg: impl Into<String>) -> Self {
        Self {
            kind: "log".to_string(),
            level: Some(level.to_string()),
            msg: Some(msg.into()),
            content: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Director plan preview pushed to monitors mid-turn.
    pub fn director(content: impl Into<String>) -> Self {
        Self {
            kind: "director".to_string(),
            level: None,
            msg: None,
            content: Some(content.into()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self {
            kind: "status".to_string(),
            level: None,
            msg: None,
            content: Some(content.into()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: "pong".to_string(),
            level: None,
            msg: None,
            content: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Fan-out bus with replay. Cheap to clone; all clones share the stream.
#[derive(Clone)]
pub struct LogBus {
    tx: broadcast::Sender<LogEvent>,
    replay: Arc<Mutex<VecDeque<LogEvent>>>,
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(REPLAY_CAPACITY))),
        }
    }

    /// Push an event to all subscribers and record it for replay.
    /// Silently drops the broadcast when no subscriber exists.
    pub fn publish(&self, event: LogEvent) {
        {
            let mut replay = self.replay.lock().unwrap();
            if replay.len() >= REPLAY_CAPACITY {
                replay.pop_front();
            }
            replay.push_back(event.clone());
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }

    /// Snapshot of the replay buffer, oldest first.
    pub fn replay(&self) -> Vec<LogEvent> {
        self.replay.lock().unwrap().iter().cloned().collect()
    }
}

/// `tracing_subscriber` layer that mirrors every event onto the bus.
pub struct BusLayer {
    bus: LogBus,
}

impl BusLayer {
    pub fn new(bus: LogBus) -> Self {
        Self { bus }
    }
}

impl<S: tracing::Subscriber> Layer<S> for BusLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.bus.publish(LogEvent::log(
            &event.metadata().level().to_string(),
            visitor.rendered,
        ));
    }
}

#[derive(Default)]
struct MessageVisitor {
    rendered: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        use std::fmt::Write;
        if field.name() == "message" {
            self.rendered.insert_str(0, value);
        } else {
            let _ = write!(self.rendered, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write;
        if field.name() == "message" {
            self.rendered.insert_str(0, &format!("{value:?}"));
        } else {
            let _ = write!(self.rendered, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_buffer_is_bounded() {
        let bus = LogBus::new();
        for i in 0..(REPLAY_CAPACITY + 50) {
            bus.publish(LogEvent::log("INFO", format!("event {i}")));
        }
        let replayed = bus.replay();
        assert_eq!(replayed.len(), REPLAY_CAPACITY);
        assert_eq!(replayed[0].msg.as_deref(), Some("event 50"));
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = LogBus::new();
        let mut rx = bus.subscribe();
        bus.publish(LogEvent::director("the plot thickens"));
        let event = rx.recv().await.expect("no event");
        assert_eq!(event.kind, "director");
        assert_eq!(event.content.as_deref(), Some("the plot thickens"));
    }

    #[test]
    fn event_json_shape() {
        let event = LogEvent::log("WARN", "low hp");
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "log");
        assert_eq!(v["level"], "WARN");
        assert_eq!(v["msg"], "low hp");
        assert!(v.get("content").is_none());
    }
}
