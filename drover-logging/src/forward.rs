//! Forwarding of worker log records to the controller
//!
//! Inside a worker process the [`ForwardingLayer`] is installed instead of a
//! local formatter: every event becomes a [`LogRecord`] handed to a
//! [`RecordSink`] (the control channel). The controller side calls
//! [`emit_forwarded`] to re-emit the record through its own subscriber.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::record::{LogLevel, LogRecord};

/// Destination for forwarded records
pub trait RecordSink: Send + Sync + 'static {
    /// Hand a record over; must not block and must not log
    fn forward(&self, record: LogRecord);
}

impl<T: RecordSink + ?Sized> RecordSink for Arc<T> {
    fn forward(&self, record: LogRecord) {
        (**self).forward(record)
    }
}

/// Tracing layer converting events into [`LogRecord`]s
pub struct ForwardingLayer<K> {
    sink: K,
}

impl<K: RecordSink> ForwardingLayer<K> {
    pub fn new(sink: K) -> Self {
        Self { sink }
    }
}

impl<S, K> Layer<S> for ForwardingLayer<K>
where
    S: Subscriber,
    K: RecordSink,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        self.sink.forward(LogRecord {
            level: LogLevel::from(metadata.level()),
            target: metadata.target().to_string(),
            message: collector.message.unwrap_or_default(),
            fields: collector.fields,
            timestamp: Utc::now(),
        });
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: BTreeMap<String, JsonValue>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: JsonValue) {
        if field.name() == "message" {
            self.message = Some(match value {
                JsonValue::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, JsonValue::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, JsonValue::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, JsonValue::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, JsonValue::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, JsonValue::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, JsonValue::from(value));
    }
}

/// Re-emit a record received from a worker through the local subscriber
pub fn emit_forwarded(worker_id: &str, record: &LogRecord) {
    let origin = record.target.as_str();
    let fields = if record.fields.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&record.fields).unwrap_or_default()
    };
    let message = record.message.as_str();

    match record.level {
        LogLevel::Error => {
            tracing::error!(target: "drover::worker", worker_id, origin, fields = %fields, "{}", message)
        }
        LogLevel::Warn => {
            tracing::warn!(target: "drover::worker", worker_id, origin, fields = %fields, "{}", message)
        }
        LogLevel::Info => {
            tracing::info!(target: "drover::worker", worker_id, origin, fields = %fields, "{}", message)
        }
        LogLevel::Debug => {
            tracing::debug!(target: "drover::worker", worker_id, origin, fields = %fields, "{}", message)
        }
        LogLevel::Trace => {
            tracing::trace!(target: "drover::worker", worker_id, origin, fields = %fields, "{}", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<LogRecord>>,
    }

    impl RecordSink for CollectingSink {
        fn forward(&self, record: LogRecord) {
            self.records.lock().push(record);
        }
    }

    #[test]
    fn test_events_become_records() {
        let sink = Arc::new(CollectingSink::default());
        let subscriber =
            tracing_subscriber::registry().with(ForwardingLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "app::db", attempts = 3u64, healthy = false, "retrying {}", "query");
        });

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.target, "app::db");
        assert_eq!(record.message, "retrying query");
        assert_eq!(record.fields["attempts"], 3);
        assert_eq!(record.fields["healthy"], false);
    }

    #[test]
    fn test_emit_forwarded_reaches_local_subscriber() {
        let sink = Arc::new(CollectingSink::default());
        let subscriber =
            tracing_subscriber::registry().with(ForwardingLayer::new(sink.clone()));
        let record = LogRecord::new(LogLevel::Info, "app", "listening").with_field("port", 8080);

        tracing::subscriber::with_default(subscriber, || emit_forwarded("worker-2", &record));

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "drover::worker");
        assert_eq!(records[0].message, "listening");
        assert_eq!(records[0].fields["worker_id"], "worker-2");
        assert_eq!(records[0].fields["origin"], "app");
    }
}
