//! Concurrent metric registry that stores and renders Prometheus metrics.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::trace;

/// Name of the connection-status gauge.
pub const BROKER_CONNECTED_METRIC: &str = "mosquitto_broker_connected";

/// Name of the feed-liveness gauge.
pub const LAST_MESSAGE_METRIC: &str = "mosquitto_last_message_timestamp_seconds";

/// The exported kind of a metric series. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    /// The `# TYPE` comment string for the exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// A single exported series: kind and help are fixed, the value tracks the
/// latest observation.
#[derive(Debug, Clone)]
struct MetricEntry {
    kind: MetricKind,
    help: String,
    value: f64,
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Messages routed into a counter or gauge.
    pub messages_routed: u64,
    /// Messages dropped by the ignore table.
    pub messages_ignored: u64,
}

/// Thread-safe store mapping derived metric names to live series.
///
/// Series are created lazily on first observation and never removed. The
/// check-then-insert-then-set sequence runs under one exclusive lock
/// section so concurrent first observations of the same name can never
/// register two series.
pub struct MetricRegistry {
    entries: RwLock<HashMap<String, MetricEntry>>,
    stats: RwLock<RegistryStats>,
}

impl MetricRegistry {
    /// Create a registry with the lifecycle gauges pre-registered.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            BROKER_CONNECTED_METRIC.to_string(),
            MetricEntry {
                kind: MetricKind::Gauge,
                help: "Connection status to the Mosquitto broker (1 = connected, 0 = disconnected)"
                    .to_string(),
                value: 0.0,
            },
        );
        entries.insert(
            LAST_MESSAGE_METRIC.to_string(),
            MetricEntry {
                kind: MetricKind::Gauge,
                help: "Unix timestamp of the last message received from the broker".to_string(),
                value: 0.0,
            },
        );

        Self {
            entries: RwLock::new(entries),
            stats: RwLock::new(RegistryStats::default()),
        }
    }

    /// Record an absolute counter value.
    ///
    /// The broker reports cumulative totals itself, so the series is
    /// assigned rather than incremented; a broker-side counter reset shows
    /// up as a visible decrease. A `_total` suffix is applied if the name
    /// does not already carry one.
    pub fn observe_counter(&self, name: &str, help: &str, value: f64) {
        let name = if name.ends_with("_total") {
            name.to_string()
        } else {
            format!("{}_total", name)
        };
        self.observe(name, MetricKind::Counter, help, value);
    }

    /// Record the latest value of a gauge.
    pub fn observe_gauge(&self, name: &str, help: &str, value: f64) {
        self.observe(name.to_string(), MetricKind::Gauge, help, value);
    }

    fn observe(&self, name: String, kind: MetricKind, help: &str, value: f64) {
        let mut entries = self.entries.write();
        match entries.entry(name) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().value = value;
            }
            Entry::Vacant(entry) => {
                trace!(metric = %entry.key(), kind = kind.as_str(), "Registering new series");
                entry.insert(MetricEntry {
                    kind,
                    help: help.to_string(),
                    value,
                });
            }
        }
        drop(entries);

        let mut stats = self.stats.write();
        stats.messages_routed += 1;
    }

    /// Set the broker connection-status gauge.
    pub fn set_broker_connected(&self, connected: bool) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(BROKER_CONNECTED_METRIC) {
            entry.value = if connected { 1.0 } else { 0.0 };
        }
    }

    /// Update the last-message timestamp gauge to the current time.
    pub fn mark_message_received(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(LAST_MESSAGE_METRIC) {
            entry.value = now;
        }
    }

    /// Count a message dropped by the ignore table.
    pub fn mark_message_ignored(&self) {
        let mut stats = self.stats.write();
        stats.messages_ignored += 1;
    }

    /// Whether any broker message has been routed yet.
    pub fn has_messages(&self) -> bool {
        self.stats.read().messages_routed > 0
    }

    /// Current value of the connection-status gauge.
    pub fn broker_connected(&self) -> bool {
        self.entries
            .read()
            .get(BROKER_CONNECTED_METRIC)
            .is_some_and(|entry| entry.value == 1.0)
    }

    /// Current number of registered series, lifecycle gauges included.
    pub fn series_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Snapshot of the registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    /// Render all series in Prometheus text exposition format.
    ///
    /// Names are sorted so scrapes are deterministic.
    pub fn render(&self) -> String {
        let entries = self.entries.read();
        let mut output = Vec::with_capacity(entries.len() * 100);

        let mut names: Vec<_> = entries.keys().collect();
        names.sort();

        for name in names {
            let entry = &entries[name];
            writeln!(output, "# HELP {} {}", name, entry.help).ok();
            writeln!(output, "# TYPE {} {}", name, entry.kind.as_str()).ok();
            writeln!(output, "{} {}", name, format_value(entry.value)).ok();
        }

        let stats = self.stats.read();
        writeln!(output).ok();
        writeln!(
            output,
            "# TYPE mosquitto_exporter_messages_routed_total counter"
        )
        .ok();
        writeln!(
            output,
            "mosquitto_exporter_messages_routed_total {}",
            stats.messages_routed
        )
        .ok();
        writeln!(
            output,
            "# TYPE mosquitto_exporter_messages_ignored_total counter"
        )
        .ok();
        writeln!(
            output,
            "mosquitto_exporter_messages_ignored_total {}",
            stats.messages_ignored
        )
        .ok();

        String::from_utf8(output).unwrap_or_default()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricRegistry>;

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
