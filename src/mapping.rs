//! Mapping from broker `$SYS` topics to Prometheus metric names.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix under which the broker publishes its own status topics.
pub const SYS_PREFIX: &str = "$SYS/";

/// Wildcard covering the whole status subtree.
pub const SYS_WILDCARD: &str = "$SYS/#";

/// How a status topic is handled by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Dropped before parsing (non-numeric, deprecated, or static).
    Ignored,
    /// Monotonically-increasing total reported by the broker.
    Counter,
    /// Instantaneous value; the default for unknown topics.
    Gauge,
}

/// Static classification tables for the broker's status namespace.
///
/// Both tables map a raw topic to the help text exported with the derived
/// metric. The tables are built once at startup and passed by reference so
/// tests can substitute their own.
pub struct TopicTables {
    ignored: HashMap<&'static str, &'static str>,
    counters: HashMap<&'static str, &'static str>,
}

impl TopicTables {
    /// Tables for a stock Mosquitto broker.
    pub fn mosquitto() -> Self {
        let ignored = HashMap::from([
            (
                "$SYS/broker/timestamp",
                "The timestamp at which this particular build of the broker was made. Static.",
            ),
            (
                "$SYS/broker/version",
                "The version of the broker. Static.",
            ),
            (
                "$SYS/broker/clients/active",
                "deprecated in favour of $SYS/broker/clients/connected",
            ),
            (
                "$SYS/broker/clients/inactive",
                "deprecated in favour of $SYS/broker/clients/disconnected",
            ),
        ]);

        let counters = HashMap::from([
            (
                "$SYS/broker/bytes/received",
                "The total number of bytes received since the broker started.",
            ),
            (
                "$SYS/broker/bytes/sent",
                "The total number of bytes sent since the broker started.",
            ),
            (
                "$SYS/broker/messages/received",
                "The total number of messages of any type received since the broker started.",
            ),
            (
                "$SYS/broker/messages/sent",
                "The total number of messages of any type sent since the broker started.",
            ),
            (
                "$SYS/broker/publish/bytes/received",
                "The total number of PUBLISH bytes received since the broker started.",
            ),
            (
                "$SYS/broker/publish/bytes/sent",
                "The total number of PUBLISH bytes sent since the broker started.",
            ),
            (
                "$SYS/broker/publish/messages/received",
                "The total number of PUBLISH messages received since the broker started.",
            ),
            (
                "$SYS/broker/publish/messages/sent",
                "The total number of PUBLISH messages sent since the broker started.",
            ),
            (
                "$SYS/broker/publish/messages/dropped",
                "The total number of PUBLISH messages that have been dropped due to inflight/queuing limits.",
            ),
            (
                "$SYS/broker/uptime",
                "The total number of seconds since the broker started.",
            ),
            (
                "$SYS/broker/clients/maximum",
                "The maximum number of clients connected simultaneously since the broker started.",
            ),
            (
                "$SYS/broker/clients/total",
                "The total number of clients connected since the broker started.",
            ),
        ]);

        Self { ignored, counters }
    }

    /// Build tables from explicit entries.
    pub fn new(
        ignored: HashMap<&'static str, &'static str>,
        counters: HashMap<&'static str, &'static str>,
    ) -> Self {
        Self { ignored, counters }
    }

    /// Classify a topic: ignore table wins, then counter table, else gauge.
    pub fn classify(&self, topic: &str) -> Classification {
        if self.ignored.contains_key(topic) {
            Classification::Ignored
        } else if self.counters.contains_key(topic) {
            Classification::Counter
        } else {
            Classification::Gauge
        }
    }

    /// Help text for a topic, from whichever table holds it.
    pub fn help_text(&self, topic: &str) -> Option<&'static str> {
        self.counters
            .get(topic)
            .or_else(|| self.ignored.get(topic))
            .copied()
    }
}

impl Default for TopicTables {
    fn default() -> Self {
        Self::mosquitto()
    }
}

/// Derive a Prometheus metric name from a status topic.
///
/// Strips one leading `$SYS/`, then replaces `/`, space, `-`, and `.`
/// with underscores. Distinct topics differing only in a replaced
/// character collapse to the same name; the registry merges them into one
/// series.
pub fn metric_name(topic: &str) -> String {
    let stripped = topic.strip_prefix(SYS_PREFIX).unwrap_or(topic);
    stripped
        .chars()
        .map(|c| match c {
            '/' | ' ' | '-' | '.' => '_',
            other => other,
        })
        .collect()
}

/// Derive a counter metric name: [`metric_name`] plus a `_total` suffix.
///
/// The suffix is added at most once, so repeated derivation is stable.
pub fn counter_metric_name(topic: &str) -> String {
    let name = metric_name(topic);
    if name.ends_with("_total") {
        name
    } else {
        format!("{}_total", name)
    }
}

static NUMERIC_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid numeric token regex"));

/// Extract a numeric value from a raw payload string.
///
/// Broker payloads are not schema-guaranteed and may carry units or other
/// text (`"56.2 kB/s"`); the first embedded integer or decimal literal is
/// taken. Anything unparseable resolves to `0.0`.
pub fn parse_value(payload: &str) -> f64 {
    NUMERIC_TOKEN
        .find(payload)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}
