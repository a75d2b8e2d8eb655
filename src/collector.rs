//! Broker connection lifecycle and message dispatch.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::MosquittoConfig;
use crate::mapping::{self, Classification, SYS_WILDCARD, TopicTables};
use crate::registry::SharedRegistry;
use crate::tls::{self, TlsError};

/// Bound on a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed wait between failed connect attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on waiting for the subscription acknowledgement.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for flushing the disconnect packet on shutdown.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

const DEFAULT_CLIENT_ID: &str = "mosquitto-exporter";

/// Errors raised by the collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Invalid broker URL '{url}': {message}")]
    BrokerUrl { url: String, message: String },
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Timeout connecting to broker")]
    ConnectTimeout,
    #[error("Broker refused connection: {0:?}")]
    ConnectionRefused(ConnectReturnCode),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Connection lifecycle state, owned by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

/// Cloneable read handle onto the collector's connection state.
#[derive(Clone)]
pub struct StateHandle(Arc<RwLock<ConnectionState>>);

impl StateHandle {
    /// The current connection state.
    pub fn get(&self) -> ConnectionState {
        *self.0.read()
    }
}

/// How a broker session ended.
enum SessionEnd {
    Shutdown,
    ConnectionLost,
}

/// Maintains the broker connection and feeds messages into the registry.
///
/// The collector owns the connect/retry loop; the shutdown watch channel
/// is the only way to stop it. Stopping is safe at any point, including
/// before the first successful connect.
pub struct MqttCollector {
    config: MosquittoConfig,
    tables: Arc<TopicTables>,
    registry: SharedRegistry,
    state: Arc<RwLock<ConnectionState>>,
}

impl MqttCollector {
    /// Create a new collector.
    pub fn new(config: MosquittoConfig, tables: Arc<TopicTables>, registry: SharedRegistry) -> Self {
        Self {
            config,
            tables,
            registry,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    /// Handle for observing the connection state after `run` takes over.
    pub fn state_handle(&self) -> StateHandle {
        StateHandle(self.state.clone())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Run the connect/retry loop until the shutdown signal is received.
    ///
    /// Transient failures retry forever on a fixed interval; only a broken
    /// TLS configuration ends the loop early.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), CollectorError> {
        info!(
            broker = %self.config.broker_url,
            client_id = self.config.client_id.as_deref().unwrap_or(DEFAULT_CLIENT_ID),
            tls_enabled = self.config.tls.enabled,
            "Starting Mosquitto collector"
        );

        let transport = if self.config.tls.enabled {
            tls::client_tls_config(&self.config.tls, &self.config.broker_url)?
                .map(|config| Transport::Tls(TlsConfiguration::Rustls(config)))
        } else {
            None
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);

            match self.run_session(transport.clone(), &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ConnectionLost) => {
                    // Reconnection is the retry loop's normal lifecycle.
                }
                Err(e) => {
                    error!(
                        broker = %self.config.broker_url,
                        error = %e,
                        "Failed to connect to broker"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.registry.set_broker_connected(false);
        info!("Mosquitto collector stopped");
        Ok(())
    }

    /// Connect once, subscribe, and dispatch messages until the session
    /// ends.
    async fn run_session(
        &self,
        transport: Option<Transport>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, CollectorError> {
        let options = self.build_options(transport)?;
        let (client, mut event_loop) = AsyncClient::new(options, 64);

        // Wait for the broker's ConnAck under the connect timeout.
        let connect_deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                event = tokio::time::timeout_at(connect_deadline, event_loop.poll()) => {
                    match event {
                        Err(_) => return Err(CollectorError::ConnectTimeout),
                        Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                            if ack.code == ConnectReturnCode::Success {
                                break;
                            }
                            return Err(CollectorError::ConnectionRefused(ack.code));
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => return Err(CollectorError::Connection(e.to_string())),
                    }
                }
            }
        }

        info!(broker = %self.config.broker_url, "Connected to MQTT broker");
        self.set_state(ConnectionState::Connected);
        self.registry.set_broker_connected(true);

        // Best-effort delivery is enough for periodically republished
        // status values.
        let mut suback_deadline = match client.subscribe(SYS_WILDCARD, QoS::AtMostOnce).await {
            Ok(()) => Some(Instant::now() + SUBSCRIBE_TIMEOUT),
            Err(e) => {
                // Stays connected but uninstrumented until the next
                // reconnect cycle.
                error!(error = %e, topic = SYS_WILDCARD, "Failed to subscribe");
                None
            }
        };

        let end = loop {
            let pending_suback = suback_deadline;
            let suback_wait = async move {
                match pending_suback {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                _ = suback_wait => {
                    error!(topic = SYS_WILDCARD, "Timeout subscribing");
                    suback_deadline = None;
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        if suback_deadline.take().is_some() {
                            info!(topic = SYS_WILDCARD, "Subscribed to status topics");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_message(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            broker = %self.config.broker_url,
                            error = %e,
                            "Connection to MQTT broker lost"
                        );
                        break SessionEnd::ConnectionLost;
                    }
                }
            }
        };

        self.registry.set_broker_connected(false);

        match end {
            SessionEnd::Shutdown => {
                let _ = client.disconnect().await;
                let _ = tokio::time::timeout(DISCONNECT_GRACE, event_loop.poll()).await;
                info!("Disconnected from MQTT broker");
            }
            SessionEnd::ConnectionLost => {
                self.set_state(ConnectionState::Lost);
            }
        }

        Ok(end)
    }

    /// Route one inbound message into the registry.
    ///
    /// Must stay safe under reentrant invocation; all shared mutation goes
    /// through the registry's lock.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        let payload = String::from_utf8_lossy(payload);

        match self.tables.classify(topic) {
            Classification::Ignored => {
                debug!(topic, "Ignoring status topic");
                self.registry.mark_message_ignored();
            }
            Classification::Counter => {
                let value = mapping::parse_value(&payload);
                let name = mapping::counter_metric_name(topic);
                let help = self.tables.help_text(topic).unwrap_or(name.as_str());
                self.registry.observe_counter(&name, help, value);
                self.registry.mark_message_received();
            }
            Classification::Gauge => {
                let value = mapping::parse_value(&payload);
                let name = mapping::metric_name(topic);
                let help = self.tables.help_text(topic).unwrap_or(name.as_str());
                self.registry.observe_gauge(&name, help, value);
                self.registry.mark_message_received();
            }
        }
    }

    /// Build MQTT client options from the broker configuration.
    fn build_options(&self, transport: Option<Transport>) -> Result<MqttOptions, CollectorError> {
        let normalized = normalize_broker_url(&self.config.broker_url);
        let endpoint = Url::parse(&normalized).map_err(|e| CollectorError::BrokerUrl {
            url: self.config.broker_url.clone(),
            message: e.to_string(),
        })?;

        let scheme = endpoint.scheme();

        let host = endpoint
            .host_str()
            .ok_or_else(|| CollectorError::BrokerUrl {
                url: self.config.broker_url.clone(),
                message: "missing host".to_string(),
            })?;

        let port = endpoint
            .port()
            .or_else(|| default_port_for_scheme(scheme))
            .ok_or_else(|| CollectorError::BrokerUrl {
                url: self.config.broker_url.clone(),
                message: "missing port".to_string(),
            })?;

        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_clean_session(true);
        options.set_keep_alive(Duration::from_secs(30));

        if let Some(username) = &self.config.username {
            options.set_credentials(username, self.config.password.as_deref().unwrap_or(""));
        }

        if let Some(transport) = transport {
            options.set_transport(transport);
        } else if is_tls_scheme(scheme) {
            warn!(
                broker = %self.config.broker_url,
                "Broker URL uses a TLS scheme but no TLS material is configured; using default TLS"
            );
            options.set_transport(Transport::tls_with_default_config());
        }

        Ok(options)
    }
}

fn normalize_broker_url(url: &str) -> String {
    if url.contains("://") {
        url.to_owned()
    } else {
        format!("tcp://{url}")
    }
}

fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    match scheme {
        "mqtt" | "tcp" => Some(1883),
        "mqtts" | "ssl" | "tls" | "tcps" => Some(8883),
        _ => None,
    }
}

fn is_tls_scheme(scheme: &str) -> bool {
    matches!(scheme, "mqtts" | "ssl" | "tls" | "tcps")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricRegistry;

    fn make_collector(broker_url: &str) -> MqttCollector {
        let config = MosquittoConfig {
            broker_url: broker_url.to_string(),
            ..Default::default()
        };
        MqttCollector::new(
            config,
            Arc::new(TopicTables::mosquitto()),
            Arc::new(MetricRegistry::new()),
        )
    }

    #[test]
    fn test_normalize_broker_url() {
        assert_eq!(normalize_broker_url("localhost:1883"), "tcp://localhost:1883");
        assert_eq!(
            normalize_broker_url("tcp://localhost:1883"),
            "tcp://localhost:1883"
        );
        assert_eq!(
            normalize_broker_url("ssl://broker:8883"),
            "ssl://broker:8883"
        );
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(default_port_for_scheme("tcp"), Some(1883));
        assert_eq!(default_port_for_scheme("mqtt"), Some(1883));
        assert_eq!(default_port_for_scheme("ssl"), Some(8883));
        assert_eq!(default_port_for_scheme("tls"), Some(8883));
        assert_eq!(default_port_for_scheme("http"), None);
    }

    #[test]
    fn test_build_options_defaults() {
        let collector = make_collector("tcp://broker.example.org");
        let options = collector.build_options(None).unwrap();

        assert_eq!(options.broker_address(), ("broker.example.org".to_string(), 1883));
        assert_eq!(options.client_id(), DEFAULT_CLIENT_ID);
        assert!(options.clean_session());
    }

    #[test]
    fn test_build_options_credentials_and_id() {
        let config = MosquittoConfig {
            broker_url: "tcp://broker:1883".to_string(),
            username: Some("stats".to_string()),
            password: Some("secret".to_string()),
            client_id: Some("exporter-01".to_string()),
            ..Default::default()
        };
        let collector = MqttCollector::new(
            config,
            Arc::new(TopicTables::mosquitto()),
            Arc::new(MetricRegistry::new()),
        );

        let options = collector.build_options(None).unwrap();
        assert_eq!(options.client_id(), "exporter-01");
    }

    #[test]
    fn test_build_options_rejects_bad_url() {
        let collector = make_collector("://not-a-url");
        assert!(matches!(
            collector.build_options(None),
            Err(CollectorError::BrokerUrl { .. })
        ));
    }

    #[test]
    fn test_dispatch_routes_by_classification() {
        let registry = Arc::new(MetricRegistry::new());
        let collector = MqttCollector::new(
            MosquittoConfig::default(),
            Arc::new(TopicTables::mosquitto()),
            registry.clone(),
        );

        collector.handle_message("$SYS/broker/bytes/sent", b"1024");
        collector.handle_message("$SYS/broker/clients/connected", b"3");
        collector.handle_message("$SYS/broker/version", b"mosquitto version 2.0.18");

        let output = registry.render();
        assert!(output.contains("broker_bytes_sent_total 1024"));
        assert!(output.contains("# TYPE broker_bytes_sent_total counter"));
        assert!(output.contains("broker_clients_connected 3"));
        assert!(output.contains("# TYPE broker_clients_connected gauge"));
        assert!(!output.contains("broker_version"));

        let stats = registry.stats();
        assert_eq!(stats.messages_routed, 2);
        assert_eq!(stats.messages_ignored, 1);
    }

    #[test]
    fn test_dispatch_counter_help_from_table() {
        let registry = Arc::new(MetricRegistry::new());
        let collector = MqttCollector::new(
            MosquittoConfig::default(),
            Arc::new(TopicTables::mosquitto()),
            registry.clone(),
        );

        collector.handle_message("$SYS/broker/uptime", b"3600 seconds");

        let output = registry.render();
        assert!(output.contains(
            "# HELP broker_uptime_total The total number of seconds since the broker started."
        ));
        assert!(output.contains("broker_uptime_total 3600"));
    }

    #[test]
    fn test_dispatch_unknown_gauge_uses_name_as_help() {
        let registry = Arc::new(MetricRegistry::new());
        let collector = MqttCollector::new(
            MosquittoConfig::default(),
            Arc::new(TopicTables::mosquitto()),
            registry.clone(),
        );

        collector.handle_message("$SYS/broker/heap/current", b"8192");

        let output = registry.render();
        assert!(output.contains("# HELP broker_heap_current broker_heap_current"));
    }

    #[tokio::test]
    async fn test_retry_loop_exits_on_cancellation() {
        // Nothing listens on this port; every attempt fails fast and the
        // loop sits in its backoff sleep.
        let collector = make_collector("tcp://127.0.0.1:1");
        let handle = collector.state_handle();
        let registry = collector.registry.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(collector.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("collector should stop promptly after cancellation")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(handle.get(), ConnectionState::Disconnected);
        assert!(!registry.broker_connected());
    }

    #[tokio::test]
    async fn test_stop_before_any_connection_is_safe() {
        let collector = make_collector("tcp://127.0.0.1:1");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        // Already-cancelled lifetime: the loop must exit without a single
        // connect attempt hanging.
        let result = tokio::time::timeout(Duration::from_secs(1), collector.run(shutdown_rx))
            .await
            .expect("run should return immediately");
        assert!(result.is_ok());
    }
}
