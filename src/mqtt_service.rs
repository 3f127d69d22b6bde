use crate::params::ParameterSet;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to the broker.")]
    NotConnected,
    #[error("Broker did not answer within {0:?}.")]
    Timeout(Duration),
    #[error("Broker refused the connection: {0}.")]
    Refused(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Publish rejected: {0}")]
    Publish(String),
}

impl TransportError {
    /// Short stable identifier for log lines and status output.
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::NotConnected => "not_connected",
            TransportError::Timeout(_) => "timeout",
            TransportError::Refused(_) => "refused",
            TransportError::Network(_) => "network",
            TransportError::Publish(_) => "publish",
        }
    }
}

/// Session options that do not come from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(120),
            clean_session: true,
            timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub timeout: Duration,
}

impl ConnectOptions {
    pub fn new(params: &ParameterSet, settings: SessionSettings) -> Self {
        Self {
            host: params.broker_host.clone(),
            port: params.broker_port,
            client_id: params.client_id.clone(),
            username: params.username.clone(),
            password: params.password.clone(),
            keep_alive: settings.keep_alive,
            clean_session: settings.clean_session,
            timeout: settings.timeout,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Maps the numeric MQTT QoS level.
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Authenticated broker session used for publishing.
pub trait BrokerSession {
    /// One connection attempt. Retrying is up to the caller.
    fn connect(
        &mut self,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<(), TransportError>>;

    /// Hands one message to the session. Nothing is queued on failure.
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retained: bool,
    ) -> impl Future<Output = Result<(), TransportError>>;

    fn is_connected(&self) -> bool;

    /// Error of the most recent failed operation, if any.
    fn last_error(&self) -> Option<TransportError>;

    fn disconnect(&mut self) -> impl Future<Output = ()>;
}

/// State shared with the event loop task.
#[derive(Default)]
struct SessionShared {
    connected: AtomicBool,
    last_error: Mutex<Option<TransportError>>,
}

impl SessionShared {
    fn record(&self, err: TransportError) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err);
        }
    }

    fn last(&self) -> Option<TransportError> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }
}

/// `rumqttc` backed session. After CONNACK a background task keeps polling
/// the event loop; the first connection error marks the session as down.
pub struct RumqttSession {
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    shared: Arc<SessionShared>,
}

impl Default for RumqttSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttSession {
    pub fn new() -> Self {
        Self {
            client: None,
            driver: None,
            shared: Arc::new(SessionShared::default()),
        }
    }

    fn teardown(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.client = None;
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl BrokerSession for RumqttSession {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.teardown();
        debug!("Configuring MQTT broker at {}:{}...", options.host, options.port);

        let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(options.clean_session);

        if !options.username.is_empty() && !options.password.is_empty() {
            mqtt_options.set_credentials(&options.username, &options.password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

        let handshake =
            tokio::time::timeout(options.timeout, wait_for_connack(&mut eventloop)).await;
        let result = handshake.unwrap_or(Err(TransportError::Timeout(options.timeout)));

        match result {
            Ok(()) => {
                info!("Connected to MQTT broker.");
                self.shared.connected.store(true, Ordering::SeqCst);
                self.client = Some(client);
                self.driver = Some(tokio::spawn(drive(eventloop, Arc::clone(&self.shared))));
                Ok(())
            }
            Err(e) => {
                self.shared.record(e.clone());
                Err(e)
            }
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError> {
        let client = match self.client.as_ref() {
            Some(client) if self.shared.connected.load(Ordering::SeqCst) => client,
            _ => return Err(TransportError::NotConnected),
        };

        match client.try_publish(topic, qos, retained, payload) {
            Ok(()) => {
                debug!("Message published to '{}': {}", topic, payload);
                Ok(())
            }
            Err(e) => {
                error!("Failed to publish message to '{}': {:?}", topic, e);
                let err = TransportError::Publish(e.to_string());
                self.shared.record(err.clone());
                Err(err)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.shared.connected.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<TransportError> {
        self.shared.last()
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.as_ref() {
            if let Err(e) = client.try_disconnect() {
                warn!("Failed to request MQTT disconnect: {:?}", e);
            }
        }
        if let Some(driver) = self.driver.as_mut() {
            // Give the event loop a moment to flush the DISCONNECT packet.
            let _ = tokio::time::timeout(Duration::from_millis(500), driver).await;
        }
        self.teardown();
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(event) => debug!("Event before CONNACK: {:?}", event),
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(TransportError::Refused(format!("{:?}", code)))
            }
            Err(e) => return Err(TransportError::Network(e.to_string())),
        }
    }
}

async fn drive(mut eventloop: EventLoop, shared: Arc<SessionShared>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the MQTT session.");
                shared.record(TransportError::Network("disconnected by broker".to_string()));
                break;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                error!("Error in MQTT event loop: {:?}", e);
                shared.record(TransportError::Network(e.to_string()));
                break;
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}
