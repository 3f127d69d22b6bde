//! Transport connector: keeps the network link and the broker session up and
//! guards publishing on both being connected.

use crate::link::{LinkError, LinkState, NetworkLink};
use crate::mqtt_service::{
    BrokerSession, ConnectOptions, SessionSettings, SessionState, TransportError,
};
use crate::params::ParameterSet;
use rumqttc::QoS;
use std::time::Duration;
use tokio::time::sleep;
use tokio_retry::strategy::FixedInterval;
use tracing::{error, info, warn};

/// Bounded, fixed-delay schedule for broker connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delays between consecutive attempts; one fewer than `attempts`.
    fn delays(&self) -> impl Iterator<Item = Duration> {
        FixedInterval::new(self.delay).take(self.attempts.saturating_sub(1) as usize)
    }
}

pub struct Connector<L, S> {
    link: L,
    session: S,
    link_state: LinkState,
    session_state: SessionState,
    retry: RetryPolicy,
    settings: SessionSettings,
    ssid_hint: String,
}

impl<L: NetworkLink, S: BrokerSession> Connector<L, S> {
    pub fn new(
        link: L,
        session: S,
        retry: RetryPolicy,
        settings: SessionSettings,
        ssid_hint: impl Into<String>,
    ) -> Self {
        Self {
            link,
            session,
            link_state: LinkState::Down,
            session_state: SessionState::Disconnected,
            retry,
            settings,
            ssid_hint: ssid_hint.into(),
        }
    }

    /// Re-checks the link and re-reads the session state.
    pub async fn refresh(&mut self) -> (LinkState, SessionState) {
        self.link_state = if self.link.check().await {
            LinkState::Up
        } else {
            LinkState::Down
        };
        self.session_state = if self.link_state == LinkState::Up && self.session.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        };
        (self.link_state, self.session_state)
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn is_ready(&self) -> bool {
        self.link_state == LinkState::Up && self.session_state == SessionState::Connected
    }

    pub fn last_error(&self) -> Option<TransportError> {
        self.session.last_error()
    }

    /// `Down -> Associating -> Up`. A failure is returned to the caller,
    /// which should provision rather than retry.
    pub async fn ensure_link(&mut self) -> Result<(), LinkError> {
        if self.link.is_up() {
            self.link_state = LinkState::Up;
            return Ok(());
        }

        info!("Network link is down, associating...");
        self.link_state = LinkState::Associating;
        match self.link.associate(&self.ssid_hint).await {
            Ok(()) => {
                self.link_state = LinkState::Up;
                info!("Network link is up.");
                Ok(())
            }
            Err(e) => {
                self.link_state = LinkState::Down;
                error!("Network association failed: {}", e);
                Err(e)
            }
        }
    }

    /// `Disconnected -> Connecting -> Connected`, with at most
    /// `retry.attempts` attempts. Returns the last error when all fail.
    pub async fn ensure_session(&mut self, params: &ParameterSet) -> Result<(), TransportError> {
        if self.session.is_connected() {
            self.session_state = SessionState::Connected;
            return Ok(());
        }

        let options = ConnectOptions::new(params, self.settings);
        info!("Connecting to MQTT broker {}:{}...", options.host, options.port);
        self.session_state = SessionState::Connecting;

        let mut delays = self.retry.delays();
        let mut attempt = 1;
        let last = loop {
            match self.session.connect(&options).await {
                Ok(()) => {
                    self.session_state = SessionState::Connected;
                    info!("Connected to MQTT broker after {} attempt(s).", attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!("MQTT connect attempt {}/{} failed: {}", attempt, self.retry.attempts, e);
                    match delays.next() {
                        Some(delay) => {
                            sleep(delay).await;
                            attempt += 1;
                        }
                        None => break e,
                    }
                }
            }
        };

        self.session_state = SessionState::Disconnected;
        let last = self.session.last_error().unwrap_or(last);
        error!("Failed to connect to MQTT broker! Last error: {} ({})", last.code(), last);
        Err(last)
    }

    /// Publishes only when link and session are both connected.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotConnected);
        }
        self.session.publish(topic, payload, qos, retained).await
    }

    /// Drops the session, e.g. after the parameters changed.
    pub async fn reset_session(&mut self) {
        self.session.disconnect().await;
        self.session_state = SessionState::Disconnected;
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> &S {
        &self.session
    }

    #[cfg(test)]
    pub(crate) fn link(&self) -> &L {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLink, FakeSession};

    fn connector(link: FakeLink, session: FakeSession) -> Connector<FakeLink, FakeSession> {
        Connector::new(
            link,
            session,
            RetryPolicy::default(),
            SessionSettings::default(),
            "ESP32_DHT",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn session_gives_up_after_five_attempts() {
        let session = FakeSession::unreachable();
        let probe = session.probe();
        let mut connector = connector(FakeLink::up(), session);
        connector.ensure_link().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = connector.ensure_session(&ParameterSet::default()).await.unwrap_err();

        assert_eq!(probe.connect_attempts(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(err.code(), "network");
        assert_eq!(connector.session_state(), SessionState::Disconnected);
        assert!(connector.last_error().is_some());
        assert!(!connector.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn session_connects_on_a_later_attempt() {
        let session = FakeSession::failing_first(2);
        let probe = session.probe();
        let mut connector = connector(FakeLink::up(), session);
        connector.ensure_link().await.unwrap();

        connector.ensure_session(&ParameterSet::default()).await.unwrap();

        assert_eq!(probe.connect_attempts(), 3);
        assert!(connector.is_ready());
    }

    #[tokio::test]
    async fn publish_requires_link_and_session() {
        let session = FakeSession::reachable();
        let probe = session.probe();
        let mut connector = connector(FakeLink::up(), session);

        let result = connector.publish("a", "1.0", QoS::ExactlyOnce, false).await;
        assert_eq!(result, Err(TransportError::NotConnected));

        connector.ensure_link().await.unwrap();
        connector.ensure_session(&ParameterSet::default()).await.unwrap();
        connector.publish("a", "1.0", QoS::ExactlyOnce, false).await.unwrap();

        assert_eq!(probe.published(), vec![("a".to_string(), "1.0".to_string())]);
    }

    #[tokio::test]
    async fn failed_association_leaves_the_link_down() {
        let mut connector = connector(FakeLink::unreachable(), FakeSession::reachable());
        assert!(connector.ensure_link().await.is_err());
        assert_eq!(connector.link_state(), LinkState::Down);
        assert_eq!(connector.link().associations(), 1);
    }

    #[tokio::test]
    async fn refresh_tracks_a_dropped_session() {
        let session = FakeSession::reachable();
        let probe = session.probe();
        let mut connector = connector(FakeLink::up(), session);
        connector.ensure_link().await.unwrap();
        connector.ensure_session(&ParameterSet::default()).await.unwrap();
        assert_eq!(connector.refresh().await, (LinkState::Up, SessionState::Connected));

        probe.drop_connection();
        assert_eq!(connector.refresh().await, (LinkState::Up, SessionState::Disconnected));
        assert!(!connector.session().is_connected());
    }

    #[tokio::test]
    async fn refresh_tracks_a_lost_link() {
        let link = FakeLink::up();
        let switch = link.switch();
        let mut connector = connector(link, FakeSession::reachable());
        connector.ensure_link().await.unwrap();
        connector.ensure_session(&ParameterSet::default()).await.unwrap();

        switch.drop_link(None);

        assert_eq!(connector.refresh().await, (LinkState::Down, SessionState::Disconnected));
        assert!(!connector.is_ready());
    }
}
