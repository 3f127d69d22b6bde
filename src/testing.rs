//! Scriptable collaborators shared by the unit tests.

use crate::link::{LinkError, NetworkLink};
use crate::mqtt_service::{BrokerSession, ConnectOptions, TransportError};
use crate::params::ParameterSet;
use crate::provisioning::{AccessPoint, CaptivePortal, ProvisionError};
use crate::sensor::{Climate, SensorError, SensorPort};
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Sensor returning scripted `(temperature, humidity)` pairs, then a steady
/// 21.0 C / 45.0 %. NaN in a pair makes that read invalid.
pub struct FakeSensor {
    script: VecDeque<(f32, f32)>,
    reads: Arc<AtomicUsize>,
}

impl FakeSensor {
    pub fn scripted(script: Vec<(f32, f32)>) -> Self {
        Self {
            script: script.into(),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn steady() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn reads(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

impl SensorPort for FakeSensor {
    async fn read(&mut self) -> Result<Climate, SensorError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let (temperature, humidity) = self.script.pop_front().unwrap_or((21.0, 45.0));
        Climate::new(temperature, humidity)
    }
}

struct LinkLog {
    failures_left: Option<usize>,
    up: bool,
    associations: usize,
}

/// Handle for taking a [`FakeLink`] down after it moved into the code under test.
#[derive(Clone)]
pub struct LinkSwitch(Arc<Mutex<LinkLog>>);

impl LinkSwitch {
    /// Drops the link; the next `failures` associations fail (`None`: all).
    pub fn drop_link(&self, failures: Option<usize>) {
        let mut log = self.0.lock().unwrap();
        log.up = false;
        log.failures_left = failures;
    }
}

/// Link failing a scripted number of associations. `None` failures means
/// the network is never reachable.
pub struct FakeLink {
    log: Arc<Mutex<LinkLog>>,
}

impl FakeLink {
    fn with_failures(failures_left: Option<usize>) -> Self {
        Self {
            log: Arc::new(Mutex::new(LinkLog {
                failures_left,
                up: false,
                associations: 0,
            })),
        }
    }

    pub fn up() -> Self {
        Self::with_failures(Some(0))
    }

    pub fn failing_first(failures: usize) -> Self {
        Self::with_failures(Some(failures))
    }

    pub fn unreachable() -> Self {
        Self::with_failures(None)
    }

    pub fn switch(&self) -> LinkSwitch {
        LinkSwitch(Arc::clone(&self.log))
    }

    pub fn associations(&self) -> usize {
        self.log.lock().unwrap().associations
    }
}

impl NetworkLink for FakeLink {
    async fn associate(&mut self, _ssid_hint: &str) -> Result<(), LinkError> {
        let mut log = self.log.lock().unwrap();
        log.associations += 1;
        log.up = match log.failures_left {
            Some(0) => true,
            Some(n) => {
                log.failures_left = Some(n - 1);
                false
            }
            None => false,
        };
        if log.up {
            Ok(())
        } else {
            Err(LinkError::ProbeFailed {
                probe: "fake".to_string(),
                reason: "unreachable".to_string(),
            })
        }
    }

    async fn check(&mut self) -> bool {
        self.log.lock().unwrap().up
    }

    fn is_up(&self) -> bool {
        self.log.lock().unwrap().up
    }
}

#[derive(Default)]
struct SessionLog {
    failures_left: Option<usize>,
    connected: bool,
    connects: Vec<ConnectOptions>,
    published: Vec<(String, String)>,
    failing_topics: Vec<String>,
    last_error: Option<TransportError>,
    disconnects: usize,
}

/// Handle for inspecting a [`FakeSession`] after it moved into the code under test.
#[derive(Clone)]
pub struct SessionProbe(Arc<Mutex<SessionLog>>);

impl SessionProbe {
    pub fn connect_attempts(&self) -> usize {
        self.0.lock().unwrap().connects.len()
    }

    pub fn connects(&self) -> Vec<ConnectOptions> {
        self.0.lock().unwrap().connects.clone()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.0.lock().unwrap().published.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.0.lock().unwrap().disconnects
    }

    pub fn drop_connection(&self) {
        self.0.lock().unwrap().connected = false;
    }

    pub fn fail_publishes_to(&self, topic: &str) {
        self.0.lock().unwrap().failing_topics.push(topic.to_string());
    }

    pub fn make_reachable(&self) {
        self.0.lock().unwrap().failures_left = Some(0);
    }
}

/// Broker session failing a scripted number of connects. `None` failures
/// means the broker is never reachable.
pub struct FakeSession {
    log: Arc<Mutex<SessionLog>>,
}

impl FakeSession {
    fn with_failures(failures_left: Option<usize>) -> Self {
        Self {
            log: Arc::new(Mutex::new(SessionLog {
                failures_left,
                ..SessionLog::default()
            })),
        }
    }

    pub fn reachable() -> Self {
        Self::with_failures(Some(0))
    }

    pub fn failing_first(failures: usize) -> Self {
        Self::with_failures(Some(failures))
    }

    pub fn unreachable() -> Self {
        Self::with_failures(None)
    }

    pub fn probe(&self) -> SessionProbe {
        SessionProbe(Arc::clone(&self.log))
    }
}

impl BrokerSession for FakeSession {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        log.connects.push(options.clone());
        match log.failures_left {
            Some(0) => {
                log.connected = true;
                Ok(())
            }
            Some(n) => {
                log.failures_left = Some(n - 1);
                let err = TransportError::Network("connection refused".to_string());
                log.last_error = Some(err.clone());
                Err(err)
            }
            None => {
                let err = TransportError::Network("connection refused".to_string());
                log.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        _qos: QoS,
        _retained: bool,
    ) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        if !log.connected {
            return Err(TransportError::NotConnected);
        }
        if log.failing_topics.iter().any(|t| t == topic) {
            let err = TransportError::Publish("queue full".to_string());
            log.last_error = Some(err.clone());
            return Err(err);
        }
        log.published.push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.log.lock().unwrap().connected
    }

    fn last_error(&self) -> Option<TransportError> {
        self.log.lock().unwrap().last_error.clone()
    }

    async fn disconnect(&mut self) {
        let mut log = self.log.lock().unwrap();
        log.connected = false;
        log.disconnects += 1;
    }
}

#[derive(Default)]
pub struct FakeAccessPoint {
    advertised: Vec<String>,
    withdrawals: usize,
}

impl FakeAccessPoint {
    pub fn advertised(&self) -> Vec<String> {
        self.advertised.clone()
    }

    pub fn withdrawals(&self) -> usize {
        self.withdrawals
    }
}

impl AccessPoint for FakeAccessPoint {
    async fn advertise(&mut self, name: &str) -> Result<(), ProvisionError> {
        self.advertised.push(name.to_string());
        Ok(())
    }

    async fn withdraw(&mut self) {
        self.withdrawals += 1;
    }
}

enum PortalScript {
    Submit(ParameterSet),
    Silent,
    Close,
    Broken,
}

/// Portal that answers every `open` according to its script.
pub struct ScriptedPortal {
    script: PortalScript,
    opened_with: Vec<ParameterSet>,
    closes: usize,
    // Keeps a silent portal's channel open.
    held: Option<mpsc::Sender<ParameterSet>>,
}

impl ScriptedPortal {
    fn new(script: PortalScript) -> Self {
        Self {
            script,
            opened_with: Vec::new(),
            closes: 0,
            held: None,
        }
    }

    pub fn submitting(candidate: ParameterSet) -> Self {
        Self::new(PortalScript::Submit(candidate))
    }

    pub fn silent() -> Self {
        Self::new(PortalScript::Silent)
    }

    pub fn closing() -> Self {
        Self::new(PortalScript::Close)
    }

    pub fn broken() -> Self {
        Self::new(PortalScript::Broken)
    }

    pub fn opened_with(&self) -> Vec<ParameterSet> {
        self.opened_with.clone()
    }

    pub fn closes(&self) -> usize {
        self.closes
    }
}

impl CaptivePortal for ScriptedPortal {
    async fn open(
        &mut self,
        _ap_name: &str,
        current: &ParameterSet,
    ) -> Result<mpsc::Receiver<ParameterSet>, ProvisionError> {
        self.opened_with.push(current.clone());
        let (tx, rx) = mpsc::channel(1);
        match &self.script {
            PortalScript::Submit(candidate) => {
                tx.try_send(candidate.clone())
                    .map_err(|e| ProvisionError::Portal(e.to_string()))?;
                self.held = Some(tx);
            }
            PortalScript::Silent => self.held = Some(tx),
            PortalScript::Close => drop(tx),
            PortalScript::Broken => {
                return Err(ProvisionError::Portal("address in use".to_string()))
            }
        }
        Ok(rx)
    }

    async fn close(&mut self) {
        self.closes += 1;
        self.held = None;
    }
}
