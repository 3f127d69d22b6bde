//! The tick: link check, then session check, then timer-gated sampling.

use crate::connector::Connector;
use crate::link::{LinkState, NetworkLink};
use crate::mqtt_service::BrokerSession;
use crate::params::ParameterStore;
use crate::provisioning::{AccessPoint, CaptivePortal, ProvisionOutcome, Provisioner};
use crate::sampling::{Reading, Sampler, SamplingGate};
use crate::sensor::SensorPort;
use crate::vault::ParameterVault;
use rumqttc::QoS;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Provisioning timed out, the process has to restart.")]
    Restart,
}

/// How readings are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    pub qos: QoS,
    pub retained: bool,
}

impl Default for Publication {
    fn default() -> Self {
        Self {
            qos: QoS::ExactlyOnce,
            retained: false,
        }
    }
}

/// What happened during one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub provisioned: bool,
    pub connected: bool,
    pub sampled: bool,
    pub published: usize,
    pub failed: usize,
}

pub struct Bridge<Se, L, S, A, P> {
    store: ParameterStore,
    vault: Option<ParameterVault>,
    sensor: Se,
    connector: Connector<L, S>,
    provisioner: Provisioner<A, P>,
    gate: SamplingGate,
    sampler: Sampler,
    publication: Publication,
    provision_on_first_boot: bool,
}

impl<Se, L, S, A, P> Bridge<Se, L, S, A, P>
where
    Se: SensorPort,
    L: NetworkLink,
    S: BrokerSession,
    A: AccessPoint,
    P: CaptivePortal,
{
    pub fn new(
        store: ParameterStore,
        sensor: Se,
        connector: Connector<L, S>,
        provisioner: Provisioner<A, P>,
        gate: SamplingGate,
        sampler: Sampler,
        publication: Publication,
    ) -> Self {
        Self {
            store,
            vault: None,
            sensor,
            connector,
            provisioner,
            gate,
            sampler,
            publication,
            provision_on_first_boot: false,
        }
    }

    pub fn with_vault(mut self, vault: ParameterVault) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn provision_on_first_boot(mut self, enabled: bool) -> Self {
        self.provision_on_first_boot = enabled;
        self
    }

    /// Restores saved parameters and, on a device that was never
    /// provisioned, runs the provisioning flow once.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        if let Some(vault) = self.vault.as_ref() {
            match vault.load() {
                Ok(Some(saved)) => match self.store.apply(saved) {
                    Ok(()) => info!("Restored saved parameters: {:?}", self.store.current()),
                    Err(e) => warn!("Ignoring saved parameters: {}", e),
                },
                Ok(None) => info!("No saved parameters, using defaults."),
                Err(e) => error!("Failed to load saved parameters: {}", e),
            }
        }

        if self.provision_on_first_boot && !self.store.is_provisioned() {
            info!("Device has not been provisioned yet.");
            self.provision().await?;
        }
        Ok(())
    }

    pub async fn tick(&mut self, now: Instant) -> Result<TickReport, BridgeError> {
        let mut report = TickReport::default();

        let (link, _) = self.connector.refresh().await;
        if link != LinkState::Up {
            warn!("Network disconnected. Reconnecting...");
            if self.connector.ensure_link().await.is_err() {
                self.provision().await?;
                report.provisioned = true;
                if self.connector.ensure_link().await.is_err() {
                    return Ok(report);
                }
            }
        }

        if !self.connector.is_ready() {
            warn!("MQTT disconnected. Reconnecting...");
            let params = self.store.current();
            // Failures are logged by the connector; the next tick tries again.
            let _ = self.connector.ensure_session(&params).await;
        }
        report.connected = self.connector.is_ready();

        if self.gate.poll(now) {
            if let Some(reading) = self.sampler.sample(&mut self.sensor).await {
                report.sampled = true;
                self.publish(&reading, &mut report).await;
            }
        }

        Ok(report)
    }

    /// Starts the bridge and ticks every `tick_interval` until `shutdown`
    /// resolves. A start or tick still in progress is abandoned at that point.
    pub async fn run<F: Future>(
        &mut self,
        tick_interval: Duration,
        shutdown: F,
    ) -> Result<(), BridgeError> {
        tokio::pin!(shutdown);
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stopped = tokio::select! {
            result = self.start() => {
                result?;
                false
            }
            _ = &mut shutdown => true,
        };

        if !stopped {
            info!("Bridge started, ticking every {:?}.", tick_interval);
            loop {
                let now = tokio::select! {
                    now = ticker.tick() => now,
                    _ = &mut shutdown => break,
                };
                tokio::select! {
                    result = self.tick(now) => {
                        result?;
                    }
                    _ = &mut shutdown => break,
                }
            }
        }

        info!("Shutdown signal received.");
        self.shutdown().await;
        Ok(())
    }

    /// Disconnects from the broker.
    pub async fn shutdown(&mut self) {
        self.connector.reset_session().await;
        info!("Bridge stopped.");
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    async fn publish(&mut self, reading: &Reading, report: &mut TickReport) {
        if !self.connector.is_ready() {
            warn!("Broker not connected, dropping this reading.");
            return;
        }

        let params = self.store.current();
        let messages = [
            (params.topic_temperature.as_str(), reading.temperature_payload()),
            (params.topic_humidity.as_str(), reading.humidity_payload()),
        ];
        for (topic, payload) in messages {
            match self
                .connector
                .publish(topic, &payload, self.publication.qos, self.publication.retained)
                .await
            {
                Ok(()) => report.published += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to publish to '{}': {} ({})", topic, e, e.code());
                }
            }
        }

        if report.failed == 0 {
            info!("DHT data published to MQTT with {:?}", self.publication.qos);
        } else {
            warn!("Failed to publish some MQTT messages");
        }
    }

    async fn provision(&mut self) -> Result<(), BridgeError> {
        let current = self.store.current();
        match self.provisioner.run(&current).await {
            ProvisionOutcome::Saved(candidate) => {
                if let Err(e) = self.store.apply(candidate) {
                    warn!("Ignoring submitted parameters: {}", e);
                    return Ok(());
                }
                let applied = self.store.current();
                if let Some(vault) = self.vault.as_ref() {
                    if let Err(e) = vault.save(&applied) {
                        error!("Failed to persist parameters: {}", e);
                    }
                }
                self.connector.reset_session().await;
                Ok(())
            }
            ProvisionOutcome::TimedOut => Err(BridgeError::Restart),
        }
    }

    #[cfg(test)]
    pub(crate) fn connector(&self) -> &Connector<L, S> {
        &self.connector
    }

    #[cfg(test)]
    pub(crate) fn vault(&self) -> Option<&ParameterVault> {
        self.vault.as_ref()
    }
}
