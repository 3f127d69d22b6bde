//! Provisioning flow: `Idle -> Advertising -> Collecting -> {Saved, TimedOut}`.
//!
//! The flow advertises an access point, opens the captive portal pre-filled
//! with the current parameters and waits for one accepted submission. The
//! result is returned as a value; nothing is signalled through shared flags.

use crate::params::ParameterSet;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ProvisionState {
    #[default]
    Idle,
    Advertising,
    Collecting,
    Saved,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Saved(ParameterSet),
    TimedOut,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Access point failed: {0}")]
    AccessPoint(String),
    #[error("Captive portal failed: {0}")]
    Portal(String),
}

/// Makes the device discoverable for the operator.
pub trait AccessPoint {
    fn advertise(&mut self, name: &str) -> impl Future<Output = Result<(), ProvisionError>>;

    fn withdraw(&mut self) -> impl Future<Output = ()>;
}

/// Serves the parameter form. Accepted submissions arrive on the returned
/// channel.
pub trait CaptivePortal {
    fn open(
        &mut self,
        ap_name: &str,
        current: &ParameterSet,
    ) -> impl Future<Output = Result<mpsc::Receiver<ParameterSet>, ProvisionError>>;

    fn close(&mut self) -> impl Future<Output = ()>;
}

/// Access point of a host without a radio of its own: the portal listener is
/// what the operator connects to, so advertising only announces its address.
#[derive(Debug, Clone)]
pub struct HostAccessPoint {
    portal_addr: SocketAddr,
}

impl HostAccessPoint {
    pub fn new(portal_addr: SocketAddr) -> Self {
        Self { portal_addr }
    }
}

impl AccessPoint for HostAccessPoint {
    async fn advertise(&mut self, name: &str) -> Result<(), ProvisionError> {
        info!(
            "Access point '{}' advertised, configuration portal at http://{}/",
            name, self.portal_addr
        );
        Ok(())
    }

    async fn withdraw(&mut self) {
        info!("Access point withdrawn.");
    }
}

pub struct Provisioner<A, P> {
    access_point: A,
    portal: P,
    ap_name: String,
    timeout: Duration,
    state: ProvisionState,
}

impl<A: AccessPoint, P: CaptivePortal> Provisioner<A, P> {
    pub fn new(access_point: A, portal: P, ap_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            access_point,
            portal,
            ap_name: ap_name.into(),
            timeout,
            state: ProvisionState::Idle,
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    /// Runs the flow once. Start-up failures of the access point or portal,
    /// and a portal that closes without a submission, are not retried here:
    /// the flow waits out its timeout and reports `TimedOut`.
    pub async fn run(&mut self, current: &ParameterSet) -> ProvisionOutcome {
        let deadline = Instant::now() + self.timeout;

        self.state = ProvisionState::Advertising;
        if let Err(e) = self.access_point.advertise(&self.ap_name).await {
            error!("Could not advertise access point '{}': {}", self.ap_name, e);
            sleep_until(deadline).await;
            return self.finish(None).await;
        }

        self.state = ProvisionState::Collecting;
        let mut submissions = match self.portal.open(&self.ap_name, current).await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Could not open configuration portal: {}", e);
                sleep_until(deadline).await;
                self.access_point.withdraw().await;
                return self.finish(None).await;
            }
        };
        info!(
            "Waiting up to {:?} for the configuration form to be submitted.",
            self.timeout
        );

        let saved = match timeout_at(deadline, submissions.recv()).await {
            Ok(Some(candidate)) => Some(candidate),
            Ok(None) => {
                warn!("Configuration portal closed without a submission.");
                sleep_until(deadline).await;
                None
            }
            Err(_) => None,
        };

        self.portal.close().await;
        self.access_point.withdraw().await;
        self.finish(saved).await
    }

    async fn finish(&mut self, saved: Option<ParameterSet>) -> ProvisionOutcome {
        match saved {
            Some(candidate) => {
                self.state = ProvisionState::Saved;
                info!("Parameters saved: {:?}", candidate);
                ProvisionOutcome::Saved(candidate)
            }
            None => {
                self.state = ProvisionState::TimedOut;
                error!("Failed to provision and hit timeout.");
                ProvisionOutcome::TimedOut
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn portal(&self) -> &P {
        &self.portal
    }

    #[cfg(test)]
    pub(crate) fn access_point(&self) -> &A {
        &self.access_point
    }
}
