//! Network link: the association underneath the broker session.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Down,
    Associating,
    Up,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Association with '{0}' timed out.")]
    Timeout(String),
    #[error("Network probe '{probe}' failed: {reason}")]
    ProbeFailed { probe: String, reason: String },
}

pub trait NetworkLink {
    /// Joins the network. `ssid_hint` names the network to prefer; links
    /// without a radio may ignore it.
    fn associate(&mut self, ssid_hint: &str) -> impl Future<Output = Result<(), LinkError>>;

    /// Re-checks an associated link and returns whether it is still up.
    fn check(&mut self) -> impl Future<Output = bool>;

    fn is_up(&self) -> bool;
}

/// Link of a host that is already on a network. The link counts as up while
/// a TCP connection to the probe address (e.g. the broker or the gateway)
/// can be opened; without a probe it is taken as up.
#[derive(Debug, Clone)]
pub struct HostLink {
    probe: Option<String>,
    timeout: Duration,
    up: bool,
}

impl HostLink {
    pub fn new(probe: Option<String>, timeout: Duration) -> Self {
        Self {
            probe,
            timeout,
            up: false,
        }
    }

    async fn reach(&self, probe: &str) -> Result<SocketAddr, LinkError> {
        let attempt = async {
            let addr = lookup_host(probe.to_string())
                .await
                .map_err(|e| probe_failed(probe, e.to_string()))?
                .next()
                .ok_or_else(|| probe_failed(probe, "no addresses".to_string()))?;
            TcpStream::connect(addr)
                .await
                .map_err(|e| probe_failed(probe, e.to_string()))?;
            Ok::<_, LinkError>(addr)
        };

        match timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(probe.to_string())),
        }
    }
}

fn probe_failed(probe: &str, reason: String) -> LinkError {
    LinkError::ProbeFailed {
        probe: probe.to_string(),
        reason,
    }
}

impl NetworkLink for HostLink {
    async fn associate(&mut self, ssid_hint: &str) -> Result<(), LinkError> {
        if !ssid_hint.is_empty() {
            debug!("SSID hint '{}' is not used by the host link.", ssid_hint);
        }

        let Some(probe) = self.probe.clone() else {
            self.up = true;
            info!("No link probe configured, using the host network as is.");
            return Ok(());
        };

        match self.reach(&probe).await {
            Ok(addr) => {
                self.up = true;
                info!("Network is up, probe '{}' reached at {}.", probe, addr);
                Ok(())
            }
            Err(e) => {
                self.up = false;
                warn!("{}", e);
                Err(e)
            }
        }
    }

    async fn check(&mut self) -> bool {
        if !self.up {
            return false;
        }
        let Some(probe) = self.probe.clone() else {
            return true;
        };

        if let Err(e) = self.reach(&probe).await {
            warn!("Network link lost: {}", e);
            self.up = false;
        }
        self.up
    }

    fn is_up(&self) -> bool {
        self.up
    }
}
