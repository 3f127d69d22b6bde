use dht_bridge::bridge::{Bridge, BridgeError, Publication};
use dht_bridge::config::Config;
use dht_bridge::connector::{Connector, RetryPolicy};
use dht_bridge::link::HostLink;
use dht_bridge::mqtt_service::{qos_from_level, RumqttSession, SessionSettings};
use dht_bridge::params::ParameterStore;
use dht_bridge::portal::RocketPortal;
use dht_bridge::provisioning::{HostAccessPoint, Provisioner};
use dht_bridge::sampling::{Sampler, SamplingGate};
use dht_bridge::sensor::IioDht;
use dht_bridge::vault::ParameterVault;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let vault = match &config.parameter_db {
        Some(path) => match ParameterVault::open(path) {
            Ok(vault) => {
                info!("Parameter database opened at {}.", path.display());
                Some(vault)
            }
            Err(e) => {
                error!("Failed to open parameter database: {}", e);
                return;
            }
        },
        None => None,
    };

    let Some(qos) = qos_from_level(config.mqtt_qos) else {
        error!("Unsupported MQTT QoS level {}.", config.mqtt_qos);
        return;
    };

    let connector = Connector::new(
        HostLink::new(
            config.link_probe.clone(),
            Duration::from_millis(config.mqtt_connect_timeout_ms),
        ),
        RumqttSession::new(),
        RetryPolicy {
            attempts: config.mqtt_max_retries,
            delay: config.mqtt_retry_interval(),
        },
        SessionSettings {
            keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
            clean_session: config.mqtt_clean_session,
            timeout: Duration::from_millis(config.mqtt_connect_timeout_ms),
        },
        config.ssid_hint.clone(),
    );

    let portal_addr = SocketAddr::new(config.portal_address, config.portal_port);
    let provisioner = Provisioner::new(
        HostAccessPoint::new(portal_addr),
        RocketPortal::new(config.portal_address, config.portal_port),
        config.ap_name.clone(),
        config.portal_timeout(),
    );

    let mut bridge = Bridge::new(
        ParameterStore::load(),
        IioDht::new(config.sensor_iio_device.clone()),
        connector,
        provisioner,
        SamplingGate::new(config.sample_interval(), Instant::now()),
        Sampler::new(config.sensor_retry_delay()),
        Publication {
            qos,
            retained: config.mqtt_retain,
        },
    )
    .provision_on_first_boot(config.provision_on_first_boot);
    if let Some(vault) = vault {
        bridge = bridge.with_vault(vault);
    }

    if let Err(e) = bridge
        .run(config.tick_interval(), tokio::signal::ctrl_c())
        .await
    {
        restart(&config, e).await;
    }
}

/// Leaves the process after the restart delay; the supervisor starts it again.
async fn restart(config: &Config, reason: BridgeError) -> ! {
    error!("{} Restarting in {:?}...", reason, config.restart_delay());
    sleep(config.restart_delay()).await;
    std::process::exit(1);
}
