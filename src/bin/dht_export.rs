use dht_bridge::config::Config;
use dht_bridge::export::{CsvSink, Exporter};
use dht_bridge::params::ParameterSet;
use dht_bridge::vault::ParameterVault;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    // Follow whatever the bridge was provisioned with.
    let params = match config.parameter_db.as_ref().map(ParameterVault::open_read_only) {
        Some(Ok(vault)) => match vault.load() {
            Ok(Some(saved)) => saved,
            Ok(None) => ParameterSet::default(),
            Err(e) => {
                warn!("Failed to load saved parameters, using defaults: {}", e);
                ParameterSet::default()
            }
        },
        Some(Err(e)) => {
            warn!("Failed to open parameter database, using defaults: {}", e);
            ParameterSet::default()
        }
        None => ParameterSet::default(),
    };

    let exporter = Exporter::new(
        params,
        CsvSink::new(&config.export_csv_file),
        config.mqtt_retry_interval(),
    );

    tokio::select! {
        _ = exporter.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received."),
    }
}
