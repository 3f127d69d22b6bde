use dotenvy::dotenv;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Runtime settings of the bridge. Broker parameters are not part of this;
/// they live in the parameter store and come from the provisioning portal.
#[derive(Debug, Clone)]
pub struct Config {
    pub ap_name: String,
    pub ssid_hint: String,
    pub link_probe: Option<String>,
    pub parameter_db: Option<PathBuf>,
    pub provision_on_first_boot: bool,
    pub restart_delay_ms: u64,
    pub tick_interval_ms: u64,

    pub portal_address: IpAddr,
    pub portal_port: u16,
    pub portal_timeout_secs: u64,

    pub sensor_iio_device: PathBuf,
    pub sample_interval_ms: u64,
    pub sensor_retry_delay_ms: u64,

    pub mqtt_max_retries: u32,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_clean_session: bool,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_qos: u8,
    pub mqtt_retain: bool,

    pub export_csv_file: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        let checks = [
            ("MQTT_RETRY_INTERVAL_MS", self.mqtt_retry_interval_ms),
            ("MQTT_CONNECT_TIMEOUT_MS", self.mqtt_connect_timeout_ms),
            ("SENSOR_SAMPLE_INTERVAL_MS", self.sample_interval_ms),
            ("SENSOR_RETRY_DELAY_MS", self.sensor_retry_delay_ms),
        ];
        for (name, value) in checks {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if !(10..=MAX_TIMEOUT).contains(&self.tick_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "BRIDGE_TICK_INTERVAL_MS must be between 10 and {} ms",
                MAX_TIMEOUT
            )));
        }
        if self.portal_timeout_secs == 0 {
            return Err(ConfigError::ParsingError(
                "PORTAL_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }
        if !(1..=100).contains(&self.mqtt_max_retries) {
            return Err(ConfigError::ParsingError(
                "MQTT_MAX_RETRIES must be between 1 and 100".to_string(),
            ));
        }
        if self.mqtt_qos > 2 {
            return Err(ConfigError::ParsingError(
                "MQTT_QOS must be 0, 1 or 2".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let config = Self {
            ap_name: text("BRIDGE_AP_NAME", "ESP32_DHT"),
            ssid_hint: text("BRIDGE_SSID_HINT", ""),
            link_probe: optional("BRIDGE_LINK_PROBE"),
            parameter_db: match lookup("BRIDGE_PARAMETER_DB") {
                Some(path) if path.trim().is_empty() => None,
                Some(path) => Some(PathBuf::from(path)),
                None => Some(PathBuf::from("bridge_parameters.db")),
            },
            provision_on_first_boot: parse_flag(&lookup, "BRIDGE_PROVISION_ON_FIRST_BOOT", true)?,
            restart_delay_ms: parse_number(&lookup, "BRIDGE_RESTART_DELAY_MS", 3000)?,
            tick_interval_ms: parse_number(&lookup, "BRIDGE_TICK_INTERVAL_MS", 100)?,

            portal_address: parse_number(
                &lookup,
                "PORTAL_ADDRESS",
                IpAddr::from([0, 0, 0, 0]),
            )?,
            portal_port: parse_number(&lookup, "PORTAL_PORT", 8080)?,
            portal_timeout_secs: parse_number(&lookup, "PORTAL_TIMEOUT_SECS", 180)?,

            sensor_iio_device: PathBuf::from(text(
                "SENSOR_IIO_DEVICE",
                "/sys/bus/iio/devices/iio:device0",
            )),
            sample_interval_ms: parse_number(&lookup, "SENSOR_SAMPLE_INTERVAL_MS", 10_000)?,
            sensor_retry_delay_ms: parse_number(&lookup, "SENSOR_RETRY_DELAY_MS", 1000)?,

            mqtt_max_retries: parse_number(&lookup, "MQTT_MAX_RETRIES", 5)?,
            mqtt_retry_interval_ms: parse_number(&lookup, "MQTT_RETRY_INTERVAL_MS", 1000)?,
            mqtt_keep_alive_secs: parse_number(&lookup, "MQTT_KEEP_ALIVE_SECS", 120)?,
            mqtt_clean_session: parse_flag(&lookup, "MQTT_CLEAN_SESSION", true)?,
            mqtt_connect_timeout_ms: parse_number(&lookup, "MQTT_CONNECT_TIMEOUT_MS", 1000)?,
            mqtt_qos: parse_number(&lookup, "MQTT_QOS", 2)?,
            mqtt_retain: parse_flag(&lookup, "MQTT_RETAIN", false)?,

            export_csv_file: PathBuf::from(text("EXPORT_CSV_FILE", "sensor_data.csv")),
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn portal_timeout(&self) -> Duration {
        Duration::from_secs(self.portal_timeout_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn sensor_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sensor_retry_delay_ms)
    }

    pub fn mqtt_retry_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_interval_ms)
    }
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| {
                ConfigError::ParsingError(format!("{} has an invalid value '{}'", key, raw))
            }),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|raw| raw.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::MissingOrInvalid(key.to_string())),
        },
    }
}
