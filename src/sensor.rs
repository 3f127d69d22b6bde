//! Sensor port - abstraction over the temperature/humidity source.
//!
//! The bridge never talks to sensor hardware directly. Anything that can
//! produce a [`Climate`] sample implements [`SensorPort`]; on a Linux host the
//! kernel DHT11/DHT22 IIO driver is read through [`IioDht`].

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Error type for sensor operations. Every variant means "no usable reading".
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Sensor returned an invalid value (temperature {temperature}, humidity {humidity}).")]
    InvalidData { temperature: f32, humidity: f32 },
    #[error("Failed to read {path}: {source}")]
    ReadFailed { path: PathBuf, source: io::Error },
    #[error("Unexpected sensor output '{0}'.")]
    Malformed(String),
}

/// One raw sample as returned by the sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    /// Degrees Celsius.
    pub temperature: f32,
    /// Relative humidity in percent.
    pub humidity: f32,
}

impl Climate {
    /// Rejects NaN and infinite values, which DHT drivers use to signal a
    /// failed transfer.
    pub fn new(temperature: f32, humidity: f32) -> Result<Self, SensorError> {
        if temperature.is_finite() && humidity.is_finite() {
            Ok(Self {
                temperature,
                humidity,
            })
        } else {
            Err(SensorError::InvalidData {
                temperature,
                humidity,
            })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.temperature.is_finite() && self.humidity.is_finite()
    }
}

/// Port for reading the temperature/humidity sensor.
pub trait SensorPort {
    /// Takes a single sample. Implementations should not retry internally;
    /// the sampler owns the retry policy.
    fn read(&mut self) -> impl Future<Output = Result<Climate, SensorError>>;
}

/// DHT11/DHT22 exposed by the Linux `dht11` IIO driver.
///
/// The driver publishes milli-degrees and milli-percent in
/// `in_temp_input` and `in_humidityrelative_input`. A failed bus transfer
/// shows up as an I/O error (usually `EIO`) on the read.
#[derive(Debug, Clone)]
pub struct IioDht {
    device: PathBuf,
}

impl IioDht {
    pub fn new<P: Into<PathBuf>>(device: P) -> Self {
        Self {
            device: device.into(),
        }
    }

    async fn read_milli(&self, attribute: &str) -> Result<f32, SensorError> {
        let path = self.device.join(attribute);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SensorError::ReadFailed {
                path: path.clone(),
                source,
            })?;
        parse_milli(&raw)
    }

    pub fn device(&self) -> &Path {
        &self.device
    }
}

impl SensorPort for IioDht {
    async fn read(&mut self) -> Result<Climate, SensorError> {
        let temperature = self.read_milli("in_temp_input").await?;
        let humidity = self.read_milli("in_humidityrelative_input").await?;
        debug!(
            "Raw sample from {}: {} C, {} %",
            self.device.display(),
            temperature,
            humidity
        );
        Climate::new(temperature, humidity)
    }
}

fn parse_milli(raw: &str) -> Result<f32, SensorError> {
    let trimmed = raw.trim();
    trimmed
        .parse::<i64>()
        .map(|milli| milli as f32 / 1000.0)
        .map_err(|_| SensorError::Malformed(trimmed.to_string()))
}
