//! Timer-gated sampling.

use crate::sensor::SensorPort;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Opens at most once per interval, measured from the previous opening on
/// the monotonic clock. The first opening is one interval after `start`.
#[derive(Debug, Clone)]
pub struct SamplingGate {
    interval: Duration,
    last_fire: Instant,
}

impl SamplingGate {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last_fire: start,
        }
    }

    /// Returns `true` and re-arms when the interval has elapsed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_fire) >= self.interval {
            self.last_fire = now;
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// A validated sample, only kept for the duration of one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature: f32,
    pub humidity: f32,
    pub taken_at: Instant,
}

impl Reading {
    /// Payloads as published: one decimal place.
    pub fn temperature_payload(&self) -> String {
        format!("{:.1}", self.temperature)
    }

    pub fn humidity_payload(&self) -> String {
        format!("{:.1}", self.humidity)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    retry_delay: Duration,
}

impl Sampler {
    pub fn new(retry_delay: Duration) -> Self {
        Self { retry_delay }
    }

    /// Reads the sensor, retrying exactly once after `retry_delay` if the
    /// first read is invalid. `None` means the tick is skipped.
    pub async fn sample<S: SensorPort>(&self, sensor: &mut S) -> Option<Reading> {
        let climate = match sensor.read().await {
            Ok(climate) => climate,
            Err(e) => {
                warn!("Failed to read from DHT sensor: {}", e);
                sleep(self.retry_delay).await;
                match sensor.read().await {
                    Ok(climate) => climate,
                    Err(e) => {
                        warn!("Retry failed as well, skipping this sample: {}", e);
                        return None;
                    }
                }
            }
        };

        let reading = Reading {
            temperature: climate.temperature,
            humidity: climate.humidity,
            taken_at: Instant::now(),
        };
        info!(
            "Temperature: {}°C, Humidity: {}%",
            reading.temperature_payload(),
            reading.humidity_payload()
        );
        Some(reading)
    }
}
