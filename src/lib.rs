//! Bridges a DHT temperature/humidity sensor to an MQTT broker. Broker
//! parameters are entered through a captive portal and kept in SQLite.

pub mod bridge;
pub mod config;
pub mod connector;
pub mod export;
pub mod link;
pub mod mqtt_service;
pub mod params;
pub mod portal;
pub mod provisioning;
pub mod sampling;
pub mod sensor;
pub mod vault;

#[cfg(test)]
mod testing;
