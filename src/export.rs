//! CSV exporter: subscribes to the bridge's topics and appends every reading
//! to a CSV file.

use crate::params::ParameterSet;
use futures::future::try_join;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CSV_HEADER: &str = "Date,Time,SensorID,Temperature,Humidity";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("MQTT subscribe failed: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
}

/// One CSV line. Exactly one of the two value columns is filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvRow {
    pub date: String,
    pub time: String,
    pub sensor_id: String,
    pub temperature: Option<String>,
    pub humidity: Option<String>,
}

impl CsvRow {
    pub fn to_line(&self) -> String {
        [
            self.date.as_str(),
            self.time.as_str(),
            self.sensor_id.as_str(),
            self.temperature.as_deref().unwrap_or(""),
            self.humidity.as_deref().unwrap_or(""),
        ]
        .iter()
        .map(|field| quote(field))
        .collect::<Vec<_>>()
        .join(",")
    }
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Local wall-clock time, UTC when the local offset cannot be determined.
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `(YYYY-MM-DD, HH:MM:SS)` for a timestamp.
pub fn stamp(at: OffsetDateTime) -> Result<(String, String), ExportError> {
    let date = at.format(format_description!("[year]-[month]-[day]"))?;
    let time = at.format(format_description!("[hour]:[minute]:[second]"))?;
    Ok((date, time))
}

/// Append-only CSV file. The header is written when the file is created.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, row: &CsvRow) -> Result<(), ExportError> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| self.write_error(e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.write_error(e))?;

        let mut text = String::new();
        if !exists {
            text.push_str(CSV_HEADER);
            text.push('\n');
        }
        text.push_str(&row.to_line());
        text.push('\n');

        file.write_all(text.as_bytes())
            .await
            .map_err(|e| self.write_error(e))?;
        file.flush().await.map_err(|e| self.write_error(e))
    }

    fn write_error(&self, source: std::io::Error) -> ExportError {
        ExportError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

pub struct Exporter {
    params: ParameterSet,
    sink: CsvSink,
    retry_interval: Duration,
}

impl Exporter {
    pub fn new(params: ParameterSet, sink: CsvSink, retry_interval: Duration) -> Self {
        Self {
            params,
            sink,
            retry_interval,
        }
    }

    /// Row for a message, or `None` when the topic is not one of ours.
    pub fn row_for(
        &self,
        topic: &str,
        payload: &str,
        at: OffsetDateTime,
    ) -> Result<Option<CsvRow>, ExportError> {
        let value = payload.trim().to_string();
        let (temperature, humidity) = if topic == self.params.topic_temperature {
            (Some(value), None)
        } else if topic == self.params.topic_humidity {
            (None, Some(value))
        } else {
            return Ok(None);
        };

        let (date, time) = stamp(at)?;
        Ok(Some(CsvRow {
            date,
            time,
            sensor_id: self.params.client_id.clone(),
            temperature,
            humidity,
        }))
    }

    /// Subscribes and records until the process is stopped. A lost
    /// connection is rebuilt after the retry interval.
    pub async fn run(&self) {
        info!(
            "Recording '{}' and '{}' into {}",
            self.params.topic_temperature,
            self.params.topic_humidity,
            self.sink.path().display()
        );

        loop {
            let client_id = format!("dht_export_{}", Uuid::new_v4());
            debug!(
                "Configuring MQTT broker at {}:{}...",
                self.params.broker_host, self.params.broker_port
            );

            let mut options =
                MqttOptions::new(client_id, &self.params.broker_host, self.params.broker_port);
            options.set_keep_alive(Duration::from_secs(60));
            options.set_clean_session(true);
            if !self.params.username.is_empty() {
                options.set_credentials(&self.params.username, &self.params.password);
            }

            let (client, mut eventloop) = AsyncClient::new(options, 10);
            match self.subscribe(&client).await {
                Ok(()) => {
                    loop {
                        match eventloop.poll().await {
                            Ok(event) => {
                                if let Err(e) = self.handle_event(event).await {
                                    error!("Failed to record message: {}", e);
                                }
                            }
                            Err(e) => {
                                error!("Error in MQTT event loop: {:?}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => error!("{}", e),
            }

            warn!(
                "Lost connection to MQTT broker. Retrying in {:?}...",
                self.retry_interval
            );
            sleep(self.retry_interval).await;
        }
    }

    async fn subscribe(&self, client: &AsyncClient) -> Result<(), ExportError> {
        try_join(
            client.subscribe(&self.params.topic_temperature, QoS::ExactlyOnce),
            client.subscribe(&self.params.topic_humidity, QoS::ExactlyOnce),
        )
        .await?;
        Ok(())
    }

    /// Records incoming publishes; other events are only logged.
    pub async fn handle_event(&self, event: Event) -> Result<(), ExportError> {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                let payload = String::from_utf8_lossy(&publish.payload);
                info!("New MQTT Message: {} = {}", publish.topic, payload);
                match self.row_for(&publish.topic, &payload, local_now())? {
                    Some(row) => self.sink.append(&row).await?,
                    None => warn!("Unknown topic received: {}", publish.topic),
                }
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("Successfully connected to MQTT broker");
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                debug!("Subscription acknowledged: {:?}", ack.return_codes);
            }
            _ => {}
        }
        Ok(())
    }
}
