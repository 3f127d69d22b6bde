//! Broker parameters: the field catalogue shown by the provisioning portal,
//! the parameter set itself and the copy-on-write store holding it.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// One field of the parameter set as exposed to the operator. Defaults are
/// not serialized: they include the factory password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub key: &'static str,
    pub label: &'static str,
    #[serde(skip_serializing)]
    pub default: &'static str,
    pub max_len: usize,
}

pub const BROKER_HOST: &str = "broker_host";
pub const BROKER_PORT: &str = "broker_port";
pub const CLIENT_ID: &str = "client_id";
pub const USERNAME: &str = "username";
pub const PASSWORD: &str = "password";
pub const TOPIC_TEMPERATURE: &str = "topic_temperature";
pub const TOPIC_HUMIDITY: &str = "topic_humidity";

pub const FIELDS: [FieldSpec; 7] = [
    FieldSpec {
        key: BROKER_HOST,
        label: "MQTT Broker IP",
        default: "iotgw.local",
        max_len: 40,
    },
    FieldSpec {
        key: BROKER_PORT,
        label: "MQTT Port",
        default: "1883",
        max_len: 6,
    },
    FieldSpec {
        key: CLIENT_ID,
        label: "MQTT Client ID",
        default: "DHTSensor",
        max_len: 40,
    },
    FieldSpec {
        key: USERNAME,
        label: "MQTT Username",
        default: "test_user",
        max_len: 40,
    },
    FieldSpec {
        key: PASSWORD,
        label: "MQTT Password",
        default: "test_password",
        max_len: 40,
    },
    FieldSpec {
        key: TOPIC_TEMPERATURE,
        label: "Temperature Topic",
        default: "DHTSensor/temperature",
        max_len: 40,
    },
    FieldSpec {
        key: TOPIC_HUMIDITY,
        label: "Humidity Topic",
        default: "DHTSensor/humidity",
        max_len: 40,
    },
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("Unknown parameter '{0}'.")]
    UnknownField(String),
    #[error("Parameter '{0}' must not be empty.")]
    Empty(&'static str),
    #[error("Broker port '{0}' is not a number between 1 and 65535.")]
    InvalidPort(String),
}

/// Everything the bridge needs to reach the broker and name its topics.
#[derive(Clone, PartialEq, Eq)]
pub struct ParameterSet {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub topic_temperature: String,
    pub topic_humidity: String,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            broker_host: "iotgw.local".to_string(),
            broker_port: 1883,
            client_id: "DHTSensor".to_string(),
            username: "test_user".to_string(),
            password: "test_password".to_string(),
            topic_temperature: "DHTSensor/temperature".to_string(),
            topic_humidity: "DHTSensor/humidity".to_string(),
        }
    }
}

// Keep the password out of log lines.
impl fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSet")
            .field("broker_host", &self.broker_host)
            .field("broker_port", &self.broker_port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("topic_temperature", &self.topic_temperature)
            .field("topic_humidity", &self.topic_humidity)
            .finish()
    }
}

impl ParameterSet {
    /// Current value of a field in its textual form.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            BROKER_HOST => self.broker_host.clone(),
            BROKER_PORT => self.broker_port.to_string(),
            CLIENT_ID => self.client_id.clone(),
            USERNAME => self.username.clone(),
            PASSWORD => self.password.clone(),
            TOPIC_TEMPERATURE => self.topic_temperature.clone(),
            TOPIC_HUMIDITY => self.topic_humidity.clone(),
            _ => return None,
        };
        Some(value)
    }

    /// Sets a field from its textual form, truncated to the field's max length.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), ParameterError> {
        let spec = field_spec(key).ok_or_else(|| ParameterError::UnknownField(key.to_string()))?;
        let value = truncate(raw.trim(), spec.max_len);

        match spec.key {
            BROKER_PORT => {
                self.broker_port = match value.parse::<u16>() {
                    Ok(port) if port > 0 => port,
                    _ => return Err(ParameterError::InvalidPort(value)),
                };
            }
            BROKER_HOST => self.broker_host = value,
            CLIENT_ID => self.client_id = value,
            USERNAME => self.username = value,
            PASSWORD => self.password = value,
            TOPIC_TEMPERATURE => self.topic_temperature = value,
            TOPIC_HUMIDITY => self.topic_humidity = value,
            _ => return Err(ParameterError::UnknownField(key.to_string())),
        }
        Ok(())
    }

    /// Builds a set from `(key, value)` pairs; keys not present keep their defaults.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ParameterError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut set = Self::default();
        for (key, value) in pairs {
            set.set(key, value)?;
        }
        set.validate()?;
        Ok(set)
    }

    /// Every field must carry a value before the set may be used.
    pub fn validate(&self) -> Result<(), ParameterError> {
        let texts = [
            (BROKER_HOST, &self.broker_host),
            (CLIENT_ID, &self.client_id),
            (USERNAME, &self.username),
            (PASSWORD, &self.password),
            (TOPIC_TEMPERATURE, &self.topic_temperature),
            (TOPIC_HUMIDITY, &self.topic_humidity),
        ];
        for (key, value) in texts {
            if value.is_empty() {
                return Err(ParameterError::Empty(key));
            }
        }
        if self.broker_port == 0 {
            return Err(ParameterError::InvalidPort("0".to_string()));
        }
        Ok(())
    }

    /// `(key, value)` pairs in catalogue order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        FIELDS
            .iter()
            .filter_map(|spec| self.get(spec.key).map(|value| (spec.key, value)))
            .collect()
    }
}

pub fn field_spec(key: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|spec| spec.key == key)
}

fn truncate(value: &str, max_len: usize) -> String {
    value.chars().take(max_len).collect()
}

/// Holds the active parameter set. Readers get an `Arc` snapshot; `apply`
/// swaps in a whole new set and never mutates a snapshot already handed out.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    current: Arc<ParameterSet>,
    provisioned: bool,
}

impl ParameterStore {
    /// Store holding the compiled-in defaults.
    pub fn load() -> Self {
        Self {
            current: Arc::new(ParameterSet::default()),
            provisioned: false,
        }
    }

    pub fn current(&self) -> Arc<ParameterSet> {
        Arc::clone(&self.current)
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    /// Replaces all fields at once. The candidate is rejected as a whole if
    /// any field is empty.
    pub fn apply(&mut self, candidate: ParameterSet) -> Result<(), ParameterError> {
        candidate.validate()?;
        self.current = Arc::new(candidate);
        self.provisioned = true;
        Ok(())
    }
}
