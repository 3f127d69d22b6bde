use crate::params::{field_spec, ParameterError, ParameterSet};
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored parameters are invalid: {0}")]
    Invalid(#[from] ParameterError),
    #[error("Parameter vault lock is poisoned.")]
    Poisoned,
}

/// Key-value persistence of the parameter set.
pub struct ParameterVault {
    conn: Mutex<Connection>,
}

impl ParameterVault {
    /// Opens (or creates) the vault file and makes sure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VaultError> {
        let conn = Connection::open(path)?;
        let vault = Self {
            conn: Mutex::new(conn),
        };
        vault.initialize()?;
        Ok(vault)
    }

    /// Opens an existing vault file for reading only. Never creates the file
    /// or its schema.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, VaultError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, VaultError> {
        let conn = Connection::open_in_memory()?;
        let vault = Self {
            conn: Mutex::new(conn),
        };
        vault.initialize()?;
        Ok(vault)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, VaultError> {
        self.conn.lock().map_err(|_| VaultError::Poisoned)
    }

    /// Initializes the database schema.
    pub fn initialize(&self) -> Result<(), VaultError> {
        let conn = self.conn()?;

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS parameters (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        "#,
        ) {
            Ok(_) => {
                info!("Parameter vault schema initialized.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize parameter vault schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Returns the stored set, or `None` if nothing was ever saved.
    /// Fields missing from the table fall back to their defaults.
    pub fn load(&self) -> Result<Option<ParameterSet>, VaultError> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare("SELECT key, value FROM parameters")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut stored = Vec::new();
        for row in rows {
            let (key, value) = row?;
            if field_spec(&key).is_some() {
                stored.push((key, value));
            } else {
                warn!("Ignoring unknown stored parameter '{}'.", key);
            }
        }

        if stored.is_empty() {
            return Ok(None);
        }

        let set = ParameterSet::from_pairs(stored.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        Ok(Some(set))
    }

    /// Upserts every field of the set in a single transaction.
    pub fn save(&self, set: &ParameterSet) -> Result<(), VaultError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (key, value) in set.pairs() {
            tx.execute(
                r#"
                INSERT INTO parameters (key, value)
                VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = CURRENT_TIMESTAMP
                "#,
                params![key, value],
            )?;
        }
        tx.commit()?;
        info!("Saved parameters for client '{}'.", set.client_id);
        Ok(())
    }
}
