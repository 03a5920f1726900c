//! SQLite-backed observation log and model slot.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::optimizer::RoutingObservation;
use crate::router::types::{FeatureVector, RoutingOutcome};

/// Persistence surface the optimizer needs: an append-only observation log
/// and a single slot holding the serialized current model.
pub trait ObservationStore: Send + Sync {
    fn append(&self, observation: &RoutingObservation) -> Result<()>;

    /// Observations at or after `since`, in submission order.
    fn scan(&self, since: DateTime<Utc>) -> Result<Vec<RoutingObservation>>;

    /// Drop observations older than `cutoff`. Returns how many were removed.
    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn count(&self) -> Result<usize>;

    fn get_model(&self) -> Result<Option<Vec<u8>>>;

    fn put_model(&self, bytes: &[u8]) -> Result<()>;
}

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS observations (
            seq        INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            features   TEXT NOT NULL,
            decision   TEXT NOT NULL,
            reward     REAL NOT NULL,
            timestamp  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_observations_timestamp
            ON observations(timestamp);
        CREATE TABLE IF NOT EXISTS model_slot (
            slot       INTEGER PRIMARY KEY CHECK (slot = 0),
            data       BLOB NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

/// SQLite-backed store.
pub struct SqliteObservationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteObservationStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::InternalInvariant("store connection lock poisoned".into()))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }
}

fn decode_outcome(raw: &str) -> rusqlite::Result<RoutingOutcome> {
    RoutingOutcome::all()
        .into_iter()
        .find(|o| o.as_str() == raw)
        .ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown outcome {raw}").into(),
            )
        })
}

impl ObservationStore for SqliteObservationStore {
    fn append(&self, observation: &RoutingObservation) -> Result<()> {
        let features = serde_json::to_string(&observation.features)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO observations (request_id, features, decision, reward, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    observation.request_id,
                    features,
                    observation.decision.as_str(),
                    observation.reward,
                    observation.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn scan(&self, since: DateTime<Utc>) -> Result<Vec<RoutingObservation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, features, decision, reward, timestamp
                 FROM observations WHERE timestamp >= ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![since.to_rfc3339()], |row| {
                let features_json: String = row.get(1)?;
                let features: FeatureVector =
                    serde_json::from_str(&features_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                let decision = decode_outcome(&row.get::<_, String>(2)?)?;
                let timestamp: String = row.get(4)?;
                let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            4,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?
                    .with_timezone(&Utc);
                Ok(RoutingObservation {
                    request_id: row.get(0)?,
                    features,
                    decision,
                    reward: row.get(3)?,
                    timestamp,
                })
            })?;
            rows.collect()
        })
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM observations WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )
        })
    }

    fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM observations", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as usize)
    }

    fn get_model(&self) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT data FROM model_slot WHERE slot = 0", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
        })
    }

    fn put_model(&self, bytes: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO model_slot (slot, data, updated_at) VALUES (0, ?1, ?2)
                 ON CONFLICT(slot) DO UPDATE SET data = ?1, updated_at = ?2",
                params![bytes, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}
