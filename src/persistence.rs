//! Durable snapshot storage.
//!
//! One redb table holds the schema version and three JSON slots: terminal jobs,
//! terminal submissions, and the submissions to resume. A save replaces all of them in
//! a single write transaction.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition, TableError};

use crate::error::{Result, SatelliteError};
use crate::scheduler::store::Snapshot;

const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("satellite_state");

const VERSION_KEY: &str = "schema_version";
const JOBS_KEY: &str = "jobs";
const SUBMISSIONS_KEY: &str = "submissions";
const PENDING_KEY: &str = "pending_submissions";

pub const SNAPSHOT_VERSION: u32 = 1;

pub struct Persistence {
    db: Database,
}

impl Persistence {
    /// Open or create the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(redb::Error::from)?;
        tracing::info!(path = %path.display(), "Opened state database");
        Ok(Self { db })
    }

    /// Read the last saved snapshot. Returns `None` for a fresh database.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = match txn.open_table(STATE_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(redb::Error::from(e).into()),
        };

        let version: u32 = match table.get(VERSION_KEY).map_err(redb::Error::from)? {
            Some(raw) => serde_json::from_slice(raw.value())?,
            None => return Ok(None),
        };
        if version != SNAPSHOT_VERSION {
            return Err(SatelliteError::UnsupportedSnapshot(version));
        }

        let read_slot = |key: &str| -> Result<Option<Vec<u8>>> {
            Ok(table
                .get(key)
                .map_err(redb::Error::from)?
                .map(|raw| raw.value().to_vec()))
        };
        let mut snapshot = Snapshot::default();
        if let Some(raw) = read_slot(JOBS_KEY)? {
            snapshot.jobs = serde_json::from_slice(&raw)?;
        }
        if let Some(raw) = read_slot(SUBMISSIONS_KEY)? {
            snapshot.submissions = serde_json::from_slice(&raw)?;
        }
        if let Some(raw) = read_slot(PENDING_KEY)? {
            snapshot.pending = serde_json::from_slice(&raw)?;
        }
        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let version = serde_json::to_vec(&SNAPSHOT_VERSION)?;
        let jobs = serde_json::to_vec(&snapshot.jobs)?;
        let submissions = serde_json::to_vec(&snapshot.submissions)?;
        let pending = serde_json::to_vec(&snapshot.pending)?;

        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(STATE_TABLE).map_err(redb::Error::from)?;
            for (key, value) in [
                (VERSION_KEY, &version),
                (JOBS_KEY, &jobs),
                (SUBMISSIONS_KEY, &submissions),
                (PENDING_KEY, &pending),
            ] {
                table
                    .insert(key, value.as_slice())
                    .map_err(redb::Error::from)?;
            }
        }
        txn.commit().map_err(redb::Error::from)?;

        tracing::info!(
            jobs = snapshot.jobs.len(),
            submissions = snapshot.submissions.len(),
            pending = snapshot.pending.len(),
            "Saved state snapshot"
        );
        Ok(())
    }
}
