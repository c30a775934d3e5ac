use chrono::Utc;
use pbr_core::{SiteProfile, SiteRecord};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

pub const PROFILE_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Key-value persistence of [`SiteProfile`]s keyed by hostname.
///
/// Absent hostnames and absent records read as `None`; that is never an
/// error. The write helpers are read-modify-write: an absent profile starts
/// from [`SiteProfile::default_for`] and an absent record from
/// [`SiteRecord::default`]. There is no concurrency check, the last writer
/// wins.
pub trait ProfileStore: Send + Sync {
    fn get_profile(&self, hostname: &str) -> Result<Option<SiteProfile>, StorageError>;

    fn set_profile(&self, hostname: &str, profile: &SiteProfile) -> Result<(), StorageError>;

    fn update_profile(
        &self,
        hostname: &str,
        updater: &mut dyn FnMut(&mut SiteProfile),
    ) -> Result<SiteProfile, StorageError> {
        let mut profile = self
            .get_profile(hostname)?
            .unwrap_or_else(|| SiteProfile::default_for(hostname));
        updater(&mut profile);
        self.set_profile(hostname, &profile)?;
        Ok(profile)
    }

    fn get_record(&self, hostname: &str, url: &str) -> Result<Option<SiteRecord>, StorageError> {
        Ok(self
            .get_profile(hostname)?
            .and_then(|mut profile| profile.children.remove(url)))
    }

    fn add_record(
        &self,
        hostname: &str,
        url: &str,
        record: SiteRecord,
    ) -> Result<(), StorageError> {
        let mut record = Some(record);
        self.update_profile(hostname, &mut |profile| {
            if let Some(record) = record.take() {
                profile.children.insert(url.to_string(), record);
            }
        })?;
        Ok(())
    }

    /// Removes one record. Returns whether it existed; a missing profile is
    /// left missing.
    fn delete_record(&self, hostname: &str, url: &str) -> Result<bool, StorageError> {
        let Some(mut profile) = self.get_profile(hostname)? else {
            return Ok(false);
        };
        if profile.children.remove(url).is_none() {
            return Ok(false);
        }
        self.set_profile(hostname, &profile)?;
        Ok(true)
    }

    fn update_record(
        &self,
        hostname: &str,
        url: &str,
        updater: &mut dyn FnMut(&mut SiteRecord),
    ) -> Result<SiteRecord, StorageError> {
        let mut updated = SiteRecord::default();
        self.update_profile(hostname, &mut |profile| {
            let record = profile.children.entry(url.to_string()).or_default();
            updater(record);
            updated = record.clone();
        })?;
        Ok(updated)
    }
}

/// Process-local store; every operation succeeds.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, SiteProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.profiles).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.profiles).is_empty()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get_profile(&self, hostname: &str) -> Result<Option<SiteProfile>, StorageError> {
        Ok(lock(&self.profiles).get(hostname).cloned())
    }

    fn set_profile(&self, hostname: &str, profile: &SiteProfile) -> Result<(), StorageError> {
        lock(&self.profiles).insert(hostname.to_string(), profile.clone());
        Ok(())
    }

    fn update_profile(
        &self,
        hostname: &str,
        updater: &mut dyn FnMut(&mut SiteProfile),
    ) -> Result<SiteProfile, StorageError> {
        let mut profiles = lock(&self.profiles);
        let profile = profiles
            .entry(hostname.to_string())
            .or_insert_with(|| SiteProfile::default_for(hostname));
        updater(profile);
        Ok(profile.clone())
    }
}

/// One JSON document per hostname in a SQLite table.
pub struct SqliteProfileStore {
    conn: Mutex<Connection>,
}

impl SqliteProfileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        schema_version(&lock(&self.conn))
    }

    pub fn hostnames(&self) -> Result<Vec<String>, StorageError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare("SELECT hostname FROM site_profiles ORDER BY hostname")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut hostnames = Vec::new();
        for row in rows {
            hostnames.push(row?);
        }
        Ok(hostnames)
    }
}

impl ProfileStore for SqliteProfileStore {
    fn get_profile(&self, hostname: &str) -> Result<Option<SiteProfile>, StorageError> {
        read_profile(&lock(&self.conn), hostname)
    }

    fn set_profile(&self, hostname: &str, profile: &SiteProfile) -> Result<(), StorageError> {
        write_profile(&lock(&self.conn), hostname, profile)
    }

    fn update_profile(
        &self,
        hostname: &str,
        updater: &mut dyn FnMut(&mut SiteProfile),
    ) -> Result<SiteProfile, StorageError> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let mut profile =
            read_profile(&tx, hostname)?.unwrap_or_else(|| SiteProfile::default_for(hostname));
        updater(&mut profile);
        write_profile(&tx, hostname, &profile)?;
        tx.commit()?;
        Ok(profile)
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let current = schema_version(conn)?;
    if current > PROFILE_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported: PROFILE_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        conn.execute_batch(include_str!("../migrations/0001_site_profiles.sql"))?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        debug!(event = "profile_store_migrated", version = 1);
    }

    Ok(())
}

fn read_profile(conn: &Connection, hostname: &str) -> Result<Option<SiteProfile>, StorageError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT profile_json FROM site_profiles WHERE hostname = ?1",
            [hostname],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|json| {
        serde_json::from_str(&json).map_err(|err| StorageError::Serialization(err.to_string()))
    })
    .transpose()
}

fn write_profile(
    conn: &Connection,
    hostname: &str,
    profile: &SiteProfile,
) -> Result<(), StorageError> {
    let json =
        serde_json::to_string(profile).map_err(|err| StorageError::Serialization(err.to_string()))?;
    conn.execute(
        "
        INSERT INTO site_profiles (hostname, profile_json, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(hostname) DO UPDATE SET
            profile_json=excluded.profile_json,
            updated_at=excluded.updated_at
        ",
        params![hostname, json, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
