use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};

use super::IdentityStore;
use crate::open_db_connection;

/// Identities held in memory; used by tests and for fixed deployments.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    known: RwLock<HashMap<String, Vec<f32>>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(known: HashMap<String, Vec<f32>>) -> Self {
        Self {
            known: RwLock::new(known),
        }
    }

    pub fn insert(&self, identity: impl Into<String>, features: Vec<f32>) -> Result<()> {
        self.known
            .write()
            .map_err(|_| anyhow!("identity store lock poisoned"))?
            .insert(identity.into(), features);
        Ok(())
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn list_known(&self) -> Result<HashMap<String, Vec<f32>>> {
        Ok(self
            .known
            .read()
            .map_err(|_| anyhow!("identity store lock poisoned"))?
            .clone())
    }
}

/// `identities` table: one L2-normalised vector per identity, stored as
/// little-endian f32 bytes.
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open identity database {}", db_path))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
              identity TEXT PRIMARY KEY,
              dims INTEGER NOT NULL,
              features BLOB NOT NULL,
              enrolled_at REAL NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace an identity's feature vector.
    pub fn enroll(&self, identity: &str, features: &[f32]) -> Result<()> {
        if identity.trim().is_empty() {
            return Err(anyhow!("identity name must not be empty"));
        }
        if features.is_empty() {
            return Err(anyhow!("feature vector for '{}' is empty", identity));
        }
        let blob: Vec<u8> = features.iter().flat_map(|v| v.to_le_bytes()).collect();
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("identity database lock poisoned"))?;
        conn.execute(
            r#"
            INSERT INTO identities(identity, dims, features, enrolled_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(identity) DO UPDATE SET
              dims = excluded.dims,
              features = excluded.features,
              enrolled_at = excluded.enrolled_at
            "#,
            params![identity, features.len() as i64, blob, crate::now_s()],
        )?;
        Ok(())
    }

    pub fn remove(&self, identity: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("identity database lock poisoned"))?;
        let n = conn.execute("DELETE FROM identities WHERE identity = ?1", params![identity])?;
        Ok(n > 0)
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn list_known(&self) -> Result<HashMap<String, Vec<f32>>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("identity database lock poisoned"))?;
        let mut stmt = conn.prepare("SELECT identity, dims, features FROM identities")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut known = HashMap::new();
        for row in rows {
            let (identity, dims, blob) = row?;
            if blob.len() != dims as usize * 4 {
                return Err(anyhow!(
                    "corrupt identity '{}': {} bytes for {} dims",
                    identity,
                    blob.len(),
                    dims
                ));
            }
            let features = blob
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            known.insert(identity, features);
        }
        Ok(known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory_uri;

    #[test]
    fn sqlite_store_round_trips_vectors() -> Result<()> {
        let store = SqliteIdentityStore::open(&shared_memory_uri())?;
        store.enroll("alice", &[0.6, 0.8])?;
        store.enroll("bob", &[1.0, 0.0, 0.0])?;
        store.enroll("alice", &[0.0, 1.0])?;

        let known = store.list_known()?;
        assert_eq!(known.len(), 2);
        assert_eq!(known["alice"], vec![0.0, 1.0]);
        assert_eq!(known["bob"], vec![1.0, 0.0, 0.0]);

        assert!(store.remove("bob")?);
        assert!(!store.remove("bob")?);
        assert_eq!(store.list_known()?.len(), 1);
        Ok(())
    }

    #[test]
    fn sqlite_store_rejects_empty_enrolment() -> Result<()> {
        let store = SqliteIdentityStore::open(&shared_memory_uri())?;
        assert!(store.enroll("", &[1.0]).is_err());
        assert!(store.enroll("carol", &[]).is_err());
        Ok(())
    }

    #[test]
    fn in_memory_store_lists_inserted() -> Result<()> {
        let store = InMemoryIdentityStore::new();
        store.insert("alice", vec![1.0])?;
        assert_eq!(store.list_known()?["alice"], vec![1.0]);
        Ok(())
    }
}
