use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use mnemo_core::{PersistenceError, ScopedStore, Snapshot, now_unix_ms};

use crate::error::{Result, StoreError};
use crate::schema;

/// One row of the snapshots table, without its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeEntry {
    pub scope: String,
    pub written_at: u64,
    pub bytes: usize,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    // --- Snapshots ---

    pub fn read_snapshot(&self, scope: &str) -> Result<Option<String>> {
        let body = self
            .conn
            .query_row(
                "SELECT body FROM snapshots WHERE scope = ?1",
                [scope],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }

    /// Replace the scope's snapshot.
    pub fn write_snapshot(&self, scope: &str, body: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshots (scope, body, written_at) VALUES (?1, ?2, ?3)",
            params![scope, body, now_unix_ms() as i64],
        )?;
        Ok(())
    }

    pub fn clear_snapshot(&self, scope: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM snapshots WHERE scope = ?1", [scope])?;
        Ok(removed > 0)
    }

    /// Decoded snapshot for `scope`, if one is stored.
    pub fn load_snapshot(&self, scope: &str) -> Result<Option<Snapshot>> {
        match self.read_snapshot(scope)? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| StoreError::InvalidData(format!("snapshot for {scope}: {e}"))),
            None => Ok(None),
        }
    }

    pub fn scopes(&self) -> Result<Vec<ScopeEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT scope, written_at, length(body) FROM snapshots ORDER BY scope",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let written_at: i64 = row.get(1)?;
                let bytes: i64 = row.get(2)?;
                Ok(ScopeEntry {
                    scope: row.get(0)?,
                    written_at: written_at.max(0) as u64,
                    bytes: bytes.max(0) as usize,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }
}

impl ScopedStore for Store {
    fn read(&self, scope: &str) -> std::result::Result<Option<String>, PersistenceError> {
        Ok(self.read_snapshot(scope)?)
    }

    fn write(&mut self, scope: &str, body: &str) -> std::result::Result<(), PersistenceError> {
        Ok(self.write_snapshot(scope, body)?)
    }

    fn clear(&mut self, scope: &str) -> std::result::Result<bool, PersistenceError> {
        Ok(self.clear_snapshot(scope)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_core::{
        FragmentDescriptor, FragmentType, ManualClock, Phase, Runtime, RuntimeConfig,
        TransitionSource,
    };
    use std::rc::Rc;

    fn snapshot_body(timestamp: u64) -> String {
        serde_json::to_string(&Snapshot {
            timestamp,
            generation: 0,
            trauma_level: 3.0,
            phase: Phase::Uneasy,
            active_fragments: vec![FragmentDescriptor {
                id: "f1".into(),
                kind: FragmentType::Scar,
                integrity: 0.8,
                trauma_level: 6.0,
                interaction_count: 2,
                created_at: timestamp,
                phase_at_creation: Phase::Calm,
            }],
            origin_path: "/".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_write_read_clear() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.read_snapshot("a").unwrap(), None);

        store.write_snapshot("a", &snapshot_body(1)).unwrap();
        let loaded = store.load_snapshot("a").unwrap().unwrap();
        assert_eq!(loaded.timestamp, 1);
        assert_eq!(loaded.active_fragments[0].kind, FragmentType::Scar);

        assert!(store.clear_snapshot("a").unwrap());
        assert!(!store.clear_snapshot("a").unwrap());
        assert_eq!(store.load_snapshot("a").unwrap(), None);
    }

    #[test]
    fn test_write_replaces_previous() {
        let store = Store::open_in_memory().unwrap();
        store.write_snapshot("a", &snapshot_body(1)).unwrap();
        store.write_snapshot("a", &snapshot_body(2)).unwrap();
        assert_eq!(store.load_snapshot("a").unwrap().unwrap().timestamp, 2);
        assert_eq!(store.scopes().unwrap().len(), 1);
    }

    #[test]
    fn test_scopes_are_isolated() {
        let store = Store::open_in_memory().unwrap();
        store.write_snapshot("tab-1", &snapshot_body(1)).unwrap();
        store.write_snapshot("tab-2", &snapshot_body(2)).unwrap();
        store.clear_snapshot("tab-1").unwrap();

        let scopes = store.scopes().unwrap();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].scope, "tab-2");
        assert!(scopes[0].bytes > 0);
    }

    #[test]
    fn test_corrupt_body_is_invalid_data() {
        let store = Store::open_in_memory().unwrap();
        store.write_snapshot("a", "{").unwrap();
        let err = store.load_snapshot("a").unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
        assert!(matches!(
            PersistenceError::from(err),
            PersistenceError::Corrupt(_)
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mnemo.db");
        {
            let store = Store::open(&path).unwrap();
            store.write_snapshot("a", &snapshot_body(7)).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.load_snapshot("a").unwrap().unwrap().timestamp, 7);
    }

    #[test]
    fn test_runtime_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mnemo.db");
        let clock = ManualClock::new(1_700_000_000_000);

        {
            let rt = Runtime::new(
                RuntimeConfig::default(),
                Rc::new(clock.clone()),
                Box::new(Store::open(&path).unwrap()),
            );
            rt.add_fragment(&mnemo_core::FragmentSeed::new("f1", FragmentType::Echo, 4.0));
            rt.request_transition(Phase::Fractured, TransitionSource::Manual)
                .unwrap();
            rt.suspend();
        }

        clock.advance(10_000);
        let rt = Runtime::new(
            RuntimeConfig::default(),
            Rc::new(clock.clone()),
            Box::new(Store::open(&path).unwrap()),
        );
        let resurrection = rt.resume().unwrap();
        assert_eq!(resurrection.restored, 1);
        assert_eq!(rt.bus().phase(), Phase::Fractured);
        assert_eq!(rt.cache().get("f1").unwrap().kind, FragmentType::Echo);
    }
}
