mod schema;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::Utc;
use jarstore_core::{Oid, ResourceType};
use rusqlite::{Connection, Params, Row};

use crate::models::*;

/// Oid of the root container every tree hangs off.
pub const ROOT_OID: Oid = Oid(0);

/// Type name of the built-in root container.
pub const ROOT_TYPE: &str = "Root";

const RECORD_COLUMNS: &str =
    "oid, type_name, parent_oid, belongs, name, serial, state, size, created_at, updated_at";

/// SQLite-backed object storage.
///
/// Besides the rows, a `Database` carries the registry of [`ResourceType`]s
/// used to rebuild stored objects by type name.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    types: Arc<RwLock<HashMap<String, ResourceType>>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_default() -> Result<Self> {
        Self::open(default_path()?)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            types: Arc::new(RwLock::new(HashMap::new())),
        };
        db.register_type(ResourceType::new(ROOT_TYPE));
        Ok(db)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Type registry
    // ============================================================

    /// Make `kind` available for rebuilding stored objects of its name.
    pub fn register_type(&self, kind: ResourceType) {
        self.types
            .write()
            .expect("type registry lock poisoned")
            .insert(kind.name().to_string(), kind);
    }

    /// Register a plain type for every stored type name not yet known, so
    /// tools without the application's types can still walk the store.
    pub fn register_stored_types(&self) -> Result<()> {
        let names: Vec<String> = {
            let conn = self.conn.lock().expect("database lock poisoned");
            let mut stmt = conn.prepare("SELECT DISTINCT type_name FROM objects")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            names
        };

        let mut types = self.types.write().expect("type registry lock poisoned");
        for name in names {
            types
                .entry(name.clone())
                .or_insert_with(|| ResourceType::new(name));
        }
        Ok(())
    }

    pub fn resource_type(&self, name: &str) -> Result<ResourceType> {
        self.types
            .read()
            .expect("type registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown resource type '{}'", name))
    }

    // ============================================================
    // Sequences
    // ============================================================

    pub fn next_oid(&self) -> Result<Oid> {
        self.next_in_sequence("oid").map(Oid)
    }

    pub fn next_serial(&self) -> Result<i64> {
        self.next_in_sequence("serial")
    }

    /// Serial handed to the most recent transaction, without advancing it.
    pub fn last_serial(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let value = conn.query_row(
            "SELECT value FROM sequences WHERE name = 'serial'",
            [],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    fn next_in_sequence(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let value = conn
            .query_row(
                "UPDATE sequences SET value = value + 1 WHERE name = ? RETURNING value",
                [name],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to advance sequence '{}'", name))?;
        Ok(value)
    }

    // ============================================================
    // Object reads
    // ============================================================

    pub fn get_record(&self, oid: Oid) -> Result<Option<ObjectRecord>> {
        self.query_record("oid = ?", [oid.0])
    }

    pub fn find_child(&self, parent: Oid, name: &str) -> Result<Option<ObjectRecord>> {
        self.query_record("parent_oid = ? AND name = ?", (parent.0, name))
    }

    pub fn find_annotation(&self, owner: Oid, key: &str) -> Result<Option<ObjectRecord>> {
        self.query_record("belongs = ? AND name = ?", (owner.0, key))
    }

    fn query_record<P: Params>(&self, filter: &str, params: P) -> Result<Option<ObjectRecord>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM objects WHERE {}",
            RECORD_COLUMNS, filter
        ))?;

        let mut rows = stmt.query(params)?;
        if let Some(row) = rows.next()? {
            Ok(Some(record_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_children(&self, parent: Oid) -> Result<Vec<ChildEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT oid, name, type_name FROM objects WHERE parent_oid = ? ORDER BY name",
        )?;

        let children = stmt
            .query_map([parent.0], |row| {
                Ok(ChildEntry {
                    oid: Oid(row.get(0)?),
                    name: row.get(1)?,
                    type_name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(children)
    }

    pub fn get_annotation_keys(&self, owner: Oid) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare("SELECT name FROM objects WHERE belongs = ? ORDER BY name")?;

        let keys = stmt
            .query_map([owner.0], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(keys)
    }

    pub fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let (objects, annotations, total_size): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(belongs), COALESCE(SUM(size), 0) FROM objects",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        drop(conn);
        let last_serial = self.last_serial()?;

        Ok(StoreStats {
            objects,
            annotations,
            last_serial,
            total_size,
        })
    }

    // ============================================================
    // Object writes
    // ============================================================

    /// Apply deletions then upserts atomically.
    ///
    /// Deleting an object cascades to its children and annotations.
    pub fn write_objects(&self, records: &[ObjectRecord], deletes: &[Oid]) -> Result<()> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        for oid in deletes {
            tx.execute("DELETE FROM objects WHERE oid = ?", [oid.0])?;
        }

        for record in records {
            let state = serde_json::to_string(&record.state)?;
            tx.execute(
                "INSERT INTO objects (oid, type_name, parent_oid, belongs, name, serial, state, size, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(oid) DO UPDATE SET
                    type_name = excluded.type_name,
                    parent_oid = excluded.parent_oid,
                    belongs = excluded.belongs,
                    name = excluded.name,
                    serial = excluded.serial,
                    state = excluded.state,
                    size = excluded.size,
                    updated_at = excluded.updated_at",
                (
                    record.oid.0,
                    &record.type_name,
                    record.parent_oid.map(|oid| oid.0),
                    record.belongs.map(|oid| oid.0),
                    &record.name,
                    record.serial,
                    state,
                    record.size as i64,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ),
            )
            .with_context(|| format!("Failed to write object {}", record.oid))?;
        }

        tx.commit()?;
        Ok(())
    }
}

/// Database location under the platform data directory.
pub fn default_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "jarstore")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    Ok(dirs.data_dir().join("jarstore.db"))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let state: String = row.get(6)?;
    let state = serde_json::from_str(&state).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ObjectRecord {
        oid: Oid(row.get(0)?),
        type_name: row.get(1)?,
        parent_oid: row.get::<_, Option<i64>>(2)?.map(Oid),
        belongs: row.get::<_, Option<i64>>(3)?.map(Oid),
        name: row.get(4)?,
        serial: row.get(5)?,
        state,
        size: row.get::<_, i64>(7)?.max(0) as usize,
        created_at: parse_datetime(row.get::<_, String>(8)?),
        updated_at: parse_datetime(row.get::<_, String>(9)?),
    })
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
