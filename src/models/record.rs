use chrono::{DateTime, Utc};
use jarstore_core::{ObjectState, Oid};
use serde::{Deserialize, Serialize};

/// A persisted object.
///
/// `serial` is the serial of the transaction that last wrote the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub oid: Oid,
    pub type_name: String,
    /// Container holding this object. Mutually exclusive with `belongs`.
    pub parent_oid: Option<Oid>,
    /// Owner of this annotation. Mutually exclusive with `parent_oid`.
    pub belongs: Option<Oid>,
    /// Name within the parent, or the annotation key.
    pub name: Option<String>,
    pub serial: i64,
    pub state: ObjectState,
    /// Size in bytes of the encoded state.
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn is_annotation(&self) -> bool {
        self.belongs.is_some()
    }
}

/// A child listed under its container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub oid: Oid,
    pub name: String,
    pub type_name: String,
}

/// Aggregate counts over the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub objects: i64,
    pub annotations: i64,
    /// Serial handed to the most recent transaction.
    pub last_serial: i64,
    pub total_size: i64,
}
