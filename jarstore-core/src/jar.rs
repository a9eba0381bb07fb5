use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::PersistentObject;
use crate::state::ObjectState;

/// Durable identifier of an object within a jar's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(pub i64);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Oid {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// The transaction-scoped coordinator that loads, registers and persists
/// objects.
///
/// `register` and `unregister` are synchronous because they run inside an
/// attribute write. Implementations receive the object without any kernel
/// lock held and may read it freely.
#[async_trait]
pub trait Jar: Send + Sync {
    /// Add `obj` to the pending-write set. Idempotent until commit.
    fn register(&self, obj: &PersistentObject) -> Result<()>;

    /// Remove `obj` from the pending-write set. No-op if absent.
    fn unregister(&self, obj: &PersistentObject) -> Result<()>;

    /// Resolve the object stored under `oid`.
    async fn get_parent(&self, oid: Oid) -> Result<PersistentObject>;

    /// Resolve the annotation stored under `key` for the owner `oid`.
    async fn get_annotation(&self, oid: Oid, key: &str) -> Result<PersistentObject>;

    /// Load the stored state of `oid`, used to activate ghosts.
    async fn load_state(&self, oid: Oid) -> Result<ObjectState> {
        Err(Error::integrity(format!(
            "jar cannot load state for object {}",
            oid
        )))
    }
}

/// Non-owning back-reference from an object to its jar.
#[derive(Clone)]
pub struct JarHandle(Weak<dyn Jar>);

impl JarHandle {
    pub fn new<J: Jar + 'static>(jar: &Arc<J>) -> Self {
        let weak: Weak<J> = Arc::downgrade(jar);
        let weak: Weak<dyn Jar> = weak;
        Self(weak)
    }

    pub fn from_weak(weak: Weak<dyn Jar>) -> Self {
        Self(weak)
    }

    /// The live jar, or an integrity error once the jar has been dropped.
    pub fn upgrade(&self) -> Result<Arc<dyn Jar>> {
        self.0
            .upgrade()
            .ok_or_else(|| Error::integrity("transaction jar has been dropped"))
    }

    pub fn same_jar(&self, other: &JarHandle) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for JarHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JarHandle")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}
