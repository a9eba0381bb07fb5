//! Transactions over a [`Database`].
//!
//! A [`Transaction`] is the [`Jar`] objects attach to. It keeps one live
//! object per oid (the identity map), collects registered objects as pending
//! writes, and flushes them to SQLite on [`Transaction::commit`].
//!
//! Objects that are unregistered while belonging to neither a container nor
//! an owner (removed children, deleted annotations) are scheduled for
//! deletion at commit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jarstore_core::{Error, Jar, JarHandle, ObjectState, Oid, PersistentObject, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{Database, ROOT_OID, ROOT_TYPE};
use crate::models::*;

/// The lifecycle of a transaction.
///
/// - `Active`: accepting registrations
/// - `Committed`: pending writes were flushed; objects are read-only
/// - `Aborted`: pending writes were discarded; objects were invalidated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSummary {
    pub serial: i64,
    pub written: usize,
    pub deleted: usize,
}

pub struct Transaction {
    id: Uuid,
    serial: i64,
    db: Database,
    handle: JarHandle,
    read_only: bool,
    state: Mutex<TransactionState>,
    objects: Mutex<HashMap<Oid, PersistentObject>>,
    pending: Mutex<BTreeMap<Oid, PersistentObject>>,
    orphans: Mutex<BTreeSet<Oid>>,
}

impl Transaction {
    /// Start a transaction. Its serial is stamped on every object it writes.
    pub fn begin(db: &Database) -> anyhow::Result<Arc<Self>> {
        let serial = db.next_serial()?;
        Ok(Self::start(db, serial, false))
    }

    /// Start a transaction that only reads. It does not consume a serial and
    /// rejects every registration.
    pub fn begin_read_only(db: &Database) -> anyhow::Result<Arc<Self>> {
        let serial = db.last_serial()?;
        Ok(Self::start(db, serial, true))
    }

    fn start(db: &Database, serial: i64, read_only: bool) -> Arc<Self> {
        let id = Uuid::new_v4();
        tracing::debug!(txn = %id, serial, read_only, "Transaction started");

        Arc::new_cyclic(|weak: &Weak<Transaction>| {
            let jar: Weak<dyn Jar> = weak.clone();
            Self {
                id,
                serial,
                db: db.clone(),
                handle: JarHandle::from_weak(jar),
                read_only,
                state: Mutex::new(TransactionState::Active),
                objects: Mutex::new(HashMap::new()),
                pending: Mutex::new(BTreeMap::new()),
                orphans: Mutex::new(BTreeSet::new()),
            }
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn serial(&self) -> i64 {
        self.serial
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().expect("transaction lock poisoned")
    }

    /// Number of objects waiting to be written.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("transaction lock poisoned").len()
    }

    /// Whether `obj` is attached to this transaction.
    pub fn owns(&self, obj: &PersistentObject) -> bool {
        obj.jar().is_some_and(|jar| jar.same_jar(&self.handle))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::integrity(format!(
                "transaction {} is read-only",
                self.id
            )));
        }
        match self.state() {
            TransactionState::Active => Ok(()),
            state => Err(Error::integrity(format!(
                "transaction {} is {:?}, not active",
                self.id, state
            ))),
        }
    }

    fn is_orphaned(&self, oid: Oid) -> bool {
        self.orphans
            .lock()
            .expect("transaction lock poisoned")
            .contains(&oid)
    }

    fn cached(&self, oid: Oid) -> Option<PersistentObject> {
        self.objects
            .lock()
            .expect("transaction lock poisoned")
            .get(&oid)
            .cloned()
    }

    fn remember(&self, oid: Oid, obj: &PersistentObject) {
        self.objects
            .lock()
            .expect("transaction lock poisoned")
            .insert(oid, obj.clone());
    }

    /// First loaded object that is not scheduled for deletion and satisfies
    /// `matches`.
    fn find_loaded(&self, matches: impl Fn(&PersistentObject) -> bool) -> Option<PersistentObject> {
        let orphans = self.orphans.lock().expect("transaction lock poisoned").clone();
        let objects = self.objects.lock().expect("transaction lock poisoned");
        objects
            .iter()
            .find(|(oid, obj)| !orphans.contains(*oid) && matches(*obj))
            .map(|(_, obj)| obj.clone())
    }

    /// Loaded objects reachable from `oid` through parent or owner links.
    fn loaded_descendants(&self, oid: Oid) -> Vec<PersistentObject> {
        let objects = self.objects.lock().expect("transaction lock poisoned");
        let mut reached = BTreeSet::from([oid]);
        let mut found = Vec::new();
        loop {
            let before = reached.len();
            for (other_oid, obj) in objects.iter() {
                if reached.contains(other_oid) {
                    continue;
                }
                let link = obj.parent_oid().or_else(|| obj.belongs());
                if link.is_some_and(|link| reached.contains(&link)) {
                    reached.insert(*other_oid);
                    found.push(obj.clone());
                }
            }
            if reached.len() == before {
                return found;
            }
        }
    }

    /// Drop `oid` from the pending and loaded sets and schedule its row for
    /// deletion.
    fn discard(&self, oid: Oid) -> Option<PersistentObject> {
        self.pending
            .lock()
            .expect("transaction lock poisoned")
            .remove(&oid);
        self.orphans
            .lock()
            .expect("transaction lock poisoned")
            .insert(oid);
        self.objects
            .lock()
            .expect("transaction lock poisoned")
            .remove(&oid)
    }

    /// Attach a fresh object under `oid`.
    fn attach(&self, obj: &PersistentObject, oid: Oid) {
        obj.set_oid(oid);
        obj.set_jar(self.handle.clone());
        obj.set_serial(self.serial);
        self.remember(oid, obj);
    }

    /// The live object for `record`, building a ghost if it is not loaded.
    fn ghost_from_record(&self, record: ObjectRecord) -> Result<PersistentObject> {
        if let Some(obj) = self.cached(record.oid) {
            return Ok(obj);
        }
        let kind = self.db.resource_type(&record.type_name).map_err(Error::jar)?;
        let ghost = PersistentObject::ghost(kind, record.oid, self.handle.clone());
        ghost.set_serial(record.serial);
        ghost.set_size(record.size);
        ghost.set_belongs(record.belongs);
        if let Some(name) = record.name {
            ghost.set_name(name);
        }
        if let Some(parent) = record.parent_oid {
            ghost.set_parent(parent);
        }
        self.remember(record.oid, &ghost);
        Ok(ghost)
    }

    // ============================================================
    // Object lookup
    // ============================================================

    /// The object stored under `oid`, as a ghost unless already loaded.
    pub fn get(&self, oid: Oid) -> Result<PersistentObject> {
        if self.is_orphaned(oid) {
            return Err(Error::NotFound(format!("object {}", oid)));
        }
        if let Some(obj) = self.cached(oid) {
            return Ok(obj);
        }
        let record = self
            .db
            .get_record(oid)
            .map_err(Error::jar)?
            .ok_or_else(|| Error::NotFound(format!("object {}", oid)))?;
        self.ghost_from_record(record)
    }

    /// The root container, created on first use.
    pub fn root(&self) -> Result<PersistentObject> {
        match self.get(ROOT_OID) {
            Err(Error::NotFound(_)) => {}
            found => return found,
        }
        self.ensure_active()?;
        let kind = self.db.resource_type(ROOT_TYPE).map_err(Error::jar)?;
        let root = kind.instantiate();
        self.attach(&root, ROOT_OID);
        root.mark_changed()?;
        tracing::info!(txn = %self.id, "Created root container");
        Ok(root)
    }

    // ============================================================
    // Container operations
    // ============================================================

    fn container_oid(&self, parent: &PersistentObject) -> Result<Oid> {
        if !self.owns(parent) {
            return Err(Error::integrity(
                "container is not attached to this transaction",
            ));
        }
        parent
            .oid()
            .ok_or_else(|| Error::integrity("container has no oid"))
    }

    /// Insert an unsaved `child` into `parent` under `name`.
    ///
    /// Assigns the child's oid, jar, serial, parent and name, then registers
    /// it as changed.
    pub fn insert(&self, parent: &PersistentObject, name: &str, child: &PersistentObject) -> Result<()> {
        self.ensure_active()?;
        let parent_oid = self.container_oid(parent)?;
        if child.jar().is_some() {
            return Err(Error::integrity(format!(
                "cannot insert '{}': object is already attached",
                name
            )));
        }
        if self.get_child(parent, name)?.is_some() {
            return Err(Error::integrity(format!(
                "'{}' already exists in container {}",
                name, parent_oid
            )));
        }

        let oid = self.db.next_oid().map_err(Error::jar)?;
        child.set_parent(parent);
        child.set_name(name);
        self.attach(child, oid);
        child.mark_changed()?;
        tracing::debug!(txn = %self.id, %oid, parent = %parent_oid, name, "Inserted object");
        Ok(())
    }

    /// The child of `parent` called `name`, if any.
    pub fn get_child(&self, parent: &PersistentObject, name: &str) -> Result<Option<PersistentObject>> {
        let parent_oid = self.container_oid(parent)?;
        let loaded = self.find_loaded(|obj| {
            obj.parent_oid() == Some(parent_oid) && obj.name().as_deref() == Some(name)
        });
        if loaded.is_some() {
            return Ok(loaded);
        }
        match self.db.find_child(parent_oid, name).map_err(Error::jar)? {
            Some(record) if !self.is_orphaned(record.oid) => self.ghost_from_record(record).map(Some),
            _ => Ok(None),
        }
    }

    /// Names of the children of `parent`, sorted.
    pub fn keys(&self, parent: &PersistentObject) -> Result<Vec<String>> {
        let parent_oid = self.container_oid(parent)?;
        let mut names: BTreeSet<String> = self
            .db
            .get_children(parent_oid)
            .map_err(Error::jar)?
            .into_iter()
            .filter(|child| !self.is_orphaned(child.oid))
            .map(|child| child.name)
            .collect();

        let objects = self.objects.lock().expect("transaction lock poisoned");
        for obj in objects.values() {
            if obj.parent_oid() == Some(parent_oid) {
                if let Some(name) = obj.name() {
                    names.insert(name);
                }
            }
        }

        Ok(names.into_iter().collect())
    }

    /// Remove the child `name` from `parent`.
    ///
    /// The child is unregistered, scheduled for deletion, and detached. Its
    /// loaded descendants and annotations go with it; stored ones are removed
    /// by the cascading delete.
    pub fn remove(&self, parent: &PersistentObject, name: &str) -> Result<Option<PersistentObject>> {
        self.ensure_active()?;
        let Some(child) = self.get_child(parent, name)? else {
            return Ok(None);
        };

        let descendants = child
            .oid()
            .map(|oid| self.loaded_descendants(oid))
            .unwrap_or_default();
        for obj in &descendants {
            if let Some(oid) = obj.oid() {
                self.discard(oid);
            }
        }
        for obj in &descendants {
            obj.detach();
        }

        child.del_parent();
        self.unregister(&child)?;
        if let Some(oid) = child.oid() {
            self.objects
                .lock()
                .expect("transaction lock poisoned")
                .remove(&oid);
            tracing::debug!(txn = %self.id, %oid, name, "Removed object");
        }
        child.detach();
        Ok(Some(child))
    }

    /// Build the tree below `node` from stored and loaded children.
    pub fn tree(&self, node: &PersistentObject) -> Result<TreeNode> {
        let mut children = Vec::new();
        for name in self.keys(node)? {
            if let Some(child) = self.get_child(node, &name)? {
                children.push(self.tree(&child)?);
            }
        }

        Ok(TreeNode {
            oid: node.oid().unwrap_or(ROOT_OID),
            name: node.name().unwrap_or_default(),
            type_name: node.kind().name().to_string(),
            status: node.status(),
            children,
        })
    }

    // ============================================================
    // Commit / abort
    // ============================================================

    fn record_for(&self, obj: &PersistentObject, now: DateTime<Utc>) -> anyhow::Result<ObjectRecord> {
        let oid = obj
            .oid()
            .ok_or_else(|| anyhow::anyhow!("Pending object has no oid"))?;
        let state = obj
            .get_state()
            .with_context(|| format!("Failed to capture state of object {}", oid))?;
        let size = serde_json::to_vec(&state)?.len();

        Ok(ObjectRecord {
            oid,
            type_name: obj.kind().name().to_string(),
            parent_oid: obj.parent_oid(),
            belongs: obj.belongs(),
            name: obj.name(),
            serial: self.serial,
            state,
            size,
            created_at: now,
            updated_at: now,
        })
    }

    /// Write every pending object and scheduled deletion in one SQLite
    /// transaction, then mark the written objects unchanged.
    ///
    /// If storage fails the pending set is kept, so the caller can retry or
    /// abort.
    pub fn commit(&self) -> anyhow::Result<CommitSummary> {
        self.ensure_active()?;
        let pending: Vec<PersistentObject> = self
            .pending
            .lock()
            .expect("transaction lock poisoned")
            .values()
            .cloned()
            .collect();
        let orphans: Vec<Oid> = self
            .orphans
            .lock()
            .expect("transaction lock poisoned")
            .iter()
            .copied()
            .collect();

        let now = Utc::now();
        let records = pending
            .iter()
            .map(|obj| self.record_for(obj, now))
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.db
            .write_objects(&records, &orphans)
            .with_context(|| format!("Failed to commit transaction {}", self.id))?;

        self.pending.lock().expect("transaction lock poisoned").clear();
        self.orphans.lock().expect("transaction lock poisoned").clear();
        for (obj, record) in pending.iter().zip(&records) {
            obj.set_serial(self.serial);
            obj.set_size(record.size);
            obj.mark_unchanged()?;
        }
        *self.state.lock().expect("transaction lock poisoned") = TransactionState::Committed;

        tracing::info!(
            txn = %self.id,
            serial = self.serial,
            written = records.len(),
            deleted = orphans.len(),
            "Transaction committed"
        );

        Ok(CommitSummary {
            serial: self.serial,
            written: records.len(),
            deleted: orphans.len(),
        })
    }

    /// Discard pending work and invalidate every object this transaction
    /// touched. Objects it handed out must not be used afterwards.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock().expect("transaction lock poisoned");
            if *state != TransactionState::Active {
                return;
            }
            *state = TransactionState::Aborted;
        }

        let touched: Vec<PersistentObject> = self
            .objects
            .lock()
            .expect("transaction lock poisoned")
            .drain()
            .map(|(_, obj)| obj)
            .collect();
        for obj in &touched {
            if let Err(err) = obj.invalidate() {
                tracing::warn!(txn = %self.id, oid = ?obj.oid(), "Failed to invalidate object: {}", err);
            }
        }
        self.pending.lock().expect("transaction lock poisoned").clear();
        self.orphans.lock().expect("transaction lock poisoned").clear();

        tracing::info!(txn = %self.id, discarded = touched.len(), "Transaction aborted");
    }

    /// Replace any other pending, loaded or stored annotation using the same
    /// key as `obj`.
    fn replace_annotation(&self, obj: &PersistentObject, oid: Oid) -> Result<()> {
        let (Some(owner), Some(key)) = (obj.belongs(), obj.name()) else {
            return Ok(());
        };
        let same_key = |other_oid: &Oid, other: &PersistentObject| {
            *other_oid != oid
                && other.belongs() == Some(owner)
                && other.name().as_deref() == Some(key.as_str())
        };

        let mut replaced: BTreeSet<Oid> = self
            .pending
            .lock()
            .expect("transaction lock poisoned")
            .iter()
            .filter(|(other_oid, other)| same_key(*other_oid, *other))
            .map(|(other_oid, _)| *other_oid)
            .collect();
        replaced.extend(
            self.objects
                .lock()
                .expect("transaction lock poisoned")
                .iter()
                .filter(|(other_oid, other)| same_key(*other_oid, *other))
                .map(|(other_oid, _)| *other_oid),
        );
        if let Some(existing) = self.db.find_annotation(owner, &key).map_err(Error::jar)? {
            if existing.oid != oid {
                replaced.insert(existing.oid);
            }
        }

        for old in replaced {
            if let Some(stale) = self.discard(old) {
                stale.set_belongs(None);
            }
            tracing::debug!(txn = %self.id, owner = %owner, key, replaced = %old, "Annotation replaced");
        }
        Ok(())
    }
}

#[async_trait]
impl Jar for Transaction {
    fn register(&self, obj: &PersistentObject) -> Result<()> {
        self.ensure_active()?;
        if obj.jar().is_some() && !self.owns(obj) {
            return Err(Error::integrity(
                "object is attached to another transaction",
            ));
        }

        let oid = match obj.oid() {
            Some(oid) => oid,
            None => {
                let oid = self.db.next_oid().map_err(Error::jar)?;
                obj.set_oid(oid);
                oid
            }
        };
        obj.set_jar(self.handle.clone());

        self.replace_annotation(obj, oid)?;
        self.remember(oid, obj);
        self.orphans
            .lock()
            .expect("transaction lock poisoned")
            .remove(&oid);
        self.pending
            .lock()
            .expect("transaction lock poisoned")
            .insert(oid, obj.clone());
        tracing::trace!(txn = %self.id, %oid, "Registered object");
        Ok(())
    }

    fn unregister(&self, obj: &PersistentObject) -> Result<()> {
        let Some(oid) = obj.oid() else {
            return Ok(());
        };
        self.pending
            .lock()
            .expect("transaction lock poisoned")
            .remove(&oid);

        if oid != ROOT_OID && obj.parent_ref().is_none() && obj.belongs().is_none() {
            self.orphans
                .lock()
                .expect("transaction lock poisoned")
                .insert(oid);
        }
        tracing::trace!(txn = %self.id, %oid, "Unregistered object");
        Ok(())
    }

    async fn get_parent(&self, oid: Oid) -> Result<PersistentObject> {
        self.get(oid)
    }

    async fn get_annotation(&self, oid: Oid, key: &str) -> Result<PersistentObject> {
        let loaded = self.find_loaded(|obj| {
            obj.belongs() == Some(oid) && obj.name().as_deref() == Some(key)
        });
        if let Some(obj) = loaded {
            return Ok(obj);
        }
        match self.db.find_annotation(oid, key).map_err(Error::jar)? {
            Some(record) if !self.is_orphaned(record.oid) => self.ghost_from_record(record),
            _ => Err(Error::NotFound(format!(
                "annotation '{}' on object {}",
                key, oid
            ))),
        }
    }

    async fn load_state(&self, oid: Oid) -> Result<ObjectState> {
        self.db
            .get_record(oid)
            .map_err(Error::jar)?
            .map(|record| record.state)
            .ok_or_else(|| Error::NotFound(format!("object {}", oid)))
    }
}
