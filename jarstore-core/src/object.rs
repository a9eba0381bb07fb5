use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::jar::{JarHandle, Oid};
use crate::names::NameKind;
use crate::parent::Parent;
use crate::state::{Lifecycle, ObjectState, Status};

/// Describes the shape of a resource: its type name, declared slots, and
/// whether it carries an open instance dictionary.
///
/// A `ResourceType` is the constructor half of [`PersistentObject::reduce`];
/// storage uses its name to rebuild objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    name: String,
    slots: Vec<String>,
    has_dict: bool,
}

impl ResourceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            has_dict: true,
        }
    }

    /// Declare fixed attribute slots. Slot values are captured separately
    /// from the instance dictionary.
    pub fn with_slots<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slots.extend(slots.into_iter().map(Into::into));
        self
    }

    /// Drop the instance dictionary; only slots can hold state.
    pub fn without_dict(mut self) -> Self {
        self.has_dict = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }

    pub fn has_dict(&self) -> bool {
        self.has_dict
    }

    fn has_slot(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| slot == name)
    }

    /// Create a fresh, unsaved instance.
    pub fn instantiate(&self) -> PersistentObject {
        self.instantiate_with(Vec::new())
    }

    /// Create a fresh instance remembering constructor arguments, which
    /// [`PersistentObject::reduce`] hands back.
    pub fn instantiate_with(&self, args: Vec<Value>) -> PersistentObject {
        PersistentObject::from_parts(self.clone(), args, Meta::new(self, Residency::UpToDate))
    }
}

/// Constructor, arguments and state sufficient to rebuild an object.
#[derive(Debug, Clone)]
pub struct Reduced {
    pub constructor: ResourceType,
    pub args: Vec<Value>,
    pub state: ObjectState,
}

impl Reduced {
    pub fn rebuild(self) -> Result<PersistentObject> {
        let obj = self.constructor.instantiate_with(self.args);
        obj.set_state(self.state)?;
        Ok(obj)
    }
}

/// Whether the state of an attached object is loaded, and whether it is dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Ghost,
    UpToDate,
    Changed,
}

pub(crate) struct Meta {
    pub(crate) jar: Option<JarHandle>,
    pub(crate) oid: Option<Oid>,
    serial: Option<i64>,
    residency: Residency,
    sticky: bool,
    size: usize,
    pub(crate) belongs: Option<Oid>,
    pub(crate) parent: Option<Parent>,
    name: Option<String>,
    pub(crate) annotations: HashMap<String, PersistentObject>,
    attributes: Option<BTreeMap<String, Value>>,
    slots: BTreeMap<String, Value>,
}

impl Meta {
    fn new(kind: &ResourceType, residency: Residency) -> Self {
        Self {
            jar: None,
            oid: None,
            serial: None,
            residency,
            sticky: false,
            size: 0,
            belongs: None,
            parent: None,
            name: None,
            annotations: HashMap::new(),
            attributes: kind.has_dict.then(BTreeMap::new),
            slots: BTreeMap::new(),
        }
    }

    fn is_ghost(&self) -> bool {
        self.residency == Residency::Ghost
    }

    fn attached(&self) -> bool {
        self.jar.is_some() && self.oid.is_some()
    }

    /// Write a value into its slot or the instance dictionary, returning the
    /// previous value.
    fn store(&mut self, kind: &ResourceType, name: &str, value: Value) -> Result<Option<Value>> {
        if kind.has_slot(name) {
            return Ok(self.slots.insert(name.to_string(), value));
        }
        match self.attributes.as_mut() {
            Some(dict) => Ok(dict.insert(name.to_string(), value)),
            None => Err(Error::validation(format!(
                "{} has no attribute storage for '{}'",
                kind.name, name
            ))),
        }
    }

    fn take(&mut self, kind: &ResourceType, name: &str) -> Option<Value> {
        if kind.has_slot(name) {
            self.slots.remove(name)
        } else {
            self.attributes.as_mut().and_then(|dict| dict.remove(name))
        }
    }

    fn lookup(&self, kind: &ResourceType, name: &str) -> Option<Value> {
        if kind.has_slot(name) {
            self.slots.get(name).cloned()
        } else {
            self.attributes.as_ref().and_then(|dict| dict.get(name).cloned())
        }
    }

    /// Put back what `store`/`take` replaced. The value came out of the
    /// same slot or dictionary, so the storage it needs exists.
    fn restore(&mut self, kind: &ResourceType, name: &str, previous: Option<Value>) {
        match previous {
            Some(value) if kind.has_slot(name) => {
                self.slots.insert(name.to_string(), value);
            }
            Some(value) => {
                if let Some(dict) = self.attributes.as_mut() {
                    dict.insert(name.to_string(), value);
                }
            }
            None => {
                self.take(kind, name);
            }
        }
    }

    fn clear_state(&mut self) {
        if let Some(dict) = self.attributes.as_mut() {
            dict.clear();
        }
        self.slots.clear();
        self.annotations.clear();
    }
}

struct Inner {
    kind: ResourceType,
    args: Vec<Value>,
    meta: Mutex<Meta>,
}

/// A resource whose state is tracked for persistence.
///
/// `PersistentObject` is a cheap, clonable handle; clones share the same
/// underlying object. All mutation goes through methods on this type so that
/// every change to tracked state is observed.
///
/// The internal lock is never held while calling into a [`Jar`](crate::Jar)
/// or across an `.await`.
#[derive(Clone)]
pub struct PersistentObject {
    inner: Arc<Inner>,
}

/// Non-owning reference to a [`PersistentObject`].
#[derive(Clone)]
pub struct WeakObject(Weak<Inner>);

impl WeakObject {
    pub fn upgrade(&self) -> Option<PersistentObject> {
        self.0.upgrade().map(|inner| PersistentObject { inner })
    }
}

impl fmt::Debug for WeakObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObject")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

impl PersistentObject {
    fn from_parts(kind: ResourceType, args: Vec<Value>, meta: Meta) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                args,
                meta: Mutex::new(meta),
            }),
        }
    }

    /// Create a ghost: an attached object whose state has not been loaded.
    pub fn ghost(kind: ResourceType, oid: Oid, jar: JarHandle) -> Self {
        let mut meta = Meta::new(&kind, Residency::Ghost);
        meta.oid = Some(oid);
        meta.jar = Some(jar);
        Self::from_parts(kind, Vec::new(), meta)
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, Meta> {
        self.inner.meta.lock().expect("object lock poisoned")
    }

    pub fn kind(&self) -> &ResourceType {
        &self.inner.kind
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &PersistentObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Arc::downgrade(&self.inner))
    }

    // ============================================================
    // Identity accessors
    // ============================================================

    pub fn jar(&self) -> Option<JarHandle> {
        self.meta().jar.clone()
    }

    pub fn set_jar(&self, jar: JarHandle) {
        self.meta().jar = Some(jar);
    }

    pub fn del_jar(&self) {
        self.meta().jar = None;
    }

    pub fn oid(&self) -> Option<Oid> {
        self.meta().oid
    }

    pub fn set_oid(&self, oid: Oid) {
        self.meta().oid = Some(oid);
    }

    pub fn del_oid(&self) {
        self.meta().oid = None;
    }

    pub fn serial(&self) -> Option<i64> {
        self.meta().serial
    }

    pub fn set_serial(&self, serial: i64) {
        self.meta().serial = Some(serial);
    }

    /// Set the serial from an untyped value, as read by a storage codec.
    ///
    /// Fails with [`Error::Validation`] unless the value is an integer; the
    /// current serial is untouched on failure.
    pub fn set_serial_value(&self, value: &Value) -> Result<()> {
        let serial = value
            .as_i64()
            .ok_or_else(|| Error::validation(format!("Invalid serial type: {}", value)))?;
        self.set_serial(serial);
        Ok(())
    }

    pub fn del_serial(&self) {
        self.meta().serial = None;
    }

    /// Identifier within the parent's namespace, or the annotation key.
    pub fn name(&self) -> Option<String> {
        self.meta().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.meta().name = Some(name.into());
    }

    pub fn del_name(&self) {
        self.meta().name = None;
    }

    /// Oid of the object this annotation belongs to.
    pub fn belongs(&self) -> Option<Oid> {
        self.meta().belongs
    }

    pub fn set_belongs(&self, owner: Option<Oid>) {
        self.meta().belongs = owner;
    }

    /// Last-known encoded size, as stamped by storage.
    pub fn size(&self) -> usize {
        self.meta().size
    }

    pub fn set_size(&self, size: usize) {
        self.meta().size = size;
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    /// `Some(false)` when unattached, `None` for a ghost, otherwise whether
    /// the object has changed since it was last saved.
    pub fn is_changed(&self) -> Option<bool> {
        let meta = self.meta();
        if meta.jar.is_none() {
            return Some(false);
        }
        match meta.residency {
            Residency::Ghost => None,
            Residency::UpToDate => Some(false),
            Residency::Changed => Some(true),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        let meta = self.meta();
        if meta.jar.is_none() {
            return Lifecycle::Unsaved;
        }
        match meta.residency {
            Residency::Ghost => Lifecycle::Ghost,
            Residency::UpToDate => Lifecycle::UpToDate,
            Residency::Changed => Lifecycle::Changed,
        }
    }

    pub fn status(&self) -> Status {
        let meta = self.meta();
        if meta.jar.is_none() {
            Status::Unsaved
        } else if meta.is_ghost() {
            Status::Ghost
        } else if meta.sticky {
            Status::Sticky
        } else if meta.residency == Residency::Changed {
            Status::Changed
        } else {
            Status::Saved
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.meta().sticky
    }

    /// Pin the object so it is not deactivated.
    pub fn set_sticky(&self, sticky: bool) -> Result<()> {
        let mut meta = self.meta();
        if sticky && meta.is_ghost() {
            return Err(Error::validation("cannot set the sticky flag on a ghost"));
        }
        meta.sticky = sticky;
        Ok(())
    }

    /// Flag an attached, loaded object as changed and register it with its
    /// jar. Repeated calls while already changed do nothing.
    pub fn mark_changed(&self) -> Result<()> {
        {
            let mut meta = self.meta();
            if !meta.attached() || meta.residency != Residency::UpToDate {
                return Ok(());
            }
            meta.residency = Residency::Changed;
        }
        if let Err(err) = self.register() {
            self.meta().residency = Residency::UpToDate;
            return Err(err);
        }
        tracing::debug!(oid = ?self.oid(), "Object marked changed");
        Ok(())
    }

    /// Clear the changed flag and unregister from the jar. Does nothing
    /// unless the object is currently changed.
    pub fn mark_unchanged(&self) -> Result<()> {
        {
            let mut meta = self.meta();
            if meta.residency != Residency::Changed {
                return Ok(());
            }
            meta.residency = Residency::UpToDate;
        }
        if let Err(err) = self.unregister() {
            self.meta().residency = Residency::Changed;
            return Err(err);
        }
        tracing::debug!(oid = ?self.oid(), "Object marked unchanged");
        Ok(())
    }

    fn register(&self) -> Result<()> {
        let jar = {
            let meta = self.meta();
            if !meta.attached() {
                return Ok(());
            }
            meta.jar.clone()
        };
        match jar {
            Some(jar) => jar.upgrade()?.register(self),
            None => Ok(()),
        }
    }

    fn unregister(&self) -> Result<()> {
        let jar = {
            let meta = self.meta();
            if !meta.attached() {
                return Ok(());
            }
            meta.jar.clone()
        };
        match jar {
            Some(jar) => jar.upgrade()?.unregister(self),
            None => Ok(()),
        }
    }

    /// Load the state of a ghost from its jar. Loaded objects are untouched.
    pub async fn activate(&self) -> Result<()> {
        let (jar, oid) = {
            let meta = self.meta();
            if !meta.is_ghost() {
                return Ok(());
            }
            (meta.jar.clone(), meta.oid)
        };
        let jar = jar.ok_or_else(|| Error::integrity("ghost has no jar"))?;
        let oid = oid.ok_or_else(|| Error::integrity("ghost has no oid"))?;
        let state = jar.upgrade()?.load_state(oid).await?;
        self.set_state(state)?;
        self.meta().residency = Residency::UpToDate;
        tracing::debug!(%oid, "Activated ghost");
        Ok(())
    }

    /// Drop the loaded state of an up-to-date, non-sticky attached object,
    /// turning it back into a ghost. Returns whether it was deactivated.
    pub fn deactivate(&self) -> bool {
        let mut meta = self.meta();
        if !meta.attached() || meta.sticky || meta.residency != Residency::UpToDate {
            return false;
        }
        meta.clear_state();
        meta.residency = Residency::Ghost;
        true
    }

    /// Discard in-memory state unconditionally. A changed object is
    /// unregistered first; unsaved objects are left alone.
    pub fn invalidate(&self) -> Result<()> {
        if self.meta().jar.is_none() {
            return Ok(());
        }
        if self.meta().residency == Residency::Changed {
            self.unregister()?;
        }
        let mut meta = self.meta();
        meta.clear_state();
        meta.sticky = false;
        meta.residency = Residency::Ghost;
        Ok(())
    }

    /// Return the object to the unsaved state: no jar, oid, serial, parent or
    /// name. Loaded state is kept.
    pub fn detach(&self) {
        let mut meta = self.meta();
        meta.jar = None;
        meta.oid = None;
        meta.serial = None;
        meta.parent = None;
        meta.name = None;
        meta.sticky = false;
        meta.residency = Residency::UpToDate;
    }

    // ============================================================
    // Attribute access
    // ============================================================

    fn ghost_error(meta: &Meta) -> Error {
        match meta.oid {
            Some(oid) => Error::integrity(format!("object {} is a ghost; activate it first", oid)),
            None => Error::integrity("object is a ghost; activate it first"),
        }
    }

    /// Read an attribute. Tracked names cannot be read from a ghost.
    pub fn get_attr(&self, name: &str) -> Result<Option<Value>> {
        let meta = self.meta();
        if meta.is_ghost() && NameKind::of(name).is_tracked() {
            return Err(Self::ghost_error(&meta));
        }
        Ok(meta.lookup(&self.inner.kind, name))
    }

    /// Write an attribute.
    ///
    /// For tracked names on an attached object the write flips the object to
    /// changed and registers it with the jar, once per transition. If that
    /// registration fails, both the write and the flag are rolled back.
    pub fn set_attr(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let kind = &self.inner.kind;
        let tracked = NameKind::of(name).is_tracked();
        let previous = {
            let mut meta = self.meta();
            if meta.is_ghost() && tracked {
                return Err(Self::ghost_error(&meta));
            }
            let previous = meta.store(kind, name, value.into())?;
            if !(tracked && meta.attached() && meta.residency == Residency::UpToDate) {
                return Ok(());
            }
            meta.residency = Residency::Changed;
            previous
        };
        if let Err(err) = self.register() {
            let mut meta = self.meta();
            meta.residency = Residency::UpToDate;
            meta.restore(kind, name, previous);
            return Err(err);
        }
        tracing::debug!(oid = ?self.oid(), attribute = name, "Object changed by write");
        Ok(())
    }

    /// Remove an attribute, with the same tracking rules as [`set_attr`].
    ///
    /// [`set_attr`]: PersistentObject::set_attr
    pub fn del_attr(&self, name: &str) -> Result<Option<Value>> {
        let kind = &self.inner.kind;
        let tracked = NameKind::of(name).is_tracked();
        let removed = {
            let mut meta = self.meta();
            if meta.is_ghost() && tracked {
                return Err(Self::ghost_error(&meta));
            }
            let removed = meta.take(kind, name);
            if removed.is_none()
                || !(tracked && meta.attached() && meta.residency == Residency::UpToDate)
            {
                return Ok(removed);
            }
            meta.residency = Residency::Changed;
            removed
        };
        if let Err(err) = self.register() {
            let mut meta = self.meta();
            meta.residency = Residency::UpToDate;
            meta.restore(kind, name, removed);
            return Err(err);
        }
        Ok(removed)
    }

    // ============================================================
    // State capture
    // ============================================================

    fn persistent_slots(&self) -> impl Iterator<Item = &String> {
        self.inner
            .kind
            .slots
            .iter()
            .filter(|slot| NameKind::of(slot).is_tracked())
    }

    /// Capture tracked instance attributes and slot values.
    pub fn get_state(&self) -> Result<ObjectState> {
        let meta = self.meta();
        if meta.is_ghost() {
            return Err(Self::ghost_error(&meta));
        }
        let attributes = meta.attributes.as_ref().map(|dict| {
            dict.iter()
                .filter(|(name, _)| NameKind::of(name).is_tracked())
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        });
        let slots = self
            .persistent_slots()
            .filter_map(|slot| meta.slots.get(slot).map(|value| (slot.clone(), value.clone())))
            .collect();
        Ok(ObjectState { attributes, slots })
    }

    /// Replace the instance dictionary with `state` and assign its slots.
    ///
    /// Restoring is not a mutation: it never marks the object changed.
    pub fn set_state(&self, state: ObjectState) -> Result<()> {
        let kind = &self.inner.kind;
        let mut meta = self.meta();
        if state.attributes.is_some() && meta.attributes.is_none() {
            return Err(Error::integrity("No instance dict"));
        }
        if let Some(unknown) = state.slots.keys().find(|slot| !kind.has_slot(slot)) {
            return Err(Error::validation(format!(
                "{} has no slot '{}'",
                kind.name, unknown
            )));
        }
        if let (Some(dict), Some(attributes)) = (meta.attributes.as_mut(), state.attributes) {
            dict.clear();
            dict.extend(attributes);
        }
        meta.slots.extend(state.slots);
        Ok(())
    }

    /// Constructor, arguments and captured state for a storage codec.
    pub fn reduce(&self) -> Result<Reduced> {
        Ok(Reduced {
            constructor: self.inner.kind.clone(),
            args: self.inner.args.clone(),
            state: self.get_state()?,
        })
    }
}

impl fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta();
        f.debug_struct("PersistentObject")
            .field("kind", &self.inner.kind.name)
            .field("oid", &meta.oid)
            .field("serial", &meta.serial)
            .field("residency", &meta.residency)
            .field("name", &meta.name)
            .finish()
    }
}
