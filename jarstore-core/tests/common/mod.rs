//! Shared test jar for the kernel specs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jarstore_core::*;

/// A jar that records every call and serves canned objects.
#[derive(Default)]
pub struct RecordingJar {
    pub registered: Mutex<Vec<Option<Oid>>>,
    pub unregistered: Mutex<Vec<Option<Oid>>>,
    pub parent_lookups: Mutex<Vec<Oid>>,
    pub annotation_lookups: Mutex<Vec<(Oid, String)>>,
    pub parents: Mutex<HashMap<Oid, PersistentObject>>,
    pub annotations: Mutex<HashMap<(Oid, String), PersistentObject>>,
    pub states: Mutex<HashMap<Oid, ObjectState>>,
    pub fail_register: Mutex<bool>,
    pub seen_belongs: Mutex<Vec<Option<Oid>>>,
    pub watched_owner: Mutex<Option<PersistentObject>>,
    pub seen_cached: Mutex<Vec<Vec<String>>>,
}

impl RecordingJar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_count(&self) -> usize {
        self.registered.lock().unwrap().len()
    }

    pub fn unregister_count(&self) -> usize {
        self.unregistered.lock().unwrap().len()
    }

    pub fn fail_registrations(&self) {
        *self.fail_register.lock().unwrap() = true;
    }

    pub fn add_parent(&self, oid: Oid, obj: PersistentObject) {
        self.parents.lock().unwrap().insert(oid, obj);
    }

    pub fn add_annotation(&self, owner: Oid, key: &str, obj: PersistentObject) {
        self.annotations
            .lock()
            .unwrap()
            .insert((owner, key.to_string()), obj);
    }

    /// Record `owner`'s annotation cache at every registration.
    pub fn watch_owner(&self, owner: &PersistentObject) {
        *self.watched_owner.lock().unwrap() = Some(owner.clone());
    }

    pub fn add_state(&self, oid: Oid, state: ObjectState) {
        self.states.lock().unwrap().insert(oid, state);
    }
}

#[async_trait]
impl Jar for RecordingJar {
    fn register(&self, obj: &PersistentObject) -> Result<()> {
        if *self.fail_register.lock().unwrap() {
            return Err(Error::jar("storage offline"));
        }
        self.seen_belongs.lock().unwrap().push(obj.belongs());
        if let Some(owner) = self.watched_owner.lock().unwrap().as_ref() {
            self.seen_cached
                .lock()
                .unwrap()
                .push(owner.cached_annotation_keys());
        }
        self.registered.lock().unwrap().push(obj.oid());
        Ok(())
    }

    fn unregister(&self, obj: &PersistentObject) -> Result<()> {
        self.unregistered.lock().unwrap().push(obj.oid());
        Ok(())
    }

    async fn get_parent(&self, oid: Oid) -> Result<PersistentObject> {
        self.parent_lookups.lock().unwrap().push(oid);
        self.parents
            .lock()
            .unwrap()
            .get(&oid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object {}", oid)))
    }

    async fn get_annotation(&self, oid: Oid, key: &str) -> Result<PersistentObject> {
        self.annotation_lookups
            .lock()
            .unwrap()
            .push((oid, key.to_string()));
        self.annotations
            .lock()
            .unwrap()
            .get(&(oid, key.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("annotation '{}' on {}", key, oid)))
    }

    async fn load_state(&self, oid: Oid) -> Result<ObjectState> {
        self.states
            .lock()
            .unwrap()
            .get(&oid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("state of {}", oid)))
    }
}

pub fn item_type() -> ResourceType {
    ResourceType::new("Item")
}

/// A fresh object attached to `jar` under `oid`, up to date.
pub fn attached(jar: &Arc<RecordingJar>, oid: i64) -> PersistentObject {
    let obj = item_type().instantiate();
    obj.set_jar(JarHandle::new(jar));
    obj.set_oid(Oid(oid));
    obj
}
