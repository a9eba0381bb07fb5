use crate::error::{Error, Result};
use crate::object::PersistentObject;

impl PersistentObject {
    /// Fetch the annotation stored under `key`, from the local cache or
    /// through the jar. Fetched annotations are cached.
    pub async fn get_annotation(&self, key: &str) -> Result<PersistentObject> {
        let (jar, oid) = {
            let meta = self.meta();
            if let Some(cached) = meta.annotations.get(key) {
                return Ok(cached.clone());
            }
            (meta.jar.clone(), meta.oid)
        };
        let jar = jar.ok_or_else(|| {
            Error::integrity(format!("cannot load annotation '{}' without a jar", key))
        })?;
        let oid = oid.ok_or_else(|| {
            Error::integrity(format!("cannot load annotation '{}' without an oid", key))
        })?;
        let value = jar.upgrade()?.get_annotation(oid, key).await?;
        self.meta()
            .annotations
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Attach `value` as the annotation `key`.
    ///
    /// The annotation is stamped with this object's oid and cached before the
    /// jar sees it, so registration can rely on the link. A failed
    /// registration restores the previous cache entry.
    pub async fn set_annotation(&self, key: &str, value: &PersistentObject) -> Result<()> {
        let (oid, jar) = {
            let meta = self.meta();
            (meta.oid, meta.jar.clone())
        };
        let oid = oid.ok_or_else(|| {
            Error::integrity(format!("cannot set annotation '{}' without an oid", key))
        })?;
        let jar = jar
            .ok_or_else(|| Error::integrity(format!("cannot set annotation '{}' without a jar", key)))?
            .upgrade()?;

        value.set_belongs(Some(oid));
        value.set_name(key);
        let previous = self
            .meta()
            .annotations
            .insert(key.to_string(), value.clone());

        if let Err(err) = jar.register(value) {
            let mut meta = self.meta();
            match previous {
                Some(previous) => meta.annotations.insert(key.to_string(), previous),
                None => meta.annotations.remove(key),
            };
            return Err(err);
        }
        tracing::debug!(owner = %oid, key, "Annotation set");
        Ok(())
    }

    /// Drop the annotation `key` from the cache and unregister it. Absent
    /// keys are a no-op.
    pub async fn del_annotation(&self, key: &str) -> Result<()> {
        let (value, jar) = {
            let mut meta = self.meta();
            match meta.annotations.remove(key) {
                Some(value) => (value, meta.jar.clone()),
                None => return Ok(()),
            }
        };
        let owner = value.belongs();
        value.set_belongs(None);

        let unregistered = match jar {
            Some(jar) => jar.upgrade().and_then(|jar| jar.unregister(&value)),
            None => Ok(()),
        };
        if let Err(err) = unregistered {
            value.set_belongs(owner);
            self.meta().annotations.insert(key.to_string(), value);
            return Err(err);
        }
        tracing::debug!(key, "Annotation removed");
        Ok(())
    }

    /// Keys of the annotations currently cached on this object.
    pub fn cached_annotation_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.meta().annotations.keys().cloned().collect();
        keys.sort();
        keys
    }
}
