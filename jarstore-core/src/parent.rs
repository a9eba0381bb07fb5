use crate::error::{Error, Result};
use crate::jar::Oid;
use crate::object::{PersistentObject, WeakObject};

/// The logical parent of an object.
///
/// Freshly built trees hold direct references, so resolving them never
/// touches storage. Objects loaded as ghosts only know their parent's
/// identifier; that parent is fetched through the jar when asked for.
#[derive(Debug, Clone)]
pub enum Parent {
    Direct(WeakObject),
    ById(Oid),
}

impl Parent {
    pub fn direct(parent: &PersistentObject) -> Self {
        Self::Direct(parent.downgrade())
    }

    /// The parent's oid if it can be known without a jar round-trip.
    pub fn oid(&self) -> Option<Oid> {
        match self {
            Self::Direct(weak) => weak.upgrade().and_then(|parent| parent.oid()),
            Self::ById(oid) => Some(*oid),
        }
    }
}

impl From<Oid> for Parent {
    fn from(oid: Oid) -> Self {
        Self::ById(oid)
    }
}

impl From<&PersistentObject> for Parent {
    fn from(parent: &PersistentObject) -> Self {
        Self::direct(parent)
    }
}

impl PersistentObject {
    /// Resolve the parent.
    ///
    /// A direct reference is returned as is. A foreign identifier requires
    /// both a jar and an oid on this object and is fetched with
    /// `jar.get_parent(id)` on every call.
    pub async fn get_parent(&self) -> Result<Option<PersistentObject>> {
        let (parent, jar, oid) = {
            let meta = self.meta();
            (meta.parent.clone(), meta.jar.clone(), meta.oid)
        };
        match parent {
            None => Ok(None),
            Some(Parent::Direct(weak)) => weak
                .upgrade()
                .map(Some)
                .ok_or_else(|| Error::integrity("parent object has been dropped")),
            Some(Parent::ById(parent_oid)) => {
                let jar = jar.ok_or_else(|| {
                    Error::integrity(format!("object has parent {} but no jar", parent_oid))
                })?;
                if oid.is_none() {
                    return Err(Error::integrity("object has no oid"));
                }
                let parent = jar.upgrade()?.get_parent(parent_oid).await?;
                Ok(Some(parent))
            }
        }
    }

    /// Structural assignment; never marks the object changed.
    pub fn set_parent(&self, parent: impl Into<Parent>) {
        self.meta().parent = Some(parent.into());
    }

    pub fn del_parent(&self) {
        self.meta().parent = None;
    }

    /// The stored parent reference, unresolved.
    pub fn parent_ref(&self) -> Option<Parent> {
        self.meta().parent.clone()
    }

    /// The parent's oid, if known without a jar round-trip.
    pub fn parent_oid(&self) -> Option<Oid> {
        self.parent_ref().and_then(|parent| parent.oid())
    }
}
