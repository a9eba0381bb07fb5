//! Persistent-object kernel for jarstore.
//!
//! # Core Concepts
//!
//! - [`PersistentObject`]: a resource whose mutations are observed. Every write
//!   goes through [`PersistentObject::set_attr`], which flips the object to
//!   `Changed` and registers it with its [`Jar`] exactly once per transition.
//! - [`Jar`]: the transaction-scoped coordinator an object is attached to. The
//!   kernel only holds a non-owning [`JarHandle`] to it.
//! - [`Parent`]: an object's logical parent, held either as a direct reference
//!   or as a foreign [`Oid`] that is resolved through the jar on demand.
//! - Annotations: named auxiliary objects owned by another object, loaded
//!   lazily through the jar and cached on the owner.
//!
//! # Lifecycle
//!
//! Objects move through `Unsaved → Ghost → UpToDate ⇄ Changed`. A ghost knows
//! its identity but not its state; [`PersistentObject::activate`] loads it.

mod annotations;
mod error;
mod jar;
mod names;
mod object;
mod parent;
mod state;

pub use error::*;
pub use jar::*;
pub use names::*;
pub use object::*;
pub use parent::*;
pub use state::*;
