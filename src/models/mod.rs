//! Storage-side models for jarstore.
//!
//! # Core Concepts
//!
//! - [`ObjectRecord`]: one persisted object as stored in the `objects` table,
//!   carrying its captured state and its structural links.
//! - [`ChildEntry`]: a name/oid pair listing a container's children.
//! - [`TreeNode`]: an object with its nested children, used by the `tree`
//!   command.
//!
//! Records link objects in two ways. Tree objects have a `parent_oid` and a
//! `name` unique within that parent. Annotations have a `belongs` owner and
//! use `name` as their annotation key. An object is never both.

mod record;
mod tree;

pub use record::*;
pub use tree::*;
