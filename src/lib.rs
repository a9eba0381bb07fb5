//! SQLite-backed object store built on the `jarstore-core` kernel.
//!
//! A [`txn::Transaction`] implements the kernel's `Jar` contract: objects
//! attached to it report their changes, and `commit` writes the changed set to
//! the [`db::Database`] in one SQLite transaction.

pub mod config;
pub mod db;
pub mod models;
pub mod tree_render;
pub mod txn;

pub use jarstore_core as kernel;
