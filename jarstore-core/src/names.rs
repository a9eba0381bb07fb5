//! Attribute name classification.

/// Prefix for persistence-internal attributes.
pub const PERSISTENT_PREFIX: &str = "_p_";

/// Prefix for volatile attributes that are never stored.
pub const VOLATILE_PREFIX: &str = "_v_";

/// Structural names that may be touched on a ghost without tracking.
pub const SPECIAL_NAMES: &[&str] = &[
    "__class__",
    "__dict__",
    "__parent__",
    "__name__",
    "__annotations__",
];

/// How a write to an attribute name is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// Lifecycle metadata; never marks the object changed.
    Special,
    /// Transient data; never marks the object changed and is never captured.
    Volatile,
    /// Regular state; writes are dirty-tracked and captured.
    Tracked,
}

impl NameKind {
    pub fn of(name: &str) -> Self {
        if name.starts_with(PERSISTENT_PREFIX) || SPECIAL_NAMES.contains(&name) {
            Self::Special
        } else if name.starts_with(VOLATILE_PREFIX) {
            Self::Volatile
        } else {
            Self::Tracked
        }
    }

    pub fn is_tracked(self) -> bool {
        self == Self::Tracked
    }
}
