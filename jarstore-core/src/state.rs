use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The load/dirty state of a persistent object.
///
/// - `Unsaved`: not attached to a jar; writes have no side effects
/// - `Ghost`: identity known, state not loaded from storage
/// - `UpToDate`: state loaded and unchanged since the last save
/// - `Changed`: state modified since the last save, registered with the jar
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Unsaved,
    Ghost,
    UpToDate,
    Changed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsaved => "unsaved",
            Self::Ghost => "ghost",
            Self::UpToDate => "up_to_date",
            Self::Changed => "changed",
        }
    }
}

/// Diagnostic status of an object, derived in priority order from the jar,
/// the lifecycle and the sticky pin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Unsaved,
    Ghost,
    Sticky,
    Changed,
    Saved,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsaved => "unsaved",
            Self::Ghost => "ghost",
            Self::Sticky => "sticky",
            Self::Changed => "changed",
            Self::Saved => "saved",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unsaved" => Some(Self::Unsaved),
            "ghost" => Some(Self::Ghost),
            "sticky" => Some(Self::Sticky),
            "changed" => Some(Self::Changed),
            "saved" => Some(Self::Saved),
            _ => None,
        }
    }
}

/// Captured state of an object, handed to and received from a storage codec.
///
/// `attributes` is `None` for types without an instance dictionary. Special
/// and volatile names never appear in either map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub attributes: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub slots: BTreeMap<String, Value>,
}

impl ObjectState {
    /// State carrying only instance attributes.
    pub fn with_attributes(attributes: BTreeMap<String, Value>) -> Self {
        Self {
            attributes: Some(attributes),
            slots: BTreeMap::new(),
        }
    }
}
