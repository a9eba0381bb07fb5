use jarstore_core::{Oid, Status};
use serde::{Deserialize, Serialize};

/// An object with its nested children, used for tree output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub oid: Oid,
    pub name: String,
    pub type_name: String,
    pub status: Status,
    pub children: Vec<TreeNode>,
}
