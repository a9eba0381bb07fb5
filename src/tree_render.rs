//! ASCII tree rendering for object hierarchies.

use jarstore_core::Status;

use crate::models::TreeNode;

const UNSAVED: char = '◇';
const GHOST: char = '○';
const SAVED: char = '●';
const CHANGED: char = '✎';
const STICKY: char = '◆';

/// Get the status symbol for an object.
fn status_symbol(status: Status) -> char {
    match status {
        Status::Unsaved => UNSAVED,
        Status::Ghost => GHOST,
        Status::Saved => SAVED,
        Status::Changed => CHANGED,
        Status::Sticky => STICKY,
    }
}

fn label(node: &TreeNode) -> String {
    if node.name.is_empty() {
        format!("{} [{}]", node.type_name, node.oid)
    } else {
        format!("{} ({}) [{}]", node.name, node.type_name, node.oid)
    }
}

/// Render an object tree as ASCII art with status symbols.
///
/// Example output:
/// ```text
/// Root [0]
/// ├── ● docs (Folder) [1]
/// │   └── ○ readme (Item) [3]
/// └── ✎ inbox (Folder) [2]
/// ```
pub fn render_tree(nodes: &[TreeNode]) -> String {
    let mut output = String::new();
    for (i, node) in nodes.iter().enumerate() {
        let is_last = i == nodes.len() - 1;
        render_node(&mut output, node, "", is_last, true);
    }
    output
}

fn render_node(output: &mut String, node: &TreeNode, prefix: &str, is_last: bool, is_root: bool) {
    if is_root {
        output.push_str(&label(node));
        output.push('\n');
    } else {
        let branch = if is_last { "└── " } else { "├── " };
        output.push_str(prefix);
        output.push_str(branch);
        output.push(status_symbol(node.status));
        output.push(' ');
        output.push_str(&label(node));
        output.push('\n');
    }

    let child_prefix = if is_root {
        String::new()
    } else {
        let continuation = if is_last { "    " } else { "│   " };
        format!("{}{}", prefix, continuation)
    };

    for (i, child) in node.children.iter().enumerate() {
        let child_is_last = i == node.children.len() - 1;
        render_node(output, child, &child_prefix, child_is_last, false);
    }
}
