//! Category tree import
//!
//! Category trees are produced by an external discovery crawl and loaded
//! from a TOML file:
//!
//! ```toml
//! domain = "com"
//!
//! [[category]]
//! name = "Electronics"
//! node-id = "172282"
//!
//! [[category.children]]
//! name = "Headphones"
//! node-id = "172541"
//! ```

use crate::state::DiscoveryState;
use crate::storage::traits::{Store, StorageError, StorageResult};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// A category tree file for one marketplace domain
#[derive(Debug, Clone, Deserialize)]
pub struct TreeFile {
    pub domain: String,

    /// Top-level (main) categories
    #[serde(rename = "category", default)]
    pub categories: Vec<TreeNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeNode {
    pub name: String,

    #[serde(rename = "node-id")]
    pub node_id: String,

    #[serde(default)]
    pub children: Vec<TreeNode>,
}

/// Loads a category tree file from disk
pub fn load_tree_file(path: &Path) -> StorageResult<TreeFile> {
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Imports a tree into the store
///
/// Roots become main categories with a completed discovery state. Children
/// are linked in file order. Re-importing the same tree is a no-op.
///
/// # Returns
///
/// The ids of the main categories, in file order
pub fn import_tree(store: &mut dyn Store, tree: &TreeFile) -> StorageResult<Vec<i64>> {
    let mut roots = Vec::with_capacity(tree.categories.len());

    for node in &tree.categories {
        let id = store.insert_or_get_category(&tree.domain, &node.name, &node.node_id, true)?;
        import_children(store, &tree.domain, id, &node.children)?;
        store.set_discovery_state(id, DiscoveryState::Completed)?;
        roots.push(id);
    }

    tracing::info!(
        "Imported {} main categories for domain '{}'",
        roots.len(),
        tree.domain
    );

    Ok(roots)
}

fn import_children(
    store: &mut dyn Store,
    domain: &str,
    parent_id: i64,
    children: &[TreeNode],
) -> StorageResult<()> {
    for child in children {
        let id = store.insert_or_get_category(domain, &child.name, &child.node_id, false)?;
        store.link_child(parent_id, id)?;
        import_children(store, domain, id, &child.children)?;
    }
    Ok(())
}
