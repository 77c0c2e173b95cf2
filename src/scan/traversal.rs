//! Category tree traversal planning
//!
//! Flattens a persisted category tree into the ordered work list a category
//! scan walks. The planner only reads the tree.

use crate::scan::TraversalStrategy;
use crate::storage::{StorageResult, Store};
use std::collections::{HashSet, VecDeque};

/// One work-list category and its pagination progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryCursor {
    pub id: i64,
    pub name: String,
    pub node_id: String,
    pub current_page: u32,
    pub rerequests: u32,
    pub being_processed: bool,
    pub was_page_skipped: bool,
}

/// Builds the work list below `root_id`
///
/// Breadth-first walks use the deque as a queue, depth-first walks as a
/// stack. Each node is emitted at most once and the root itself is never
/// emitted. Every cursor starts at page 1.
///
/// # Arguments
///
/// * `store` - Store holding the tree
/// * `root_id` - Main category the walk starts from
/// * `strategy` - Walk order and child direction
pub fn plan_work_list(
    store: &dyn Store,
    root_id: i64,
    strategy: TraversalStrategy,
) -> StorageResult<Vec<CategoryCursor>> {
    let mut pending = VecDeque::from([root_id]);
    let mut visited = HashSet::new();
    let mut cursors = Vec::new();

    loop {
        let next = if strategy.is_depth_first() {
            pending.pop_back()
        } else {
            pending.pop_front()
        };
        let Some(id) = next else { break };

        if !visited.insert(id) {
            continue;
        }

        let node = store.get_category(id)?;
        if id != root_id {
            cursors.push(CategoryCursor {
                id: node.id,
                name: node.name.clone(),
                node_id: node.node_id.clone(),
                current_page: 1,
                rerequests: 0,
                being_processed: false,
                was_page_skipped: false,
            });
        }

        // A stack pops last-in first, so forward order is pushed reversed
        let forward = strategy.is_depth_first() == strategy.is_reversed();
        if forward {
            pending.extend(node.children.iter().copied());
        } else {
            pending.extend(node.children.iter().rev().copied());
        }
    }

    tracing::debug!(
        "Planned {} categories below {} ({})",
        cursors.len(),
        root_id,
        strategy
    );

    Ok(cursors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    /// root ─┬─ A ─┬─ A1
    ///       │     └─ A2
    ///       └─ B ─── B1
    fn tree() -> (SqliteStorage, i64) {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let root = storage.insert_or_get_category("com", "root", "0", true).unwrap();
        let a = storage.insert_or_get_category("com", "A", "1", false).unwrap();
        let b = storage.insert_or_get_category("com", "B", "2", false).unwrap();
        let a1 = storage.insert_or_get_category("com", "A1", "11", false).unwrap();
        let a2 = storage.insert_or_get_category("com", "A2", "12", false).unwrap();
        let b1 = storage.insert_or_get_category("com", "B1", "21", false).unwrap();
        storage.link_child(root, a).unwrap();
        storage.link_child(root, b).unwrap();
        storage.link_child(a, a1).unwrap();
        storage.link_child(a, a2).unwrap();
        storage.link_child(b, b1).unwrap();
        (storage, root)
    }

    fn names(store: &SqliteStorage, root: i64, strategy: TraversalStrategy) -> Vec<String> {
        plan_work_list(store, root, strategy)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[test]
    fn test_breadth_first() {
        let (storage, root) = tree();
        assert_eq!(
            names(&storage, root, TraversalStrategy::BreadthFirst),
            vec!["A", "B", "A1", "A2", "B1"]
        );
        assert_eq!(
            names(&storage, root, TraversalStrategy::BreadthFirstReverse),
            vec!["B", "A", "B1", "A2", "A1"]
        );
    }

    #[test]
    fn test_depth_first() {
        let (storage, root) = tree();
        assert_eq!(
            names(&storage, root, TraversalStrategy::DepthFirst),
            vec!["A", "A1", "A2", "B", "B1"]
        );
        assert_eq!(
            names(&storage, root, TraversalStrategy::DepthFirstReverse),
            vec!["B", "B1", "A", "A2", "A1"]
        );
    }

    #[test]
    fn test_shared_child_is_visited_once() {
        let (mut storage, root) = tree();
        let a = storage.insert_or_get_category("com", "A", "1", false).unwrap();
        let b1 = storage.insert_or_get_category("com", "B1", "21", false).unwrap();
        storage.link_child(a, b1).unwrap();

        let planned = names(&storage, root, TraversalStrategy::BreadthFirst);
        assert_eq!(planned.iter().filter(|n| *n == "B1").count(), 1);
        assert_eq!(planned.len(), 5);
    }

    #[test]
    fn test_cursors_start_at_page_one() {
        let (storage, root) = tree();
        let cursors = plan_work_list(&storage, root, TraversalStrategy::DepthFirst).unwrap();
        assert!(cursors
            .iter()
            .all(|c| c.current_page == 1 && !c.being_processed && !c.was_page_skipped));
    }

    #[test]
    fn test_missing_root() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        assert!(plan_work_list(&storage, 99, TraversalStrategy::BreadthFirst).is_err());
    }
}
