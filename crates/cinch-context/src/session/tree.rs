//! Common-ancestor resolution between two leaves of the session tree.

use super::{Entry, EntryStore};
use std::collections::HashSet;

/// The span left behind when moving from one leaf to another.
#[derive(Debug, Clone, Default)]
pub struct AbandonedBranch {
    /// Deepest entry shared by both paths, `None` if they share nothing.
    pub common_ancestor_id: Option<String>,
    /// Entries from just after the ancestor to the old leaf, oldest first.
    pub entries: Vec<Entry>,
}

/// Deepest entry on both the `old_leaf` and `target` paths.
pub fn common_ancestor<S: EntryStore + ?Sized>(
    store: &S,
    old_leaf: Option<&str>,
    target: &str,
) -> Option<String> {
    let old_leaf = old_leaf?;
    let old_path: HashSet<String> = store
        .branch_entries(Some(old_leaf))
        .into_iter()
        .map(|e| e.id)
        .collect();
    store
        .branch_entries(Some(target))
        .into_iter()
        .rev()
        .find(|e| old_path.contains(&e.id))
        .map(|e| e.id)
}

/// Collect the entries that become unreachable when the leaf moves from
/// `old_leaf` to `target`.
pub fn abandoned_branch<S: EntryStore + ?Sized>(
    store: &S,
    old_leaf: Option<&str>,
    target: &str,
) -> AbandonedBranch {
    let common_ancestor_id = common_ancestor(store, old_leaf, target);
    let Some(old_leaf) = old_leaf else {
        return AbandonedBranch::default();
    };

    let old_path = store.branch_entries(Some(old_leaf));
    let start = match &common_ancestor_id {
        Some(ancestor) => old_path
            .iter()
            .position(|e| &e.id == ancestor)
            .map_or(0, |i| i + 1),
        None => 0,
    };

    AbandonedBranch {
        common_ancestor_id,
        entries: old_path.into_iter().skip(start).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentMessage;
    use crate::session::{Entry, SessionLog};

    /// root ─ a1 ─ a2
    ///      └ b1 ─ b2
    fn forked() -> SessionLog {
        let mut log = SessionLog::new();
        for (id, parent) in [
            ("root", None),
            ("a1", Some("root")),
            ("a2", Some("a1")),
            ("b1", Some("root")),
            ("b2", Some("b1")),
        ] {
            log.insert(Entry::message(
                id,
                parent.map(String::from),
                AgentMessage::user(id),
            ))
            .unwrap();
        }
        log
    }

    fn ids(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn sibling_branches_meet_at_fork() {
        let log = forked();
        assert_eq!(common_ancestor(&log, Some("a2"), "b2").as_deref(), Some("root"));

        let span = abandoned_branch(&log, Some("a2"), "b2");
        assert_eq!(ids(&span.entries), vec!["a1", "a2"]);
    }

    #[test]
    fn moving_to_an_ancestor_abandons_the_tail() {
        let log = forked();
        let span = abandoned_branch(&log, Some("a2"), "a1");
        assert_eq!(span.common_ancestor_id.as_deref(), Some("a1"));
        assert_eq!(ids(&span.entries), vec!["a2"]);
    }

    #[test]
    fn moving_to_a_descendant_abandons_nothing() {
        let log = forked();
        let span = abandoned_branch(&log, Some("a1"), "a2");
        assert_eq!(span.common_ancestor_id.as_deref(), Some("a1"));
        assert!(span.entries.is_empty());
    }

    #[test]
    fn disjoint_roots_abandon_the_whole_path() {
        let mut log = forked();
        log.insert(Entry::message("other", None, AgentMessage::user("other")))
            .unwrap();
        let span = abandoned_branch(&log, Some("a2"), "other");
        assert_eq!(span.common_ancestor_id, None);
        assert_eq!(ids(&span.entries), vec!["root", "a1", "a2"]);
    }

    #[test]
    fn no_old_leaf_means_nothing_abandoned() {
        let log = forked();
        let span = abandoned_branch(&log, None, "b2");
        assert!(span.entries.is_empty());
    }
}
