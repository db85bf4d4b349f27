//! Property-based tests for the message tree and the packet fold

use std::collections::HashSet;

use proptest::prelude::*;
use proptest::sample::Index;
use parley_conversation::packets;
use parley_conversation::{MessageNode, MessageRole, MessageTree, NodeId, Packet, SYSTEM_NODE_ID};

/// Grow a tree one node at a time; each pick chooses a parent among the nodes so far
fn build(picks: &[Index]) -> MessageTree {
    let mut tree = MessageTree::new();
    let mut ids = vec![SYSTEM_NODE_ID];
    for (i, pick) in picks.iter().enumerate() {
        let id = i as NodeId + 1;
        let parent = *pick.get(&ids);
        let role = if i % 2 == 0 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        tree = tree.upsert(vec![MessageNode::new(id, role, format!("m{id}"), Some(parent))], false);
        ids.push(id);
    }
    tree
}

fn descendants(tree: &MessageTree, id: NodeId) -> HashSet<NodeId> {
    let mut found = HashSet::new();
    let mut pending = vec![id];
    while let Some(next) = pending.pop() {
        if !found.insert(next) {
            continue;
        }
        if let Some(node) = tree.get(next) {
            pending.extend(node.children_ids.iter().copied());
        }
    }
    found
}

fn assert_links_consistent(tree: &MessageTree) -> Result<(), TestCaseError> {
    for node in tree.iter() {
        for child in &node.children_ids {
            let child = tree.get(*child);
            prop_assert!(child.is_some(), "node {} lists a missing child", node.id);
            prop_assert_eq!(child.unwrap().parent_id, Some(node.id));
        }
        if let Some(latest) = node.latest_child_id {
            prop_assert!(node.children_ids.contains(&latest), "latest child of {} is not a child", node.id);
        }
    }
    Ok(())
}

proptest! {
    /// Re-applying nodes the tree already holds changes nothing
    #[test]
    fn prop_upsert_is_idempotent(picks in prop::collection::vec(any::<Index>(), 1..24)) {
        let tree = build(&picks);
        let again: Vec<MessageNode> = tree
            .iter()
            .filter(|node| node.id != SYSTEM_NODE_ID)
            .map(|node| (**node).clone())
            .collect();
        let reapplied = tree.upsert(again, false);
        prop_assert_eq!(reapplied, tree);
    }

    /// The latest chain is a simple parent-to-child path
    #[test]
    fn prop_latest_chain_is_a_path(picks in prop::collection::vec(any::<Index>(), 1..24)) {
        let tree = build(&picks);
        let chain = tree.latest_chain();
        prop_assert!(!chain.is_empty());

        let mut seen = HashSet::new();
        let mut parent = SYSTEM_NODE_ID;
        for node in &chain {
            prop_assert!(seen.insert(node.id), "node {} repeated", node.id);
            prop_assert_eq!(node.parent_id, Some(parent));
            parent = node.id;
        }
        prop_assert_eq!(chain.last().unwrap().latest_child_id, None);
        assert_links_consistent(&tree)?;
    }

    /// Selecting a branch only touches the selected node's parent
    #[test]
    fn prop_set_latest_is_local(
        picks in prop::collection::vec(any::<Index>(), 1..24),
        target in any::<Index>(),
    ) {
        let tree = build(&picks);
        let id = target.index(picks.len()) as NodeId + 1;
        let parent = tree.get(id).and_then(|node| node.parent_id).unwrap();

        let updated = tree.set_latest(id);
        prop_assert_eq!(updated.get(parent).unwrap().latest_child_id, Some(id));
        for node in tree.iter().filter(|node| node.id != parent) {
            let after = updated.get(node.id).unwrap();
            prop_assert!(std::sync::Arc::ptr_eq(node, after), "node {} was rewritten", node.id);
        }

        // selecting the whole ancestor path puts the node on the latest chain
        let mut selected = tree.clone();
        let mut current = Some(id);
        while let Some(node_id) = current {
            selected = selected.set_latest(node_id);
            current = selected.get(node_id).and_then(|node| node.parent_id);
        }
        prop_assert!(selected.latest_chain().iter().any(|node| node.id == id));
    }

    /// Removing a subtree drops every descendant and leaves consistent links
    #[test]
    fn prop_remove_subtree_is_complete(
        picks in prop::collection::vec(any::<Index>(), 1..24),
        target in any::<Index>(),
    ) {
        let tree = build(&picks);
        let id = target.index(picks.len()) as NodeId + 1;
        let doomed = descendants(&tree, id);

        let pruned = tree.remove_subtree(id);
        prop_assert_eq!(pruned.len(), tree.len() - doomed.len());
        for gone in &doomed {
            prop_assert!(!pruned.contains(*gone));
        }
        assert_links_consistent(&pruned)?;
        for node in pruned.latest_chain() {
            prop_assert!(!doomed.contains(&node.id));
        }
    }

    /// Answer text is the deltas concatenated in arrival order
    #[test]
    fn prop_fold_preserves_arrival_order(deltas in prop::collection::vec("[a-z ]{0,6}", 0..12)) {
        let mut packets = vec![Packet::message_start(0, "")];
        packets.extend(deltas.iter().map(|delta| Packet::message_delta(0, delta.clone())));

        let derived = packets::derive(&packets);
        prop_assert_eq!(derived.text, deltas.concat());
    }
}
