//! Sibling navigation and turn pairing over a [`MessageTree`]

use std::sync::Arc;

use crate::models::{MessageNode, MessageRole, NodeId};
use crate::tree::MessageTree;

/// Position of `node_id` among its parent's children
pub fn find_sibling_index(tree: &MessageTree, node_id: NodeId) -> Option<usize> {
    let node = tree.get(node_id)?;
    let parent = tree.get(node.parent_id?)?;
    parent.children_ids.iter().position(|id| *id == node_id)
}

/// All children of the node's parent, in insertion order
pub fn siblings(tree: &MessageTree, node_id: NodeId) -> Vec<NodeId> {
    tree.get(node_id)
        .and_then(|node| node.parent_id)
        .and_then(|parent_id| tree.get(parent_id))
        .map(|parent| parent.children_ids.clone())
        .unwrap_or_default()
}

fn sibling_at(tree: &MessageTree, node_id: NodeId, offset: isize) -> Option<NodeId> {
    let index = find_sibling_index(tree, node_id)?;
    let target = index.checked_add_signed(offset)?;
    siblings(tree, node_id).get(target).copied()
}

/// Sibling after `node_id`, or `None` at the end
pub fn next_sibling(tree: &MessageTree, node_id: NodeId) -> Option<NodeId> {
    sibling_at(tree, node_id, 1)
}

/// Sibling before `node_id`, or `None` at the start
pub fn previous_sibling(tree: &MessageTree, node_id: NodeId) -> Option<NodeId> {
    sibling_at(tree, node_id, -1)
}

/// A user message and the reply it produced
#[derive(Debug, Clone, PartialEq)]
pub struct TurnPair {
    pub user: Arc<MessageNode>,
    pub assistant: Arc<MessageNode>,
}

fn lookup(tree: &MessageTree, chain: &[Arc<MessageNode>], id: i64) -> Option<Arc<MessageNode>> {
    let matches = |node: &&Arc<MessageNode>| node.id == id || node.message_id == Some(id);
    chain
        .iter()
        .find(matches)
        .or_else(|| tree.iter().find(matches))
        .cloned()
}

/// Pair a user message with its active reply, or a reply with its user message.
///
/// `id` may be a node id or a backend message id. The latest chain is
/// searched first, then the whole tree.
pub fn pair_for_turn(tree: &MessageTree, id: i64) -> Option<TurnPair> {
    let chain = tree.latest_chain();
    let node = lookup(tree, &chain, id)?;
    match node.role {
        MessageRole::User => {
            let reply = tree.get(node.latest_child_id?)?;
            (reply.role == MessageRole::Assistant).then(|| TurnPair {
                user: Arc::clone(&node),
                assistant: Arc::clone(reply),
            })
        }
        MessageRole::Assistant | MessageRole::Error => {
            let parent = tree.get(node.parent_id?)?;
            (parent.role == MessageRole::User).then(|| TurnPair {
                user: Arc::clone(parent),
                assistant: Arc::clone(&node),
            })
        }
        MessageRole::System => None,
    }
}

/// The last user/reply pair on the active branch
pub fn pair_for_last_turn(tree: &MessageTree) -> Option<TurnPair> {
    let chain = tree.latest_chain();
    let last = chain.last()?;
    pair_for_turn(tree, last.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SYSTEM_NODE_ID;

    fn tree_with_branches() -> MessageTree {
        MessageTree::new()
            .upsert(
                vec![
                    MessageNode::new(1, MessageRole::User, "q", Some(SYSTEM_NODE_ID)).with_message_id(101),
                    MessageNode::new(2, MessageRole::Assistant, "a", Some(1)).with_message_id(102),
                ],
                true,
            )
            .upsert(vec![MessageNode::new(3, MessageRole::Assistant, "b", Some(1))], false)
            .upsert(vec![MessageNode::new(4, MessageRole::Assistant, "c", Some(1))], false)
    }

    #[test]
    fn test_sibling_navigation() {
        let tree = tree_with_branches();
        assert_eq!(find_sibling_index(&tree, 3), Some(1));
        assert_eq!(siblings(&tree, 2), vec![2, 3, 4]);
        assert_eq!(next_sibling(&tree, 3), Some(4));
        assert_eq!(previous_sibling(&tree, 3), Some(2));
        assert_eq!(next_sibling(&tree, 4), None);
        assert_eq!(previous_sibling(&tree, 2), None);
        assert_eq!(find_sibling_index(&tree, 99), None);
    }

    #[test]
    fn test_pair_from_user_and_reply() {
        let tree = tree_with_branches();
        let pair = pair_for_turn(&tree, 1).unwrap();
        assert_eq!(pair.user.id, 1);
        assert_eq!(pair.assistant.id, 4);

        let pair = pair_for_turn(&tree, 102).unwrap();
        assert_eq!(pair.user.id, 1);
        assert_eq!(pair.assistant.id, 2);

        assert!(pair_for_turn(&tree, SYSTEM_NODE_ID).is_none());
    }

    #[test]
    fn test_pair_for_last_turn() {
        let tree = tree_with_branches().set_latest(3);
        let pair = pair_for_last_turn(&tree).unwrap();
        assert_eq!(pair.assistant.id, 3);
        assert!(pair_for_last_turn(&MessageTree::new()).is_none());
    }
}
