//! Copy-on-write message tree
//!
//! Nodes live in an id-keyed arena; parent, children and active-child links
//! are ids, never references. Every mutating operation returns a new
//! [`MessageTree`] and leaves the receiver untouched. Unchanged nodes are
//! shared between the old and new tree (`Arc::ptr_eq` holds for them), and a
//! no-op returns a tree sharing the receiver's map, so consumers can detect
//! change by identity.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;

use crate::models::{MessageNode, MessageRole, NodeId, SYSTEM_NODE_ID};

/// Id-keyed arena of message nodes
///
/// # Example
///
/// ```rust
/// use parley_conversation::{MessageNode, MessageRole, MessageTree, SYSTEM_NODE_ID};
///
/// let tree = MessageTree::new().upsert(
///     vec![
///         MessageNode::new(1, MessageRole::User, "hi", Some(SYSTEM_NODE_ID)),
///         MessageNode::new(2, MessageRole::Assistant, "hello", Some(1)),
///     ],
///     true,
/// );
///
/// // an edit becomes a sibling branch and takes over the latest chain
/// let edited = tree.upsert(
///     vec![MessageNode::new(3, MessageRole::User, "hey", Some(SYSTEM_NODE_ID))],
///     true,
/// );
/// let texts: Vec<String> = edited.latest_chain().iter().map(|node| node.text.clone()).collect();
/// assert_eq!(texts, vec!["hey"]);
///
/// // the original tree is untouched, and the old branch can be reselected
/// assert_eq!(tree.latest_chain().len(), 2);
/// assert_eq!(edited.set_latest(1).latest_chain().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageTree {
    nodes: Arc<BTreeMap<NodeId, Arc<MessageNode>>>,
}

impl MessageTree {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from nodes whose links are already consistent
    pub fn from_nodes(nodes: impl IntoIterator<Item = MessageNode>) -> Self {
        let map = nodes
            .into_iter()
            .map(|node| (node.id, Arc::new(node)))
            .collect();
        Self { nodes: Arc::new(map) }
    }

    fn from_map(map: BTreeMap<NodeId, Arc<MessageNode>>) -> Self {
        Self { nodes: Arc::new(map) }
    }

    /// Whether both trees share the same underlying map
    pub fn ptr_eq(&self, other: &MessageTree) -> bool {
        Arc::ptr_eq(&self.nodes, &other.nodes)
    }

    /// Number of nodes, the system root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node stored under `id`
    pub fn get(&self, id: NodeId) -> Option<&Arc<MessageNode>> {
        self.nodes.get(&id)
    }

    /// Whether a node is stored under `id`
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Nodes in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MessageNode>> {
        self.nodes.values()
    }

    /// Find a node by its backend id
    pub fn find_by_message_id(&self, message_id: i64) -> Option<&Arc<MessageNode>> {
        self.nodes
            .values()
            .find(|node| node.message_id == Some(message_id))
    }

    /// Insert or replace nodes and link each one into its parent.
    ///
    /// A replaced node keeps its existing `children_ids` and `latest_child_id`.
    /// The parent's active child moves to the upserted node when the node was
    /// not yet a child, when the parent had exactly one child, or when
    /// `promote_last` is set and the node is the last of the batch. Re-applying
    /// a known sibling therefore never reorders the active branch on its own.
    ///
    /// On an empty tree a system root is synthesised first, keyed by the first
    /// node's declared parent (or [`SYSTEM_NODE_ID`]).
    pub fn upsert(&self, nodes: Vec<MessageNode>, promote_last: bool) -> MessageTree {
        if nodes.is_empty() {
            return self.clone();
        }

        let mut map = (*self.nodes).clone();
        let mut batch = nodes;

        if map.is_empty() {
            let root_id = batch[0].parent_id.unwrap_or(SYSTEM_NODE_ID);
            let first_id = batch[0].id;
            if root_id != first_id {
                map.insert(root_id, Arc::new(MessageNode::system_root(root_id, first_id)));
                batch[0].parent_id = Some(root_id);
            }
        }

        let last_id = batch.last().map(|node| node.id);

        for mut node in batch.iter().cloned() {
            if let Some(existing) = map.get(&node.id) {
                node.children_ids = existing.children_ids.clone();
                node.latest_child_id = existing.latest_child_id;
            }
            map.insert(node.id, Arc::new(node));
        }

        for node in &batch {
            let Some(parent_id) = node.parent_id else {
                continue;
            };
            let Some(parent) = map.get(&parent_id) else {
                warn!(node_id = node.id, parent_id, "upserted node references a missing parent");
                continue;
            };

            let already_child = parent.children_ids.contains(&node.id);
            let single_child = parent.children_ids.len() == 1;
            let promote = promote_last && Some(node.id) == last_id;
            let make_latest = !already_child || single_child || promote;

            if already_child && (!make_latest || parent.latest_child_id == Some(node.id)) {
                continue;
            }

            let mut updated = (**parent).clone();
            if !already_child {
                updated.children_ids.push(node.id);
            }
            if make_latest {
                updated.latest_child_id = Some(node.id);
            }
            map.insert(parent_id, Arc::new(updated));
        }

        Self::from_map(map)
    }

    /// Delete a node and every descendant, then unlink it from its parent.
    /// If it was the parent's active child, the last remaining sibling becomes active.
    pub fn remove_subtree(&self, id: NodeId) -> MessageTree {
        let Some(target) = self.nodes.get(&id) else {
            return self.clone();
        };

        let mut by_parent: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in self.nodes.values() {
            if let Some(parent_id) = node.parent_id {
                by_parent.entry(parent_id).or_default().push(node.id);
            }
        }

        let mut doomed: HashSet<NodeId> = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !self.nodes.contains_key(&current) || !doomed.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.children_ids.iter().copied());
            }
            if let Some(children) = by_parent.get(&current) {
                queue.extend(children.iter().copied());
            }
        }

        let mut map = (*self.nodes).clone();
        for doomed_id in &doomed {
            map.remove(doomed_id);
        }

        if let Some(parent_id) = target.parent_id {
            if let Some(parent) = map.get(&parent_id) {
                let mut updated = (**parent).clone();
                updated.children_ids.retain(|child| *child != id);
                if updated.latest_child_id == Some(id) {
                    updated.latest_child_id = updated.children_ids.last().copied();
                }
                map.insert(parent_id, Arc::new(updated));
            }
        }

        Self::from_map(map)
    }

    /// Make `id` the active child of its parent. Only the parent node is
    /// replaced; every other node stays shared with `self`.
    pub fn set_latest(&self, id: NodeId) -> MessageTree {
        let Some(node) = self.nodes.get(&id) else {
            return self.clone();
        };
        let Some(parent_id) = node.parent_id else {
            return self.clone();
        };
        let Some(parent) = self.nodes.get(&parent_id) else {
            return self.clone();
        };
        if !parent.children_ids.contains(&id) || parent.latest_child_id == Some(id) {
            return self.clone();
        }

        let mut updated = (**parent).clone();
        updated.latest_child_id = Some(id);
        let mut map = (*self.nodes).clone();
        map.insert(parent_id, Arc::new(updated));
        Self::from_map(map)
    }

    /// Replace a node's content in place, keeping its links
    pub fn update_node(&self, id: NodeId, f: impl FnOnce(&mut MessageNode)) -> MessageTree {
        let Some(node) = self.nodes.get(&id) else {
            return self.clone();
        };
        let mut updated = (**node).clone();
        f(&mut updated);
        updated.id = node.id;
        updated.parent_id = node.parent_id;
        updated.children_ids = node.children_ids.clone();
        updated.latest_child_id = node.latest_child_id;
        if updated == **node {
            return self.clone();
        }
        let mut map = (*self.nodes).clone();
        map.insert(id, Arc::new(updated));
        Self::from_map(map)
    }

    /// Move a node to a new key, rewriting its parent's and children's links.
    /// A no-op when `new` is already taken or `old` is missing.
    pub fn rekey(&self, old: NodeId, new: NodeId) -> MessageTree {
        if old == new || self.nodes.contains_key(&new) {
            return self.clone();
        }
        let Some(node) = self.nodes.get(&old) else {
            return self.clone();
        };

        let mut map = (*self.nodes).clone();
        map.remove(&old);

        let mut moved = (**node).clone();
        moved.id = new;
        for child_id in &moved.children_ids {
            if let Some(child) = map.get(child_id) {
                let mut child = (**child).clone();
                child.parent_id = Some(new);
                map.insert(child.id, Arc::new(child));
            }
        }
        if let Some(parent_id) = moved.parent_id {
            if let Some(parent) = map.get(&parent_id) {
                let mut parent = (**parent).clone();
                for child in parent.children_ids.iter_mut() {
                    if *child == old {
                        *child = new;
                    }
                }
                if parent.latest_child_id == Some(old) {
                    parent.latest_child_id = Some(new);
                }
                map.insert(parent_id, Arc::new(parent));
            }
        }
        map.insert(new, Arc::new(moved));
        Self::from_map(map)
    }

    /// The root the latest chain starts from: the sentinel if present, else a
    /// parentless node, preferring a non-system one
    pub fn root(&self) -> Option<&Arc<MessageNode>> {
        if let Some(root) = self.nodes.get(&SYSTEM_NODE_ID) {
            return Some(root);
        }
        let mut candidates = self.nodes.values().filter(|node| node.parent_id.is_none());
        let first = candidates.next()?;
        if first.role != MessageRole::System {
            return Some(first);
        }
        candidates
            .find(|node| node.role != MessageRole::System)
            .or(Some(first))
    }

    /// Linear path through every `latest_child_id` starting below the root.
    ///
    /// A non-system fallback root is part of the chain. A dangling pointer ends
    /// the chain early with a warning instead of failing.
    pub fn latest_chain(&self) -> Vec<Arc<MessageNode>> {
        let mut chain = Vec::new();
        let Some(root) = self.root() else {
            return chain;
        };

        let mut visited: HashSet<NodeId> = HashSet::new();
        visited.insert(root.id);
        if root.id != SYSTEM_NODE_ID && root.role != MessageRole::System {
            chain.push(Arc::clone(root));
        }

        let mut current = Arc::clone(root);
        while let Some(next_id) = current.latest_child_id {
            let Some(next) = self.nodes.get(&next_id) else {
                warn!(
                    node_id = current.id,
                    latest_child_id = next_id,
                    "latest child is missing from the tree; truncating chain"
                );
                break;
            };
            if !visited.insert(next_id) {
                warn!(node_id = next_id, "cycle in latest-child links; truncating chain");
                break;
            }
            chain.push(Arc::clone(next));
            current = Arc::clone(next);
        }
        chain
    }

    /// Last node of `chain` (or of the latest chain) that is not an error.
    /// Falls back to the root when the chain is empty or all errors.
    pub fn last_successful(&self, chain: Option<&[Arc<MessageNode>]>) -> Option<NodeId> {
        let computed;
        let chain = match chain {
            Some(chain) => chain,
            None => {
                computed = self.latest_chain();
                &computed[..]
            }
        };
        chain
            .iter()
            .rev()
            .find(|node| !node.is_error())
            .map(|node| node.id)
            .or_else(|| self.root().map(|root| root.id))
    }

    /// Drop a failed trailing turn: when the latest chain ends in an error node,
    /// remove it together with its user parent. Returns `None` if there is nothing to prune.
    pub fn without_trailing_error_turn(&self) -> Option<MessageTree> {
        let chain = self.latest_chain();
        let last = chain.last()?;
        if !last.is_error() {
            return None;
        }
        let parent = last.parent_id.and_then(|id| self.nodes.get(&id));
        match parent {
            Some(parent) if parent.role == MessageRole::User => Some(self.remove_subtree(parent.id)),
            _ => Some(self.remove_subtree(last.id)),
        }
    }
}
