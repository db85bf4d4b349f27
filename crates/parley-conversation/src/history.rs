//! Rebuild a [`MessageTree`] from stored history
//!
//! The backend returns a flat message list and, separately, one packet list
//! per assistant message in the order those messages appear. The k-th
//! assistant message receives the k-th packet list.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::{MessageNode, MessageRole, NodeId, SYSTEM_NODE_ID};
use crate::packets::{self, Packet};
use crate::transport::{BackendChatSession, BackendMessage};
use crate::tree::MessageTree;

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    match DateTime::parse_from_rfc3339(value) {
        Ok(time) => Some(time.with_timezone(&Utc)),
        Err(err) => {
            warn!(value, error = %err, "unparseable message timestamp");
            None
        }
    }
}

/// Node for one stored message. Node id and backend id coincide.
pub fn node_from_backend(message: &BackendMessage, packets: Vec<Packet>) -> MessageNode {
    let mut node = MessageNode::new(
        message.message_id,
        message.message_type,
        message.message.clone(),
        message.parent_message,
    )
    .with_message_id(message.message_id)
    .with_files(message.files.clone());

    if !packets.is_empty() {
        let derived = packets::derive(&packets);
        if node.text.is_empty() {
            node.text = derived.text;
        }
        node.citations = derived.citations;
        node.documents = derived.documents;
        if node.files.is_empty() {
            node.files = derived.files;
        }
        node.tool_call = derived.tool_call;
    }
    if let Some(citations) = &message.citations {
        node.citations = citations.clone();
    }
    let documents = message.documents();
    if !documents.is_empty() {
        node.documents = documents;
    }
    if message.tool_call.is_some() {
        node.tool_call = message.tool_call.clone();
    }
    node.packets = packets;
    node.generation_complete = true;
    node.overridden_model = message.overridden_model.clone();
    node.query = message.rephrased_query.clone();
    node.alternate_assistant_id = message.alternate_assistant_id;
    node.time_sent = parse_time(message.time_sent.as_deref());
    node
}

/// Zip messages with their packet logs and link them into a tree.
///
/// A backend system message without a parent serves as the root; otherwise a
/// sentinel root is synthesised. Messages whose parent is unknown hang off the
/// root. Children are ordered by id; an invalid `latest_child_message` falls
/// back to the last child.
pub fn build_tree(session: &BackendChatSession) -> MessageTree {
    if session.messages.is_empty() {
        return MessageTree::new();
    }

    let known: HashSet<NodeId> = session.messages.iter().map(|m| m.message_id).collect();
    let backend_root = session
        .messages
        .iter()
        .find(|m| m.message_type == MessageRole::System && m.parent_message.is_none())
        .map(|m| m.message_id);
    let root_id = backend_root.unwrap_or(SYSTEM_NODE_ID);

    let mut packet_logs = session.packets.iter();
    let mut nodes: BTreeMap<NodeId, MessageNode> = BTreeMap::new();
    let mut declared_latest: BTreeMap<NodeId, NodeId> = BTreeMap::new();

    for message in &session.messages {
        let packets = if message.message_type == MessageRole::Assistant {
            packet_logs.next().cloned().unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut node = node_from_backend(message, packets);

        if Some(node.id) != backend_root {
            node.parent_id = match message.parent_message {
                Some(parent) if known.contains(&parent) => Some(parent),
                Some(parent) => {
                    warn!(message_id = node.id, parent, "history message references an unknown parent");
                    Some(root_id)
                }
                None => Some(root_id),
            };
        }
        if let Some(latest) = message.latest_child_message {
            declared_latest.insert(node.id, latest);
        }
        nodes.insert(node.id, node);
    }

    if backend_root.is_none() {
        nodes.insert(
            SYSTEM_NODE_ID,
            MessageNode::new(SYSTEM_NODE_ID, MessageRole::System, "", None),
        );
    }

    let links: Vec<(NodeId, NodeId)> = nodes
        .values()
        .filter_map(|node| node.parent_id.map(|parent| (parent, node.id)))
        .collect();
    for (parent, child) in links {
        if let Some(node) = nodes.get_mut(&parent) {
            node.children_ids.push(child);
        }
    }

    for node in nodes.values_mut() {
        node.children_ids.sort_unstable();
        node.latest_child_id = match declared_latest.get(&node.id) {
            Some(latest) if node.children_ids.contains(latest) => Some(*latest),
            Some(latest) => {
                warn!(message_id = node.id, latest, "latest child is not a child; using last child");
                node.children_ids.last().copied()
            }
            None => node.children_ids.last().copied(),
        };
    }

    MessageTree::from_nodes(nodes.into_values())
}
