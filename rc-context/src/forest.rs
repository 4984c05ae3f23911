//! Presentation view of every stored conversation.
//!
//! Built arena-style: decoded records go into a flat vector, a child index
//! is derived from `(root, reply_to)`, and owned trees are assembled from
//! the leaves up so no node ever holds a reference to its parent.

use crate::key::{NodeKey, RootId};
use crate::node::ConversationNode;
use chrono::{DateTime, Utc};
use rc_llm::Role;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Which conversation roots a forest covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForestFilter {
    All,
    Allowed(HashSet<RootId>),
    Only(RootId),
}

impl ForestFilter {
    pub fn admits(&self, root: &RootId) -> bool {
        match self {
            Self::All => true,
            Self::Allowed(roots) => roots.contains(root),
            Self::Only(only) => only == root,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DialogNode {
    #[serde(skip)]
    pub root: RootId,
    pub message_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i32>,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DialogNode>,
}

impl DialogNode {
    /// Number of nodes in this subtree, including itself.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(DialogNode::size).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialogForest {
    /// Conversation trees per root, newest first.
    pub groups: BTreeMap<RootId, Vec<DialogNode>>,
    /// Non-root nodes that could not be connected to any root.
    pub orphaned: usize,
}

impl DialogForest {
    pub(crate) fn from_entries(entries: Vec<(Vec<u8>, Vec<u8>)>, filter: &ForestFilter) -> Self {
        let mut arena: Vec<(NodeKey, ConversationNode)> = Vec::with_capacity(entries.len());
        for (raw_key, raw_value) in entries {
            let key = match NodeKey::parse(&raw_key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(error = %e, "forest: skipping unparsable key");
                    continue;
                }
            };
            if !filter.admits(&key.root) {
                continue;
            }
            match ConversationNode::decode(key, &raw_value) {
                Ok(node) => arena.push((key, node)),
                Err(e) => tracing::warn!(error = %e, "forest: skipping corrupt record"),
            }
        }

        let index: HashMap<NodeKey, usize> = arena
            .iter()
            .enumerate()
            .map(|(i, (key, _))| (*key, i))
            .collect();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); arena.len()];
        let mut roots = Vec::new();
        for (i, (key, node)) in arena.iter().enumerate() {
            match node.reply_to {
                None => roots.push(i),
                Some(parent) => {
                    if let Some(&p) = index.get(&key.sibling(parent)) {
                        if p != i {
                            children[p].push(i);
                        }
                    }
                }
            }
        }

        // Preorder over everything reachable from a root; parents always
        // precede their children, so the reverse order builds bottom-up.
        let mut order = Vec::with_capacity(arena.len());
        let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            order.push(i);
            stack.extend(children[i].iter().rev().copied());
        }

        let mut built: Vec<Option<DialogNode>> = vec![None; arena.len()];
        for &i in order.iter().rev() {
            let (key, node) = &arena[i];
            let kids = children[i]
                .iter()
                .filter_map(|&c| built[c].take())
                .collect();
            built[i] = Some(DialogNode {
                root: key.root,
                message_id: key.message_id,
                reply_to: node.reply_to,
                role: node.message.role,
                content: node.message.content.clone(),
                timestamp: node.timestamp,
                children: kids,
            });
        }

        let orphaned = arena.len() - order.len();
        if orphaned > 0 {
            tracing::warn!(orphaned, "forest: dropped nodes without a reachable root");
        }

        let mut groups: BTreeMap<RootId, Vec<DialogNode>> = BTreeMap::new();
        for i in roots {
            if let Some(tree) = built[i].take() {
                groups.entry(tree.root).or_default().push(tree);
            }
        }
        for trees in groups.values_mut() {
            trees.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }

        Self { groups, orphaned }
    }

    pub fn node_count(&self) -> usize {
        self.groups
            .values()
            .flat_map(|trees| trees.iter())
            .map(DialogNode::size)
            .sum()
    }
}
