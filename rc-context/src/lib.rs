//! Reply-chain addressed conversation store.
//!
//! Every message is persisted once under `<root-kind>/<root-id>/<message-id>`
//! with an optional pointer to the message it replied to. Linear prompt
//! history and the presentation forest are both derived from that flat
//! keyspace on demand.

mod engine;
mod error;
mod forest;
mod key;
mod node;
mod store;

pub use engine::ContextEngine;
pub use error::{ContextError, Result};
pub use forest::{DialogForest, DialogNode, ForestFilter};
pub use key::{NodeKey, RootId, RootKind};
pub use node::ConversationNode;
pub use store::{ConversationStore, MemoryStore, SqliteStore};
