use crate::key::NodeKey;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        key: NodeKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("reply chain broken: {missing} not found (referenced by {referenced_by:?})")]
    ChainBroken {
        missing: NodeKey,
        referenced_by: Option<NodeKey>,
    },

    #[error("reply chain revisits {0}")]
    ChainCycle(NodeKey),

    #[error("no history under {0}")]
    NoHistory(String),
}

impl From<rusqlite::Error> for ContextError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
