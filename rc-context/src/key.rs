use crate::error::{ContextError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootKind {
    User,
    Group,
}

impl RootKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }
}

impl FromStr for RootKind {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            other => Err(ContextError::InvalidKey {
                key: other.to_string(),
                reason: "root kind must be user or group".to_string(),
            }),
        }
    }
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user or group a conversation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId {
    pub kind: RootKind,
    pub id: i64,
}

impl RootId {
    pub fn new(kind: RootKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn user(id: i64) -> Self {
        Self::new(RootKind::User, id)
    }

    pub fn group(id: i64) -> Self {
        Self::new(RootKind::Group, id)
    }

    /// Group conversations are keyed by the group, private ones by the user.
    pub fn for_sender(user_id: i64, group_id: Option<i64>) -> Self {
        match group_id {
            Some(group_id) => Self::group(group_id),
            None => Self::user(user_id),
        }
    }

    /// Scan prefix covering exactly this root's nodes. The trailing `/`
    /// keeps `user/12/` from matching `user/123/...`.
    pub fn prefix(&self) -> Vec<u8> {
        format!("{}/{}/", self.kind, self.id).into_bytes()
    }

    pub fn node(&self, message_id: i32) -> NodeKey {
        NodeKey::new(*self, message_id)
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl FromStr for RootId {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s.split_once('/').ok_or_else(|| ContextError::InvalidKey {
            key: s.to_string(),
            reason: "expected <kind>/<id>".to_string(),
        })?;
        let id = id.parse::<i64>().map_err(|e| ContextError::InvalidKey {
            key: s.to_string(),
            reason: format!("root id: {e}"),
        })?;
        Ok(Self::new(kind.parse()?, id))
    }
}

impl Serialize for RootId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RootId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Address of one persisted message: `<root-kind>/<root-id>/<message-id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub root: RootId,
    pub message_id: i32,
}

impl NodeKey {
    pub fn new(root: RootId, message_id: i32) -> Self {
        Self { root, message_id }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Strict inverse of [`NodeKey::to_bytes`].
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|e| ContextError::InvalidKey {
            key: String::from_utf8_lossy(raw).into_owned(),
            reason: e.to_string(),
        })?;
        text.parse()
    }

    /// Another message under the same root.
    pub fn sibling(&self, message_id: i32) -> Self {
        Self::new(self.root, message_id)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root, self.message_id)
    }
}

impl FromStr for NodeKey {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: String| ContextError::InvalidKey {
            key: s.to_string(),
            reason,
        };
        let mut parts = s.split('/');
        let (Some(kind), Some(id), Some(message_id), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected <kind>/<id>/<message-id>".to_string()));
        };
        let id = id
            .parse::<i64>()
            .map_err(|e| invalid(format!("root id: {e}")))?;
        let message_id = message_id
            .parse::<i32>()
            .map_err(|e| invalid(format!("message id: {e}")))?;
        Ok(Self::new(RootId::new(kind.parse()?, id), message_id))
    }
}
