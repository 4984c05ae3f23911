//! OneBot 11 event payloads and their normalization into [`InboundMessage`].

use crate::types::{InboundMessage, MessageCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

const SHARE_CARD_PREFIX: &str = "[CQ:json";

#[derive(Debug, Clone, Deserialize)]
pub struct OneBotEvent {
    /// Unix seconds at which the gateway saw the message; 0 when absent.
    #[serde(default)]
    pub time: i64,
    pub self_id: i64,
    pub post_type: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub message_id: i32,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default)]
    pub sender: EventSender,
    #[serde(default)]
    pub message: Vec<Segment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventSender {
    #[serde(default)]
    pub nickname: String,
}

/// One element of a OneBot message array, used in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: SegmentData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentData {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub qq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub id: Option<String>,
}

/// Gateways disagree on whether ids are strings or numbers.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            data: SegmentData {
                text: Some(text.into()),
                ..SegmentData::default()
            },
        }
    }

    pub fn at(qq: i64) -> Self {
        Self {
            kind: "at".to_string(),
            data: SegmentData {
                qq: Some(qq.to_string()),
                ..SegmentData::default()
            },
        }
    }

    pub fn reply(message_id: i32) -> Self {
        Self {
            kind: "reply".to_string(),
            data: SegmentData {
                id: Some(message_id.to_string()),
                ..SegmentData::default()
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ShareCard {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    meta: ShareMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ShareMeta {
    #[serde(default)]
    detail_1: Option<ShareDetail>,
    #[serde(default)]
    news: Option<ShareNews>,
}

#[derive(Debug, Deserialize)]
struct ShareDetail {
    #[serde(default)]
    qqdocurl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShareNews {
    #[serde(default, rename = "jumpUrl")]
    jump_url: Option<String>,
}

impl OneBotEvent {
    pub fn is_message(&self) -> bool {
        self.post_type == "message"
    }

    pub fn is_from_self(&self) -> bool {
        self.self_id == self.user_id
    }

    pub fn mentions_self(&self) -> bool {
        let self_id = self.self_id.to_string();
        self.message
            .iter()
            .any(|s| s.kind == "at" && s.data.qq.as_deref() == Some(self_id.as_str()))
    }

    /// First reply segment carrying a valid 32-bit message id.
    /// Event time, or now when the gateway sent none.
    pub fn received_at(&self) -> DateTime<Utc> {
        Some(self.time)
            .filter(|t| *t > 0)
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
            .unwrap_or_else(Utc::now)
    }

    pub fn reply_to(&self) -> Option<i32> {
        self.message
            .iter()
            .filter(|s| s.kind == "reply")
            .find_map(|s| s.data.id.as_deref()?.trim().parse::<i32>().ok())
    }

    fn concatenated_text(&self) -> String {
        self.message
            .iter()
            .filter(|s| s.kind == "text")
            .filter_map(|s| s.data.text.as_deref())
            .collect()
    }

    /// Edge filter plus normalization. `None` means the event is not
    /// something the relay should look at.
    pub fn normalize(&self) -> Option<InboundMessage> {
        if !self.is_message() {
            return None;
        }
        let reply_to = self.reply_to();
        let mentions_bot = self.mentions_self();
        let mut relevant = self.group_id.is_none() || mentions_bot || reply_to.is_some();

        let raw = self.raw_message.trim();
        let (category, text) = if raw.starts_with(SHARE_CARD_PREFIX) {
            relevant = true;
            match parse_share_card(raw) {
                Ok(text) => (MessageCategory::Share, text),
                Err(e) => {
                    tracing::warn!(error = %e, message_id = self.message_id, "unreadable share card");
                    return None;
                }
            }
        } else {
            let text = self.concatenated_text();
            match text.trim_start().strip_prefix('/') {
                Some(command) => {
                    relevant = true;
                    (MessageCategory::Command, command.to_string())
                }
                None => (MessageCategory::Chat, text),
            }
        };

        if !relevant {
            return None;
        }

        Some(InboundMessage {
            message_id: self.message_id,
            user_id: self.user_id,
            group_id: self.group_id,
            nickname: self.sender.nickname.clone(),
            reply_to,
            text: text.trim().to_string(),
            category,
            mentions_bot,
            is_from_self: self.is_from_self(),
            received_at: self.received_at(),
        })
    }
}

/// Prompt line plus the card's document or article link.
fn parse_share_card(raw: &str) -> serde_json::Result<String> {
    let body = raw.strip_prefix("[CQ:json,data=").unwrap_or(raw);
    let body = body.strip_suffix(']').unwrap_or(body);
    let body = html_escape::decode_html_entities(body);
    let card: ShareCard = serde_json::from_str(&body)?;

    let mut text = format!("{}\n", card.prompt);
    let link = card
        .meta
        .detail_1
        .and_then(|d| d.qqdocurl)
        .filter(|u| !u.is_empty())
        .or_else(|| card.meta.news.and_then(|n| n.jump_url).filter(|u| !u.is_empty()));
    if let Some(link) = link {
        text.push_str(&link);
        text.push('\n');
    }
    Ok(text)
}
