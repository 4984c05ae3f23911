//! Gateway adapters for ReplyChain.
//!
//! Adapters are pure I/O: they convert gateway events to/from ReplyChain
//! `InboundMessage` / `OutboundMessage`.

mod event;
mod onebot;
mod traits;
mod types;

pub use event::{OneBotEvent, Segment, SegmentData};
pub use onebot::OneBotAdapter;
pub use traits::ChannelAdapter;
pub use types::{InboundMessage, MessageCategory, OutboundMessage};
