use crate::event::{OneBotEvent, Segment};
use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, OutboundMessage};
use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

const ONEBOT_CHANNEL_ID: &str = "onebot";
const FORWARD_NODE_NICKNAME: &str = "QQ用户";

#[derive(Debug, Serialize)]
struct PrivateMessage {
    user_id: i64,
    message: Vec<Segment>,
}

#[derive(Debug, Serialize)]
struct GroupMessage {
    group_id: i64,
    message: Vec<Segment>,
}

#[derive(Debug, Serialize)]
struct PrivateForwardMessage {
    user_id: i64,
    messages: Vec<ForwardNode>,
}

#[derive(Debug, Serialize)]
struct GroupForwardMessage {
    group_id: i64,
    messages: Vec<ForwardNode>,
}

#[derive(Debug, Serialize)]
struct ForwardNode {
    #[serde(rename = "type")]
    kind: &'static str,
    data: ForwardNodeData,
}

#[derive(Debug, Serialize)]
struct ForwardNodeData {
    user_id: i64,
    nickname: &'static str,
    content: Vec<Segment>,
}

impl ForwardNode {
    fn text(text: &str) -> Self {
        Self {
            kind: "node",
            data: ForwardNodeData {
                user_id: 0,
                nickname: FORWARD_NODE_NICKNAME,
                content: vec![Segment::text(text)],
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SendResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    retcode: i32,
    #[serde(default)]
    data: Option<SendResponseData>,
}

#[derive(Debug, Default, Deserialize)]
struct SendResponseData {
    #[serde(default)]
    message_id: i32,
}

/// Reply segments: quote the question, mention the asker in groups, then an
/// optional `[model]` header line before the text.
fn reply_segments(message: &OutboundMessage) -> Vec<Segment> {
    let mut segments = vec![Segment::reply(message.reply_to_message_id)];
    if message.is_group() {
        segments.push(Segment::at(message.user_id));
        segments.push(Segment::text(" "));
    }
    if let Some(label) = message.model_label.as_deref().filter(|l| !l.is_empty()) {
        segments.push(Segment::text(format!("[{label}]\n")));
    }
    segments.push(Segment::text(message.content.as_str()));
    segments
}

/// OneBot 11 over HTTP: events arrive as webhook posts, replies go out as
/// action calls against the gateway's HTTP API.
pub struct OneBotAdapter {
    http: reqwest::Client,
    endpoint: String,
    inbound_tx: RwLock<Option<mpsc::Sender<InboundMessage>>>,
}

impl OneBotAdapter {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "onebot endpoint must be http(s): {endpoint:?}"
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build onebot http client")?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            inbound_tx: RwLock::new(None),
        })
    }

    /// Router that accepts gateway event posts at `/`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", post(receive_event))
            .with_state(self)
    }

    #[tracing::instrument(level = "debug", skip(self, body))]
    async fn call(&self, action: &str, body: &impl Serialize) -> Result<i32> {
        let url = format!("{}/{action}", self.endpoint);
        let resp = self.http.post(&url).json(body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "onebot {action} failed: status={status} body={text}"
            ));
        }
        let parsed: SendResponse = serde_json::from_str(&text)
            .with_context(|| format!("onebot {action} returned unreadable body: {text}"))?;
        if parsed.retcode != 0 {
            tracing::warn!(
                action,
                status = %parsed.status,
                retcode = parsed.retcode,
                "onebot action reported a non-zero retcode"
            );
        }
        Ok(parsed.data.map(|d| d.message_id).unwrap_or_default())
    }
}

async fn receive_event(State(adapter): State<Arc<OneBotAdapter>>, body: Bytes) -> StatusCode {
    let event: OneBotEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(%e, "onebot webhook received malformed event");
            return StatusCode::BAD_REQUEST;
        }
    };
    let Some(inbound) = event.normalize() else {
        return StatusCode::NO_CONTENT;
    };

    let tx = adapter.inbound_tx.read().await.clone();
    let Some(tx) = tx else {
        tracing::error!("onebot adapter started without inbound queue");
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    tracing::info!(
        message_id = inbound.message_id,
        user_id = inbound.user_id,
        group_id = ?inbound.group_id,
        category = ?inbound.category,
        "onebot message received"
    );
    if let Err(e) = tx.send(inbound).await {
        tracing::error!(%e, "onebot inbound queue closed");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::NO_CONTENT
}

#[async_trait::async_trait]
impl ChannelAdapter for OneBotAdapter {
    fn channel_id(&self) -> &str {
        ONEBOT_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Option<i32>> {
        let segments = reply_segments(message);
        let id = match message.group_id {
            Some(group_id) => {
                self.call(
                    "send_group_msg",
                    &GroupMessage {
                        group_id,
                        message: segments,
                    },
                )
                .await?
            }
            None => {
                self.call(
                    "send_private_msg",
                    &PrivateMessage {
                        user_id: message.user_id,
                        message: segments,
                    },
                )
                .await?
            }
        };
        Ok((id != 0).then_some(id))
    }

    async fn send_forward(&self, user_id: i64, group_id: Option<i64>, text: &str) -> Result<()> {
        let messages = vec![ForwardNode::text(text)];
        match group_id {
            Some(group_id) => {
                self.call(
                    "send_group_forward_msg",
                    &GroupForwardMessage { group_id, messages },
                )
                .await?;
            }
            None => {
                self.call(
                    "send_private_forward_msg",
                    &PrivateForwardMessage { user_id, messages },
                )
                .await?;
            }
        }
        Ok(())
    }

    fn supports_forward(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn outbound(group_id: Option<i64>, label: Option<&str>) -> OutboundMessage {
        OutboundMessage {
            user_id: 42,
            group_id,
            reply_to_message_id: 100,
            content: "hi".to_string(),
            model_label: label.map(str::to_string),
            is_command: false,
        }
    }

    #[test]
    fn group_reply_mentions_asker_under_model_header() {
        let json = serde_json::to_value(reply_segments(&outbound(Some(9), Some("primary"))))
            .expect("json");
        assert_eq!(
            json,
            json!([
                { "type": "reply", "data": { "id": "100" } },
                { "type": "at", "data": { "qq": "42" } },
                { "type": "text", "data": { "text": " " } },
                { "type": "text", "data": { "text": "[primary]\n" } },
                { "type": "text", "data": { "text": "hi" } },
            ])
        );
    }

    #[test]
    fn private_command_reply_is_bare() {
        let json = serde_json::to_value(reply_segments(&outbound(None, None))).expect("json");
        assert_eq!(
            json,
            json!([
                { "type": "reply", "data": { "id": "100" } },
                { "type": "text", "data": { "text": "hi" } },
            ])
        );
    }

    #[test]
    fn rejects_non_http_endpoint() {
        assert!(OneBotAdapter::new("ws://gateway", Duration::from_secs(1)).is_err());
    }

    async fn post_event(adapter: Arc<OneBotAdapter>, body: &str) -> StatusCode {
        adapter
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response")
            .status()
    }

    #[tokio::test]
    async fn webhook_forwards_relevant_events() {
        let adapter =
            Arc::new(OneBotAdapter::new("http://127.0.0.1:1", Duration::from_secs(1)).expect("adapter"));
        let (tx, mut rx) = mpsc::channel(4);
        adapter.start(tx).await.expect("start");

        let event = json!({
            "self_id": 1,
            "post_type": "message",
            "message_type": "private",
            "message_id": 100,
            "user_id": 42,
            "raw_message": "hello",
            "message": [{ "type": "text", "data": { "text": "hello" } }],
        });
        assert_eq!(post_event(adapter.clone(), &event.to_string()).await, StatusCode::NO_CONTENT);
        let inbound = rx.recv().await.expect("inbound");
        assert_eq!(inbound.message_id, 100);
        assert_eq!(inbound.text, "hello");

        let heartbeat = json!({ "self_id": 1, "post_type": "meta_event" });
        assert_eq!(
            post_event(adapter.clone(), &heartbeat.to_string()).await,
            StatusCode::NO_CONTENT
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(post_event(adapter, "{oops").await, StatusCode::BAD_REQUEST);
    }

    async fn spawn_gateway(reply: Value, status: StatusCode) -> (String, Arc<Mutex<Vec<(String, Value)>>>) {
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::default();
        let seen_in = seen.clone();
        let router = Router::new().route(
            "/{action}",
            post(
                move |axum::extract::Path(action): axum::extract::Path<String>,
                      Json(body): Json<Value>| {
                    let seen = seen_in.clone();
                    let reply = reply.clone();
                    async move {
                        seen.lock().expect("lock").push((action, body));
                        (status, Json(reply))
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn send_returns_assigned_id() {
        let (endpoint, seen) = spawn_gateway(
            json!({ "status": "ok", "retcode": 0, "data": { "message_id": 555 } }),
            StatusCode::OK,
        )
        .await;
        let adapter = OneBotAdapter::new(&endpoint, Duration::from_secs(5)).expect("adapter");

        let id = adapter
            .send(&outbound(Some(9), Some("m")))
            .await
            .expect("send");
        assert_eq!(id, Some(555));
        adapter
            .send_forward(42, None, "thinking")
            .await
            .expect("forward");

        let seen = seen.lock().expect("lock");
        assert_eq!(seen[0].0, "send_group_msg");
        assert_eq!(seen[0].1["group_id"], 9);
        assert_eq!(seen[1].0, "send_private_forward_msg");
        assert_eq!(seen[1].1["messages"][0]["type"], "node");
        assert_eq!(
            seen[1].1["messages"][0]["data"]["content"][0]["data"]["text"],
            "thinking"
        );
    }

    #[tokio::test]
    async fn zero_id_means_unassigned() {
        let (endpoint, _) = spawn_gateway(
            json!({ "status": "failed", "retcode": 1200, "data": null }),
            StatusCode::OK,
        )
        .await;
        let adapter = OneBotAdapter::new(&endpoint, Duration::from_secs(5)).expect("adapter");
        assert_eq!(adapter.send(&outbound(None, None)).await.expect("send"), None);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (endpoint, _) = spawn_gateway(json!({}), StatusCode::INTERNAL_SERVER_ERROR).await;
        let adapter = OneBotAdapter::new(&endpoint, Duration::from_secs(5)).expect("adapter");
        assert!(adapter.send(&outbound(None, None)).await.is_err());
    }
}
