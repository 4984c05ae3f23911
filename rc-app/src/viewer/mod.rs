//! Read-only browser over stored conversations, served on its own listener.

pub mod auth;
pub mod rate_limit;

use anyhow::Context;
use auth::{AuthConfig, Viewer};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router, middleware};
use rate_limit::FixedWindowLimiter;
use rc_context::{ContextEngine, ContextError, DialogForest, DialogNode, ForestFilter, RootId};
use rc_llm::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Display names keyed by `user/<id>` / `group/<id>`.
#[derive(Debug, Clone, Default)]
pub struct IdMap(HashMap<String, String>);

#[derive(Debug, Deserialize)]
struct IdMapping {
    namespaced_id: String,
    name: String,
}

impl IdMap {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let mappings: Vec<IdMapping> =
            serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(Self::from_iter(
            mappings.into_iter().map(|m| (m.namespaced_id, m.name)),
        ))
    }

    pub fn name_of(&self, root: &RootId) -> Option<&str> {
        self.0.get(&root.to_string()).map(String::as_str)
    }
}

impl FromIterator<(String, String)> for IdMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Replace the last four characters with `x`.
pub fn mask_last_four(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let keep = chars.len().saturating_sub(4);
    let mut out: String = chars[..keep].iter().collect();
    out.extend(std::iter::repeat_n('x', chars.len() - keep));
    out
}

pub struct ViewerState {
    context: ContextEngine,
    id_map: IdMap,
    fuzz_ids: bool,
}

impl ViewerState {
    pub fn new(context: ContextEngine, id_map: IdMap, fuzz_ids: bool) -> Self {
        Self {
            context,
            id_map,
            fuzz_ids,
        }
    }

    fn label(&self, root: &RootId) -> String {
        let raw = root.to_string();
        let mut label = if self.fuzz_ids {
            mask_last_four(&raw)
        } else {
            raw
        };
        if let Some(name) = self.id_map.name_of(root) {
            label.push('@');
            label.push_str(name);
        }
        label
    }

    /// Forest regrouped under display labels. Masked labels may collide, in
    /// which case the trees are merged and re-sorted newest first.
    fn labelled(&self, forest: DialogForest) -> BTreeMap<String, Vec<DialogNode>> {
        let mut dialogs: BTreeMap<String, Vec<DialogNode>> = BTreeMap::new();
        for (root, trees) in forest.groups {
            dialogs.entry(self.label(&root)).or_default().extend(trees);
        }
        for trees in dialogs.values_mut() {
            trees.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }
        dialogs
    }
}

#[derive(Debug)]
pub enum ViewerError {
    BadPath(String),
    Forbidden(RootId),
    NotFound(String),
    Internal(String),
}

impl From<ContextError> for ViewerError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::ChainBroken { .. } | ContextError::ChainCycle(_) | ContextError::NoHistory(_) => {
                Self::NotFound(e.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ViewerError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadPath(e) => (StatusCode::BAD_REQUEST, format!("bad path: {e}")),
            Self::Forbidden(root) => (StatusCode::FORBIDDEN, format!("no permission for {root}")),
            Self::NotFound(e) => (StatusCode::NOT_FOUND, e),
            Self::Internal(e) => {
                tracing::error!(error = %e, "viewer request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e)
            }
        };
        (status, Json(json!({ "status": "error", "error": error }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct DialogsResponse {
    welcome: String,
    dialogs: BTreeMap<String, Vec<DialogNode>>,
    orphaned: usize,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    root: RootId,
    messages: Vec<ChatMessage>,
}

pub fn router(
    state: Arc<ViewerState>,
    auth: Arc<AuthConfig>,
    limiter: Arc<FixedWindowLimiter>,
) -> Router {
    Router::new()
        .route("/", get(list_dialogs))
        .route("/{kind}/{id}", get(root_dialogs))
        .route("/{kind}/{id}/{message_id}", get(linear_history))
        .layer(middleware::from_fn_with_state(auth, auth::require_basic_auth))
        .layer(middleware::from_fn_with_state(
            limiter,
            rate_limit::enforce_rate_limit,
        ))
        .with_state(state)
}

fn parse_root(kind: &str, id: &str) -> Result<RootId, ViewerError> {
    format!("{kind}/{id}")
        .parse()
        .map_err(|e: ContextError| ViewerError::BadPath(e.to_string()))
}

async fn build_forest(state: &ViewerState, filter: ForestFilter) -> Result<DialogForest, ViewerError> {
    let context = state.context.clone();
    tokio::task::spawn_blocking(move || context.build_dialog_forest(&filter))
        .await
        .map_err(|e| ViewerError::Internal(e.to_string()))?
        .map_err(ViewerError::from)
}

fn dialogs_response(state: &ViewerState, viewer: &Viewer, forest: DialogForest) -> Json<DialogsResponse> {
    let orphaned = forest.orphaned;
    Json(DialogsResponse {
        welcome: viewer.welcome.clone(),
        dialogs: state.labelled(forest),
        orphaned,
    })
}

#[tracing::instrument(level = "info", skip_all, fields(viewer = %viewer.name))]
async fn list_dialogs(
    State(state): State<Arc<ViewerState>>,
    Extension(viewer): Extension<Viewer>,
) -> Result<Json<DialogsResponse>, ViewerError> {
    let started = std::time::Instant::now();
    let forest = build_forest(&state, viewer.forest_filter()).await?;
    tracing::debug!(
        nodes = forest.node_count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "dialog forest built"
    );
    Ok(dialogs_response(&state, &viewer, forest))
}

#[tracing::instrument(level = "info", skip_all, fields(viewer = %viewer.name, kind = %kind, id = %id))]
async fn root_dialogs(
    State(state): State<Arc<ViewerState>>,
    Extension(viewer): Extension<Viewer>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<DialogsResponse>, ViewerError> {
    let root = parse_root(&kind, &id)?;
    if !viewer.may_view(root) {
        return Err(ViewerError::Forbidden(root));
    }
    let forest = build_forest(&state, ForestFilter::Only(root)).await?;
    Ok(dialogs_response(&state, &viewer, forest))
}

#[tracing::instrument(level = "info", skip_all, fields(viewer = %viewer.name, kind = %kind, id = %id, message_id = %message_id))]
async fn linear_history(
    State(state): State<Arc<ViewerState>>,
    Extension(viewer): Extension<Viewer>,
    Path((kind, id, message_id)): Path<(String, String, String)>,
) -> Result<Json<HistoryResponse>, ViewerError> {
    let root = parse_root(&kind, &id)?;
    let leaf = match message_id.as_str() {
        "latest" => None,
        raw => Some(
            raw.parse::<i32>()
                .map_err(|e| ViewerError::BadPath(format!("message id {raw:?}: {e}")))?,
        ),
    };
    if !viewer.may_view(root) {
        return Err(ViewerError::Forbidden(root));
    }

    let context = state.context.clone();
    let messages = tokio::task::spawn_blocking(move || match leaf {
        Some(message_id) => context.load_linear_history(root, message_id),
        None => context.load_latest_history(root),
    })
    .await
    .map_err(|e| ViewerError::Internal(e.to_string()))??;
    Ok(Json(HistoryResponse { root, messages }))
}
