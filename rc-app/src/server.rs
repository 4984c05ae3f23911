//! ReplyChain server: webhook listener, dispatcher, outbound loop and the
//! optional dialog viewer, wired together and shut down in order.

use crate::config::{ReplyChainConfig, expand_home};
use crate::dispatcher::Dispatcher;
use crate::outbound::OutboundSender;
use crate::prompts::SystemPrompts;
use crate::viewer::auth::AuthConfig;
use crate::viewer::rate_limit::FixedWindowLimiter;
use crate::viewer::{self, IdMap, ViewerState};
use crate::whitelist::Whitelist;
use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use rc_channels::{ChannelAdapter, OneBotAdapter};
use rc_context::{ContextEngine, RootId, SqliteStore};
use rc_llm::LlmClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// How long queued replies may keep going out after the dispatcher drained.
const OUTBOUND_DRAIN_GRACE: Duration = Duration::from_secs(30);

#[tracing::instrument(level = "info", skip_all)]
pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ReplyChainConfig::load_with_path(config_path).await?;
    tracing::info!(
        config = %path.display(),
        providers = ?cfg.provider_registry()?.names(),
        "config loaded"
    );

    let event_listener = preflight_bind_listener(cfg.event_bind_addr()?).await?;
    let viewer_listener = if cfg.viewer.enabled {
        Some(preflight_bind_listener(cfg.viewer_bind_addr()?).await?)
    } else {
        None
    };

    let context = open_context(&cfg)?;
    let providers = cfg.provider_registry()?;
    let completion = Arc::new(LlmClient::new(cfg.request_timeout()));
    let whitelist = Arc::new(Whitelist::open(expand_home(&cfg.whitelist.path)?)?);
    let prompts = SystemPrompts::load(&cfg.prompts)?;

    let adapter = Arc::new(OneBotAdapter::new(&cfg.gateway.endpoint, cfg.request_timeout())?);
    let channel: Arc<dyn ChannelAdapter> = adapter.clone();
    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.dispatch.inbound_buffer);
    let (outbound_tx, outbound_rx) = mpsc::channel(cfg.dispatch.outbound_buffer);
    channel.start(inbound_tx).await?;

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(
        context.clone(),
        providers,
        completion,
        whitelist,
        prompts,
        &cfg.dispatch,
        outbound_tx,
    ));
    let dispatcher_handle = tokio::spawn(dispatcher.run(inbound_rx, shutdown.child_token()));

    let outbound_shutdown = CancellationToken::new();
    let mut outbound_handle = tokio::spawn(
        OutboundSender::new(channel.clone(), context.clone())
            .run(outbound_rx, outbound_shutdown.clone()),
    );
    tracing::info!(
        channel = channel.channel_id(),
        max_concurrent = cfg.dispatch.max_concurrent,
        "dispatcher started"
    );

    let viewer_handle = match viewer_listener {
        Some(listener) => {
            let app = with_http_layers(build_viewer_router(&cfg, context.clone())?, &cfg);
            let stop = shutdown.clone();
            let addr = listener.local_addr()?;
            tracing::info!(%addr, "dialog viewer serving");
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
            }))
        }
        None => None,
    };

    tokio::spawn(shutdown_signal(shutdown.clone()));
    let event_app = with_http_layers(adapter.router(), &cfg);
    tracing::info!(addr = %event_listener.local_addr()?, "event webhook serving");
    axum::serve(event_listener, event_app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;
    tracing::info!("event webhook shutdown completed");

    shutdown.cancel();
    if let Some(handle) = viewer_handle {
        match handle.await {
            Ok(Ok(())) => tracing::info!("dialog viewer shutdown completed"),
            Ok(Err(e)) => tracing::error!(error = %e, "dialog viewer failed"),
            Err(e) => tracing::error!(error = %e, "dialog viewer task join failed"),
        }
    }
    if let Err(e) = dispatcher_handle.await {
        tracing::error!(error = %e, "dispatcher task join failed during shutdown");
    }
    let outbound_joined = match tokio::time::timeout(OUTBOUND_DRAIN_GRACE, &mut outbound_handle).await {
        Ok(joined) => joined,
        Err(_) => {
            tracing::warn!("outbound queue still busy; delivering what is queued and stopping");
            outbound_shutdown.cancel();
            outbound_handle.await
        }
    };
    if let Err(e) = outbound_joined {
        tracing::error!(error = %e, "outbound task join failed during shutdown");
    }
    tracing::info!("replychain shutdown completed");
    Ok(())
}

/// Load and validate everything `serve` would touch, without binding.
pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ReplyChainConfig::load_with_path(config_path).await?;
    println!("config: {} ok", path.display());

    let registry = cfg.provider_registry()?;
    for provider in registry.iter() {
        println!(
            "provider: {} model={} keys={} reasoning={}",
            provider.name,
            provider.model,
            provider.keys.len(),
            provider.reasoning
        );
    }

    open_context(&cfg)?;
    println!("storage: {} ok", cfg.storage.db_path);

    let whitelist = Whitelist::open(expand_home(&cfg.whitelist.path)?)?;
    println!("whitelist: {} {}", whitelist.path().display(), whitelist.show()?);

    let prompts = SystemPrompts::load(&cfg.prompts)?;
    println!(
        "prompts: private={} group={}",
        prompts.private.len(),
        prompts.group.len()
    );

    OneBotAdapter::new(&cfg.gateway.endpoint, cfg.request_timeout())?;
    println!("gateway: {} ok", cfg.gateway.endpoint);

    if cfg.viewer.enabled {
        let _viewer = build_viewer_router(&cfg, ContextEngine::new(Arc::new(SqliteStore::in_memory()?)))?;
        println!("viewer: {} ok", cfg.viewer.bind);
    } else {
        println!("viewer: disabled");
    }
    Ok(())
}

/// Print one stored conversation branch as JSON.
pub async fn history(
    config_path: Option<PathBuf>,
    root: RootId,
    message_id: Option<i32>,
) -> Result<()> {
    let cfg = ReplyChainConfig::load(config_path).await?;
    let context = open_context(&cfg)?;
    let messages = tokio::task::spawn_blocking(move || match message_id {
        Some(message_id) => context.load_linear_history(root, message_id),
        None => context.load_latest_history(root),
    })
    .await?
    .with_context(|| format!("history for {root}"))?;
    println!("{}", serde_json::to_string_pretty(&messages)?);
    Ok(())
}

fn open_context(cfg: &ReplyChainConfig) -> Result<ContextEngine> {
    let db_path = expand_home(&cfg.storage.db_path)?;
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("open store {}", db_path.display()))?;
    Ok(ContextEngine::new(Arc::new(store)))
}

fn build_viewer_router(cfg: &ReplyChainConfig, context: ContextEngine) -> Result<Router> {
    let auth_path = cfg
        .viewer
        .auth_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("viewer.auth_path is required"))?;
    let auth = AuthConfig::load(&expand_home(auth_path)?)?;
    let id_map = match cfg.viewer.id_map_path.as_deref().map(str::trim) {
        Some(path) if !path.is_empty() => IdMap::load(&expand_home(path)?)?,
        _ => IdMap::default(),
    };
    Ok(viewer::router(
        Arc::new(ViewerState::new(context, id_map, cfg.viewer.fuzz_ids)),
        Arc::new(auth),
        Arc::new(FixedWindowLimiter::per_second(cfg.viewer.requests_per_second)),
    ))
}

fn with_http_layers(router: Router, cfg: &ReplyChainConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    router
        .layer(GlobalConcurrencyLimitLayer::new(cfg.gateway.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            cfg.request_timeout(),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}
