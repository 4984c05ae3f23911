//! ReplyChain: relays OneBot chat messages to LLM providers, threading each
//! conversation through the reply chain.

mod commands;
mod config;
mod dispatcher;
mod outbound;
mod prompts;
mod server;
mod viewer;
mod whitelist;

use clap::{Parser, Subcommand};
use rc_context::{RootId, RootKind};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

const DEFAULT_LOG_FILTER: &str =
    "info,replychain=debug,rc_app=debug,rc_context=debug,rc_llm=debug,rc_channels=debug,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "replychain", version, about = "Reply-chain LLM relay for OneBot gateways")]
struct Cli {
    /// Config file (default: ~/.replychain/config.toml).
    #[arg(long, global = true, env = "REPLYCHAIN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay (default).
    Serve,
    /// Validate config and the files it points at.
    Doctor,
    /// Print a stored conversation branch as JSON.
    History {
        /// `user` or `group`.
        kind: RootKind,
        #[arg(allow_hyphen_values = true)]
        id: i64,
        /// Leaf message; the most recent branch when omitted.
        #[arg(long, allow_hyphen_values = true)]
        message_id: Option<i32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::History {
            kind,
            id,
            message_id,
        } => server::history(cli.config, RootId::new(kind, id), message_id).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let log_format = std::env::var("REPLYCHAIN_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported REPLYCHAIN_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
