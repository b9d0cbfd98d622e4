//! Larder: headless driver for the client sync engine.
//!
//! Main binary with subcommands:
//! - `watch`: Load the feed, follow the change feed and reconcile until Ctrl-C
//! - `toggle`: One optimistic like, save or follow
//! - `view`: Log a one-shot view action

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use larder::{LarderConfig, Session};
use larder_sync::{
    CacheKey, EntityId, HttpGateway, MutationKind, OnceActionKind, StoreUpdate, ViewContext, ViewId,
};

/// How often `watch` evicts unreferenced stale snapshots.
const GC_INTERVAL_SECS: u64 = 60;

/// Parse a toggle kind: like, save or follow.
fn parse_mutation_kind(s: &str) -> Result<MutationKind, String> {
    MutationKind::parse(&s.to_lowercase())
        .ok_or_else(|| format!("invalid toggle '{}', expected like/save/follow", s))
}

#[derive(Parser)]
#[command(name = "larder")]
#[command(about = "Headless driver for the Larder sync engine", long_about = None)]
struct Cli {
    /// Backend base URL
    #[arg(long, env = "LARDER_API_URL", global = true)]
    api_url: Option<String>,

    /// Backend API key
    #[arg(long, env = "LARDER_API_KEY", global = true)]
    api_key: Option<String>,

    /// Signed-in user's access token
    #[arg(long, env = "LARDER_ACCESS_TOKEN", global = true)]
    access_token: Option<String>,

    /// Signed-in user's id
    #[arg(long, env = "LARDER_USER_ID", global = true)]
    user_id: Option<String>,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the first feed page and keep it consistent until Ctrl-C
    Watch {
        /// Change feed WebSocket URL
        #[arg(long, env = "LARDER_REALTIME_URL")]
        realtime_url: Option<String>,
    },

    /// Toggle like, save or follow on a recipe or profile
    Toggle {
        /// like, save or follow
        #[arg(value_parser = parse_mutation_kind)]
        kind: MutationKind,

        /// Recipe or profile id
        target: String,
    },

    /// Log a one-shot view of a recipe (or a profile with --profile)
    View {
        /// Recipe or profile id
        target: String,

        /// The target is a profile
        #[arg(long)]
        profile: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "larder=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let session = open_session(&cli).await?;

    let result = match cli.command {
        Commands::Watch { realtime_url } => watch(&session, realtime_url).await,
        Commands::Toggle { kind, target } => toggle(&session, kind, &target).await,
        Commands::View { target, profile } => view(&session, &target, profile).await,
    };

    session.sign_out().await;
    result
}

async fn open_session(cli: &Cli) -> Result<Session> {
    let api_url = cli
        .api_url
        .as_deref()
        .ok_or_else(|| miette::miette!("--api-url or LARDER_API_URL is required"))?;
    let api_key = cli
        .api_key
        .as_deref()
        .ok_or_else(|| miette::miette!("--api-key or LARDER_API_KEY is required"))?;
    let user_id = cli
        .user_id
        .as_deref()
        .ok_or_else(|| miette::miette!("--user-id or LARDER_USER_ID is required"))?;

    let config = match &cli.config {
        Some(path) => LarderConfig::load(path).await?,
        None => LarderConfig::default(),
    };

    let mut gateway =
        HttpGateway::new(api_url, api_key).map_err(|e| miette::miette!("failed to create gateway: {}", e))?;
    if let Some(token) = &cli.access_token {
        gateway = gateway.with_access_token(token.as_str());
    }

    Ok(Session::start(EntityId::new(user_id), Arc::new(gateway), config))
}

async fn watch(session: &Session, realtime_url: Option<String>) -> Result<()> {
    let feed = ViewId::new("feed");
    let keys = session
        .mount_feed(feed.clone(), 0)
        .await
        .map_err(|e| miette::miette!("failed to load feed: {}", e))?;
    info!(count = keys.len(), "feed mounted");

    match realtime_url {
        Some(url) => {
            session.connect_realtime(url).await;
        }
        None => warn!("no realtime URL configured, relying on reconciliation only"),
    }
    session.focus(&feed);

    let mut updates = session.store().updates();
    let mut gc = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal");
                break;
            }
            _ = gc.tick() => {
                let evicted = session.collect_garbage();
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "evicted unreferenced snapshots");
                }
            }
            update = updates.recv() => match update {
                Ok(StoreUpdate::Put { key, version, origin }) => {
                    if let Some(snapshot) = session.get(&key) {
                        info!(key = %key, version, origin = ?origin, value = ?snapshot.value, "updated");
                    }
                }
                Ok(StoreUpdate::Invalidated { key, .. }) => info!(key = %key, "invalidated"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "update log lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.blur(&feed);
    session.unmount(&feed);
    Ok(())
}

async fn toggle(session: &Session, kind: MutationKind, target: &str) -> Result<()> {
    let key = CacheKey::new(kind.target_kind(), target).in_context(ViewContext::Detail);
    let outcome = session
        .dispatch(kind, key.clone())
        .await
        .map_err(|e| miette::miette!("{} failed: {}", kind, e))?;
    info!(key = %key, outcome = ?outcome, "toggle settled");

    if let Some(snapshot) = session.get(&key) {
        info!(key = %key, value = ?snapshot.value, "current value");
    }
    Ok(())
}

async fn view(session: &Session, target: &str, profile: bool) -> Result<()> {
    let action = if profile {
        OnceActionKind::ProfileView
    } else {
        OnceActionKind::RecipeView
    };
    let outcome = session
        .log_view(action, &EntityId::new(target))
        .await
        .map_err(|e| miette::miette!("failed to log view: {}", e))?;
    info!(id = %target, action = %action, outcome = ?outcome, "view logged");
    Ok(())
}
