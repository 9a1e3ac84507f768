//! compaction-proxy server binary.
//!
//! # Environment variables
//!
//! - `HOST`: bind address (default 127.0.0.1)
//! - `PROXY_PORT` / `DASHBOARD_PORT`: listener ports (defaults 8742 / 8743)
//! - `UPSTREAM_URL`: real API base URL (default https://api.anthropic.com)
//! - `CHECKPOINT_THRESHOLD`: background checkpoint trigger (default 0.70)
//! - `SWAP_THRESHOLD`: swap eligibility trigger (default 0.80)
//! - `PASSTHROUGH`: disable all interception (default false)
//! - `CONVERSATION_TTL_SECONDS`: idle eviction (default 7200)
//! - `COMPACT_TRIGGER_TOKENS`: minimum size to checkpoint (default 50000)
//! - `DB_PATH`: snapshot database file
//! - `LOG_LEVEL` / `RUST_LOG`: log filtering

use compaction_proxy::{server, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("LOG_LEVEL").map(tracing_subscriber::EnvFilter::new))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("compaction_proxy=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        host = %config.host,
        proxy_port = config.proxy_port,
        dashboard_port = config.dashboard_port,
        upstream = %config.upstream_url,
        passthrough = config.passthrough,
        "starting compaction proxy"
    );

    server::run(config).await
}
