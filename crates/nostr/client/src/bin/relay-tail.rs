use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nostr::Filter;
use nostr_relay_pool::{PoolConfig, PoolNotification, RelayPool};
use serde_json::json;
use tracing::{info, warn};

/// Stream events from Nostr relays to stdout, one JSON object per line.
#[derive(Parser, Debug)]
struct Args {
    /// Relay URL. Repeatable; replaces NOSTR_RELAYS when given.
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// Event kind to match. Repeatable.
    #[arg(long = "kind")]
    kinds: Vec<u16>,

    /// Author public key (hex) to match. Repeatable.
    #[arg(long = "author")]
    authors: Vec<String>,

    /// Maximum number of stored events each relay should send back.
    #[arg(long)]
    limit: Option<u64>,
}

impl Args {
    fn filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied());
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.iter().cloned());
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = PoolConfig::from_env().context("read relay configuration")?;
    if !args.relays.is_empty() {
        config.relays.clone_from(&args.relays);
    }
    if config.relays.is_empty() {
        bail!("no relays configured; pass --relay or set NOSTR_RELAYS");
    }

    let pool = RelayPool::websocket(config);
    if let Err(error) = pool.connect_all().await {
        warn!("{}", error);
    }

    let subscriptions = pool.subscribe(None, args.filter()).await;
    if subscriptions.is_empty() {
        pool.close_all().await;
        bail!("no relay could be reached");
    }
    info!("subscribed on {} relay(s)", subscriptions.len());

    let events = pool.events();
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                info!("interrupted; closing relays");
                break;
            }
            notification = events.recv() => match notification {
                Some(PoolNotification::Event(relay_event)) => {
                    let line = json!({
                        "relay": relay_event.relay_url,
                        "subscription": relay_event.subscription_id,
                        "event": relay_event.event,
                    });
                    writeln!(stdout, "{}", line).context("write event to stdout")?;
                    stdout.flush().context("flush stdout")?;
                }
                Some(PoolNotification::EndOfStoredEvents { relay_url, .. }) => {
                    info!("{} sent all stored events", relay_url);
                }
                None => break,
            },
        }
    }

    pool.close_all().await;
    Ok(())
}
