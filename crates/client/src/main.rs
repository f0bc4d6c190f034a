//! cinebudget-watch - follow one project's expenses from the terminal
//!
//! Connects to the project channel, prints every expense update as a JSON
//! line and every notice on stderr, and disconnects on Ctrl-C.

use std::sync::Arc;

use anyhow::{bail, Context};
use cinebudget_client::{ExpenseSync, FileTokenStore, Storage, SyncConfig, TokenStore};
use cinebudget_shared::TokenPair;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cinebudget_client=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(project_id) = std::env::args().nth(1) else {
        bail!("usage: cinebudget-watch <project_id>");
    };

    let config = SyncConfig::from_env();
    let storage = Storage::default_location().context("no config directory on this platform")?;
    let tokens = Arc::new(FileTokenStore::open(storage));
    seed_tokens(tokens.as_ref());

    let mut sync =
        ExpenseSync::new(config.clone(), tokens).context("failed to set up expense sync")?;
    sync.add_message_listener(|update| {
        println!("{}", serde_json::to_string(&update.raw)?);
        Ok(())
    });
    let mut notices = sync.notices();

    tracing::info!(%project_id, host = %config.host, "connecting");
    if let Err(e) = sync.connect(&project_id).await {
        if e.is_auth() {
            return Err(e).context("not logged in; set CINEBUDGET_ACCESS_TOKEN and CINEBUDGET_REFRESH_TOKEN");
        }
        tracing::warn!(error = %e, "first connection attempt failed, retrying in the background");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    eprintln!("{notice}");
                    if notice.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "notices dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    sync.disconnect().await;
    Ok(())
}

/// Seed the session from the environment when both tokens are provided.
fn seed_tokens(tokens: &dyn TokenStore) {
    let access = std::env::var("CINEBUDGET_ACCESS_TOKEN").ok();
    let refresh = std::env::var("CINEBUDGET_REFRESH_TOKEN").ok();
    if let (Some(access), Some(refresh)) = (access, refresh) {
        tokens.set(&TokenPair { access, refresh });
    }
}
