//! Publish a pre-signed event and report each relay's answer.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use nostr_sync_client::{ClientConfig, PublishAction, SyncContext};
use nostr_sync_core::CommandResult;
use nostr_sync_types::Event;

use super::relay_pool;
use crate::config;

/// Read an event from a JSON file.
pub async fn read_event(path: &Path) -> Result<Event> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read event file {}", path.display()))?;
    serde_json::from_str(&contents).context("Invalid event JSON")
}

/// Run the publish command. Returns one result per relay.
pub async fn run(
    config: &ClientConfig,
    relays: &[String],
    event_file: &Path,
    timeout: Option<Duration>,
    use_mock: bool,
) -> Result<Vec<CommandResult>> {
    let relays = config::resolve_relays(relays, config)?;
    let event = read_event(event_file).await?;
    if !event.has_valid_id() {
        warn!(id = %event.id, "event id does not match its content; relays will likely reject it");
    }

    let pool = relay_pool(config, &relays, use_mock);
    let context = SyncContext::new();
    let timeout = timeout.unwrap_or_else(|| config.publish_timeout());
    println!("Publishing {} to {} relay(s)...", event.id, relays.len());

    let action = PublishAction::new(&pool, &context, "cli", &relays, event, timeout)
        .context("Failed to start publish")?;
    let results = action.on_complete().wait().await;

    for result in &results {
        if result.status {
            println!("  {}  ok {}", result.relay, result.message);
        } else {
            println!("  {}  FAILED {}", result.relay, result.message);
        }
    }
    let accepted = results.iter().filter(|r| r.status).count();
    println!();
    println!("Accepted by {}/{} relay(s)", accepted, results.len());

    if accepted == 0 {
        anyhow::bail!("No relay accepted the event");
    }
    Ok(results)
}
