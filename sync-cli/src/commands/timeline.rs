//! Page a timeline backward and print it.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use nostr_sync_client::{ClientConfig, SyncContext, TimelineLoader};
use nostr_sync_types::{Event, Filter, QueryMap};

use super::relay_pool;
use crate::config;

/// Options for the timeline command.
#[derive(Debug, Clone)]
pub struct TimelineOptions {
    /// Relays to read from (config defaults when empty).
    pub relays: Vec<String>,
    /// Event kinds to include (all when empty).
    pub kinds: Vec<u32>,
    /// Authors to include (all when empty).
    pub authors: Vec<String>,
    /// Blocks to load per relay.
    pub pages: u32,
    /// How long to wait for one page.
    pub page_timeout: Duration,
    /// Print one JSON event per line instead of a summary.
    pub json: bool,
}

fn query_map(relays: &[String], kinds: &[u32], authors: &[String]) -> QueryMap {
    let mut filter = Filter::new();
    if !kinds.is_empty() {
        filter = filter.kinds(kinds.iter().copied());
    }
    if !authors.is_empty() {
        filter = filter.authors(authors.iter().cloned());
    }
    relays
        .iter()
        .map(|relay| (relay.clone(), vec![filter.clone()]))
        .collect()
}

/// Run the timeline command. Returns the events printed.
pub async fn run(config: &ClientConfig, options: &TimelineOptions, use_mock: bool) -> Result<Vec<Event>> {
    let relays = config::resolve_relays(&options.relays, config)?;
    let pool = relay_pool(config, &relays, use_mock);
    let timeline = TimelineLoader::new(pool, SyncContext::new(), "cli", config);

    let (loading_tx, mut loading_rx) = watch::channel(timeline.loading().value());
    let _loading = timeline.loading().subscribe(move |loading: &bool| {
        let _ = loading_tx.send(*loading);
    });

    timeline
        .set_query_map(query_map(&relays, &options.kinds, &options.authors))
        .context("Invalid query")?;

    for page in 1..=options.pages {
        if page > 1 {
            if timeline.complete().value() {
                break;
            }
            timeline.load_next_block();
        }
        let idle = tokio::time::timeout(options.page_timeout, loading_rx.wait_for(|loading| !*loading))
            .await
            .is_ok();
        if !idle {
            warn!(page, "page timed out; printing what arrived");
            break;
        }
        info!(page, events = timeline.store().len(), "page loaded");
    }

    let events = timeline.timeline().value();
    timeline.cleanup();

    for event in &events {
        if options.json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{}", summarize(event));
        }
    }
    if !options.json {
        println!();
        println!("{} event(s) from {} relay(s)", events.len(), relays.len());
    }
    Ok(events)
}

fn summarize(event: &Event) -> String {
    let author: String = event.pubkey.chars().take(8).collect();
    let mut content: String = event.content.replace('\n', " ").chars().take(72).collect();
    if event.content.chars().count() > 72 {
        content.push_str("...");
    }
    format!("[{}] kind {:<5} {} {}", event.created_at, event.kind, author, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sync_types::kind;

    fn options(relays: &[&str], pages: u32) -> TimelineOptions {
        TimelineOptions {
            relays: relays.iter().map(|r| r.to_string()).collect(),
            kinds: vec![kind::TEXT_NOTE],
            authors: Vec::new(),
            pages,
            page_timeout: Duration::from_secs(5),
            json: false,
        }
    }

    #[tokio::test]
    async fn first_page_is_one_block() {
        let events = run(&ClientConfig::default(), &options(&["wss://a.test"], 1), true)
            .await
            .unwrap();
        assert_eq!(events.len(), 30);
        assert!(events.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert!(events.iter().all(|e| e.kind == kind::TEXT_NOTE));
    }

    #[tokio::test]
    async fn more_pages_reach_older_events() {
        let events = run(&ClientConfig::default(), &options(&["wss://a.test"], 5), true)
            .await
            .unwrap();
        assert_eq!(events.len(), 40);
    }

    #[tokio::test]
    async fn relays_with_the_same_events_merge() {
        let events = run(&ClientConfig::default(), &options(&["wss://a.test", "wss://b.test"], 1), true)
            .await
            .unwrap();
        assert_eq!(events.len(), 30);
    }

    #[tokio::test]
    async fn author_filter_applies() {
        let mut opts = options(&["wss://a.test"], 5);
        let author = super::super::demo_events()[0].pubkey.clone();
        opts.authors = vec![author.clone()];
        let events = run(&ClientConfig::default(), &opts, true).await.unwrap();
        assert_eq!(events.len(), 20);
        assert!(events.iter().all(|e| e.pubkey == author));
    }

    #[tokio::test]
    async fn requires_a_relay() {
        assert!(run(&ClientConfig::default(), &options(&[], 1), true).await.is_err());
    }

    #[test]
    fn summary_is_one_line() {
        let event = Event::unsigned("abcdef0123", kind::TEXT_NOTE, 7, vec![], "line one\nline two");
        assert_eq!(summarize(&event), "[7] kind 1     abcdef01 line one line two");
    }
}
