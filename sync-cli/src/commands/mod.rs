//! CLI command implementations.

pub mod publish;
pub mod timeline;

use nostr_sync_client::{ClientConfig, MockConnector, RelayPool};
use nostr_sync_types::{kind, Event, Tag};
use std::sync::Arc;

/// Pool over real websockets, or over in-memory relays serving
/// [`demo_events`] when `use_mock` is set.
pub fn relay_pool(config: &ClientConfig, relays: &[String], use_mock: bool) -> RelayPool {
    if !use_mock {
        return RelayPool::websocket(config);
    }
    let connector = MockConnector::new();
    for url in relays {
        connector.transport_for(url).respond_with_events(demo_events());
    }
    RelayPool::new(Arc::new(connector), config)
}

/// Events held by every mock relay.
pub fn demo_events() -> Vec<Event> {
    const AUTHORS: [&str; 2] = [
        "1f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c5b6a7988",
        "a0b1c2d3e4f5a6b7a0b1c2d3e4f5a6b7a0b1c2d3e4f5a6b7a0b1c2d3e4f5a6b7",
    ];
    let mut events: Vec<Event> = (0..40u64)
        .map(|i| {
            Event::unsigned(
                AUTHORS[(i % 2) as usize],
                kind::TEXT_NOTE,
                1_700_000_000 + i * 60,
                vec![Tag::new(["t", "demo"])],
                format!("demo note #{}", i),
            )
        })
        .collect();
    events.push(Event::unsigned(AUTHORS[0], kind::METADATA, 1_700_000_000, vec![], r#"{"name":"demo"}"#));
    events
}
