//! End-to-end runs of the sync-cli binary against demo relays.

use assert_cmd::Command;
use predicates::prelude::*;

fn sync_cli() -> Command {
    Command::cargo_bin("sync-cli").unwrap()
}

#[test]
fn timeline_prints_demo_notes() {
    sync_cli()
        .args(["--mock", "timeline", "--relay", "wss://demo.test", "--kind", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("demo note #39"))
        .stdout(predicate::str::contains("30 event(s) from 1 relay(s)"));
}

#[test]
fn timeline_uses_default_relays_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("sync.toml");
    std::fs::write(&config, "block_size = 5\ndefault_relays = [\"wss://demo.test\"]\n").unwrap();

    sync_cli()
        .arg("--mock")
        .arg("--config")
        .arg(&config)
        .args(["timeline", "--kind", "1", "--pages", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("10 event(s) from 1 relay(s)"));
}

#[test]
fn timeline_without_relays_fails() {
    sync_cli()
        .args(["--mock", "timeline"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No relays given"));
}

#[test]
fn publish_reports_each_relay() {
    let dir = tempfile::tempdir().unwrap();
    let event = dir.path().join("event.json");
    let note = nostr_sync_types::Event::unsigned("aa", 1, 1, vec![], "hello");
    std::fs::write(&event, serde_json::to_string(&note).unwrap()).unwrap();

    sync_cli()
        .args(["--mock", "publish", "--relay", "wss://a.test", "--relay", "wss://b.test", "--event"])
        .arg(&event)
        .assert()
        .success()
        .stdout(predicate::str::contains("Accepted by 2/2 relay(s)"));
}
