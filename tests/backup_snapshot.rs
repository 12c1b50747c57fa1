//! Snapshot promotion against a live store.

use ircbot::backup::{BackupManager, CycleOutcome};
use ircbot::store::Store;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn quote_count(path: &Path) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM quotes", [], |r| r.get(0))
        .unwrap()
}

fn manager(store: &Store, tmp: &TempDir) -> BackupManager {
    BackupManager::new(
        Arc::new(store.clone()),
        tmp.path().join("bot.db.backup"),
        Duration::from_secs(1800),
        Duration::from_secs(10),
    )
}

#[tokio::test]
async fn each_cycle_replaces_snapshot_with_complete_copy() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(&tmp.path().join("bot.db")).unwrap();
    let manager = manager(&store, &tmp);
    let shutdown = CancellationToken::new();

    store.insert_quote(chrono::Utc::now(), 1, "first").await.unwrap();
    assert_eq!(manager.run_cycle(&shutdown).await, CycleOutcome::Promoted);
    assert_eq!(quote_count(manager.snapshot_path()), 1);

    store.insert_quote(chrono::Utc::now(), 2, "second").await.unwrap();
    assert_eq!(manager.run_cycle(&shutdown).await, CycleOutcome::Promoted);
    assert_eq!(quote_count(manager.snapshot_path()), 2);
    assert!(!manager.temp_path().exists());
}

#[tokio::test]
async fn store_stays_usable_while_exporting() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(&tmp.path().join("bot.db")).unwrap();
    for i in 0..50 {
        store
            .insert_quote(chrono::Utc::now(), i, &format!("quote {i}"))
            .await
            .unwrap();
    }
    let manager = manager(&store, &tmp);
    let shutdown = CancellationToken::new();

    let (outcome, quote) = tokio::join!(manager.run_cycle(&shutdown), store.quote(7));

    assert_eq!(outcome, CycleOutcome::Promoted);
    assert_eq!(quote.unwrap().lines, vec!["quote 6".to_string()]);
    assert_eq!(quote_count(manager.snapshot_path()), 50);
}
