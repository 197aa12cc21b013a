use chrono::{DateTime, TimeZone, Utc};
use mqc_core::{ClaimConfig, ClaimRenewal, ClaimRequest, ManualClock, NewMessage, SystemClock};
use mqc_storage::{QueueStore, StorageError};
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

const WORKERS: usize = 8;

fn config() -> ClaimConfig {
    ClaimConfig {
        busy_timeout_ms: 30_000,
        ..ClaimConfig::default()
    }
}

fn open(file: &NamedTempFile) -> QueueStore {
    QueueStore::open_with(file.path(), config(), Arc::new(SystemClock)).expect("open db")
}

fn seed(file: &NamedTempFile, messages: usize) -> Vec<String> {
    let db = open(file);
    db.create_queue("work", None).expect("create queue");
    let batch: Vec<NewMessage> = (0..messages)
        .map(|n| NewMessage::new(600, json!({ "n": n })))
        .collect();
    db.post_messages("work", None, &batch).expect("post")
}

fn claim_concurrently(file: &NamedTempFile, limit: usize) -> Vec<(String, Vec<String>)> {
    let barrier = Arc::new(Barrier::new(WORKERS));
    thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let barrier = barrier.clone();
                scope.spawn(move || {
                    let db = open(file);
                    barrier.wait();
                    let (claim_id, messages) = db
                        .claims()
                        .create("work", ClaimRequest::new(300, 30), None, Some(limit))
                        .expect("create claim");
                    let ids = messages
                        .fetch()
                        .expect("fetch")
                        .into_iter()
                        .map(|message| message.id)
                        .collect::<Vec<_>>();
                    (claim_id, ids)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect()
    })
}

#[test]
fn concurrent_single_message_claims_never_overlap() {
    let file = NamedTempFile::new().expect("temp db");
    let posted = seed(&file, WORKERS);

    let results = claim_concurrently(&file, 1);

    let claim_ids: BTreeSet<&String> = results.iter().map(|(id, _)| id).collect();
    assert_eq!(claim_ids.len(), WORKERS);

    let mut claimed = BTreeSet::new();
    for (_, ids) in &results {
        assert_eq!(ids.len(), 1, "every worker holds exactly one message");
        assert!(claimed.insert(ids[0].clone()), "message claimed twice");
    }
    assert_eq!(claimed, posted.into_iter().collect::<BTreeSet<_>>());
}

#[test]
fn concurrent_batches_partition_the_queue() {
    let file = NamedTempFile::new().expect("temp db");
    let posted = seed(&file, WORKERS * 2 + 3);

    let results = claim_concurrently(&file, 3);

    let mut claimed = BTreeSet::new();
    let mut total = 0;
    for (_, ids) in &results {
        assert!(ids.len() <= 3);
        total += ids.len();
        claimed.extend(ids.iter().cloned());
    }
    assert_eq!(total, claimed.len(), "no message appears in two claims");
    assert_eq!(total, posted.len());

    let stats = open(&file).queue_stats("work", None).expect("stats");
    assert_eq!(stats.claimed as usize, posted.len());
    assert_eq!(stats.free, 0);
}

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Holds the database write lock on a separate connection.
fn hold_write_lock(file: &NamedTempFile) -> Connection {
    let conn = Connection::open(file.path()).expect("raw open");
    conn.execute_batch("BEGIN IMMEDIATE;").expect("take write lock");
    conn
}

fn open_at(file: &NamedTempFile, clock: &Arc<ManualClock>) -> QueueStore {
    QueueStore::open_with(file.path(), config(), clock.clone()).expect("open db")
}

#[test]
fn create_blocked_behind_a_writer_uses_the_time_it_acquires_the_lock() {
    let file = NamedTempFile::new().expect("temp db");
    let clock = Arc::new(ManualClock::new(ts()));
    let db = open_at(&file, &clock);
    db.create_queue("work", None).expect("create queue");
    db.post_messages("work", None, &[NewMessage::new(5, json!("short"))])
        .expect("post");

    let writer = hold_write_lock(&file);
    let (claim_age, claimed) = thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let (claim_id, messages) = db
                .claims()
                .create("work", ClaimRequest::new(30, 0), None, None)
                .expect("create claim");
            let claimed = messages.fetch().expect("fetch");
            let (view, _) = db.claims().get("work", &claim_id, None).expect("get");
            (view.age, claimed)
        });

        thread::sleep(Duration::from_millis(200));
        // The message lapses while the create is waiting for the lock.
        clock.advance_secs(10);
        writer.execute_batch("COMMIT;").expect("release write lock");

        handle.join().expect("worker panicked")
    });

    assert_eq!(claim_age, 0);
    assert!(claimed.is_empty(), "expired message was claimed: {claimed:?}");
}

#[test]
fn renewal_blocked_behind_a_writer_does_not_revive_a_lapsed_claim() {
    let file = NamedTempFile::new().expect("temp db");
    let clock = Arc::new(ManualClock::new(ts()));
    let db = open_at(&file, &clock);
    db.create_queue("work", None).expect("create queue");
    db.post_messages("work", None, &[NewMessage::new(600, json!("job"))])
        .expect("post");
    let (claim_id, _) = db
        .claims()
        .create("work", ClaimRequest::new(5, 0), None, None)
        .expect("create claim");

    let writer = hold_write_lock(&file);
    let result = thread::scope(|scope| {
        let claim_id = claim_id.as_str();
        let handle = scope.spawn(move || {
            db.claims()
                .update("work", claim_id, ClaimRenewal { ttl: 60 }, None)
        });

        thread::sleep(Duration::from_millis(200));
        // The claim lapses while the renewal is waiting for the lock.
        clock.advance_secs(10);
        writer.execute_batch("COMMIT;").expect("release write lock");

        handle.join().expect("worker panicked")
    });

    match result {
        Err(StorageError::ClaimDoesNotExist { claim_id: id, .. }) => assert_eq!(id, claim_id),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(()) => panic!("lapsed claim was renewed"),
    }
}
