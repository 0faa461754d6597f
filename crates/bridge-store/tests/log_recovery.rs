//! Durability and crash-recovery behavior of the disk-backed log.

use std::sync::Arc;

use bridge_store::{DiskBackend, EventLog, LogConfig, MemoryBackend};
use bridge_types::{
    AgentId, EventDraft, EventFilter, EventId, EventPayload, FileMutated, StreamId,
};

fn mutation(path: &str) -> EventDraft {
    EventDraft::new(
        StreamId::file(path),
        EventPayload::FileMutated(FileMutated {
            path: path.into(),
            mutation: "write".into(),
            agent: AgentId::from("alpha"),
            content_hash: None,
        }),
        AgentId::from("alpha"),
    )
}

async fn open_log(dir: &std::path::Path, config: &LogConfig) -> EventLog {
    let backend = DiskBackend::open(dir, config).await.unwrap();
    EventLog::start(Arc::new(backend), config.clone()).await.unwrap()
}

#[tokio::test]
async fn events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig::default();

    let log = open_log(dir.path(), &config).await;
    log.append(vec![mutation("a.rs"), mutation("b.rs")]).await.unwrap();
    let last = log.latest_id();
    log.close().await.unwrap();

    let log = open_log(dir.path(), &config).await;
    assert_eq!(log.latest_id(), last);
    let events = log.read(EventId::ZERO, 100, &EventFilter::all()).await.unwrap();
    assert_eq!(events.len(), 2);

    // Ids assigned after reopen continue past the recovered tail.
    let next = log.append_one(mutation("c.rs")).await.unwrap();
    assert!(next > last);
    log.close().await.unwrap();
}

#[tokio::test]
async fn torn_tail_is_truncated_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig::default();

    let log = open_log(dir.path(), &config).await;
    log.append(vec![mutation("a.rs"), mutation("b.rs"), mutation("c.rs")])
        .await
        .unwrap();
    let durable_last = log.latest_id();
    log.close().await.unwrap();

    // Simulate a crash mid-batch: garbage bytes after the fsynced frames.
    let segment = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|ext| ext == "log"))
        .unwrap();
    let mut bytes = std::fs::read(&segment).unwrap();
    let intact_len = bytes.len();
    bytes.extend_from_slice(&(4096u32).to_le_bytes());
    bytes.extend_from_slice(b"partial frame that never finished");
    std::fs::write(&segment, &bytes).unwrap();

    let log = open_log(dir.path(), &config).await;
    // The torn tail is invisible: latest id and reads stop at the durable
    // prefix, and the file is truncated back to it.
    assert_eq!(log.latest_id(), durable_last);
    let events = log.read(EventId::ZERO, 100, &EventFilter::all()).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(std::fs::metadata(&segment).unwrap().len(), intact_len as u64);

    // The chain continues from the recovered head.
    let next = log.append_one(mutation("d.rs")).await.unwrap();
    assert!(next > durable_last);
    let events = log.read(EventId::ZERO, 100, &EventFilter::all()).await.unwrap();
    assert_eq!(events.len(), 4);
    log.close().await.unwrap();
}

#[tokio::test]
async fn segments_roll_and_scans_cross_them() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
        segment_max_bytes: 1024, // force frequent rolls
        ..LogConfig::default()
    };

    let log = open_log(dir.path(), &config).await;
    for i in 0..50 {
        log.append_one(mutation(&format!("file-{i}.rs"))).await.unwrap();
    }
    let events = log.read(EventId::ZERO, 1000, &EventFilter::all()).await.unwrap();
    assert_eq!(events.len(), 50);
    for pair in events.windows(2) {
        assert!(pair[0].id < pair[1].id);
    }
    log.close().await.unwrap();

    let segments = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension().is_some_and(|ext| ext == "log")
        })
        .count();
    assert!(segments > 1, "expected the log to roll segments");

    // Reopen and read across the segment boundary from a mid-log cursor.
    let log = open_log(dir.path(), &config).await;
    let mid = events[20].id;
    let tail = log.read(mid, 1000, &EventFilter::all()).await.unwrap();
    assert_eq!(tail.len(), 29);
    assert_eq!(tail[0].id, events[21].id);
    log.close().await.unwrap();
}

#[tokio::test]
async fn filters_apply_during_scan() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig::default();
    let log = open_log(dir.path(), &config).await;

    log.append(vec![mutation("src/a.rs"), mutation("docs/b.md"), mutation("src/c.rs")])
        .await
        .unwrap();

    let filtered = log
        .read(EventId::ZERO, 100, &EventFilter::stream("file:src/"))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 2);
    log.close().await.unwrap();
}

#[tokio::test]
async fn storage_high_water_degrades_writes_but_not_reads() {
    let config = LogConfig {
        high_water_bytes: 1, // trip immediately after the first batch
        ..LogConfig::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), &config).await;

    log.append_one(mutation("a.rs")).await.unwrap();
    let err = log.append_one(mutation("b.rs")).await.unwrap_err();
    assert_eq!(err.code(), "degraded");

    // Reads continue at the durable prefix.
    let events = log.read(EventId::ZERO, 100, &EventFilter::all()).await.unwrap();
    assert_eq!(events.len(), 1);

    // The health surface reports the high-water condition.
    let mut health = log.health();
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while !health.borrow().storage_high_water {
            health.changed().await.unwrap();
        }
    })
    .await
    .expect("high-water never reported");
    log.close().await.unwrap();
}

#[tokio::test]
async fn memory_and_disk_drivers_agree_on_replay_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig::default();

    for backend in ["memory", "disk"] {
        let log = match backend {
            "memory" => EventLog::start(Arc::new(MemoryBackend::new()), config.clone())
                .await
                .unwrap(),
            _ => open_log(dir.path(), &config).await,
        };
        log.append_one(mutation("a.rs")).await.unwrap();
        let events = log.read(EventId::ZERO, 10, &EventFilter::all()).await.unwrap();
        assert_eq!(events.len(), 1, "backend {backend}");
        log.close().await.unwrap();
    }
}
