//! Integration tests for the parallel journal export
//!
//! Every test runs a complete export over an in-memory journal:
//! 1. Coverage of every message below the probed watermarks
//! 2. Deduplication across partitions, runs and export ids
//! 3. Resumption from committed offsets after a restart
//! 4. Fail-fast behaviour and exporter isolation

use anyhow::Result;
use jex_export::config::ExportConfig;
use jex_export::exporter::{Exporter, ExporterFactory, JsonlExporterFactory};
use jex_export::journal::MemoryJournal;
use jex_export::{ObjectType, ParallelJournalExporter, RunState};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const TOPIC: &str = "jex.journal.objects.origin";

// ============================================================================
// Test Helpers
// ============================================================================

/// Collects the url of every exported object
#[derive(Default)]
struct Collected {
    urls: Mutex<Vec<String>>,
    built: AtomicUsize,
}

struct CollectingExporter {
    name: String,
    collected: Arc<Collected>,
    fail_on: Option<String>,
    panic_on: Option<String>,
}

impl Exporter for CollectingExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_object(&mut self, _object_type: ObjectType, object: &Value) -> Result<()> {
        let url = object["url"].as_str().unwrap_or_default().to_string();
        if self.panic_on.as_deref() == Some(url.as_str()) {
            panic!("exporter cannot handle {}", url);
        }
        if self.fail_on.as_deref() == Some(url.as_str()) {
            anyhow::bail!("rejected {}", url);
        }
        self.collected.urls.lock().unwrap().push(url);
        Ok(())
    }
}

struct CollectingFactory {
    collected: Arc<Collected>,
    fail_on: Option<String>,
    panic_on: Option<String>,
}

impl CollectingFactory {
    fn new(collected: &Arc<Collected>) -> Self {
        Self {
            collected: collected.clone(),
            fail_on: None,
            panic_on: None,
        }
    }
}

impl ExporterFactory for CollectingFactory {
    fn name(&self) -> &str {
        "collecting"
    }

    fn build(&self, worker: usize) -> Result<Box<dyn Exporter>> {
        self.collected.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CollectingExporter {
            name: format!("collecting-{}", worker),
            collected: self.collected.clone(),
            fail_on: self.fail_on.clone(),
            panic_on: self.panic_on.clone(),
        }))
    }
}

fn url(partition: i32, i: usize) -> String {
    format!("https://example.org/p{}/{}", partition, i)
}

fn produce_origins(journal: &MemoryJournal, partition: i32, range: std::ops::Range<usize>) {
    for i in range {
        journal
            .produce(TOPIC, partition, None, format!(r#"{{"url": "{}"}}"#, url(partition, i)))
            .unwrap();
    }
}

/// Four partitions holding 100, 0, 0 (truncated at 50) and 10 messages
fn scenario_journal() -> MemoryJournal {
    let journal = MemoryJournal::new();
    journal.create_topic(TOPIC, 4).unwrap();
    produce_origins(&journal, 0, 0..100);
    produce_origins(&journal, 2, 0..50);
    journal.truncate(TOPIC, 2, 50).unwrap();
    produce_origins(&journal, 3, 0..10);
    journal
}

fn config(dir: &Path, export_id: &str, processes: usize) -> ExportConfig {
    ExportConfig {
        object_type: Some(ObjectType::Origin),
        export_id: export_id.to_string(),
        processes,
        progress_interval: 7,
        batch_size: 16,
        poll_timeout_ms: 0,
        node_sets_path: dir.join("node-sets"),
        show_progress: false,
        ..ExportConfig::default()
    }
}

fn exporter(
    dir: &Path,
    export_id: &str,
    processes: usize,
    journal: &MemoryJournal,
    factories: Vec<Arc<dyn ExporterFactory>>,
) -> ParallelJournalExporter {
    ParallelJournalExporter::new(config(dir, export_id, processes), Arc::new(journal.clone()), factories).unwrap()
}

fn collecting(collected: &Arc<Collected>) -> Vec<Arc<dyn ExporterFactory>> {
    vec![Arc::new(CollectingFactory::new(collected))]
}

// ============================================================================
// Coverage
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scenario_exports_every_message_once() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    let collected = Arc::new(Collected::default());
    let mut exporter = exporter(dir.path(), "e1", 2, &journal, collecting(&collected));

    assert_eq!(exporter.assignment().await.unwrap(), vec![vec![0], vec![3]]);
    assert_eq!(exporter.group_id(), "jex-export-e1");

    let summary = exporter.run().await.unwrap();
    assert_eq!(exporter.state(), RunState::Completed);
    assert_eq!(summary.total_work, 110);
    assert_eq!(summary.progress, 110);
    assert_eq!(summary.messages(), 110);
    assert_eq!(summary.exported(), 110);
    assert_eq!(summary.workers.len(), 2);
    assert_eq!(summary.workers[0].partitions, vec![0]);
    assert_eq!(summary.workers[1].partitions, vec![3]);

    let mut urls = collected.urls.lock().unwrap().clone();
    urls.sort();
    let mut expected: Vec<String> = (0..100).map(|i| url(0, i)).chain((0..10).map(|i| url(3, i))).collect();
    expected.sort();
    assert_eq!(urls, expected);

    assert_eq!(journal.committed_offset("jex-export-e1", TOPIC, 0).unwrap(), Some(100));
    assert_eq!(journal.committed_offset("jex-export-e1", TOPIC, 3).unwrap(), Some(10));
    assert_eq!(journal.committed_offset("jex-export-e1", TOPIC, 1).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_after_probe_are_left_for_next_run() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    let collected = Arc::new(Collected::default());
    let mut exporter = exporter(dir.path(), "e1", 2, &journal, collecting(&collected));

    let ranges = exporter.offsets().await.unwrap();
    assert_eq!(ranges.total(), 110);
    produce_origins(&journal, 3, 10..15);
    produce_origins(&journal, 1, 0..5);

    let summary = exporter.run().await.unwrap();
    assert_eq!(summary.messages(), 110);
    assert_eq!(summary.exported(), 110);
    assert_eq!(journal.committed_offset("jex-export-e1", TOPIC, 3).unwrap(), Some(10));
    assert!(!collected.urls.lock().unwrap().contains(&url(3, 10)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_more_workers_than_partitions() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    let collected = Arc::new(Collected::default());
    let mut exporter = exporter(dir.path(), "e1", 5, &journal, collecting(&collected));

    let summary = exporter.run().await.unwrap();
    assert_eq!(summary.workers.len(), 5);
    assert_eq!(summary.workers.iter().filter(|w| w.partitions.is_empty()).count(), 3);
    assert_eq!(summary.exported(), 110);
    assert_eq!(collected.built.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_topic_completes() {
    let dir = TempDir::new().unwrap();
    let journal = MemoryJournal::new();
    journal.create_topic(TOPIC, 3).unwrap();
    let collected = Arc::new(Collected::default());
    let mut exporter = exporter(dir.path(), "e1", 2, &journal, collecting(&collected));

    let summary = exporter.run().await.unwrap();
    assert_eq!(summary.total_work, 0);
    assert_eq!(summary.exported(), 0);
    assert_eq!(exporter.state(), RunState::Completed);
}

// ============================================================================
// Deduplication and restart
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_objects_within_a_partition() {
    let dir = TempDir::new().unwrap();
    let journal = MemoryJournal::new();
    journal.create_topic(TOPIC, 1).unwrap();
    for i in 0..30 {
        journal
            .produce(TOPIC, 0, None, format!(r#"{{"url": "{}"}}"#, url(0, i % 10)))
            .unwrap();
    }
    let collected = Arc::new(Collected::default());
    let mut exporter = exporter(dir.path(), "e1", 1, &journal, collecting(&collected));

    let summary = exporter.run().await.unwrap();
    assert_eq!(summary.messages(), 30);
    assert_eq!(summary.exported(), 10);
    assert_eq!(summary.duplicates(), 20);
    assert_eq!(collected.urls.lock().unwrap().len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_resumes_from_committed_offsets() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();

    let first = Arc::new(Collected::default());
    exporter(dir.path(), "e1", 2, &journal, collecting(&first))
        .run()
        .await
        .unwrap();

    produce_origins(&journal, 0, 100..120);
    let second = Arc::new(Collected::default());
    let mut restarted = exporter(dir.path(), "e1", 2, &journal, collecting(&second));
    let summary = restarted.run().await.unwrap();

    assert_eq!(summary.total_work, 130);
    assert_eq!(summary.progress, 130);
    assert_eq!(summary.messages(), 20);
    assert_eq!(summary.exported(), 20);
    let urls = second.urls.lock().unwrap();
    assert!(urls.iter().all(|u| u.starts_with("https://example.org/p0/1")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replayed_messages_are_not_exported_again() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    let first = Arc::new(Collected::default());
    exporter(dir.path(), "e1", 2, &journal, collecting(&first))
        .run()
        .await
        .unwrap();

    // Crash between node set flush and offset commit
    journal.set_committed("jex-export-e1", TOPIC, 0, 60).unwrap();

    let second = Arc::new(Collected::default());
    let summary = exporter(dir.path(), "e1", 2, &journal, collecting(&second))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.messages(), 40);
    assert_eq!(summary.duplicates(), 40);
    assert_eq!(summary.exported(), 0);
    assert!(second.urls.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_export_id_reuses_node_sets() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    let first = Arc::new(Collected::default());
    exporter(dir.path(), "e1", 2, &journal, collecting(&first))
        .run()
        .await
        .unwrap();

    let second = Arc::new(Collected::default());
    let summary = exporter(dir.path(), "e2", 3, &journal, collecting(&second))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.messages(), 110);
    assert_eq!(summary.exported(), 0);
    assert_eq!(journal.committed_offset("jex-export-e2", TOPIC, 0).unwrap(), Some(100));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exporter_error_is_isolated() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    let failing = Arc::new(Collected::default());
    let healthy = Arc::new(Collected::default());
    let factories: Vec<Arc<dyn ExporterFactory>> = vec![
        Arc::new(CollectingFactory {
            fail_on: Some(url(0, 42)),
            ..CollectingFactory::new(&failing)
        }),
        Arc::new(CollectingFactory::new(&healthy)),
    ];

    let summary = exporter(dir.path(), "e1", 2, &journal, factories)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.exporter_errors(), 1);
    assert_eq!(summary.exported(), 110);
    assert_eq!(failing.urls.lock().unwrap().len(), 109);
    assert_eq!(healthy.urls.lock().unwrap().len(), 110);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_message_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    journal.produce(TOPIC, 3, None, "{not json").unwrap();
    let collected = Arc::new(Collected::default());
    let mut exporter = exporter(dir.path(), "e1", 2, &journal, collecting(&collected));

    let err = exporter.run().await.unwrap_err();
    let chain = format!("{:#}", err);
    assert!(chain.contains("Export worker 1 (partitions [3]) failed"), "{}", chain);
    assert!(chain.contains("offset 10"), "{}", chain);
    assert_eq!(exporter.state(), RunState::Failed);

    // The failed batch was never committed
    let committed = journal.committed_offset("jex-export-e1", TOPIC, 3).unwrap();
    assert!(committed.unwrap_or(0) <= 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_exporter_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    let collected = Arc::new(Collected::default());
    let factories: Vec<Arc<dyn ExporterFactory>> = vec![Arc::new(CollectingFactory {
        panic_on: Some(url(3, 4)),
        ..CollectingFactory::new(&collected)
    })];
    let mut exporter = exporter(dir.path(), "e1", 2, &journal, factories);

    let err = exporter.run().await.unwrap_err();
    let chain = format!("{:#}", err);
    assert!(chain.contains("panicked"), "{}", chain);
    assert!(chain.contains("partitions [3]"), "{}", chain);
    assert_eq!(exporter.state(), RunState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_probe_failure_spawns_no_worker() {
    let dir = TempDir::new().unwrap();
    let journal = scenario_journal();
    journal.set_unreachable(true).unwrap();
    let collected = Arc::new(Collected::default());
    let mut exporter = exporter(dir.path(), "e1", 2, &journal, collecting(&collected));

    let err = exporter.run().await.unwrap_err();
    assert!(format!("{:#}", err).contains("probe offsets"));
    assert_eq!(exporter.state(), RunState::Failed);
    assert_eq!(collected.built.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("node-sets").exists());
}

// ============================================================================
// Replay directory and JSON-lines output
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_directory_to_jsonl_files() {
    let dir = TempDir::new().unwrap();
    let replay = dir.path().join("replay").join("jex.journal.objects.origin_visit");
    std::fs::create_dir_all(&replay).unwrap();
    std::fs::write(
        replay.join("part-0.jsonl"),
        concat!(
            r#"{"origin": {"url": "https://a"}, "visit": 1, "date": 1600000000}"#,
            "\n",
            r#"{"origin": "https://a", "visit": 1, "date": "2020-09-13T12:26:40+00:00"}"#,
            "\n",
        ),
    )
    .unwrap();
    std::fs::write(
        replay.join("part-1.jsonl"),
        concat!(r#"{"origin": "https://b", "visit": 7}"#, "\n"),
    )
    .unwrap();

    let mut config = config(dir.path(), "replay", 2);
    config.object_type = Some(ObjectType::OriginVisit);
    config.journal.replay_dir = Some(dir.path().join("replay"));
    config.export_dir = dir.path().join("out");
    config.validate().unwrap();

    let journal = config.journal.connect().unwrap();
    let factories: Vec<Arc<dyn ExporterFactory>> = vec![Arc::new(JsonlExporterFactory::new(&config.export_dir))];
    let out_dir = config.export_dir.join("origin_visit");
    let summary = ParallelJournalExporter::new(config, journal, factories)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(summary.messages(), 3);
    assert_eq!(summary.exported(), 2);

    let mut lines = Vec::new();
    for entry in std::fs::read_dir(out_dir).unwrap() {
        let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
        lines.extend(content.lines().map(|l| serde_json::from_str::<Value>(l).unwrap()));
    }
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().any(|o| o["origin"] == "https://a" && o["date"] == "2020-09-13T12:26:40+00:00"));
}
