#![allow(missing_docs)]
use std::sync::Arc;
use std::time::Duration;

mod dependencies;
use dependencies::mock::{register_mocks, CollectingReceiver, ScriptedFetcher};

use feedloom::config::{load_configuration_from_str, HandlerRegistry};
use feedloom::modules::modifiers::comparison::CompareAndFilter;
use feedloom::prepare_message_batches;
use feedloom::storage::memory::MemoryPostStore;
use feedloom::storage::{DedupKey, PostStore};
use feedloom::{Modifier, Runtime};

async fn run_once(
    config: &str,
    responses: Vec<&str>,
    timeout: Duration,
) -> Arc<CollectingReceiver> {
    let configuration = load_configuration_from_str(config).unwrap();

    let fetcher = ScriptedFetcher::new(responses);
    let receiver = CollectingReceiver::new();
    let mut registry = HandlerRegistry::new();
    register_mocks(&mut registry, fetcher, Arc::clone(&receiver)).unwrap();
    registry.init(&configuration).unwrap();

    let mut runtime = Runtime::new(configuration, registry).unwrap();
    runtime.set_timeout(Some(timeout));
    runtime.run().await.unwrap();

    receiver
}

fn sql_config(db_path: &str) -> String {
    format!(
        r#"
settings:
  post_storage: sql
  outbox_storage: sql
  sql_db_path: {db_path}
  poll_interval: 1h
  fetch_workers: 1
sources:
  demo:
    fetcher_type: scripted
    parser_type: lines
    tags: [demo]
    streams:
      - receiver_type: collect
        message_template: "${{title}}"
"#
    )
}

#[tokio::test]
async fn fresh_source_is_suppressed_and_new_posts_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("feedloom.db");
    let config = sql_config(db_path.to_str().unwrap());

    // first run sees the feed history [c, b, a] and must deliver nothing
    let receiver = run_once(&config, vec!["c\nb\na"], Duration::from_millis(1500)).await;
    assert!(receiver.batches().is_empty());

    // after a restart the same feed gained d; only d is delivered
    let receiver = run_once(&config, vec!["d\nc\nb\na"], Duration::from_millis(1500)).await;
    assert_eq!(receiver.batches(), vec![vec!["d".to_string()]]);

    // a third restart over identical feed content delivers nothing
    let receiver = run_once(&config, vec!["d\nc\nb\na"], Duration::from_millis(1500)).await;
    assert!(receiver.batches().is_empty());
}

#[tokio::test]
async fn unsquashed_new_posts_become_one_item_each_oldest_first() {
    let config = r#"
settings:
  poll_interval: 1s
  fetch_workers: 1
sources:
  demo:
    fetcher_type: scripted
    parser_type: lines
    streams:
      - receiver_type: collect
        message_template: "${title}"
"#;

    // tick one arms dedup with [x0]; tick two brings three new posts,
    // newest first
    let receiver = run_once(
        config,
        vec!["x0", "x3\nx2\nx1\nx0"],
        Duration::from_millis(2800),
    )
    .await;

    assert_eq!(
        receiver.batches(),
        vec![
            vec!["x1".to_string()],
            vec!["x2".to_string()],
            vec!["x3".to_string()],
        ]
    );
}

#[tokio::test]
async fn squash_fuses_new_posts_into_one_delivery() {
    let config = r#"
settings:
  poll_interval: 1s
  fetch_workers: 1
sources:
  demo:
    fetcher_type: scripted
    parser_type: lines
    streams:
      - receiver_type: collect
        message_template: "${title}"
        squash: true
"#;

    let receiver = run_once(
        config,
        vec!["x0", "x2\nx1\nx0"],
        Duration::from_millis(2800),
    )
    .await;

    assert_eq!(
        receiver.batches(),
        vec![vec!["x1".to_string(), "x2".to_string()]]
    );
}

#[tokio::test]
async fn posts_dropped_by_a_modifier_are_not_marked_processed() {
    use feedloom::{Source, Stream};
    use serde_yaml::Value;

    let store = MemoryPostStore::new();
    let stream = Stream {
        receiver_type: "collect".into(),
        receiver_options: Value::Null,
        message_template: "${title}".into(),
        modifiers: Vec::new(),
        squash: false,
        intervals: Vec::new(),
    };
    let source = Source {
        id: "demo".into(),
        fetcher_type: "scripted".into(),
        fetcher_options: Value::Null,
        parser_type: "lines".into(),
        parser_options: Value::Null,
        tags: Vec::new(),
        streams: vec![stream.clone()],
    };

    let parser = dependencies::mock::LineParser;
    use feedloom::Parser;
    let posts = parser.parse("b:20\na:5", &Value::Null).await.unwrap();

    let high_only: Value = serde_yaml::from_str(
        r#"
field: score
field_type: integer
operator: ">"
value: "10"
"#,
    )
    .unwrap();

    // first tick: the filter drops a before dedup ever sees it
    let filtered = CompareAndFilter
        .apply(posts.clone(), &high_only)
        .await
        .unwrap();
    let batches = prepare_message_batches(&store, &source, &stream, &filtered)
        .await
        .unwrap();
    assert!(batches.is_empty());

    let key = DedupKey::new("demo", "collect");
    assert!(store.is_processed(&key, "b").await.unwrap());
    assert!(!store.is_processed(&key, "a").await.unwrap());

    // lowering the threshold later re-delivers the post the filter had
    // been dropping
    let low_bar: Value = serde_yaml::from_str(
        r#"
field: score
field_type: integer
operator: ">"
value: "1"
"#,
    )
    .unwrap();
    let filtered = CompareAndFilter.apply(posts, &low_bar).await.unwrap();
    let batches = prepare_message_batches(&store, &source, &stream, &filtered)
        .await
        .unwrap();

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].post_id, "a");
}
