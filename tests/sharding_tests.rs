//! Tests for the execution planner: glob expansion and batch grouping.


use flotilla::error::FlotillaError;
use flotilla::model::Deal;
use flotilla::sharding::{matching_items, plan};
use test_harness::{setup, sharded_spec, test_spec};

fn seed_items(storage: &flotilla::external::InMemoryStorage, count: usize) {
    let items = (0..count)
        .map(|i| format!("/inputs/file-{:02}.csv", i))
        .collect();
    storage.add_volume("inputs", items);
}

/// No glob pattern means no sharding: one shard.
#[test]
fn test_unsharded_job_is_one_shard() {
    let (_orchestrator, storage) = setup();
    let spec = test_spec(Deal::default());
    let plan = plan(&spec, storage.as_ref()).unwrap();
    assert_eq!(plan.shards_total, 1);
}

/// BatchSize=7 over 20 matched items yields 3 shards (7, 7, 6).
#[test]
fn test_batches_round_up() {
    let (_orchestrator, storage) = setup();
    seed_items(&storage, 20);
    let spec = sharded_spec(Deal::default(), "*.csv", 7);
    let plan = plan(&spec, storage.as_ref()).unwrap();
    assert_eq!(plan.shards_total, 3);
}

/// A glob that matches nothing fails the plan when sharding was requested.
#[test]
fn test_no_matching_inputs_is_an_error() {
    let (_orchestrator, storage) = setup();
    seed_items(&storage, 5);
    let spec = sharded_spec(Deal::default(), "*.json", 10);
    match plan(&spec, storage.as_ref()) {
        Err(FlotillaError::NoMatchingInputs(pattern)) => assert_eq!(pattern, "*.json"),
        other => panic!("expected NoMatchingInputs, got {:?}", other),
    }
}

/// A zero batch size degrades to one item per shard.
#[test]
fn test_zero_batch_size_means_one_item_per_shard() {
    let (_orchestrator, storage) = setup();
    seed_items(&storage, 4);
    let spec = sharded_spec(Deal::default(), "*.csv", 0);
    let plan = plan(&spec, storage.as_ref()).unwrap();
    assert_eq!(plan.shards_total, 4);
}

/// The glob filters the volume listing; only matches are sharded.
#[test]
fn test_glob_filters_items() {
    let (_orchestrator, storage) = setup();
    storage.add_volume(
        "inputs",
        vec![
            "/inputs/a.csv".to_string(),
            "/inputs/b.csv".to_string(),
            "/inputs/readme.txt".to_string(),
        ],
    );
    let spec = sharded_spec(Deal::default(), "*.csv", 1);
    let matched = matching_items(&spec, storage.as_ref()).unwrap();
    assert_eq!(matched.len(), 2);
    assert!(matched.iter().all(|item| item.ends_with(".csv")));
}
