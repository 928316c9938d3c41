//! End-to-end runs through the public coordinator API: incremental skip,
//! checkpoint resume, DLQ retry convergence, breaker halt, and admission
//! exhaustion, all against real state files in a temp directory.

use async_trait::async_trait;
use conveyor_core::checkpoint::CheckpointManager;
use conveyor_core::config::ConveyorConfig;
use conveyor_core::coordinator::{RunCoordinator, RunOptions};
use conveyor_core::manifest::{EntryStatus, StateManifest};
use conveyor_core::pool::{WorkOutput, Worker, WorkerError, WorkerFactory};
use conveyor_core::resource::MemoryProbe;
use conveyor_core::types::{RunOutcome, WorkItem};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct PlentyProbe;

impl MemoryProbe for PlentyProbe {
    fn available_bytes(&self) -> u64 {
        u64::MAX
    }

    fn process_rss_bytes(&self) -> u64 {
        0
    }
}

struct StarvedProbe;

impl MemoryProbe for StarvedProbe {
    fn available_bytes(&self) -> u64 {
        0
    }

    fn process_rss_bytes(&self) -> u64 {
        0
    }
}

/// Behavior scripted by filename prefix; the shared attempt map persists
/// across worker recreations, so "flaky" items fail exactly once. The
/// in-flight set fails any item whose worker invocation overlaps with
/// another invocation for the same item.
struct ScriptedWorker {
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn process(&self, item: &WorkItem) -> Result<WorkOutput, WorkerError> {
        if !self.in_flight.lock().unwrap().insert(item.id.clone()) {
            return Err(WorkerError::Permanent(format!(
                "overlapping dispatch for {}",
                item.id
            )));
        }

        let seen = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(item.id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let result = match item.id.split('_').next().unwrap_or("") {
            "ok" => Ok(WorkOutput::default()),
            "bad" => Ok(WorkOutput {
                quality_failure: true,
                ..WorkOutput::default()
            }),
            "perm" => Err(WorkerError::Permanent("unparseable input".to_string())),
            "flaky" if seen == 1 => Err(WorkerError::Transient("first attempt fails".to_string())),
            "flaky" => Ok(WorkOutput::default()),
            other => Err(WorkerError::Transient(format!("unknown script: {other}"))),
        };

        // Widen the window so an overlapping dispatch would be caught.
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.lock().unwrap().remove(&item.id);
        result
    }
}

#[derive(Clone)]
struct ScriptedFactory {
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ScriptedFactory {
    fn new() -> Self {
        Self {
            attempts: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn attempts_for(&self, item_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(item_id)
            .copied()
            .unwrap_or(0)
    }
}

impl WorkerFactory for ScriptedFactory {
    fn create(&self) -> conveyor_core::Result<Box<dyn Worker>> {
        Ok(Box::new(ScriptedWorker {
            attempts: Arc::clone(&self.attempts),
            in_flight: Arc::clone(&self.in_flight),
        }))
    }
}

fn test_config(state_dir: &Path) -> ConveyorConfig {
    let mut config = ConveyorConfig::default();
    config.state.state_dir = state_dir.to_path_buf();
    config.pool.max_workers = 2;
    config.admission.base_timeout_small_ms = 5_000;
    config.admission.max_wait_ms = 100;
    config.admission.poll_interval_ms = 10;
    config.checkpoint.save_every_n = 1;
    config
}

fn write_inputs(dir: &Path, names: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    for name in names {
        std::fs::write(dir.join(name), format!("contents of {name}")).unwrap();
    }
}

fn coordinator(
    config: ConveyorConfig,
    factory: &ScriptedFactory,
    probe: Arc<dyn MemoryProbe>,
) -> RunCoordinator {
    RunCoordinator::new(config, Arc::new(factory.clone()), probe).unwrap()
}

fn options(input_dir: &Path) -> RunOptions {
    RunOptions {
        input_dir: input_dir.to_path_buf(),
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn test_clean_run_processes_everything_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt", "ok_b.txt", "ok_c.txt"]);

    let factory = ScriptedFactory::new();
    let report = coordinator(test_config(&state), &factory, Arc::new(PlentyProbe))
        .run(&options(&input))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Clean);
    assert_eq!(report.state.success, 3);
    assert_eq!(report.state.skipped, 0);
    assert_eq!(factory.attempts_for("ok_a.txt"), 1);
    // Clean completion clears the checkpoint and writes the summary.
    assert!(!state.join("checkpoint.json").exists());
    assert!(state.join("run_summary.json").exists());
}

#[tokio::test]
async fn test_second_run_skips_unchanged_items() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt", "ok_b.txt"]);

    let factory = ScriptedFactory::new();
    let probe: Arc<dyn MemoryProbe> = Arc::new(PlentyProbe);
    coordinator(test_config(&state), &factory, Arc::clone(&probe))
        .run(&options(&input))
        .await
        .unwrap();

    // Unchanged inputs: nothing is dispatched.
    let report = coordinator(test_config(&state), &factory, Arc::clone(&probe))
        .run(&options(&input))
        .await
        .unwrap();
    assert_eq!(report.state.skipped, 2);
    assert_eq!(report.state.processed(), 0);

    // One changed input: only it is reprocessed.
    std::fs::write(input.join("ok_a.txt"), "new contents").unwrap();
    let report = coordinator(test_config(&state), &factory, probe)
        .run(&options(&input))
        .await
        .unwrap();
    assert_eq!(report.state.skipped, 1);
    assert_eq!(report.state.success, 1);
    assert_eq!(factory.attempts_for("ok_a.txt"), 2);
    assert_eq!(factory.attempts_for("ok_b.txt"), 1);
}

#[tokio::test]
async fn test_force_reprocesses_unchanged_items() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt"]);

    let factory = ScriptedFactory::new();
    let probe: Arc<dyn MemoryProbe> = Arc::new(PlentyProbe);
    coordinator(test_config(&state), &factory, Arc::clone(&probe))
        .run(&options(&input))
        .await
        .unwrap();

    let mut opts = options(&input);
    opts.force = true;
    let report = coordinator(test_config(&state), &factory, probe)
        .run(&opts)
        .await
        .unwrap();
    assert_eq!(report.state.success, 1);
    assert_eq!(factory.attempts_for("ok_a.txt"), 2);
}

#[tokio::test]
async fn test_resume_skips_checkpointed_items() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt", "ok_b.txt", "ok_c.txt"]);

    // Fabricate the checkpoint a crashed run would have left behind.
    let config = test_config(&state);
    let mut crashed = CheckpointManager::start_fresh(
        config.state.checkpoint_path(),
        config.checkpoint.clone(),
        config.fingerprint(),
    );
    crashed.record_done("ok_a.txt").unwrap();
    crashed.record_done("ok_b.txt").unwrap();

    let factory = ScriptedFactory::new();
    let mut opts = options(&input);
    opts.resume = true;
    let report = coordinator(config, &factory, Arc::new(PlentyProbe))
        .run(&opts)
        .await
        .unwrap();

    assert_eq!(report.state.skipped, 2);
    assert_eq!(report.state.success, 1);
    assert_eq!(factory.attempts_for("ok_a.txt"), 0);
    assert_eq!(factory.attempts_for("ok_b.txt"), 0);
    assert_eq!(factory.attempts_for("ok_c.txt"), 1);
}

#[tokio::test]
async fn test_resume_publishes_pre_crash_completions_to_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt", "ok_b.txt", "ok_c.txt"]);

    // A crash between checkpoint and manifest saves leaves completions only
    // in the checkpoint and no manifest file at all.
    let config = test_config(&state);
    let mut crashed = CheckpointManager::start_fresh(
        config.state.checkpoint_path(),
        config.checkpoint.clone(),
        config.fingerprint(),
    );
    crashed.record_done("ok_a.txt").unwrap();
    crashed.record_done("ok_b.txt").unwrap();
    assert!(!state.join("manifest.json").exists());

    let factory = ScriptedFactory::new();
    let mut opts = options(&input);
    opts.resume = true;
    let report = coordinator(config, &factory, Arc::new(PlentyProbe))
        .run(&opts)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Clean);
    assert_eq!(report.state.success, 1);
    assert!(!state.join("checkpoint.json").exists());

    // The resumed run's manifest equals a from-scratch run's: pre-crash
    // completions are present, so the next run dispatches nothing.
    let manifest = StateManifest::load(&state.join("manifest.json")).unwrap();
    for id in ["ok_a.txt", "ok_b.txt", "ok_c.txt"] {
        assert_eq!(manifest.get(id).unwrap().status, EntryStatus::Success);
    }

    let report = coordinator(test_config(&state), &factory, Arc::new(PlentyProbe))
        .run(&options(&input))
        .await
        .unwrap();
    assert_eq!(report.state.skipped, 3);
    assert_eq!(report.state.processed(), 0);
    assert_eq!(factory.attempts_for("ok_a.txt"), 0);
    assert_eq!(factory.attempts_for("ok_b.txt"), 0);
}

#[tokio::test]
async fn test_transient_failure_recovers_on_dlq_retry() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["flaky_a.txt", "ok_b.txt"]);

    let factory = ScriptedFactory::new();
    let report = coordinator(test_config(&state), &factory, Arc::new(PlentyProbe))
        .run(&options(&input))
        .await
        .unwrap();

    // First attempt failed, the drain retry succeeded: outcome is clean and
    // the item converged on attempt 2.
    assert_eq!(report.outcome, RunOutcome::Clean);
    assert_eq!(report.summary.recovered_on_retry, 1);
    assert_eq!(report.summary.dlq_remaining, 0);
    assert_eq!(factory.attempts_for("flaky_a.txt"), 2);

    let manifest = StateManifest::load(&state.join("manifest.json")).unwrap();
    let entry = manifest.get("flaky_a.txt").unwrap();
    assert_eq!(entry.attempt_count, 2);
}

#[tokio::test]
async fn test_permanent_reject_stays_in_dlq() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["perm_a.txt", "ok_b.txt"]);

    let factory = ScriptedFactory::new();
    let report = coordinator(test_config(&state), &factory, Arc::new(PlentyProbe))
        .run(&options(&input))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::PartialFailure);
    assert_eq!(report.outcome.exit_code(), 1);
    assert_eq!(report.summary.dlq_remaining, 1);
    // Exactly one attempt: permanent rejects are never retried.
    assert_eq!(factory.attempts_for("perm_a.txt"), 1);
}

#[tokio::test]
async fn test_breaker_halts_systematic_quality_failures() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    let names: Vec<String> = (0..30).map(|i| format!("bad_{i:02}.txt")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    write_inputs(&input, &name_refs);

    let mut config = test_config(&state);
    config.pool.max_workers = 1;
    config.breaker.min_sample_size = 5;
    config.breaker.threshold = 0.2;

    let factory = ScriptedFactory::new();
    let report = coordinator(config, &factory, Arc::new(PlentyProbe))
        .run(&options(&input))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::BreakerHalt);
    assert_eq!(report.outcome.exit_code(), 2);
    assert!(report.state.circuit_breaker_tripped);
    // Sequential mode trips at the sample-size boundary and stops dispatch;
    // most of the batch never runs.
    assert!(report.state.processed() < 30);
    assert!(state.join("HALT").exists());
    // The checkpoint survives a halt for post-investigation resume.
    assert!(state.join("checkpoint.json").exists());
}

#[tokio::test]
async fn test_admission_exhaustion_leaves_items_for_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt"]);

    let factory = ScriptedFactory::new();
    let report = coordinator(test_config(&state), &factory, Arc::new(StarvedProbe))
        .run(&options(&input))
        .await
        .unwrap();

    // Admission never succeeded: the item failed without reaching a worker
    // and was not dead-lettered.
    assert_eq!(report.outcome, RunOutcome::PartialFailure);
    assert_eq!(report.state.error, 1);
    assert_eq!(report.summary.dlq_remaining, 0);
    assert_eq!(factory.attempts_for("ok_a.txt"), 0);
    // Items that never reached a worker do not feed the quality breaker.
    assert_eq!(report.summary.breaker.processed_count, 0);

    // With memory available again, the next run picks it up.
    let report = coordinator(test_config(&state), &factory, Arc::new(PlentyProbe))
        .run(&options(&input))
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Clean);
    assert_eq!(report.state.success, 1);
    assert_eq!(factory.attempts_for("ok_a.txt"), 1);
}

#[tokio::test]
async fn test_dry_run_dispatches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt", "ok_b.txt"]);

    let factory = ScriptedFactory::new();
    let mut opts = options(&input);
    opts.dry_run = true;
    let report = coordinator(test_config(&state), &factory, Arc::new(PlentyProbe))
        .run(&opts)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Clean);
    assert_eq!(report.state.processed(), 0);
    assert_eq!(factory.attempts_for("ok_a.txt"), 0);
    assert!(report.summary.dry_run);
}

#[tokio::test]
async fn test_prune_removes_entries_for_deleted_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt", "ok_b.txt"]);

    let factory = ScriptedFactory::new();
    let probe: Arc<dyn MemoryProbe> = Arc::new(PlentyProbe);
    coordinator(test_config(&state), &factory, Arc::clone(&probe))
        .run(&options(&input))
        .await
        .unwrap();

    std::fs::remove_file(input.join("ok_b.txt")).unwrap();
    let mut opts = options(&input);
    opts.prune_deleted = true;
    coordinator(test_config(&state), &factory, probe)
        .run(&opts)
        .await
        .unwrap();

    let manifest = StateManifest::load(&state.join("manifest.json")).unwrap();
    assert!(manifest.get("ok_a.txt").is_some());
    assert!(manifest.get("ok_b.txt").is_none());
}

#[tokio::test]
async fn test_at_most_once_dispatch_under_parallel_workers() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    let names: Vec<String> = (0..100).map(|i| format!("ok_{i:03}.txt")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    write_inputs(&input, &name_refs);

    let mut config = test_config(&state);
    config.pool.max_workers = 8;

    // The scripted worker turns any overlapping invocation for the same
    // item into a permanent failure, so a clean outcome proves no overlap.
    let factory = ScriptedFactory::new();
    let report = coordinator(config, &factory, Arc::new(PlentyProbe))
        .run(&options(&input))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Clean);
    assert_eq!(report.state.success, 100);
    for name in &names {
        assert_eq!(factory.attempts_for(name), 1);
    }
}

#[tokio::test]
async fn test_interrupted_manifest_write_is_invisible_to_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let state = dir.path().join("state");
    write_inputs(&input, &["ok_a.txt", "ok_b.txt"]);

    let factory = ScriptedFactory::new();
    let probe: Arc<dyn MemoryProbe> = Arc::new(PlentyProbe);
    coordinator(test_config(&state), &factory, Arc::clone(&probe))
        .run(&options(&input))
        .await
        .unwrap();

    // A process killed mid-write dies before the rename: the target still
    // holds the pre-image and a partial temporary is left behind.
    std::fs::write(state.join("manifest.json.tmp"), b"{\"ok_a.txt\":{\"conte").unwrap();

    let report = coordinator(test_config(&state), &factory, probe)
        .run(&options(&input))
        .await
        .unwrap();
    assert_eq!(report.state.skipped, 2);
    assert_eq!(report.state.processed(), 0);
    assert_eq!(factory.attempts_for("ok_a.txt"), 1);
}
