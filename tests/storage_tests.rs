//! # Storage Tests
//!
//! `FsAdapter` against the `StorageAdapter` contract, plus `RunTracker`:
//! - concurrent writers on one pipeline index lose no updates
//! - run listing, filtering, paging
//! - step-level persistence and time series with occurrence indexing
//! - retention purge and settings

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pipetrace::{
    FsAdapter, Pipeline, PipetraceError, RunFilter, RunMeta, RunStatus, RunTracker, StepMeta,
    StepTime, StorageAdapter, TimeRange, TimeseriesSummary,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use tempfile::TempDir;

// ============================================================================
// TEST HELPERS
// ============================================================================

async fn adapter() -> (TempDir, FsAdapter) {
    let dir = TempDir::new().unwrap();
    let adapter = FsAdapter::new(dir.path());
    adapter.connect().await.unwrap();
    (dir, adapter)
}

fn step(key: &str, start_ts: i64, end_ts: Option<i64>, error: Option<&str>) -> StepMeta {
    StepMeta {
        name: key.rsplit('.').next().unwrap_or(key).to_string(),
        key: key.to_string(),
        time: StepTime {
            start_ts,
            end_ts,
            duration_ms: end_ts.map(|e| e - start_ts),
        },
        records: Map::new(),
        result: match (end_ts, error) {
            (Some(_), None) => Some(json!(null)),
            _ => None,
        },
        error: error.map(str::to_string),
    }
}

fn run(run_id: &str, pipeline: &str, start_ts: i64, steps: Vec<StepMeta>) -> RunMeta {
    let end_ts = steps.first().and_then(|s| s.time.end_ts);
    RunMeta {
        run_id: run_id.to_string(),
        pipeline: pipeline.to_string(),
        start_ts,
        end_ts,
        duration_ms: end_ts.map(|e| e - start_ts),
        steps,
    }
}

fn now() -> i64 {
    pipetrace::now_ms()
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

// ============================================================================
// SERIALIZED ACCESS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_on_one_index_are_all_kept() {
    let (_dir, adapter) = adapter().await;
    let adapter = Arc::new(adapter);
    let base = now();

    let writers = (0..32).map(|i| {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move {
            let meta = run(
                &format!("run-{:02}", i),
                "shared",
                base + i,
                vec![step("shared", base + i, Some(base + i + 5), None)],
            );
            adapter.initiate_run(&meta).await?;
            adapter.finish_run(&meta, RunStatus::Completed).await
        })
    });
    for outcome in join_all(writers).await {
        outcome.unwrap().unwrap();
    }

    let runs = adapter
        .list_runs("shared", &RunFilter::new())
        .await
        .unwrap();
    assert_eq!(runs.len(), 32);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));

    let series = adapter
        .get_pipeline_step_timeseries("shared", "shared", &TimeRange::all())
        .await
        .unwrap();
    assert_eq!(series.len(), 32);

    // Lock entries are dropped once every section has settled
    assert_eq!(adapter.busy_files(), 0);
}

// ============================================================================
// RUNS
// ============================================================================

#[tokio::test]
async fn test_run_lifecycle_and_listing() {
    let (_dir, adapter) = adapter().await;
    let base = now();

    let ok = run("r1", "etl", base, vec![step("etl", base, Some(base + 10), None)]);
    let bad = run(
        "r2",
        "etl",
        base + 100,
        vec![step("etl", base + 100, Some(base + 130), Some("boom"))],
    );
    let open = run("r3", "etl", base + 200, Vec::new());

    for meta in [&ok, &bad, &open] {
        adapter.initiate_run(meta).await.unwrap();
    }
    adapter.finish_run(&ok, ok.status()).await.unwrap();
    adapter.finish_run(&bad, bad.status()).await.unwrap();

    let all = adapter.list_runs("etl", &RunFilter::new()).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec!["r3", "r2", "r1"]);
    assert_eq!(all[0].status, RunStatus::Running);
    assert_eq!(all[1].status, RunStatus::Failed);
    assert_eq!(all[2].duration_ms, Some(10));

    let failed = adapter
        .list_runs("etl", &RunFilter::new().with_status(RunStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].run_id, "r2");

    let paged = adapter
        .list_runs("etl", &RunFilter::new().with_offset(1).with_limit(1))
        .await
        .unwrap();
    assert_eq!(paged[0].run_id, "r2");

    assert_eq!(adapter.list_pipelines().await.unwrap(), vec!["etl"]);

    let data = adapter.get_run_data("r2").await.unwrap();
    assert_eq!(data.record.status, RunStatus::Failed);
    assert_eq!(data.steps[0].error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_unknown_run_is_reported() {
    let (_dir, adapter) = adapter().await;

    let err = adapter.get_run_data("missing").await.unwrap_err();
    assert!(matches!(err, PipetraceError::RunNotFound { .. }));

    let err = adapter
        .initiate_step("missing", &step("x", 0, None, None))
        .await
        .unwrap_err();
    assert!(matches!(err, PipetraceError::RunNotFound { .. }));

    assert!(adapter
        .list_runs("nobody", &RunFilter::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_hostile_identifiers_are_rejected_or_encoded() {
    let (dir, adapter) = adapter().await;
    let base = now();

    let err = adapter.get_run_data("../etc/passwd").await.unwrap_err();
    assert!(matches!(err, PipetraceError::InvalidIdentifier { .. }));

    let meta = run(
        "r1",
        "../escape",
        base,
        vec![step("x/y", base, Some(base + 1), None)],
    );
    adapter.initiate_run(&meta).await.unwrap();
    adapter.finish_run(&meta, RunStatus::Completed).await.unwrap();

    assert_eq!(adapter.list_pipelines().await.unwrap(), vec!["../escape"]);
    assert_eq!(
        adapter.list_pipeline_steps("../escape").await.unwrap(),
        vec!["x/y"]
    );
    assert!(!dir.path().parent().unwrap().join("escape").exists());
}

// ============================================================================
// STEPS + TIME SERIES
// ============================================================================

#[tokio::test]
async fn test_step_level_updates_complete_earliest_open_duplicate() {
    let (_dir, adapter) = adapter().await;
    let base = now();
    adapter
        .initiate_run(&run("r1", "p", base, Vec::new()))
        .await
        .unwrap();

    adapter
        .initiate_step("r1", &step("p.b", base, None, None))
        .await
        .unwrap();
    adapter
        .initiate_step("r1", &step("p.b", base + 1, None, None))
        .await
        .unwrap();
    adapter
        .finish_step("r1", &step("p.b", base, Some(base + 4), None))
        .await
        .unwrap();

    let steps = adapter.list_run_steps("r1").await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].time.end_ts, Some(base + 4));
    assert!(steps[1].time.end_ts.is_none());

    let data = adapter.get_run_data("r1").await.unwrap();
    assert!(data.step("p.b", 1).unwrap().time.end_ts.is_none());
    let err = data.step("p.b", 2).unwrap_err();
    assert_eq!(err.code(), "PT-021");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_finishes_of_duplicate_keys_close_both() {
    let (_dir, adapter) = adapter().await;
    let base = now();
    adapter
        .initiate_run(&run("r1", "p", base, Vec::new()))
        .await
        .unwrap();
    for offset in [0, 1] {
        adapter
            .initiate_step("r1", &step("p.b", base + offset, None, None))
            .await
            .unwrap();
    }

    let first = step("p.b", base, Some(base + 4), None);
    let second = step("p.b", base + 1, Some(base + 6), None);
    let (a, b) = tokio::join!(
        adapter.finish_step("r1", &first),
        adapter.finish_step("r1", &second)
    );
    a.unwrap();
    b.unwrap();

    let steps = adapter.list_run_steps("r1").await.unwrap();
    assert_eq!(steps.len(), 2);
    let mut ends: Vec<i64> = steps.iter().filter_map(|s| s.time.end_ts).collect();
    ends.sort();
    assert_eq!(ends, vec![base + 4, base + 6]);
}

#[tokio::test]
async fn test_failed_series_write_does_not_abort_the_others() {
    let (dir, adapter) = adapter().await;
    let base = now();

    // A directory where the series file should be makes that write fail
    let steps_dir = dir.path().join("pipelines/p/steps");
    std::fs::create_dir_all(steps_dir.join("p.bad.json")).unwrap();

    let meta = run(
        "r1",
        "p",
        base,
        vec![
            step("p", base, Some(base + 9), None),
            step("p.bad", base, Some(base + 2), None),
            step("p.good", base + 2, Some(base + 8), None),
        ],
    );
    adapter.initiate_run(&meta).await.unwrap();
    assert!(adapter.finish_run(&meta, RunStatus::Completed).await.is_err());

    for key in ["p", "p.good"] {
        let points = adapter
            .get_pipeline_step_timeseries("p", key, &TimeRange::all())
            .await
            .unwrap();
        assert_eq!(points.len(), 1, "series {} written", key);
    }
    assert_eq!(adapter.busy_files(), 0);

    let leftovers: Vec<_> = std::fs::read_dir(&steps_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_timeseries_tracks_duplicate_occurrences() {
    let (_dir, adapter) = adapter().await;
    let base = now();

    for (i, run_id) in ["r1", "r2"].iter().enumerate() {
        let t = base + i as i64 * 1000;
        let meta = run(
            run_id,
            "a",
            t,
            vec![
                step("a", t, Some(t + 50), None),
                step("a.b", t, Some(t + 10), None),
                step("a.b", t + 10, Some(t + 40), Some("late")),
            ],
        );
        adapter.initiate_run(&meta).await.unwrap();
        adapter.finish_run(&meta, meta.status()).await.unwrap();
    }

    assert_eq!(
        adapter.list_pipeline_steps("a").await.unwrap(),
        vec!["a", "a.b"]
    );

    let points = adapter
        .get_pipeline_step_timeseries("a", "a.b", &TimeRange::all())
        .await
        .unwrap();
    let shape: Vec<(&str, usize, i64, RunStatus)> = points
        .iter()
        .map(|p| (p.run_id.as_str(), p.occurrence, p.duration_ms, p.status))
        .collect();
    assert_eq!(
        shape,
        vec![
            ("r1", 0, 10, RunStatus::Completed),
            ("r1", 1, 30, RunStatus::Failed),
            ("r2", 0, 10, RunStatus::Completed),
            ("r2", 1, 30, RunStatus::Failed),
        ]
    );

    let summary = TimeseriesSummary::from_points(&points).unwrap();
    assert_eq!(summary.count, 4);
    assert_eq!(summary.min_ms, 10);
    assert_eq!(summary.max_ms, 30);
    assert_eq!(summary.avg_ms, 20.0);

    // Finishing a run again replaces its points instead of duplicating them
    let again = run("r1", "a", base, vec![step("a.b", base, Some(base + 5), None)]);
    adapter.finish_run(&again, RunStatus::Completed).await.unwrap();
    let points = adapter
        .get_pipeline_step_timeseries("a", "a.b", &TimeRange::all())
        .await
        .unwrap();
    assert_eq!(points.iter().filter(|p| p.run_id == "r1").count(), 1);

    let window = TimeRange {
        start: Some(base + 500),
        end: None,
    };
    let recent = adapter
        .get_pipeline_step_timeseries("a", "a.b", &window)
        .await
        .unwrap();
    assert!(recent.iter().all(|p| p.run_id == "r2"));
}

// ============================================================================
// RETENTION + SETTINGS
// ============================================================================

#[tokio::test]
async fn test_purge_drops_runs_and_points_outside_retention() {
    let (_dir, adapter) = adapter().await;
    let base = now();
    let old = base - 30 * DAY_MS;

    let stale = run("old", "p", old, vec![step("p", old, Some(old + 5), None)]);
    let fresh = run("new", "p", base, vec![step("p", base, Some(base + 5), None)]);
    for meta in [&stale, &fresh] {
        adapter.initiate_run(meta).await.unwrap();
        adapter.finish_run(meta, RunStatus::Completed).await.unwrap();
    }

    let report = adapter.purge_old_data("p", 14).await.unwrap();
    assert_eq!(report.runs_removed, 1);
    assert_eq!(report.points_removed, 1);

    let runs = adapter.list_runs("p", &RunFilter::new()).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, "new");
    assert!(matches!(
        adapter.get_run_data("old").await,
        Err(PipetraceError::RunNotFound { .. })
    ));

    // Nothing left to purge
    let report = adapter.purge_old_data("p", 14).await.unwrap();
    assert_eq!(report.runs_removed, 0);
    assert_eq!(report.points_removed, 0);
}

#[tokio::test]
async fn test_purge_drops_points_of_expired_runs_started_later() {
    let (_dir, adapter) = adapter().await;
    let cutoff = now() - 14 * DAY_MS;
    let start = cutoff - 60_000;
    let late = cutoff + 60_000;

    // The run starts before the window, one of its steps inside it
    let meta = run(
        "edge",
        "p",
        start,
        vec![
            step("p", start, Some(late + 10), None),
            step("p.late", late, Some(late + 5), None),
        ],
    );
    adapter.initiate_run(&meta).await.unwrap();
    adapter.finish_run(&meta, RunStatus::Completed).await.unwrap();

    let report = adapter.purge_old_data("p", 14).await.unwrap();
    assert_eq!(report.runs_removed, 1);
    assert_eq!(report.points_removed, 2);

    let orphans = adapter
        .get_pipeline_step_timeseries("p", "p.late", &TimeRange::all())
        .await
        .unwrap();
    assert!(orphans.is_empty());
    assert!(adapter.list_pipeline_steps("p").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_settings_default_then_persist() {
    let (_dir, adapter) = adapter().await;

    let settings = adapter.get_settings().await.unwrap();
    assert_eq!(settings.retention_days, 14);

    let mut updated = settings.clone();
    updated.retention_days = 3;
    updated.extra.insert("theme".into(), json!("dark"));
    adapter.save_settings(&updated).await.unwrap();

    assert_eq!(adapter.get_settings().await.unwrap(), updated);
}

// ============================================================================
// RUN TRACKER
// ============================================================================

#[tokio::test]
async fn test_tracker_persists_finished_run() {
    let (_dir, adapter) = adapter().await;
    let tracker = RunTracker::new(Arc::new(adapter));
    let pipeline = Pipeline::with_run_id("nightly", "run-1");

    let outcome = tracker
        .track(&pipeline, |root| async move {
            root.step("load", |st| async move {
                st.record("rows", 42);
                Ok::<_, Infallible>(42)
            })
            .await
        })
        .await;
    assert_eq!(outcome, Ok(42));
    assert_eq!(tracker.persistence_failures(), 0);

    let data = tracker.adapter().get_run_data("run-1").await.unwrap();
    assert_eq!(data.record.status, RunStatus::Completed);
    assert_eq!(data.record.pipeline, "nightly");
    assert_eq!(data.steps.len(), 2);
    assert_eq!(data.steps[1].records.get("rows"), Some(&json!(42)));

    let tree = data.to_hierarchy().unwrap();
    assert_eq!(tree.meta.key, "nightly");
    assert_eq!(tree.children[0].meta.key, "nightly.load");
}

#[tokio::test]
async fn test_tracker_with_step_persistence_matches_final_dump() {
    let (_dir, adapter) = adapter().await;
    let tracker = RunTracker::new(Arc::new(adapter)).with_step_persistence(true);
    let pipeline = Pipeline::with_run_id("live", "run-2");

    let outcome = tracker
        .track(&pipeline, |root| async move {
            root.step("a", |_| async { Ok::<_, String>(()) }).await?;
            root.step("b", |_| async { Err::<(), _>("nope".to_string()) })
                .await
        })
        .await;
    assert_eq!(outcome, Err("nope".to_string()));
    assert_eq!(tracker.persistence_failures(), 0);

    let data = tracker.adapter().get_run_data("run-2").await.unwrap();
    assert_eq!(data.record.status, RunStatus::Failed);
    let keys: Vec<&str> = data.steps.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["live", "live.a", "live.b"]);
    assert!(data.steps.iter().all(|s| s.time.end_ts.is_some()));
    assert_eq!(data.steps[2].error.as_deref(), Some("nope"));
}

#[tokio::test]
async fn test_step_persistence_is_visible_while_the_run_is_in_flight() {
    let (_dir, adapter) = adapter().await;
    let tracker = RunTracker::new(Arc::new(adapter)).with_step_persistence(true);
    let store = Arc::clone(tracker.adapter());
    let pipeline = Pipeline::with_run_id("live", "run-3");

    let outcome = tracker
        .track(&pipeline, |root| async move {
            root.step("wait", move |_| async move {
                // The writer is asynchronous: poll until the open step lands
                for _ in 0..400 {
                    let data = store
                        .get_run_data("run-3")
                        .await
                        .map_err(|e| e.to_string())?;
                    let open_root = data.step("live", 0).map(|s| s.time.end_ts.is_none());
                    let open_wait = data.step("live.wait", 0).map(|s| s.time.end_ts.is_none());
                    if matches!((open_root, open_wait), (Ok(true), Ok(true))) {
                        return Ok(true);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok::<_, String>(false)
            })
            .await
        })
        .await;

    assert_eq!(outcome, Ok(true));
    assert_eq!(tracker.persistence_failures(), 0);

    let data = tracker.adapter().get_run_data("run-3").await.unwrap();
    assert_eq!(data.steps.len(), 2);
    assert!(data.steps.iter().all(|s| s.time.end_ts.is_some()));
}

#[tokio::test]
async fn test_tracker_failures_never_change_the_outcome() {
    let dir = TempDir::new().unwrap();
    // A file where the storage root should be makes every write fail
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"").unwrap();
    let tracker = RunTracker::new(Arc::new(FsAdapter::new(&blocked)));
    let pipeline = Pipeline::new("p");

    let outcome = tracker
        .track(&pipeline, |_| async { Ok::<_, Infallible>("fine") })
        .await;

    assert_eq!(outcome, Ok("fine"));
    assert_eq!(tracker.persistence_failures(), 2);
    assert_eq!(pipeline.status(), Some(RunStatus::Completed));
}
