//! StorageAdapter contract and the records it exchanges
//!
//! The engine never calls an adapter itself; the host process (see
//! `RunTracker`) drives it around a pipeline run. Adapters backed by shared
//! mutable indices must wrap every read-modify-write in a `KeyedSerializer`.
//!
//! Repeated step keys: keys are stored verbatim, and every flattened step
//! gets an occurrence index (how many earlier steps of the same run share
//! its key). Lookups and time-series points use `(key, occurrence)`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipetraceError, Result};
use crate::projection::{StepHierarchy, StepMeta};
use crate::step::{now_ms, Pipeline};

pub use crate::step::StepStatus as RunStatus;

pub const DEFAULT_RETENTION_DAYS: u32 = 14;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

// ═══════════════════════════════════════════════════════════════
// Run records
// ═══════════════════════════════════════════════════════════════

/// A run as handed to `initiate_run` / `finish_run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub run_id: String,
    pub pipeline: String,
    pub start_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Flattened step dump (empty until the run finishes)
    #[serde(default)]
    pub steps: Vec<StepMeta>,
}

impl RunMeta {
    /// Metadata for a run about to start
    pub fn starting(pipeline: &Pipeline) -> Self {
        Self {
            run_id: pipeline.run_id().to_string(),
            pipeline: pipeline.name().to_string(),
            start_ts: now_ms(),
            end_ts: None,
            duration_ms: None,
            steps: Vec::new(),
        }
    }

    /// Metadata of a run that has been started, with its current step dump
    pub fn from_pipeline(pipeline: &Pipeline) -> Result<Self> {
        let root = pipeline
            .root()
            .ok_or_else(|| PipetraceError::PipelineNotStarted {
                name: pipeline.name().to_string(),
            })?;
        let time = root.time();
        Ok(Self {
            run_id: pipeline.run_id().to_string(),
            pipeline: pipeline.name().to_string(),
            start_ts: time.start_ts,
            end_ts: time.end_ts,
            duration_ms: time.duration_ms,
            steps: crate::projection::to_flattened(&root),
        })
    }

    /// Status derived from the root step (running when no dump yet)
    pub fn status(&self) -> RunStatus {
        self.steps
            .first()
            .map(|root| root.status())
            .unwrap_or(RunStatus::Running)
    }
}

/// One entry of a pipeline's run index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    pub start_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl RunRecord {
    pub fn from_meta(run: &RunMeta, status: RunStatus) -> Self {
        Self {
            run_id: run.run_id.clone(),
            pipeline: run.pipeline.clone(),
            status,
            start_ts: run.start_ts,
            end_ts: run.end_ts,
            duration_ms: run.duration_ms,
        }
    }
}

/// Full data of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    #[serde(flatten)]
    pub record: RunRecord,
    #[serde(default)]
    pub steps: Vec<StepMeta>,
}

impl RunData {
    /// Step by key and occurrence index
    pub fn step(&self, key: &str, occurrence: usize) -> Result<&StepMeta> {
        self.steps
            .iter()
            .filter(|s| s.key == key)
            .nth(occurrence)
            .ok_or_else(|| PipetraceError::StepNotFound {
                run_id: self.record.run_id.clone(),
                key: key.to_string(),
                occurrence,
            })
    }

    /// Rebuild the nested view from the flattened dump
    pub fn to_hierarchy(&self) -> Option<StepHierarchy> {
        rebuild_hierarchy(&self.steps)
    }
}

/// Occurrence index of every entry of a flattened dump
pub fn occurrences(steps: &[StepMeta]) -> Vec<usize> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    steps
        .iter()
        .map(|s| {
            let n = seen.entry(s.key.as_str()).or_insert(0);
            let occurrence = *n;
            *n += 1;
            occurrence
        })
        .collect()
}

fn parent_key(key: &str) -> Option<&str> {
    key.rsplit_once('.').map(|(parent, _)| parent)
}

/// Inverse of `to_flattened`: relies on pre-order, where a step's parent is
/// the nearest earlier entry holding the parent key.
pub fn rebuild_hierarchy(steps: &[StepMeta]) -> Option<StepHierarchy> {
    let mut stack: Vec<StepHierarchy> = Vec::new();

    for meta in steps {
        let parent = parent_key(&meta.key);
        while stack.len() > 1 {
            if stack.last().map(|top| top.meta.key.as_str()) == parent {
                break;
            }
            fold_top(&mut stack);
        }
        stack.push(StepHierarchy {
            meta: meta.clone(),
            children: Vec::new(),
        });
    }

    while stack.len() > 1 {
        fold_top(&mut stack);
    }
    stack.pop()
}

fn fold_top(stack: &mut Vec<StepHierarchy>) {
    if let Some(done) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(done);
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════

/// Filter accepted by `list_runs`. Dates are epoch ms on `start_ts`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub status: Option<RunStatus>,
    pub run_id: Option<String>,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn between(mut self, start_date: Option<i64>, end_date: Option<i64>) -> Self {
        self.start_date = start_date;
        self.end_date = end_date;
        self
    }

    pub fn matches(&self, run: &RunRecord) -> bool {
        self.status.map_or(true, |s| s == run.status)
            && self.run_id.as_deref().map_or(true, |id| id == run.run_id)
            && self.start_date.map_or(true, |d| run.start_ts >= d)
            && self.end_date.map_or(true, |d| run.start_ts <= d)
    }

    /// Filter, sort newest first, then page
    pub fn apply(&self, runs: Vec<RunRecord>) -> Vec<RunRecord> {
        let mut runs: Vec<_> = runs.into_iter().filter(|r| self.matches(r)).collect();
        runs.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
        runs.into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Inclusive epoch-ms window; open ends are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    /// The last `days` days up to now
    pub fn last_days(days: u32) -> Self {
        Self {
            start: Some(now_ms() - i64::from(days) * DAY_MS),
            end: None,
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

/// One finished occurrence of a step in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesPoint {
    pub run_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub duration_ms: i64,
    pub status: RunStatus,
    #[serde(default)]
    pub occurrence: usize,
}

impl TimeseriesPoint {
    /// None for steps still running
    pub fn from_step(run_id: &str, step: &StepMeta, occurrence: usize) -> Option<Self> {
        let end_ts = step.time.end_ts?;
        Some(Self {
            run_id: run_id.to_string(),
            start_ts: step.time.start_ts,
            end_ts,
            duration_ms: step
                .time
                .duration_ms
                .unwrap_or(end_ts - step.time.start_ts),
            status: step.status(),
            occurrence,
        })
    }
}

/// min / max / avg of durations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesSummary {
    pub count: usize,
    pub min_ms: i64,
    pub max_ms: i64,
    pub avg_ms: f64,
}

impl TimeseriesSummary {
    pub fn from_points(points: &[TimeseriesPoint]) -> Option<Self> {
        let min_ms = points.iter().map(|p| p.duration_ms).min()?;
        let max_ms = points.iter().map(|p| p.duration_ms).max()?;
        let total: i64 = points.iter().map(|p| p.duration_ms).sum();
        Some(Self {
            count: points.len(),
            min_ms,
            max_ms,
            avg_ms: total as f64 / points.len() as f64,
        })
    }
}

/// Dashboard settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Free-form settings owned by the UI
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub runs_removed: usize,
    pub points_removed: usize,
}

/// Cutoff timestamp for a retention window ending now
pub fn retention_cutoff(retention_days: u32) -> i64 {
    now_ms() - i64::from(retention_days) * DAY_MS
}

// ═══════════════════════════════════════════════════════════════
// Contract
// ═══════════════════════════════════════════════════════════════

/// Persistence of runs and steps, plus the history queries behind the UI.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backing store (create directories, open pools, ...)
    async fn connect(&self) -> Result<()>;

    async fn list_pipelines(&self) -> Result<Vec<String>>;

    async fn list_runs(&self, pipeline: &str, filter: &RunFilter) -> Result<Vec<RunRecord>>;

    /// Persist a new run tagged `running`
    async fn initiate_run(&self, run: &RunMeta) -> Result<()>;

    /// Close a run with its end time, duration and full step dump
    async fn finish_run(&self, run: &RunMeta, status: RunStatus) -> Result<()>;

    async fn get_run_data(&self, run_id: &str) -> Result<RunData>;

    async fn list_run_steps(&self, run_id: &str) -> Result<Vec<StepMeta>>;

    /// Persist a step that just started (near-real-time view)
    async fn initiate_step(&self, run_id: &str, step: &StepMeta) -> Result<()>;

    /// Complete the earliest still-running step of the run with this key
    async fn finish_step(&self, run_id: &str, step: &StepMeta) -> Result<()>;

    async fn get_pipeline_step_timeseries(
        &self,
        pipeline: &str,
        step_key: &str,
        range: &TimeRange,
    ) -> Result<Vec<TimeseriesPoint>>;

    async fn list_pipeline_steps(&self, pipeline: &str) -> Result<Vec<String>>;

    async fn save_settings(&self, settings: &Settings) -> Result<()>;

    async fn get_settings(&self) -> Result<Settings>;

    /// Drop runs and time-series points older than `retention_days`
    async fn purge_old_data(&self, pipeline: &str, retention_days: u32) -> Result<PurgeReport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepTime;
    use serde_json::json;

    fn meta(key: &str, start: i64, end: Option<i64>) -> StepMeta {
        StepMeta {
            name: key.rsplit('.').next().unwrap().to_string(),
            key: key.to_string(),
            time: StepTime {
                start_ts: start,
                end_ts: end,
                duration_ms: end.map(|e| e - start),
            },
            records: Map::new(),
            result: None,
            error: None,
        }
    }

    fn record(id: &str, start: i64, status: RunStatus) -> RunRecord {
        RunRecord {
            run_id: id.into(),
            pipeline: "p".into(),
            status,
            start_ts: start,
            end_ts: None,
            duration_ms: None,
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Occurrences / hierarchy rebuild
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn occurrences_count_repeated_keys() {
        let steps = vec![
            meta("a", 0, None),
            meta("a.b", 0, None),
            meta("a.c", 0, None),
            meta("a.b", 0, None),
        ];
        assert_eq!(occurrences(&steps), vec![0, 0, 0, 1]);
    }

    #[test]
    fn rebuild_inverts_pre_order() {
        let steps = vec![
            meta("main", 0, Some(9)),
            meta("main.fetch", 1, Some(8)),
            meta("main.fetch.url1", 2, Some(3)),
            meta("main.fetch.url2", 2, Some(4)),
            meta("main.report", 8, Some(9)),
        ];
        let h = rebuild_hierarchy(&steps).unwrap();
        assert_eq!(h.meta.key, "main");
        assert_eq!(h.children.len(), 2);
        assert_eq!(h.children[0].children.len(), 2);
        assert_eq!(h.children[1].meta.key, "main.report");
        assert_eq!(h.node_count(), steps.len());
    }

    #[test]
    fn rebuild_handles_duplicate_subtrees() {
        let steps = vec![
            meta("a", 0, None),
            meta("a.b", 0, None),
            meta("a.b.x", 0, None),
            meta("a.b", 0, None),
            meta("a.b.y", 0, None),
        ];
        let h = rebuild_hierarchy(&steps).unwrap();
        assert_eq!(h.children.len(), 2);
        assert_eq!(h.children[0].children[0].meta.key, "a.b.x");
        assert_eq!(h.children[1].children[0].meta.key, "a.b.y");
    }

    #[test]
    fn rebuild_of_nothing_is_none() {
        assert!(rebuild_hierarchy(&[]).is_none());
    }

    #[test]
    fn run_data_step_lookup_by_occurrence() {
        let mut second = meta("a.b", 5, Some(6));
        second.records.insert("i".into(), json!(2));
        let data = RunData {
            record: record("r", 0, RunStatus::Completed),
            steps: vec![meta("a", 0, Some(9)), meta("a.b", 1, Some(2)), second],
        };
        assert_eq!(data.step("a.b", 1).unwrap().records["i"], json!(2));
        assert!(matches!(
            data.step("a.b", 2),
            Err(PipetraceError::StepNotFound { occurrence: 2, .. })
        ));
    }

    // ═══════════════════════════════════════════════════════════════
    // Filters
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn filter_sorts_newest_first_and_pages() {
        let runs = (0..5)
            .map(|i| record(&format!("r{}", i), i * 10, RunStatus::Completed))
            .collect();
        let page = RunFilter::new().with_offset(1).with_limit(2).apply(runs);
        let ids: Vec<_> = page.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r2"]);
    }

    #[test]
    fn filter_by_status_date_and_id() {
        let runs = vec![
            record("a", 10, RunStatus::Completed),
            record("b", 20, RunStatus::Failed),
            record("c", 30, RunStatus::Failed),
        ];
        let failed = RunFilter::new().with_status(RunStatus::Failed).apply(runs.clone());
        assert_eq!(failed.len(), 2);

        let window = RunFilter::new().between(Some(15), Some(25)).apply(runs.clone());
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].run_id, "b");

        let by_id = RunFilter::new().with_run_id("c").apply(runs);
        assert_eq!(by_id.len(), 1);
    }

    #[test]
    fn filter_deserializes_from_query_shape() {
        let filter: RunFilter =
            serde_json::from_value(json!({"limit": 5, "status": "running"})).unwrap();
        assert_eq!(filter.limit, Some(5));
        assert_eq!(filter.offset, 0);
        assert_eq!(filter.status, Some(RunStatus::Running));
    }

    // ═══════════════════════════════════════════════════════════════
    // Time series / settings
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn point_requires_finished_step() {
        assert!(TimeseriesPoint::from_step("r", &meta("a", 0, None), 0).is_none());
        let p = TimeseriesPoint::from_step("r", &meta("a", 10, Some(25)), 1).unwrap();
        assert_eq!(p.duration_ms, 15);
        assert_eq!(p.occurrence, 1);
        assert_eq!(p.status, RunStatus::Completed);
    }

    #[test]
    fn summary_is_min_max_avg() {
        let points: Vec<_> = [(0, 10), (0, 20), (0, 60)]
            .iter()
            .enumerate()
            .filter_map(|(i, (s, e))| {
                TimeseriesPoint::from_step(&format!("r{}", i), &meta("a", *s, Some(*e)), 0)
            })
            .collect();
        let summary = TimeseriesSummary::from_points(&points).unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min_ms, 10);
        assert_eq!(summary.max_ms, 60);
        assert!((summary.avg_ms - 30.0).abs() < f64::EPSILON);
        assert!(TimeseriesSummary::from_points(&[]).is_none());
    }

    #[test]
    fn time_range_bounds_are_inclusive() {
        let range = TimeRange {
            start: Some(10),
            end: Some(20),
        };
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert!(TimeRange::all().contains(i64::MIN));
    }

    #[test]
    fn settings_default_retention_and_extra_fields() {
        let settings: Settings = serde_json::from_value(json!({"theme": "dark"})).unwrap();
        assert_eq!(settings.retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(settings.extra["theme"], "dark");

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json, json!({"retentionDays": 14, "theme": "dark"}));
    }

    #[test]
    fn run_meta_status_follows_root() {
        let mut run = RunMeta {
            run_id: "r".into(),
            pipeline: "p".into(),
            start_ts: 0,
            end_ts: None,
            duration_ms: None,
            steps: vec![],
        };
        assert_eq!(run.status(), RunStatus::Running);
        let mut root = meta("p", 0, Some(1));
        root.error = Some("x".into());
        run.steps.push(root);
        assert_eq!(run.status(), RunStatus::Failed);
    }
}
