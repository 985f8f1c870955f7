//! FsAdapter - JSON files on disk
//!
//! Layout under the root directory:
//!
//! ```text
//! runs/<runId>.json                      RunData (record + steps)
//! pipelines/<pipeline>/runs.json         run index of the pipeline
//! pipelines/<pipeline>/steps/<key>.json  time series of one step key
//! settings.json
//! ```
//!
//! Every file is rewritten by read-modify-write inside a `KeyedSerializer`
//! section keyed by its path, and replaced atomically (temp file + rename),
//! so plain reads never see a torn file.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::adapter::{
    occurrences, retention_cutoff, PurgeReport, RunData, RunFilter, RunMeta, RunRecord,
    RunStatus, Settings, StorageAdapter, TimeRange, TimeseriesPoint,
};
use super::keyed::KeyedSerializer;
use crate::error::{PipetraceError, Result};
use crate::projection::StepMeta;

const RUNS_DIR: &str = "runs";
const PIPELINES_DIR: &str = "pipelines";
const STEPS_DIR: &str = "steps";
const INDEX_FILE: &str = "runs.json";
const SETTINGS_FILE: &str = "settings.json";

/// File-backed storage adapter
#[derive(Clone)]
pub struct FsAdapter {
    root: PathBuf,
    locks: KeyedSerializer<PathBuf>,
}

impl FsAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedSerializer::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files with a pending or running write
    pub fn busy_files(&self) -> usize {
        self.locks.active_keys()
    }

    // ═══════════════════════════════════════════
    // Paths
    // ═══════════════════════════════════════════

    fn run_path(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.root.join(RUNS_DIR).join(format!("{}.json", run_id)))
    }

    fn pipeline_dir(&self, pipeline: &str) -> Result<PathBuf> {
        Ok(self.root.join(PIPELINES_DIR).join(encode_component(pipeline)?))
    }

    fn index_path(&self, pipeline: &str) -> Result<PathBuf> {
        Ok(self.pipeline_dir(pipeline)?.join(INDEX_FILE))
    }

    fn steps_dir(&self, pipeline: &str) -> Result<PathBuf> {
        Ok(self.pipeline_dir(pipeline)?.join(STEPS_DIR))
    }

    fn series_path(&self, pipeline: &str, step_key: &str) -> Result<PathBuf> {
        Ok(self
            .steps_dir(pipeline)?
            .join(format!("{}.json", encode_component(step_key)?)))
    }

    fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    // ═══════════════════════════════════════════
    // Serialized read-modify-write
    // ═══════════════════════════════════════════

    /// Read `path`, let `f` compute the new content, write it back, all
    /// inside the path's critical section. `None` from `f` deletes the file.
    async fn modify<T, R, F>(&self, path: &Path, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<(Option<T>, R)>,
    {
        self.locks
            .run(path.to_path_buf(), || async {
                let current = read_json::<T>(path).await?;
                let (next, out) = f(current)?;
                match next {
                    Some(value) => write_json(path, &value).await?,
                    None => remove_file(path).await?,
                }
                Ok::<R, PipetraceError>(out)
            })
            .await
    }

    /// Insert or replace the run's entry in its pipeline index
    async fn upsert_index(&self, record: RunRecord) -> Result<()> {
        let path = self.index_path(&record.pipeline)?;
        self.modify(&path, |index: Option<Vec<RunRecord>>| {
            let mut index = index.unwrap_or_default();
            match index.iter_mut().find(|r| r.run_id == record.run_id) {
                Some(existing) => *existing = record,
                None => index.push(record),
            }
            Ok((Some(index), ()))
        })
        .await
    }

    /// Replace this run's points in one step series with `points`
    async fn write_series(
        &self,
        pipeline: &str,
        step_key: &str,
        run_id: &str,
        points: Vec<TimeseriesPoint>,
    ) -> Result<()> {
        let path = self.series_path(pipeline, step_key)?;
        self.modify(&path, |series: Option<Vec<TimeseriesPoint>>| {
            let mut series = series.unwrap_or_default();
            series.retain(|p| p.run_id != run_id);
            series.extend(points);
            series.sort_by_key(|p| (p.start_ts, p.occurrence));
            Ok((Some(series), ()))
        })
        .await
    }

    /// Update an existing run file
    async fn modify_run<F>(&self, run_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut RunData),
    {
        let path = self.run_path(run_id)?;
        self.modify(&path, |data: Option<RunData>| {
            let mut data = data.ok_or_else(|| PipetraceError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
            f(&mut data);
            Ok((Some(data), ()))
        })
        .await
    }
}

#[async_trait]
impl StorageAdapter for FsAdapter {
    async fn connect(&self) -> Result<()> {
        for dir in [RUNS_DIR, PIPELINES_DIR] {
            let path = self.root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| PipetraceError::NotConnected {
                    reason: format!("cannot create {}: {}", path.display(), e),
                })?;
        }
        debug!(root = %self.root.display(), "storage ready");
        Ok(())
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in list_dir(&self.root.join(PIPELINES_DIR)).await? {
            names.push(decode_component(&entry)?);
        }
        names.sort();
        Ok(names)
    }

    async fn list_runs(&self, pipeline: &str, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let index: Vec<RunRecord> = read_json(&self.index_path(pipeline)?)
            .await?
            .unwrap_or_default();
        Ok(filter.apply(index))
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, pipeline = %run.pipeline))]
    async fn initiate_run(&self, run: &RunMeta) -> Result<()> {
        let record = RunRecord::from_meta(run, RunStatus::Running);
        let data = RunData {
            record: record.clone(),
            steps: run.steps.clone(),
        };
        let path = self.run_path(&run.run_id)?;
        self.modify(&path, |_: Option<RunData>| Ok((Some(data), ())))
            .await?;
        self.upsert_index(record).await?;
        debug!("run initiated");
        Ok(())
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, pipeline = %run.pipeline, status = %status))]
    async fn finish_run(&self, run: &RunMeta, status: RunStatus) -> Result<()> {
        let record = RunRecord::from_meta(run, status);
        let data = RunData {
            record: record.clone(),
            steps: run.steps.clone(),
        };
        let path = self.run_path(&run.run_id)?;
        self.modify(&path, |_: Option<RunData>| Ok((Some(data), ())))
            .await?;
        self.upsert_index(record).await?;

        // Group finished steps by key; each key's series is its own lock
        let mut by_key: Vec<(String, Vec<TimeseriesPoint>)> = Vec::new();
        for (step, occurrence) in run.steps.iter().zip(occurrences(&run.steps)) {
            let Some(point) = TimeseriesPoint::from_step(&run.run_id, step, occurrence) else {
                continue;
            };
            match by_key.iter_mut().find(|(k, _)| *k == step.key) {
                Some((_, points)) => points.push(point),
                None => by_key.push((step.key.clone(), vec![point])),
            }
        }
        // Let every series section settle before reporting the first failure
        let writes = join_all(by_key.into_iter().map(|(key, points)| async move {
            self.write_series(&run.pipeline, &key, &run.run_id, points)
                .await
        }))
        .await;
        writes.into_iter().collect::<Result<Vec<()>>>()?;

        info!(steps = run.steps.len(), "run finished");
        Ok(())
    }

    async fn get_run_data(&self, run_id: &str) -> Result<RunData> {
        read_json(&self.run_path(run_id)?)
            .await?
            .ok_or_else(|| PipetraceError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn list_run_steps(&self, run_id: &str) -> Result<Vec<StepMeta>> {
        Ok(self.get_run_data(run_id).await?.steps)
    }

    #[instrument(skip(self, step), fields(key = %step.key))]
    async fn initiate_step(&self, run_id: &str, step: &StepMeta) -> Result<()> {
        let step = step.clone();
        self.modify_run(run_id, move |data| data.steps.push(step))
            .await
    }

    #[instrument(skip(self, step), fields(key = %step.key))]
    async fn finish_step(&self, run_id: &str, step: &StepMeta) -> Result<()> {
        let step = step.clone();
        self.modify_run(run_id, move |data| {
            let open = data
                .steps
                .iter_mut()
                .find(|s| s.key == step.key && s.time.end_ts.is_none());
            match open {
                Some(slot) => *slot = step,
                None => data.steps.push(step),
            }
        })
        .await
    }

    async fn get_pipeline_step_timeseries(
        &self,
        pipeline: &str,
        step_key: &str,
        range: &TimeRange,
    ) -> Result<Vec<TimeseriesPoint>> {
        let series: Vec<TimeseriesPoint> = read_json(&self.series_path(pipeline, step_key)?)
            .await?
            .unwrap_or_default();
        Ok(series
            .into_iter()
            .filter(|p| range.contains(p.start_ts))
            .collect())
    }

    async fn list_pipeline_steps(&self, pipeline: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in list_dir(&self.steps_dir(pipeline)?).await? {
            if let Some(stem) = entry.strip_suffix(".json") {
                keys.push(decode_component(stem)?);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let settings = settings.clone();
        self.modify(&self.settings_path(), |_: Option<Settings>| {
            Ok((Some(settings), ()))
        })
        .await
    }

    async fn get_settings(&self) -> Result<Settings> {
        Ok(read_json(&self.settings_path()).await?.unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn purge_old_data(&self, pipeline: &str, retention_days: u32) -> Result<PurgeReport> {
        let cutoff = retention_cutoff(retention_days);

        let expired: Vec<RunRecord> = self
            .modify(&self.index_path(pipeline)?, |index: Option<Vec<RunRecord>>| {
                let Some(index) = index else {
                    return Ok((None, Vec::new()));
                };
                let (expired, kept): (Vec<_>, Vec<_>) =
                    index.into_iter().partition(|r| r.start_ts < cutoff);
                Ok((Some(kept), expired))
            })
            .await?;

        for run in &expired {
            let path = self.run_path(&run.run_id)?;
            self.locks
                .run(path.clone(), || async { remove_file(&path).await })
                .await?;
        }

        // A run's points go with the run, even when its steps started later
        let expired_ids: HashSet<&str> = expired.iter().map(|r| r.run_id.as_str()).collect();
        let steps_dir = self.steps_dir(pipeline)?;
        let mut points_removed = 0;
        for entry in list_dir(&steps_dir).await? {
            let path = steps_dir.join(&entry);
            points_removed += self
                .modify(&path, |series: Option<Vec<TimeseriesPoint>>| {
                    let mut series = series.unwrap_or_default();
                    let before = series.len();
                    series.retain(|p| {
                        p.start_ts >= cutoff && !expired_ids.contains(p.run_id.as_str())
                    });
                    let removed = before - series.len();
                    let next = if series.is_empty() { None } else { Some(series) };
                    Ok((next, removed))
                })
                .await?;
        }

        let report = PurgeReport {
            runs_removed: expired.len(),
            points_removed,
        };
        info!(
            runs_removed = report.runs_removed,
            points_removed = report.points_removed,
            "purged old data"
        );
        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════
// File helpers
// ═══════════════════════════════════════════════════════════════

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PipetraceError::CorruptIndex {
            path: path.display().to_string(),
            details: e.to_string(),
        })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// File names in a directory (empty if it does not exist). Temp files are skipped.
async fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if !name.ends_with(".tmp") {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

// ═══════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════

/// Run ids become file names: alphanumerics, hyphens and underscores only
fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty()
        || !run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PipetraceError::InvalidIdentifier {
            value: run_id.to_string(),
            reason: "run id must be alphanumeric with hyphens/underscores only".into(),
        });
    }
    Ok(())
}

/// Percent-encode a name into one safe path component.
///
/// A leading dot is encoded so `.`/`..` and hidden names cannot occur.
fn encode_component(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(PipetraceError::InvalidIdentifier {
            value: String::new(),
            reason: "name must not be empty".into(),
        });
    }
    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if plain {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    Ok(out)
}

fn decode_component(encoded: &str) -> Result<String> {
    let invalid = || PipetraceError::InvalidIdentifier {
        value: encoded.to_string(),
        reason: "malformed percent-encoding".into(),
    };
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3).ok_or_else(invalid)?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_keeps_safe_names_readable() {
        assert_eq!(encode_component("main.fetch.url1").unwrap(), "main.fetch.url1");
        assert_eq!(encode_component("my-pipe_2").unwrap(), "my-pipe_2");
    }

    #[test]
    fn encode_escapes_separators_and_leading_dot() {
        assert_eq!(encode_component("a/b").unwrap(), "a%2Fb");
        assert_eq!(encode_component("..").unwrap(), "%2E.");
        assert_eq!(encode_component("sp ace").unwrap(), "sp%20ace");
        assert!(encode_component("").is_err());
    }

    #[test]
    fn decode_inverts_encode() {
        for name in ["a/b\\c", "..", "日本語 pipeline", "plain"] {
            let encoded = encode_component(name).unwrap();
            assert_eq!(decode_component(&encoded).unwrap(), name);
        }
        assert!(decode_component("bad%2").is_err());
        assert!(decode_component("bad%zz").is_err());
    }

    #[test]
    fn run_ids_are_validated() {
        assert!(validate_run_id("2f0e-41aa_x").is_ok());
        assert!(validate_run_id("../etc").is_err());
        assert!(validate_run_id("").is_err());
    }
}
