//! Storage - adapter contract, per-resource serialization, file backend

mod adapter;
mod fs;
mod keyed;

pub use adapter::{
    occurrences, rebuild_hierarchy, retention_cutoff, PurgeReport, RunData, RunFilter, RunMeta,
    RunRecord, RunStatus, Settings, StorageAdapter, TimeRange, TimeseriesPoint,
    TimeseriesSummary, DEFAULT_RETENTION_DAYS,
};
pub use fs::FsAdapter;
pub use keyed::KeyedSerializer;
