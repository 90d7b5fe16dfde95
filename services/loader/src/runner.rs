//! Job runner: independent source pipelines on a bounded worker pool.
//!
//! Each job gets its own resolver and loader (built inside `run_source`);
//! nothing mutable is shared between jobs except the warehouse handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::EtlResult;
use crate::pipeline::{run_source, LoadOptions, RawFile, RunReport};
use crate::sources::Registry;
use crate::store::Warehouse;

const RAW_EXTENSIONS: [&str; 8] = ["json", "csv", "txt", "xls", "xlsx", "xlsm", "xlsb", "ods"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceJob {
    pub source_id: String,
    pub files: Vec<PathBuf>,
}

fn is_raw_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| RAW_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// One job per registered source that has a non-empty `<dir>/<source_id>/`.
/// Files are taken in name order.
pub async fn discover_jobs(dir: &Path, registry: &Registry) -> EtlResult<Vec<SourceJob>> {
    let mut jobs = Vec::new();
    for source_id in registry.source_ids() {
        let source_dir = dir.join(source_id);
        if !tokio::fs::try_exists(&source_dir).await? {
            debug!(source_id, dir = %source_dir.display(), "no raw directory");
            continue;
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&source_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && is_raw_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            warn!(source_id, dir = %source_dir.display(), "raw directory has no payloads");
            continue;
        }
        jobs.push(SourceJob {
            source_id: source_id.to_string(),
            files,
        });
    }
    Ok(jobs)
}

/// Read a job's payloads and run its source. Never fails: problems end up in
/// the report.
pub async fn run_job<S: Warehouse + ?Sized>(
    store: &S,
    registry: &Registry,
    job: &SourceJob,
    options: &LoadOptions,
) -> RunReport {
    let source = match registry.get(&job.source_id) {
        Ok(source) => source,
        Err(err) => {
            error!(source_id = %job.source_id, error = %err, "job skipped");
            return RunReport::failed(&job.source_id, err.to_string());
        }
    };

    let mut files = Vec::with_capacity(job.files.len());
    for path in &job.files {
        match RawFile::read(path).await {
            Ok(file) => files.push(file),
            Err(err) => {
                error!(source_id = %job.source_id, file = %path.display(), error = %err, "unreadable payload");
                return RunReport::failed(
                    &job.source_id,
                    format!("could not read {}: {err}", path.display()),
                );
            }
        }
    }

    run_source(store, source, &files, options).await
}

/// Run every job with at most `max_workers` in flight. Reports come back in
/// source id order; a failed or panicked job does not stop the others.
pub async fn run_sources<S: Warehouse + ?Sized + 'static>(
    store: Arc<S>,
    registry: Arc<Registry>,
    jobs: Vec<SourceJob>,
    options: LoadOptions,
    max_workers: usize,
) -> Vec<RunReport> {
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut set = JoinSet::new();

    info!(jobs = jobs.len(), max_workers, "starting source jobs");
    for job in jobs {
        let store = Arc::clone(&store);
        let registry = Arc::clone(&registry);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            info!(source_id = %job.source_id, files = job.files.len(), "job started");
            run_job(store.as_ref(), &registry, &job, &options).await
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(report) => {
                info!(
                    source_id = %report.source_id,
                    status = report.status.as_str(),
                    "job finished"
                );
                reports.push(report);
            }
            Err(err) => error!(error = %err, "job task failed"),
        }
    }
    reports.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    reports
}
