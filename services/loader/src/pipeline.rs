//! One source, end to end: raw payloads to a transform output, then to the
//! warehouse through a fresh loader, bracketed by an `etl_runs` entry.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EtlError, EtlResult};
use crate::facts::FactCatalog;
use crate::loader::{FactLoader, LoadResult, LoadStatus, DEFAULT_BATCH_SIZE, DEFAULT_ERROR_SAMPLE};
use crate::mapping::map_source_rows;
use crate::record::NormalizedRecord;
use crate::sources::SourceTransformer;
use crate::store::Warehouse;
use crate::table::Table;
use crate::validate::{error_categories, validate_and_derive, RowError};

/// A raw payload as fetched: file name (for format detection) and bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl RawFile {
    pub fn new(name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            bytes: bytes.into(),
        }
    }

    pub async fn read(path: &Path) -> EtlResult<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, bytes })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
}

impl TransformStats {
    /// Share of input rows that became records, 0 when there was no input.
    pub fn success_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.valid as f64 * 100.0 / self.total as f64
        }
    }
}

/// A payload that produced no rows at all: unreadable, or missing columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub records: Vec<NormalizedRecord>,
    pub errors: Vec<RowError>,
    pub file_errors: Vec<FileError>,
    pub stats: TransformStats,
    pub error_categories: BTreeMap<String, usize>,
}

impl TransformOutput {
    /// Append another payload's output. Its record indices are shifted past
    /// the rows already seen so they stay unique across payloads.
    fn merge(&mut self, other: TransformOutput) {
        let offset = self.stats.total;
        self.records.extend(other.records);
        self.errors.extend(other.errors.into_iter().map(|mut e| {
            e.record_index += offset;
            e
        }));
        self.file_errors.extend(other.file_errors);
        self.stats.total += other.stats.total;
        self.stats.valid += other.stats.valid;
        self.stats.invalid += other.stats.invalid;
        for (category, count) in other.error_categories {
            *self.error_categories.entry(category).or_insert(0) += count;
        }
    }
}

/// Validate, derive and map one table through a source.
pub fn transform_table(table: Table, source: &dyn SourceTransformer) -> EtlResult<TransformOutput> {
    let validated = validate_and_derive(table, source.config())?;
    let total = validated.total();
    let mapped = map_source_rows(&validated.valid, source);

    let mut errors = validated.invalid;
    errors.extend(mapped.errors);
    errors.sort_by_key(|e| e.record_index);

    Ok(TransformOutput {
        file_errors: Vec::new(),
        stats: TransformStats {
            total,
            valid: mapped.records.len(),
            invalid: errors.len(),
        },
        error_categories: error_categories(&errors),
        records: mapped.records,
        errors,
    })
}

/// Category under which a payload-level failure is counted.
fn file_error_category(err: &EtlError) -> &'static str {
    match err {
        EtlError::Structural { .. } => "structural error",
        _ => "unreadable payload",
    }
}

/// Transform several payloads of one source and merge the results.
/// Empty payloads are skipped; a payload that cannot be read or lacks
/// required columns is recorded as a file error and the rest still run.
pub fn transform_files(source: &dyn SourceTransformer, files: &[RawFile]) -> TransformOutput {
    let mut output = TransformOutput::default();
    for file in files {
        if file.bytes.iter().all(u8::is_ascii_whitespace) {
            warn!(source_id = source.source_id(), file = %file.name, "empty payload skipped");
            continue;
        }
        let transformed = Table::from_bytes(&file.name, &file.bytes, &source.config().data_path)
            .and_then(|table| transform_table(table, source));
        let transformed = match transformed {
            Ok(transformed) => transformed,
            Err(err) => {
                error!(source_id = source.source_id(), file = %file.name, error = %err, "payload rejected");
                *output
                    .error_categories
                    .entry(file_error_category(&err).to_string())
                    .or_insert(0) += 1;
                output.file_errors.push(FileError {
                    file: file.name.clone(),
                    error: err.to_string(),
                });
                continue;
            }
        };
        info!(
            source_id = source.source_id(),
            file = %file.name,
            total = transformed.stats.total,
            valid = transformed.stats.valid,
            invalid = transformed.stats.invalid,
            "payload transformed"
        );
        output.merge(transformed);
    }
    output
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub error_sample: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            error_sample: DEFAULT_ERROR_SAMPLE,
        }
    }
}

/// Outcome of one source run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source_id: String,
    pub run_id: Option<Uuid>,
    pub status: LoadStatus,
    pub transform: TransformStats,
    pub error_categories: BTreeMap<String, usize>,
    pub load: Option<LoadResult>,
    pub file_errors: Vec<FileError>,
    pub message: String,
}

impl RunReport {
    pub fn failed(source_id: &str, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            run_id: None,
            status: LoadStatus::Error,
            transform: TransformStats::default(),
            error_categories: BTreeMap::new(),
            load: None,
            file_errors: Vec::new(),
            message: message.into(),
        }
    }

    fn detail(&self) -> serde_json::Value {
        let mut detail = json!({
            "transform": self.transform,
            "success_percentage": self.transform.success_percentage(),
            "error_categories": self.error_categories,
            "file_errors": self.file_errors,
            "message": self.message,
        });
        if let (Some(load), Some(map)) = (&self.load, detail.as_object_mut()) {
            map.insert(
                "load".to_string(),
                json!({
                    "inserted": load.inserted,
                    "duplicates_collapsed": load.duplicates_collapsed,
                    "skipped_no_tiempo": load.skipped_no_tiempo,
                    "skipped_no_dimension": load.skipped_no_dimension(),
                    "errors": load.errors,
                    "campos_created": load.resolver_stats.campos_created_range,
                }),
            );
        }
        detail
    }
}

/// Run one source: transform every payload, load the records with a loader
/// of its own, and record the run in the ledger. Failures are reported, not
/// returned, so a caller running many sources keeps going.
pub async fn run_source<S: Warehouse + ?Sized>(
    store: &S,
    source: &dyn SourceTransformer,
    files: &[RawFile],
    options: &LoadOptions,
) -> RunReport {
    let source_id = source.source_id();
    let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
    let run_id = match store.start_run(source_id, &json!({ "files": names })).await {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(source_id, error = %err, "could not record run start");
            None
        }
    };

    let output = transform_files(source, files);
    let mut report = load_output(store, source_id, output, options).await;
    report.run_id = run_id;

    if let Some(run_id) = run_id {
        if let Err(err) = store
            .finish_run(run_id, report.status.as_str(), &report.detail())
            .await
        {
            warn!(source_id, error = %err, "could not record run end");
        }
    }
    report
}

async fn load_output<S: Warehouse + ?Sized>(
    store: &S,
    source_id: &str,
    output: TransformOutput,
    options: &LoadOptions,
) -> RunReport {
    info!(
        source_id,
        total = output.stats.total,
        valid = output.stats.valid,
        invalid = output.stats.invalid,
        success_percentage = format!("{:.1}", output.stats.success_percentage()),
        "transform complete"
    );

    let mut loader = FactLoader::new(store, FactCatalog::builtin())
        .with_batch_size(options.batch_size)
        .with_error_sample(options.error_sample);
    let load = loader.load(&output.records, source_id).await;

    let (status, message) = match output.file_errors.first() {
        // nothing readable came in
        Some(first) if output.stats.total == 0 => (
            LoadStatus::Error,
            format!("{}: {}", first.file, first.error),
        ),
        _ if output.records.is_empty() && output.stats.total > 0 => (
            LoadStatus::Error,
            format!("no valid records out of {}", output.stats.total),
        ),
        Some(_) if load.status == LoadStatus::Success => (
            LoadStatus::Partial,
            format!(
                "{}; {} payloads rejected",
                load.message,
                output.file_errors.len()
            ),
        ),
        _ => (load.status, load.message.clone()),
    };

    RunReport {
        source_id: source_id.to_string(),
        run_id: None,
        status,
        transform: output.stats,
        error_categories: output.error_categories,
        load: Some(load),
        file_errors: output.file_errors,
        message,
    }
}
