//! Fact loader: resolve dimensions, build fact rows, upsert in batches.
//!
//! Rows whose mandatory dimensions do not resolve are skipped and counted by
//! dimension. Within one call, records colliding on a table's unique key are
//! collapsed (last wins) so no batch upsert touches a key twice. A batch that
//! fails is retried row by row so one bad row costs one row.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::facts::{FactCatalog, FactTableSpec};
use crate::record::{DimensionKind, NormalizedRecord};
use crate::resolver::{DimensionResolver, ResolvedKeys, ResolverStats};
use crate::store::Warehouse;
use crate::value::{coerce_numeric, composite_key, sanitize, Row};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_ERROR_SAMPLE: usize = 100;
const PROGRESS_EVERY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Success,
    Partial,
    Error,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    fn from_counts(total: usize, inserted: u64, errors: usize) -> Self {
        if total == 0 {
            Self::Success
        } else if inserted == 0 {
            Self::Error
        } else if errors == 0 {
            Self::Success
        } else {
            Self::Partial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadErrorDetail {
    pub fact_table: String,
    pub error: String,
    /// The offending row when the failure could be pinned to one.
    pub row: Option<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadResult {
    pub status: LoadStatus,
    pub total_processed: usize,
    pub inserted: u64,
    pub duplicates_collapsed: usize,
    pub skipped_no_tiempo: usize,
    pub skipped_no_territorio: usize,
    pub skipped_no_campo: usize,
    pub skipped_no_resolucion: usize,
    pub errors: usize,
    pub error_details: Vec<LoadErrorDetail>,
    pub resolver_stats: ResolverStats,
    pub message: String,
}

impl LoadResult {
    fn new(total_processed: usize) -> Self {
        Self {
            status: LoadStatus::Success,
            total_processed,
            inserted: 0,
            duplicates_collapsed: 0,
            skipped_no_tiempo: 0,
            skipped_no_territorio: 0,
            skipped_no_campo: 0,
            skipped_no_resolucion: 0,
            errors: 0,
            error_details: Vec::new(),
            resolver_stats: ResolverStats::default(),
            message: String::new(),
        }
    }

    /// Rows skipped for any dimension other than time.
    pub fn skipped_no_dimension(&self) -> usize {
        self.skipped_no_territorio + self.skipped_no_campo + self.skipped_no_resolucion
    }

    pub fn skipped(&self) -> usize {
        self.skipped_no_tiempo + self.skipped_no_dimension()
    }

    fn skip(&mut self, kind: DimensionKind) {
        match kind {
            DimensionKind::Tiempo => self.skipped_no_tiempo += 1,
            DimensionKind::Territorio => self.skipped_no_territorio += 1,
            DimensionKind::Campo => self.skipped_no_campo += 1,
            DimensionKind::Resolucion => self.skipped_no_resolucion += 1,
        }
    }

    fn error(&mut self, detail: LoadErrorDetail, sample: usize) {
        self.errors += 1;
        if self.error_details.len() < sample {
            self.error_details.push(detail);
        }
    }
}

/// Rows bound for one fact table, unique on its key, in first-seen order.
#[derive(Default)]
struct TableBatch {
    rows: Vec<Row>,
    positions: HashMap<String, usize>,
}

impl TableBatch {
    /// Returns true when the row replaced an earlier one with the same key.
    fn push(&mut self, key: String, row: Row) -> bool {
        match self.positions.get(&key) {
            Some(&position) => {
                self.rows[position] = row;
                true
            }
            None => {
                self.positions.insert(key, self.rows.len());
                self.rows.push(row);
                false
            }
        }
    }
}

/// FK columns, `source_id` and the table's columns read from `record.data`.
pub fn build_fact_row(
    spec: &FactTableSpec,
    record: &NormalizedRecord,
    keys: &ResolvedKeys,
    source_id: &str,
) -> Row {
    let mut row = Row::new();
    for dimension in &spec.dimensions {
        let id = keys.get(dimension.kind).map(Value::from).unwrap_or(Value::Null);
        row.insert(dimension.kind.fk_column().to_string(), id);
    }
    row.insert("source_id".to_string(), Value::from(source_id));
    for column in &spec.columns {
        let raw = record.data.get(&column.field).unwrap_or(&Value::Null);
        let value = if column.numeric {
            coerce_numeric(raw)
        } else {
            sanitize(raw.clone())
        };
        row.insert(column.column.clone(), value);
    }
    row
}

pub struct FactLoader<'a, S: Warehouse + ?Sized> {
    store: &'a S,
    resolver: DimensionResolver<'a, S>,
    catalog: FactCatalog,
    batch_size: usize,
    error_sample: usize,
}

impl<'a, S: Warehouse + ?Sized> FactLoader<'a, S> {
    pub fn new(store: &'a S, catalog: FactCatalog) -> Self {
        Self {
            store,
            resolver: DimensionResolver::new(store),
            catalog,
            batch_size: DEFAULT_BATCH_SIZE,
            error_sample: DEFAULT_ERROR_SAMPLE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_error_sample(mut self, error_sample: usize) -> Self {
        self.error_sample = error_sample;
        self
    }

    pub fn resolver(&self) -> &DimensionResolver<'a, S> {
        &self.resolver
    }

    /// Discard the resolver's caches before loading another source.
    pub fn reset(&mut self) {
        self.resolver.clear_caches();
    }

    pub async fn load(&mut self, records: &[NormalizedRecord], source_id: &str) -> LoadResult {
        let mut result = LoadResult::new(records.len());
        if records.is_empty() {
            result.message = "no records to load".to_string();
            return result;
        }

        self.resolver.preload_all_caches().await;

        let mut batches: BTreeMap<String, TableBatch> = BTreeMap::new();
        for (position, record) in records.iter().enumerate() {
            if position > 0 && position % PROGRESS_EVERY == 0 {
                info!(source_id, processed = position, total = records.len(), "resolving records");
            }

            let Some(spec) = self.catalog.get(&record.fact_table) else {
                result.error(
                    LoadErrorDetail {
                        fact_table: record.fact_table.clone(),
                        error: format!("unknown fact table '{}'", record.fact_table),
                        row: None,
                    },
                    self.error_sample,
                );
                continue;
            };

            let keys = self.resolver.resolve_record(record).await;
            let missing = spec
                .dimensions
                .iter()
                .find(|d| d.mandatory && keys.get(d.kind).is_none());
            if let Some(dimension) = missing {
                result.skip(dimension.kind);
                continue;
            }

            let row = build_fact_row(spec, record, &keys, source_id);
            let key = composite_key(&row, &spec.unique_key);
            if batches.entry(spec.name.clone()).or_default().push(key, row) {
                result.duplicates_collapsed += 1;
            }
        }

        if result.duplicates_collapsed > 0 {
            debug!(source_id, collapsed = result.duplicates_collapsed, "duplicate keys collapsed");
        }

        for (table, batch) in &batches {
            let Some(spec) = self.catalog.get(table) else {
                continue;
            };
            self.write_table(spec, &batch.rows, &mut result).await;
        }

        self.resolver.log_summary();
        result.resolver_stats = self.resolver.get_stats();
        result.status = LoadStatus::from_counts(result.total_processed, result.inserted, result.errors);
        result.message = format!(
            "{} inserted, {} skipped ({} without tiempo), {} errors",
            result.inserted,
            result.skipped(),
            result.skipped_no_tiempo,
            result.errors
        );
        info!(
            source_id,
            status = result.status.as_str(),
            total = result.total_processed,
            inserted = result.inserted,
            skipped_no_tiempo = result.skipped_no_tiempo,
            skipped_no_dimension = result.skipped_no_dimension(),
            errors = result.errors,
            "load complete"
        );
        result
    }

    async fn write_table(&self, spec: &FactTableSpec, rows: &[Row], result: &mut LoadResult) {
        let batch_count = rows.len().div_ceil(self.batch_size);
        for (index, chunk) in rows.chunks(self.batch_size).enumerate() {
            match self.store.upsert_facts(&spec.name, &spec.unique_key, chunk).await {
                Ok(written) => {
                    result.inserted += written;
                    debug!(
                        table = %spec.name,
                        batch = index + 1,
                        batches = batch_count,
                        rows = written,
                        "batch upserted"
                    );
                }
                Err(err) => {
                    warn!(
                        table = %spec.name,
                        batch = index + 1,
                        rows = chunk.len(),
                        error = %err,
                        "batch upsert failed, retrying row by row"
                    );
                    self.write_rows(spec, chunk, result).await;
                }
            }
        }
    }

    async fn write_rows(&self, spec: &FactTableSpec, rows: &[Row], result: &mut LoadResult) {
        for row in rows {
            match self
                .store
                .upsert_facts(&spec.name, &spec.unique_key, std::slice::from_ref(row))
                .await
            {
                Ok(written) => result.inserted += written,
                Err(err) => {
                    debug!(table = %spec.name, error = %err, "row upsert failed");
                    result.error(
                        LoadErrorDetail {
                            fact_table: spec.name.clone(),
                            error: err.to_string(),
                            row: Some(row.clone()),
                        },
                        self.error_sample,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DimensionStore, MemoryWarehouse, NewCampo};
    use chrono::NaiveDate;
    use serde_json::json;

    fn regalia(fecha: &str, campo: &str, tipo: &str, precio: f64) -> NormalizedRecord {
        NormalizedRecord::new("fact_regalias")
            .with_data("tiempo_fecha", fecha)
            .with_data("campo_nombre", campo)
            .with_data("tipo_hidrocarburo", tipo)
            .with_data("precio_usd", precio)
            .with_data("unidad", "Bls/Kpc")
    }

    async fn seeded() -> MemoryWarehouse {
        let store = MemoryWarehouse::new();
        for mes in 1..=12 {
            store
                .insert_tiempo(NaiveDate::from_ymd_opt(2024, mes, 1).unwrap())
                .await;
        }
        store
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    #[test]
    fn test_status_from_counts() {
        assert_eq!(LoadStatus::from_counts(0, 0, 0), LoadStatus::Success);
        assert_eq!(LoadStatus::from_counts(10, 0, 0), LoadStatus::Error);
        assert_eq!(LoadStatus::from_counts(10, 10, 0), LoadStatus::Success);
        assert_eq!(LoadStatus::from_counts(10, 9, 1), LoadStatus::Partial);
    }

    #[test]
    fn test_build_fact_row_coerces_numeric_columns() {
        let catalog = FactCatalog::builtin();
        let spec = catalog.get("fact_regalias").unwrap();
        let record = regalia("2024-01-01", "RUBIALES", "O", 0.0)
            .with_data("precio_usd", "63,13")
            .with_data("valor_regalias_cop", "n/a");
        let keys = ResolvedKeys {
            tiempo_id: Some(1),
            campo_id: Some(7),
            ..Default::default()
        };
        let row = build_fact_row(spec, &record, &keys, "api_regalias");
        assert_eq!(row["tiempo_id"], json!(1));
        assert_eq!(row["campo_id"], json!(7));
        assert_eq!(row["source_id"], json!("api_regalias"));
        assert_eq!(row["precio_usd"], json!(63.13));
        assert_eq!(row["valor_regalias_cop"], Value::Null);
        assert_eq!(row["unidad"], json!("Bls/Kpc"));
        assert_eq!(row["tipo_produccion"], Value::Null);
    }

    // -------------------------------------------------------------------------
    // Load
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_empty_load_is_success() {
        let store = MemoryWarehouse::new();
        let mut loader = FactLoader::new(&store, FactCatalog::builtin());
        let result = loader.load(&[], "api_regalias").await;
        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(result.inserted, 0);
        assert!(store.batch_sizes().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_tiempo_skips_row() {
        let store = seeded().await;
        let mut loader = FactLoader::new(&store, FactCatalog::builtin());
        let records = vec![
            regalia("2024-03-01", "RUBIALES", "O", 70.0),
            regalia("1990-03-01", "RUBIALES", "O", 70.0),
        ];
        let result = loader.load(&records, "api_regalias").await;
        assert_eq!(result.inserted, 1);
        assert_eq!(result.skipped_no_tiempo, 1);
        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(result.resolver_stats.unresolved_tiempo, vec!["1990-03-01"]);
    }

    #[tokio::test]
    async fn test_nothing_inserted_is_error() {
        let store = MemoryWarehouse::new();
        let mut loader = FactLoader::new(&store, FactCatalog::builtin());
        let result = loader
            .load(&[regalia("2024-03-01", "RUBIALES", "O", 70.0)], "api_regalias")
            .await;
        assert_eq!(result.status, LoadStatus::Error);
        assert_eq!(result.skipped_no_tiempo, 1);
    }

    #[tokio::test]
    async fn test_oferta_without_resolucion_is_skipped() {
        let store = seeded().await;
        let mut loader = FactLoader::new(&store, FactCatalog::builtin());
        let record = NormalizedRecord::new("fact_oferta_gas")
            .with_data("tiempo_fecha", "2024-05-01")
            .with_data("campo_nombre", "CUSIANA")
            .with_data("operador", "ECOPETROL")
            .with_data("tipo_produccion", "PTDV");
        let result = loader.load(&[record], "minminas_oferta").await;
        assert_eq!(result.skipped_no_resolucion, 1);
        assert_eq!(result.skipped_no_dimension(), 1);
        assert_eq!(store.fact_count("fact_oferta_gas").await, 0);
    }

    #[tokio::test]
    async fn test_unknown_fact_table_counts_as_error() {
        let store = seeded().await;
        let mut loader = FactLoader::new(&store, FactCatalog::builtin());
        let records = vec![
            NormalizedRecord::new("fact_desconocida").with_data("tiempo_fecha", "2024-01-01"),
            regalia("2024-01-01", "RUBIALES", "O", 70.0),
        ];
        let result = loader.load(&records, "api_regalias").await;
        assert_eq!(result.errors, 1);
        assert_eq!(result.inserted, 1);
        assert_eq!(result.status, LoadStatus::Partial);
        assert!(result.error_details[0].error.contains("fact_desconocida"));
    }

    #[tokio::test]
    async fn test_duplicate_keys_collapse_last_wins() {
        let store = seeded().await;
        let campo = store.upsert_campo(&NewCampo::named("CAMPO 7")).await.unwrap();
        let mut loader = FactLoader::new(&store, FactCatalog::builtin());
        let records = vec![
            regalia("2024-01-01", "CAMPO 7", "G", 1.0),
            regalia("2024-02-01", "CAMPO 7", "G", 5.0),
            regalia("2024-01-01", "CAMPO 7", "G", 2.0),
        ];
        let result = loader.load(&records, "api_regalias").await;
        assert_eq!(result.duplicates_collapsed, 1);
        assert_eq!(result.inserted, 2);

        let rows = store.fact_rows("fact_regalias").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["campo_id"], json!(campo.id));
        assert_eq!(rows[0]["precio_usd"], json!(2.0));
        assert_eq!(rows[1]["precio_usd"], json!(5.0));
    }

    #[tokio::test]
    async fn test_null_and_empty_key_parts_stay_distinct() {
        let store = seeded().await;
        store.upsert_campo(&NewCampo::named("CAMPO 7")).await.unwrap();
        let mut loader = FactLoader::new(&store, FactCatalog::builtin());
        let records = vec![
            regalia("2024-01-01", "CAMPO 7", "", 1.0),
            regalia("2024-01-01", "CAMPO 7", "G", 2.0).with_data("tipo_hidrocarburo", Value::Null),
        ];
        let result = loader.load(&records, "api_regalias").await;
        assert_eq!(result.duplicates_collapsed, 0);
        assert_eq!(result.inserted, 2);
        assert_eq!(store.fact_count("fact_regalias").await, 2);
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back_to_rows() {
        let store = seeded().await;
        store.reject_fact("fact_regalias", "precio_usd", json!(13.0)).await;
        let mut loader = FactLoader::new(&store, FactCatalog::builtin())
            .with_batch_size(2)
            .with_error_sample(5);
        let mut records: Vec<NormalizedRecord> = (1..=4)
            .map(|mes| regalia(&format!("2024-{mes:02}-01"), "RUBIALES", "O", 10.0 + mes as f64))
            .collect();
        records[2] = regalia("2024-03-01", "RUBIALES", "O", 13.0);

        let result = loader.load(&records, "api_regalias").await;
        assert_eq!(result.inserted, 3);
        assert_eq!(result.errors, 1);
        assert_eq!(result.status, LoadStatus::Partial);
        assert_eq!(store.batch_sizes().await, vec![2, 2, 1, 1]);
        let detail = &result.error_details[0];
        assert_eq!(detail.row.as_ref().unwrap()["precio_usd"], json!(13.0));
    }

    #[tokio::test]
    async fn test_error_details_are_bounded() {
        let store = seeded().await;
        store.reject_fact("fact_regalias", "unidad", json!("Bls/Kpc")).await;
        let mut loader = FactLoader::new(&store, FactCatalog::builtin()).with_error_sample(2);
        let records: Vec<NormalizedRecord> = (1..=5)
            .map(|mes| regalia(&format!("2024-{mes:02}-01"), "RUBIALES", "O", 1.0))
            .collect();
        let result = loader.load(&records, "api_regalias").await;
        assert_eq!(result.errors, 5);
        assert_eq!(result.error_details.len(), 2);
        assert_eq!(result.status, LoadStatus::Error);
    }
}
