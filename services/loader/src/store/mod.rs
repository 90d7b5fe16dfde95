//! Persistence seam between the engine and the warehouse.
//!
//! The resolver only needs [`DimensionStore`], the loader only needs
//! [`FactStore`]. [`PgWarehouse`] backs both with Postgres and
//! [`MemoryWarehouse`] backs both in memory for dry runs and tests.

mod memory;
mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EtlResult;
use crate::seed::{TerritorioSeed, TiempoSeed};
use crate::value::Row;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiempoRow {
    pub id: i64,
    pub fecha: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerritorioRow {
    pub id: i64,
    pub departamento: String,
    pub municipio: String,
}

/// A dimension row addressed by a single text natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRow {
    pub id: i64,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCampo {
    pub nombre_campo: String,
    pub contrato: Option<String>,
    pub operador: Option<String>,
    pub territorio_id: Option<i64>,
    pub activo: bool,
}

impl NewCampo {
    pub fn named(nombre_campo: &str) -> Self {
        Self {
            nombre_campo: nombre_campo.to_string(),
            activo: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewResolucion {
    pub numero_resolucion: String,
    pub periodo_desde: Option<NaiveDate>,
    pub periodo_hasta: Option<NaiveDate>,
    pub url_pdf: Option<String>,
    pub url_soporte_magnetico: Option<String>,
    pub titulo: Option<String>,
}

impl NewResolucion {
    pub fn numbered(numero_resolucion: &str) -> Self {
        Self {
            numero_resolucion: numero_resolucion.to_string(),
            ..Default::default()
        }
    }
}

/// Result of an upsert on a dimension's natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: i64,
    pub created: bool,
}

#[async_trait]
pub trait DimensionStore: Send + Sync {
    async fn load_tiempo(&self) -> EtlResult<Vec<TiempoRow>>;
    async fn load_territorios(&self) -> EtlResult<Vec<TerritorioRow>>;
    async fn load_campos(&self) -> EtlResult<Vec<NamedRow>>;
    async fn load_resoluciones(&self) -> EtlResult<Vec<NamedRow>>;

    /// Insert or update on `nombre_campo`. Never overwrites known attributes with nulls.
    async fn upsert_campo(&self, campo: &NewCampo) -> EtlResult<Upserted>;
    async fn find_campo(&self, nombre_campo: &str) -> EtlResult<Option<i64>>;

    /// Insert or update on `numero_resolucion`.
    async fn upsert_resolucion(&self, resolucion: &NewResolucion) -> EtlResult<Upserted>;
    async fn find_resolucion(&self, numero_resolucion: &str) -> EtlResult<Option<i64>>;

    /// Insert missing months; existing dates are left alone. Returns rows inserted.
    async fn seed_tiempo(&self, rows: &[TiempoSeed]) -> EtlResult<u64>;

    /// Insert missing places; a place whose `clave` already exists is left alone.
    async fn seed_territorios(&self, rows: &[TerritorioSeed]) -> EtlResult<u64>;
}

#[async_trait]
pub trait FactStore: Send + Sync {
    /// Upsert `rows` into `table` in one statement, conflicting on `unique_key`.
    /// Fails as a whole; callers split the batch to isolate bad rows.
    async fn upsert_facts(&self, table: &str, unique_key: &[String], rows: &[Row])
        -> EtlResult<u64>;
}

/// `etl_runs` bookkeeping, one row per source run.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn start_run(&self, source_id: &str, detail: &Value) -> EtlResult<Uuid>;
    async fn finish_run(&self, run_id: Uuid, status: &str, detail: &Value) -> EtlResult<()>;
}

pub trait Warehouse: DimensionStore + FactStore + RunLedger {}

impl<T: DimensionStore + FactStore + RunLedger + ?Sized> Warehouse for T {}
