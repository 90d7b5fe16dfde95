use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    DimensionStore, FactStore, NamedRow, NewCampo, NewResolucion, RunLedger, TerritorioRow,
    TiempoRow, Upserted,
};
use crate::error::{EtlError, EtlResult};
use crate::resolver::territorio_key;
use crate::seed::{TerritorioSeed, TiempoSeed};
use crate::value::{composite_key, Row};

#[derive(Debug, Default)]
struct FactTable {
    rows: Vec<Row>,
    by_key: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunEntry {
    pub run_id: Uuid,
    pub source_id: String,
    pub status: String,
    pub detail: Value,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    tiempo: Vec<TiempoRow>,
    territorios: Vec<TerritorioRow>,
    campos: Vec<(i64, NewCampo)>,
    resoluciones: Vec<(i64, NewResolucion)>,
    facts: BTreeMap<String, FactTable>,
    rejections: Vec<(String, String, Value)>,
    racing_campos: HashSet<String>,
    batch_sizes: Vec<usize>,
    runs: Vec<RunEntry>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_campo(&mut self, campo: &NewCampo) -> i64 {
        let id = self.next_id();
        self.campos.push((id, campo.clone()));
        id
    }
}

/// In-memory warehouse with the same unique constraints as the Postgres
/// schema. Like Postgres, one fact upsert may not touch the same key twice.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tiempo(&self, fecha: NaiveDate) -> i64 {
        let mut state = self.state.lock().await;
        if let Some(row) = state.tiempo.iter().find(|t| t.fecha == fecha) {
            return row.id;
        }
        let id = state.next_id();
        state.tiempo.push(TiempoRow { id, fecha });
        id
    }

    pub async fn insert_territorio(&self, departamento: &str, municipio: &str) -> i64 {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.territorios.push(TerritorioRow {
            id,
            departamento: departamento.to_string(),
            municipio: municipio.to_string(),
        });
        id
    }

    /// Fail any fact batch that contains a row whose `column` equals `value`.
    pub async fn reject_fact(&self, table: &str, column: &str, value: Value) {
        self.state
            .lock()
            .await
            .rejections
            .push((table.to_string(), column.to_string(), value));
    }

    /// Make the next upsert of this field behave as if a concurrent writer
    /// inserted it first: the row appears and the upsert reports a conflict.
    pub async fn race_campo(&self, nombre_campo: &str) {
        self.state
            .lock()
            .await
            .racing_campos
            .insert(nombre_campo.to_string());
    }

    pub async fn fact_rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .await
            .facts
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub async fn fact_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .await
            .facts
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    pub async fn campos(&self) -> Vec<(i64, NewCampo)> {
        self.state.lock().await.campos.clone()
    }

    pub async fn resolucion_count(&self) -> usize {
        self.state.lock().await.resoluciones.len()
    }

    pub async fn tiempo_count(&self) -> usize {
        self.state.lock().await.tiempo.len()
    }

    /// Sizes of every fact upsert attempted, in order.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().await.batch_sizes.clone()
    }

    pub async fn runs(&self) -> Vec<RunEntry> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait]
impl DimensionStore for MemoryWarehouse {
    async fn load_tiempo(&self) -> EtlResult<Vec<TiempoRow>> {
        Ok(self.state.lock().await.tiempo.clone())
    }

    async fn load_territorios(&self) -> EtlResult<Vec<TerritorioRow>> {
        Ok(self.state.lock().await.territorios.clone())
    }

    async fn load_campos(&self) -> EtlResult<Vec<NamedRow>> {
        let state = self.state.lock().await;
        Ok(state
            .campos
            .iter()
            .map(|(id, c)| NamedRow {
                id: *id,
                key: c.nombre_campo.clone(),
            })
            .collect())
    }

    async fn load_resoluciones(&self) -> EtlResult<Vec<NamedRow>> {
        let state = self.state.lock().await;
        Ok(state
            .resoluciones
            .iter()
            .map(|(id, r)| NamedRow {
                id: *id,
                key: r.numero_resolucion.clone(),
            })
            .collect())
    }

    async fn upsert_campo(&self, campo: &NewCampo) -> EtlResult<Upserted> {
        let mut state = self.state.lock().await;
        if state.racing_campos.remove(&campo.nombre_campo) {
            if !state.campos.iter().any(|(_, c)| c.nombre_campo == campo.nombre_campo) {
                state.insert_campo(campo);
            }
            return Err(EtlError::conflict(format!(
                "duplicate key value violates unique constraint \"dim_campos_nombre_campo_key\" ({})",
                campo.nombre_campo
            )));
        }
        if let Some((id, existing)) = state
            .campos
            .iter_mut()
            .find(|(_, c)| c.nombre_campo == campo.nombre_campo)
        {
            if campo.contrato.is_some() {
                existing.contrato = campo.contrato.clone();
            }
            if campo.operador.is_some() {
                existing.operador = campo.operador.clone();
            }
            if campo.territorio_id.is_some() {
                existing.territorio_id = campo.territorio_id;
            }
            return Ok(Upserted {
                id: *id,
                created: false,
            });
        }
        let id = state.insert_campo(campo);
        Ok(Upserted { id, created: true })
    }

    async fn find_campo(&self, nombre_campo: &str) -> EtlResult<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .campos
            .iter()
            .find(|(_, c)| c.nombre_campo == nombre_campo)
            .map(|(id, _)| *id))
    }

    async fn upsert_resolucion(&self, resolucion: &NewResolucion) -> EtlResult<Upserted> {
        let mut state = self.state.lock().await;
        if let Some((id, existing)) = state
            .resoluciones
            .iter_mut()
            .find(|(_, r)| r.numero_resolucion == resolucion.numero_resolucion)
        {
            existing.periodo_desde = resolucion.periodo_desde.or(existing.periodo_desde);
            existing.periodo_hasta = resolucion.periodo_hasta.or(existing.periodo_hasta);
            if resolucion.url_pdf.is_some() {
                existing.url_pdf = resolucion.url_pdf.clone();
            }
            if resolucion.url_soporte_magnetico.is_some() {
                existing.url_soporte_magnetico = resolucion.url_soporte_magnetico.clone();
            }
            if resolucion.titulo.is_some() {
                existing.titulo = resolucion.titulo.clone();
            }
            return Ok(Upserted {
                id: *id,
                created: false,
            });
        }
        let id = state.next_id();
        state.resoluciones.push((id, resolucion.clone()));
        Ok(Upserted { id, created: true })
    }

    async fn find_resolucion(&self, numero_resolucion: &str) -> EtlResult<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .resoluciones
            .iter()
            .find(|(_, r)| r.numero_resolucion == numero_resolucion)
            .map(|(id, _)| *id))
    }

    async fn seed_tiempo(&self, rows: &[TiempoSeed]) -> EtlResult<u64> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for seed in rows {
            if state.tiempo.iter().any(|t| t.fecha == seed.fecha) {
                continue;
            }
            let id = state.next_id();
            state.tiempo.push(TiempoRow {
                id,
                fecha: seed.fecha,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn seed_territorios(&self, rows: &[TerritorioSeed]) -> EtlResult<u64> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for seed in rows {
            let exists = state
                .territorios
                .iter()
                .any(|t| territorio_key(&t.departamento, &t.municipio) == seed.clave);
            if exists {
                continue;
            }
            let id = state.next_id();
            state.territorios.push(TerritorioRow {
                id,
                departamento: seed.departamento.clone(),
                municipio: seed.municipio.clone(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl FactStore for MemoryWarehouse {
    async fn upsert_facts(
        &self,
        table: &str,
        unique_key: &[String],
        rows: &[Row],
    ) -> EtlResult<u64> {
        let mut state = self.state.lock().await;
        state.batch_sizes.push(rows.len());

        if unique_key.is_empty() {
            return Err(EtlError::config(format!("{table} has no unique key")));
        }

        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let rejected = state
                .rejections
                .iter()
                .any(|(t, column, value)| t == table && row.get(column) == Some(value));
            if rejected {
                return Err(EtlError::store(format!("row rejected by {table}")));
            }
            let key = composite_key(row, unique_key);
            if !seen.insert(key.clone()) {
                return Err(EtlError::store(
                    "ON CONFLICT DO UPDATE command cannot affect row a second time",
                ));
            }
            keys.push(key);
        }

        let facts = state.facts.entry(table.to_string()).or_default();
        for (row, key) in rows.iter().zip(keys) {
            match facts.by_key.get(&key) {
                Some(&i) => facts.rows[i] = row.clone(),
                None => {
                    facts.by_key.insert(key, facts.rows.len());
                    facts.rows.push(row.clone());
                }
            }
        }
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl RunLedger for MemoryWarehouse {
    async fn start_run(&self, source_id: &str, detail: &Value) -> EtlResult<Uuid> {
        let run_id = Uuid::new_v4();
        self.state.lock().await.runs.push(RunEntry {
            run_id,
            source_id: source_id.to_string(),
            status: "running".to_string(),
            detail: detail.clone(),
        });
        Ok(run_id)
    }

    async fn finish_run(&self, run_id: Uuid, status: &str, detail: &Value) -> EtlResult<()> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| EtlError::store(format!("unknown run {run_id}")))?;
        run.status = status.to_string();
        if let (Value::Object(current), Value::Object(extra)) = (&mut run.detail, detail) {
            for (k, v) in extra {
                current.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    fn key(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    // -------------------------------------------------------------------------
    // Facts
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_upsert_updates_in_place() {
        let store = MemoryWarehouse::new();
        let unique = key(&["tiempo_id", "campo_id"]);
        store
            .upsert_facts("fact_x", &unique, &[row(json!({"tiempo_id": 1, "campo_id": 7, "valor": 1}))])
            .await
            .unwrap();
        store
            .upsert_facts("fact_x", &unique, &[row(json!({"tiempo_id": 1, "campo_id": 7, "valor": 2}))])
            .await
            .unwrap();
        let rows = store.fact_rows("fact_x").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["valor"], 2);
    }

    #[tokio::test]
    async fn test_null_key_part_is_not_empty_text() {
        let store = MemoryWarehouse::new();
        let unique = key(&["tiempo_id", "tipo"]);
        let batch = [
            row(json!({"tiempo_id": 1, "tipo": null, "valor": 1})),
            row(json!({"tiempo_id": 1, "tipo": "", "valor": 2})),
        ];
        store.upsert_facts("fact_x", &unique, &batch).await.unwrap();
        store
            .upsert_facts("fact_x", &unique, &[row(json!({"tiempo_id": 1, "tipo": null, "valor": 3}))])
            .await
            .unwrap();
        let rows = store.fact_rows("fact_x").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["valor"], 3);
        assert_eq!(rows[1]["valor"], 2);
    }

    #[tokio::test]
    async fn test_same_key_twice_in_one_batch_fails() {
        let store = MemoryWarehouse::new();
        let unique = key(&["tiempo_id"]);
        let batch = [row(json!({"tiempo_id": 1})), row(json!({"tiempo_id": 1}))];
        let err = store.upsert_facts("fact_x", &unique, &batch).await.unwrap_err();
        assert!(err.to_string().contains("second time"));
        assert_eq!(store.fact_count("fact_x").await, 0);
    }

    #[tokio::test]
    async fn test_rejection_fails_whole_batch() {
        let store = MemoryWarehouse::new();
        store.reject_fact("fact_x", "tiempo_id", json!(2)).await;
        let unique = key(&["tiempo_id"]);
        let batch = [row(json!({"tiempo_id": 1})), row(json!({"tiempo_id": 2}))];
        assert!(store.upsert_facts("fact_x", &unique, &batch).await.is_err());
        assert_eq!(store.fact_count("fact_x").await, 0);
        assert_eq!(store.batch_sizes().await, vec![2]);
    }

    // -------------------------------------------------------------------------
    // Dimensions
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_campo_upsert_keeps_known_attributes() {
        let store = MemoryWarehouse::new();
        let mut campo = NewCampo::named("RUBIALES");
        campo.contrato = Some("RUBIALES".into());
        let first = store.upsert_campo(&campo).await.unwrap();
        let second = store.upsert_campo(&NewCampo::named("RUBIALES")).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        let campos = store.campos().await;
        assert_eq!(campos.len(), 1);
        assert_eq!(campos[0].1.contrato.as_deref(), Some("RUBIALES"));
    }

    #[tokio::test]
    async fn test_racing_campo_reports_conflict_but_row_exists() {
        let store = MemoryWarehouse::new();
        store.race_campo("NUEVO").await;
        let err = store.upsert_campo(&NewCampo::named("NUEVO")).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.find_campo("NUEVO").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_seed_tiempo_skips_existing_dates() {
        let store = MemoryWarehouse::new();
        let seeds = crate::seed::generate_tiempo_records(
            2024,
            2024,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        assert_eq!(store.seed_tiempo(&seeds).await.unwrap(), 12);
        assert_eq!(store.seed_tiempo(&seeds).await.unwrap(), 0);
        assert_eq!(store.tiempo_count().await, 12);
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_detail_is_merged_on_finish() {
        let store = MemoryWarehouse::new();
        let run_id = store
            .start_run("api_regalias", &json!({"files": 1}))
            .await
            .unwrap();
        store
            .finish_run(run_id, "success", &json!({"inserted": 3}))
            .await
            .unwrap();
        let runs = store.runs().await;
        assert_eq!(runs[0].status, "success");
        assert_eq!(runs[0].detail, json!({"files": 1, "inserted": 3}));
    }
}
