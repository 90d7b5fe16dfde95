use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::{
    DimensionStore, FactStore, NamedRow, NewCampo, NewResolucion, RunLedger, TerritorioRow,
    TiempoRow, Upserted,
};
use crate::error::{EtlError, EtlResult};
use crate::seed::{TerritorioSeed, TiempoSeed};
use crate::value::Row;

/// Postgres star schema created by `migrations/`.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(db_url: &str, max_connections: u32) -> EtlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> EtlResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Double-quote an identifier for dynamic SQL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT ... SELECT ... FROM jsonb_populate_recordset ... ON CONFLICT` for one table.
fn fact_upsert_sql(table: &str, columns: &[String], unique_key: &[String]) -> String {
    let table_ident = quote_ident(table);
    let cols = column_list(columns);
    let conflict = column_list(unique_key);
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !unique_key.contains(*c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {table_ident} ({cols}) \
         SELECT {cols} FROM jsonb_populate_recordset(NULL::{table_ident}, $1) \
         ON CONFLICT ({conflict}) {action}"
    )
}

#[async_trait]
impl DimensionStore for PgWarehouse {
    async fn load_tiempo(&self) -> EtlResult<Vec<TiempoRow>> {
        let rows: Vec<(i64, chrono::NaiveDate)> =
            sqlx::query_as("SELECT id, fecha FROM dim_tiempo")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, fecha)| TiempoRow { id, fecha })
            .collect())
    }

    async fn load_territorios(&self) -> EtlResult<Vec<TerritorioRow>> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, departamento, municipio FROM dim_territorios")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, departamento, municipio)| TerritorioRow {
                id,
                departamento,
                municipio,
            })
            .collect())
    }

    async fn load_campos(&self) -> EtlResult<Vec<NamedRow>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, nombre_campo FROM dim_campos")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id, key)| NamedRow { id, key }).collect())
    }

    async fn load_resoluciones(&self) -> EtlResult<Vec<NamedRow>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, numero_resolucion FROM dim_resolucion")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id, key)| NamedRow { id, key }).collect())
    }

    async fn upsert_campo(&self, campo: &NewCampo) -> EtlResult<Upserted> {
        let (id, created): (i64, bool) = sqlx::query_as(
            r#"
            INSERT INTO dim_campos (nombre_campo, contrato, operador, territorio_id, activo)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (nombre_campo) DO UPDATE SET
                contrato = COALESCE(EXCLUDED.contrato, dim_campos.contrato),
                operador = COALESCE(EXCLUDED.operador, dim_campos.operador),
                territorio_id = COALESCE(EXCLUDED.territorio_id, dim_campos.territorio_id)
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&campo.nombre_campo)
        .bind(&campo.contrato)
        .bind(&campo.operador)
        .bind(campo.territorio_id)
        .bind(campo.activo)
        .fetch_one(&self.pool)
        .await?;
        Ok(Upserted { id, created })
    }

    async fn find_campo(&self, nombre_campo: &str) -> EtlResult<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM dim_campos WHERE nombre_campo = $1")
                .bind(nombre_campo)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn upsert_resolucion(&self, resolucion: &NewResolucion) -> EtlResult<Upserted> {
        let (id, created): (i64, bool) = sqlx::query_as(
            r#"
            INSERT INTO dim_resolucion
                (numero_resolucion, periodo_desde, periodo_hasta, url_pdf, url_soporte_magnetico, titulo)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (numero_resolucion) DO UPDATE SET
                periodo_desde = COALESCE(EXCLUDED.periodo_desde, dim_resolucion.periodo_desde),
                periodo_hasta = COALESCE(EXCLUDED.periodo_hasta, dim_resolucion.periodo_hasta),
                url_pdf = COALESCE(EXCLUDED.url_pdf, dim_resolucion.url_pdf),
                url_soporte_magnetico = COALESCE(EXCLUDED.url_soporte_magnetico, dim_resolucion.url_soporte_magnetico),
                titulo = COALESCE(EXCLUDED.titulo, dim_resolucion.titulo)
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&resolucion.numero_resolucion)
        .bind(resolucion.periodo_desde)
        .bind(resolucion.periodo_hasta)
        .bind(&resolucion.url_pdf)
        .bind(&resolucion.url_soporte_magnetico)
        .bind(&resolucion.titulo)
        .fetch_one(&self.pool)
        .await?;
        Ok(Upserted { id, created })
    }

    async fn find_resolucion(&self, numero_resolucion: &str) -> EtlResult<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM dim_resolucion WHERE numero_resolucion = $1")
                .bind(numero_resolucion)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn seed_tiempo(&self, rows: &[TiempoSeed]) -> EtlResult<u64> {
        let fechas: Vec<chrono::NaiveDate> = rows.iter().map(|r| r.fecha).collect();
        let anios: Vec<i32> = rows.iter().map(|r| r.anio).collect();
        let meses: Vec<i32> = rows.iter().map(|r| r.mes as i32).collect();
        let nombres: Vec<String> = rows.iter().map(|r| r.nombre_mes.to_string()).collect();
        let proyecciones: Vec<bool> = rows.iter().map(|r| r.es_proyeccion).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO dim_tiempo (fecha, anio, mes, nombre_mes, es_proyeccion)
            SELECT * FROM UNNEST($1::date[], $2::int[], $3::int[], $4::text[], $5::bool[])
            ON CONFLICT (fecha) DO NOTHING
            "#,
        )
        .bind(&fechas)
        .bind(&anios)
        .bind(&meses)
        .bind(&nombres)
        .bind(&proyecciones)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn seed_territorios(&self, rows: &[TerritorioSeed]) -> EtlResult<u64> {
        let claves: Vec<&str> = rows.iter().map(|r| r.clave.as_str()).collect();
        let departamentos: Vec<&str> = rows.iter().map(|r| r.departamento.as_str()).collect();
        let municipios: Vec<&str> = rows.iter().map(|r| r.municipio.as_str()).collect();
        let latitudes: Vec<Option<f64>> = rows.iter().map(|r| r.latitud).collect();
        let longitudes: Vec<Option<f64>> = rows.iter().map(|r| r.longitud).collect();
        let divipolas: Vec<Option<&str>> = rows.iter().map(|r| r.divipola.as_deref()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO dim_territorios (clave, departamento, municipio, latitud, longitud, divipola)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::float8[], $5::float8[], $6::text[])
            ON CONFLICT (clave) DO NOTHING
            "#,
        )
        .bind(&claves)
        .bind(&departamentos)
        .bind(&municipios)
        .bind(&latitudes)
        .bind(&longitudes)
        .bind(&divipolas)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FactStore for PgWarehouse {
    async fn upsert_facts(
        &self,
        table: &str,
        unique_key: &[String],
        rows: &[Row],
    ) -> EtlResult<u64> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        if unique_key.is_empty() {
            return Err(EtlError::config(format!("{table} has no unique key")));
        }
        let columns: Vec<String> = first.keys().cloned().collect();
        let sql = fact_upsert_sql(table, &columns, unique_key);
        debug!(table, rows = rows.len(), sql = %sql, "fact upsert");

        let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        let result = sqlx::query(&sql).bind(payload).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RunLedger for PgWarehouse {
    async fn start_run(&self, source_id: &str, detail: &Value) -> EtlResult<Uuid> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO etl_runs (run_id, source_id, status, detail)
            VALUES ($1, $2, 'running', $3)
            "#,
        )
        .bind(run_id)
        .bind(source_id)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn finish_run(&self, run_id: Uuid, status: &str, detail: &Value) -> EtlResult<()> {
        sqlx::query(
            r#"
            UPDATE etl_runs
            SET finished_at = now(), status = $2, detail = detail || $3
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("fact_regalias"), "\"fact_regalias\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_fact_upsert_sql_updates_non_key_columns() {
        let sql = fact_upsert_sql(
            "fact_regalias",
            &cols(&["campo_id", "tiempo_id", "tipo_hidrocarburo", "valor_regalias_cop"]),
            &cols(&["tiempo_id", "campo_id", "tipo_hidrocarburo"]),
        );
        assert!(sql.starts_with("INSERT INTO \"fact_regalias\" (\"campo_id\", \"tiempo_id\""));
        assert!(sql.contains("jsonb_populate_recordset(NULL::\"fact_regalias\", $1)"));
        assert!(sql.contains("ON CONFLICT (\"tiempo_id\", \"campo_id\", \"tipo_hidrocarburo\")"));
        assert!(sql.ends_with(
            "DO UPDATE SET \"valor_regalias_cop\" = EXCLUDED.\"valor_regalias_cop\""
        ));
    }

    #[test]
    fn test_fact_upsert_sql_key_only_does_nothing() {
        let sql = fact_upsert_sql("t", &cols(&["a", "b"]), &cols(&["a", "b"]));
        assert!(sql.ends_with("ON CONFLICT (\"a\", \"b\") DO NOTHING"));
    }
}
