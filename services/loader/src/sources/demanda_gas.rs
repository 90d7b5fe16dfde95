//! UPME natural gas demand projections.
//!
//! Sheets of the projection workbook share one layout but their headers vary
//! in case and spacing ("Año", "Demanda GBTUD"), so columns are looked up by a
//! normalized header name instead of declaratively.

use chrono::NaiveDate;
use serde_json::{json, Value};

use crate::config::{FactTableMapping, TransformationConfig};
use crate::mapping::fields;
use crate::record::{DimensionKind, NormalizedRecord};
use crate::sources::SourceTransformer;
use crate::table::DataPath;
use crate::value::{as_text, parse_int, parse_number, sanitize_f64, Row, NULL};

pub const SOURCE_ID: &str = "upme_demanda";

pub const ESCENARIOS: [&str; 5] = ["MEDIO", "ALTO", "BAJO", "IC_95", "IC_68"];
pub const SECTORES: [&str; 8] = [
    "RESIDENCIAL",
    "TERCIARIO",
    "INDUSTRIAL",
    "PETROQUIMICA",
    "PETROLERO",
    "GNV",
    "TERMOELECTRICO",
    "REFINERIA",
];
pub const REGIONES: [&str; 8] = [
    "CENTRO",
    "COSTA",
    "CQR",
    "NOROESTE",
    "OCCIDENTE",
    "ORIENTE",
    "SUR",
    "TOLIMA_GRANDE",
];
pub const SEGMENTOS: [&str; 4] = ["TOTAL", "PETROLERO", "TERMOELECTRICO", "NO_TERMOELECTRICO"];
pub const NIVELES: [&str; 3] = ["nacional", "sectorial", "regional"];

pub fn config() -> TransformationConfig {
    TransformationConfig::new(SOURCE_ID, FactTableMapping::new("fact_demanda_gas"))
        .describe("UPME - Proyección de demanda de gas natural")
        .data_path(DataPath::Root)
}

fn header_key(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Cell under the first header that normalizes to one of `names`.
fn cell<'a>(row: &'a Row, names: &[&str]) -> &'a Value {
    names
        .iter()
        .find_map(|name| {
            row.iter()
                .find(|(key, _)| header_key(key) == *name)
                .map(|(_, value)| value)
        })
        .unwrap_or(&NULL)
}

fn upper(row: &Row, name: &str) -> String {
    as_text(cell(row, &[name]))
        .map(|t| t.to_uppercase().replace(' ', "_"))
        .unwrap_or_default()
}

fn nivel(row: &Row) -> String {
    as_text(cell(row, &["nivel_agregacion"]))
        .map(|t| t.to_lowercase())
        .unwrap_or_else(|| "nacional".to_string())
}

pub struct DemandaGasTransformer {
    config: TransformationConfig,
}

impl DemandaGasTransformer {
    pub fn new() -> Self {
        Self { config: config() }
    }

    fn build(&self, row: &Row, source_id: &str) -> Result<NormalizedRecord, String> {
        let anio = parse_int(cell(row, &["anio", "año"])).ok_or("año ilegible")?;
        let mes = match cell(row, &["mes"]) {
            Value::Null => 1,
            value => parse_int(value).ok_or("mes ilegible")?,
        };
        let fecha = i32::try_from(anio)
            .ok()
            .zip(u32::try_from(mes).ok())
            .and_then(|(y, m)| NaiveDate::from_ymd_opt(y, m, 1))
            .ok_or_else(|| format!("fecha inválida {anio}-{mes}"))?;
        let valor = parse_number(cell(row, &["demanda_gbtud"])).ok_or("demanda_gbtud ilegible")?;
        let fecha_text = fecha.to_string();

        Ok(NormalizedRecord::new("fact_demanda_gas")
            .with_data("tiempo_fecha", fecha_text.clone())
            .with_data("escenario", upper(row, "escenario"))
            .with_data("sector", upper(row, "sector"))
            .with_data("region", upper(row, "region"))
            .with_data("segmento", upper(row, "segmento"))
            .with_data("nivel_agregacion", nivel(row))
            .with_data("valor_demanda_gbtud", sanitize_f64(valor))
            .with_data("source_id", source_id)
            .with_dimension(
                DimensionKind::Tiempo,
                fields([
                    ("fecha", json!(fecha_text)),
                    ("anio", json!(anio)),
                    ("mes", json!(mes)),
                    ("es_proyeccion", json!(true)),
                ]),
            ))
    }
}

impl Default for DemandaGasTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceTransformer for DemandaGasTransformer {
    fn config(&self) -> &TransformationConfig {
        &self.config
    }

    fn validate_row(&self, row: &Row) -> Option<String> {
        let checks: [(&str, &[&str]); 4] = [
            ("escenario", &ESCENARIOS[..]),
            ("sector", &SECTORES[..]),
            ("region", &REGIONES[..]),
            ("segmento", &SEGMENTOS[..]),
        ];
        for (column, allowed) in checks {
            let value = upper(row, column);
            if !allowed.contains(&value.as_str()) {
                return Some(format!("Valor inválido para {column} ({value})"));
            }
        }
        let nivel = nivel(row);
        if !NIVELES.contains(&nivel.as_str()) {
            return Some(format!("Valor inválido para nivel_agregacion ({nivel})"));
        }
        match parse_number(cell(row, &["demanda_gbtud"])) {
            Some(v) if v < 0.0 => Some("Demanda negativa".to_string()),
            _ => None,
        }
    }

    fn transform_row(&self, row: &Row, source_id: &str) -> Option<Result<NormalizedRecord, String>> {
        Some(self.build(row, source_id))
    }
}
