//! MinMinas gas production declarations.
//!
//! Rows come from the declaration workbook parser, one per
//! (field, operator, production type, month). Mapping is custom because a
//! row feeds three dimensions, including the resolution it was declared under.

use chrono::NaiveDate;
use serde_json::{json, Value};

use crate::config::{
    ColumnValidation, FactTableMapping, TransformationConfig, ValidationRule,
};
use crate::mapping::fields;
use crate::record::{DimensionKind, NormalizedRecord};
use crate::sources::SourceTransformer;
use crate::table::DataPath;
use crate::value::{as_text, parse_bool, parse_int, parse_number, sanitize_f64, Row, NULL};

pub const SOURCE_ID: &str = "minminas_oferta";

pub const TIPOS_PRODUCCION: [&str; 8] = [
    "PTDV",
    "PC_CONTRATOS",
    "PC_EXPORTACIONES",
    "PC_REF_BARRANCA",
    "PC_REF_CARTAGENA",
    "PP",
    "GAS_OPERACION",
    "CIDV",
];

pub fn config() -> TransformationConfig {
    TransformationConfig::new(SOURCE_ID, FactTableMapping::new("fact_oferta_gas"))
        .describe("MinMinas - Declaración de producción de gas natural")
        .data_path(DataPath::Root)
        .validate(ColumnValidation::new(
            "mes",
            ValidationRule::Range { min: 1.0, max: 12.0 },
            "Mes fuera de rango (1-12)",
        ))
        .validate(ColumnValidation::new(
            "anio",
            ValidationRule::Range {
                min: 1900.0,
                max: 2100.0,
            },
            "Año fuera de rango (1900-2100)",
        ))
        .validate(ColumnValidation::new(
            "valor_gbtud",
            ValidationRule::NonNegative,
            "Valor GBTUD negativo",
        ))
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn text(row: &Row, key: &str) -> Value {
    as_text(row.get(key).unwrap_or(&NULL))
        .map(Value::String)
        .unwrap_or(Value::Null)
}

pub struct OfertaGasTransformer {
    config: TransformationConfig,
}

impl OfertaGasTransformer {
    pub fn new() -> Self {
        Self { config: config() }
    }

    fn build(&self, row: &Row, source_id: &str) -> Result<NormalizedRecord, String> {
        let get = |key: &str| row.get(key).unwrap_or(&NULL);

        let anio = parse_int(get("anio")).ok_or("año ilegible")?;
        let mes = parse_int(get("mes")).ok_or("mes ilegible")?;
        let fecha = i32::try_from(anio)
            .ok()
            .zip(u32::try_from(mes).ok())
            .and_then(|(y, m)| NaiveDate::from_ymd_opt(y, m, 1))
            .ok_or_else(|| format!("fecha inválida {anio}-{mes}"))?;
        let valor = parse_number(get("valor_gbtud")).ok_or("valor_gbtud ilegible")?;
        let poder_calorifico = parse_number(get("poder_calorifico_btu_pc"))
            .filter(|v| *v != 0.0)
            .map(|v| sanitize_f64(round6(v)))
            .unwrap_or(Value::Null);
        let es_estado = parse_bool(get("es_participacion_estado")).unwrap_or(false);
        let tipo = as_text(get("tipo_produccion"))
            .map(|t| t.to_uppercase())
            .unwrap_or_default();
        let fecha_text = fecha.to_string();

        Ok(NormalizedRecord::new("fact_oferta_gas")
            .with_data("tiempo_fecha", fecha_text.clone())
            .with_data("campo_nombre", text(row, "campo"))
            .with_data("operador", text(row, "operador"))
            .with_data("tipo_produccion", tipo)
            .with_data("es_participacion_estado", es_estado)
            .with_data("es_operador_campo", !es_estado)
            .with_data("valor_gbtud", sanitize_f64(round6(valor)))
            .with_data("poder_calorifico_btu_pc", poder_calorifico)
            .with_data("resolucion_numero", text(row, "resolucion"))
            .with_data("source_id", source_id)
            .with_dimension(
                DimensionKind::Tiempo,
                fields([
                    ("fecha", json!(fecha_text)),
                    ("anio", json!(anio)),
                    ("mes", json!(mes)),
                    ("es_proyeccion", json!(false)),
                ]),
            )
            .with_dimension(
                DimensionKind::Campo,
                fields([("nombre_campo", text(row, "campo")), ("activo", json!(true))]),
            )
            .with_dimension(
                DimensionKind::Resolucion,
                fields([
                    ("numero_resolucion", text(row, "resolucion")),
                    ("periodo_desde", text(row, "periodo_desde")),
                    ("periodo_hasta", text(row, "periodo_hasta")),
                    ("url_pdf", text(row, "url_pdf")),
                    ("url_soporte_magnetico", text(row, "url_soporte_magnetico")),
                    ("titulo", text(row, "titulo_resolucion")),
                ]),
            ))
    }
}

impl Default for OfertaGasTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceTransformer for OfertaGasTransformer {
    fn config(&self) -> &TransformationConfig {
        &self.config
    }

    fn validate_row(&self, row: &Row) -> Option<String> {
        for key in ["campo", "operador", "resolucion"] {
            if as_text(row.get(key).unwrap_or(&NULL)).is_none() {
                return Some(format!("Columna obligatoria vacía ({key})"));
            }
        }
        let tipo = as_text(row.get("tipo_produccion").unwrap_or(&NULL))
            .map(|t| t.to_uppercase())
            .unwrap_or_default();
        if !TIPOS_PRODUCCION.contains(&tipo.as_str()) {
            return Some(format!("Tipo de producción inválido ({tipo})"));
        }
        None
    }

    fn transform_row(&self, row: &Row, source_id: &str) -> Option<Result<NormalizedRecord, String>> {
        Some(self.build(row, source_id))
    }
}
