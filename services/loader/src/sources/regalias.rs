//! ANH royalties by field (Socrata export). Fully declarative.

use serde_json::Value;

use crate::config::{
    ColumnDerivation, ColumnSource, ColumnValidation, DimensionMapping, FactTableMapping,
    TransformationConfig, ValidationRule,
};
use crate::record::DimensionKind;
use crate::sources::SourceTransformer;
use crate::table::DataPath;
use crate::value::{parse_int, Row, NULL};

pub const SOURCE_ID: &str = "api_regalias";

/// First day of the month named by `a_o` and `mes`.
fn derive_tiempo_fecha(row: &Row) -> Result<Value, String> {
    let year = parse_int(row.get("a_o").unwrap_or(&NULL)).ok_or("año ilegible")?;
    let month = parse_int(row.get("mes").unwrap_or(&NULL)).ok_or("mes ilegible")?;
    let date = i32::try_from(year)
        .ok()
        .zip(u32::try_from(month).ok())
        .and_then(|(y, m)| chrono::NaiveDate::from_ymd_opt(y, m, 1))
        .ok_or_else(|| format!("fecha inválida {year}-{month}"))?;
    Ok(Value::String(date.to_string()))
}

pub fn config() -> TransformationConfig {
    let col = ColumnSource::column;
    let fact = FactTableMapping::new("fact_regalias")
        .field("tiempo_fecha", col("tiempo_fecha"))
        .field("campo_nombre", col("campo"))
        .field("departamento", col("departamento"))
        .field("municipio", col("municipio"))
        .field("latitud", ColumnSource::optional("latitud"))
        .field("longitud", ColumnSource::optional("longitud"))
        .field("contrato", col("contrato"))
        .field("tipo_produccion", col("tipoprod"))
        .field("tipo_hidrocarburo", col("tipohidrocarburo"))
        .field("precio_usd", col("preciohidrocarburousd"))
        .field("porcentaje_regalia", col("porcregalia"))
        .field("produccion_gravable", col("prodgravableblskpc"))
        .field("volumen_regalia", col("volumenregaliablskpc"))
        .field("valor_regalias_cop", col("regaliascop"))
        .field("unidad", ColumnSource::literal("Bls/Kpc"))
        .dimension(
            DimensionMapping::new(DimensionKind::Tiempo)
                .field("fecha", col("tiempo_fecha"))
                .field("anio", col("a_o"))
                .field("mes", col("mes"))
                .field("es_proyeccion", false),
        )
        .dimension(
            DimensionMapping::new(DimensionKind::Territorio)
                .field("departamento", col("departamento"))
                .field("municipio", col("municipio"))
                .field("latitud", ColumnSource::optional("latitud"))
                .field("longitud", ColumnSource::optional("longitud")),
        )
        .dimension(
            DimensionMapping::new(DimensionKind::Campo)
                .field("nombre_campo", col("campo"))
                .field("contrato", col("contrato"))
                .field("activo", true),
        );

    TransformationConfig::new(SOURCE_ID, fact)
        .describe("ANH - Consolidación de regalías por campo (Socrata)")
        .data_path(DataPath::Field("data".to_string()))
        .validate(ColumnValidation::new(
            "mes",
            ValidationRule::Range { min: 1.0, max: 12.0 },
            "Mes fuera de rango (1-12)",
        ))
        .validate(ColumnValidation::new(
            "tipohidrocarburo",
            ValidationRule::Enum(vec!["G".to_string(), "O".to_string()]),
            "Tipo hidrocarburo inválido",
        ))
        .validate(ColumnValidation::new(
            "preciohidrocarburousd",
            ValidationRule::NonNegative,
            "Precio negativo",
        ))
        .validate(ColumnValidation::new(
            "porcregalia",
            ValidationRule::Percentage,
            "Porcentaje regalía fuera de rango",
        ))
        .derive(
            ColumnDerivation::new("tiempo_fecha", &["a_o", "mes"], derive_tiempo_fecha)
                .describe("Derivar fecha primer día del mes"),
        )
}

pub struct RegaliasTransformer {
    config: TransformationConfig,
}

impl RegaliasTransformer {
    pub fn new() -> Self {
        Self { config: config() }
    }
}

impl Default for RegaliasTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceTransformer for RegaliasTransformer {
    fn config(&self) -> &TransformationConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EtlError;
    use crate::mapping::map_source_rows;
    use crate::table::Table;
    use crate::validate::validate_and_derive;
    use serde_json::json;

    fn socrata_payload() -> Value {
        json!({"data": [
            {
                "a_o": "2024", "mes": "1", "departamento": "META", "municipio": "PUERTO GAITÁN",
                "campo": "RUBIALES", "contrato": "RUBIALES", "tipoprod": "Crudo",
                "tipohidrocarburo": "O", "preciohidrocarburousd": "63,13", "porcregalia": "20",
                "prodgravableblskpc": "1000", "volumenregaliablskpc": "200",
                "regaliascop": "549279642,9", "latitud": "3.9", "longitud": "-71.5"
            },
            {
                "a_o": "2024", "mes": "13", "departamento": "META", "municipio": "ACACÍAS",
                "campo": "CHICHIMENE", "contrato": "CPO", "tipoprod": "Crudo",
                "tipohidrocarburo": "O", "preciohidrocarburousd": "70", "porcregalia": "8",
                "prodgravableblskpc": "10", "volumenregaliablskpc": "1",
                "regaliascop": "10", "latitud": "4", "longitud": "-73"
            }
        ]})
    }

    #[test]
    fn test_derive_tiempo_fecha() {
        let row = json!({"a_o": "2024", "mes": "3"}).as_object().unwrap().clone();
        assert_eq!(derive_tiempo_fecha(&row), Ok(json!("2024-03-01")));
        let row = json!({"a_o": "2024", "mes": "13"}).as_object().unwrap().clone();
        assert!(derive_tiempo_fecha(&row).is_err());
        let row = json!({"mes": "1"}).as_object().unwrap().clone();
        assert!(derive_tiempo_fecha(&row).is_err());
    }

    #[test]
    fn test_batch_without_campo_is_structural() {
        let mut payload = socrata_payload();
        for row in payload["data"].as_array_mut().unwrap() {
            row.as_object_mut().unwrap().remove("campo");
        }
        let source = RegaliasTransformer::new();
        let table = Table::from_json(&payload, &source.config().data_path).unwrap();
        match validate_and_derive(table, source.config()) {
            Err(EtlError::Structural { missing, .. }) => assert_eq!(missing, vec!["campo"]),
            other => panic!("expected structural error, got {other:?}"),
        }
    }

    #[test]
    fn test_coordinates_are_optional() {
        let mut payload = socrata_payload();
        for row in payload["data"].as_array_mut().unwrap() {
            let row = row.as_object_mut().unwrap();
            row.remove("latitud");
            row.remove("longitud");
        }
        let source = RegaliasTransformer::new();
        let table = Table::from_json(&payload, &source.config().data_path).unwrap();
        let outcome = validate_and_derive(table, source.config()).unwrap();
        let mapped = map_source_rows(&outcome.valid, &source);
        let record = &mapped.records[0];
        assert_eq!(record.data["latitud"], Value::Null);
        assert_eq!(
            record.dimension_field(DimensionKind::Territorio, "longitud"),
            &Value::Null
        );
    }

    #[test]
    fn test_socrata_batch_end_to_end() {
        let source = RegaliasTransformer::new();
        let table = Table::from_json(&socrata_payload(), &source.config().data_path).unwrap();
        let outcome = validate_and_derive(table, source.config()).unwrap();
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.invalid.len(), 1);
        assert_eq!(outcome.invalid[0].record_index, 1);

        let mapped = map_source_rows(&outcome.valid, &source);
        assert!(mapped.errors.is_empty());
        let record = &mapped.records[0];
        assert_eq!(record.fact_table, "fact_regalias");
        assert_eq!(record.data["unidad"], "Bls/Kpc");
        assert_eq!(record.data["tiempo_fecha"], "2024-01-01");
        assert_eq!(record.data["precio_usd"], "63,13");
        assert_eq!(
            record.dimension_field(DimensionKind::Campo, "nombre_campo"),
            &json!("RUBIALES")
        );
        assert_eq!(
            record.dimension_field(DimensionKind::Tiempo, "es_proyeccion"),
            &json!(false)
        );
        assert_eq!(
            record.dimension_field(DimensionKind::Territorio, "municipio"),
            &json!("PUERTO GAITÁN")
        );
        assert_eq!(
            record.dimension_field(DimensionKind::Territorio, "latitud"),
            &json!("3.9")
        );
    }
}
