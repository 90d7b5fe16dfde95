//! Mapping engine: validated rows to [`NormalizedRecord`]s.

use serde_json::Value;
use tracing::debug;

use crate::config::{BoundSource, ColumnMapping, FactTableMapping, TransformationConfig};
use crate::record::{DimensionKind, NormalizedRecord};
use crate::sources::SourceTransformer;
use crate::table::Table;
use crate::validate::RowError;
use crate::value::{sanitize, Row};

/// A fact mapping with every column-or-literal entry resolved for one batch.
struct BoundMapping {
    fact_table: String,
    data: Vec<(String, BoundSource)>,
    dimensions: Vec<(DimensionKind, Vec<(String, BoundSource)>)>,
}

impl BoundMapping {
    fn bind(mapping: &FactTableMapping, table: &Table) -> Self {
        let bind_all = |columns: &ColumnMapping| {
            columns
                .iter()
                .map(|(dest, source)| (dest.clone(), source.bind(table)))
                .collect::<Vec<_>>()
        };
        Self {
            fact_table: mapping.fact_table.clone(),
            data: bind_all(&mapping.column_mapping),
            dimensions: mapping
                .dimension_mappings
                .iter()
                .map(|d| (d.dimension, bind_all(&d.column_mapping)))
                .collect(),
        }
    }

    fn apply(&self, row: &Row) -> NormalizedRecord {
        let project = |columns: &[(String, BoundSource)]| -> Row {
            columns
                .iter()
                .map(|(dest, source)| (dest.clone(), sanitize(source.value(row).clone())))
                .collect()
        };
        NormalizedRecord {
            fact_table: self.fact_table.clone(),
            data: project(&self.data),
            dimensions: self
                .dimensions
                .iter()
                .map(|(kind, columns)| (*kind, project(columns)))
                .collect(),
        }
    }
}

/// Declarative mapping of every row in the batch.
pub fn map_to_records(table: &Table, config: &TransformationConfig) -> Vec<NormalizedRecord> {
    let bound = BoundMapping::bind(&config.fact_mapping, table);
    table.rows().iter().map(|row| bound.apply(row)).collect()
}

#[derive(Debug, Clone, Default)]
pub struct MappingOutcome {
    pub records: Vec<NormalizedRecord>,
    pub errors: Vec<RowError>,
}

/// Map a batch through a source: custom validator first, then the custom
/// transformer when the source has one, else the declarative mapping.
pub fn map_source_rows(table: &Table, source: &dyn SourceTransformer) -> MappingOutcome {
    let source_id = source.source_id();
    let bound = BoundMapping::bind(&source.config().fact_mapping, table);
    let mut outcome = MappingOutcome::default();

    for (position, row) in table.indexed_rows() {
        if let Some(message) = source.validate_row(row) {
            debug!(source_id, record_index = position, %message, "row rejected by source validator");
            outcome.errors.push(RowError {
                record_index: position,
                error: message,
                raw_record: row.clone(),
            });
            continue;
        }
        match source.transform_row(row, source_id) {
            Some(Ok(record)) => outcome.records.push(record.sanitize()),
            Some(Err(reason)) => outcome.errors.push(RowError {
                record_index: position,
                error: format!("transform error ({reason})"),
                raw_record: row.clone(),
            }),
            None => outcome.records.push(bound.apply(row)),
        }
    }
    outcome
}

/// Shorthand for custom transformers building dimension rows.
pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), sanitize(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnSource, DimensionMapping};
    use crate::table::DataPath;
    use crate::value::{parse_number, sanitize_f64};
    use serde_json::json;

    fn regalias_like() -> TransformationConfig {
        TransformationConfig::new(
            "demo",
            FactTableMapping::new("fact_regalias")
                .field("campo_nombre", "campo")
                .field("valor", "regaliascop")
                .field("unidad", "Bls/Kpc")
                .dimension(
                    DimensionMapping::new(DimensionKind::Tiempo)
                        .field("fecha", "tiempo_fecha")
                        .field("es_proyeccion", false),
                )
                .dimension(
                    DimensionMapping::new(DimensionKind::Campo)
                        .field("nombre_campo", "campo")
                        .field("activo", true),
                ),
        )
    }

    fn table(payload: Value) -> Table {
        Table::from_json(&payload, &DataPath::Root).unwrap()
    }

    // -------------------------------------------------------------------------
    // Declarative mapping
    // -------------------------------------------------------------------------

    #[test]
    fn test_literal_used_when_no_such_column() {
        let input = table(json!([
            {"campo": "RUBIALES", "regaliascop": "10", "tiempo_fecha": "2024-01-01"},
            {"campo": "CASTILLA", "regaliascop": "20", "tiempo_fecha": "2024-02-01"}
        ]));
        let records = map_to_records(&input, &regalias_like());
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.data["unidad"], "Bls/Kpc");
            assert_eq!(record.fact_table, "fact_regalias");
        }
        assert_eq!(records[1].data["campo_nombre"], "CASTILLA");
    }

    #[test]
    fn test_dimension_mappings_resolve_independently() {
        let input = table(json!([{"campo": "RUBIALES", "tiempo_fecha": "2024-01-01"}]));
        let record = &map_to_records(&input, &regalias_like())[0];
        assert_eq!(
            record.dimension_field(DimensionKind::Tiempo, "fecha"),
            &json!("2024-01-01")
        );
        assert_eq!(
            record.dimension_field(DimensionKind::Tiempo, "es_proyeccion"),
            &json!(false)
        );
        assert_eq!(
            record.dimension_field(DimensionKind::Campo, "nombre_campo"),
            &json!("RUBIALES")
        );
        // regaliascop is absent from this batch, so the entry is a literal
        assert_eq!(record.data["valor"], "regaliascop");
    }

    #[test]
    fn test_explicit_column_never_becomes_literal() {
        let config = TransformationConfig::new(
            "demo",
            FactTableMapping::new("fact_demo").field("valor", ColumnSource::column("valor_x")),
        );
        let input = table(json!([{"otro": 1}]));
        let record = &map_to_records(&input, &config)[0];
        assert_eq!(record.data["valor"], Value::Null);
    }

    // -------------------------------------------------------------------------
    // Source hooks
    // -------------------------------------------------------------------------

    struct Hooked {
        config: TransformationConfig,
    }

    impl SourceTransformer for Hooked {
        fn config(&self) -> &TransformationConfig {
            &self.config
        }

        fn validate_row(&self, row: &Row) -> Option<String> {
            (row.get("campo") == Some(&json!("MALO"))).then(|| "Campo vacío".to_string())
        }

        fn transform_row(
            &self,
            row: &Row,
            source_id: &str,
        ) -> Option<Result<NormalizedRecord, String>> {
            if row.get("campo") == Some(&json!("ROTO")) {
                return Some(Err("sin datos".to_string()));
            }
            // a zero day count yields an infinite rate
            let produccion = parse_number(row.get("produccion")?)?;
            let dias = parse_number(row.get("dias")?)?;
            Some(Ok(NormalizedRecord::new("fact_custom")
                .with_data("origen", source_id)
                .with_data("ratio", sanitize_f64(produccion / dias))))
        }
    }

    #[test]
    fn test_custom_validator_then_transformer() {
        let source = Hooked {
            config: regalias_like(),
        };
        let input = table(json!([
            {"campo": "MALO"},
            {"campo": "BUENO", "produccion": "10", "dias": "0"},
            {"campo": "ROTO"},
            {"campo": "CASTILLA", "produccion": "10", "dias": "4"}
        ]));
        let outcome = map_source_rows(&input, &source);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].fact_table, "fact_custom");
        assert_eq!(outcome.records[0].data["origen"], "demo");
        assert_eq!(outcome.records[0].data["ratio"], Value::Null);
        assert_eq!(outcome.records[1].data["ratio"], json!(2.5));

        let errors: Vec<(usize, &str)> = outcome
            .errors
            .iter()
            .map(|e| (e.record_index, e.error.as_str()))
            .collect();
        assert_eq!(errors, vec![(0, "Campo vacío"), (2, "transform error (sin datos)")]);
    }

    struct Declarative {
        config: TransformationConfig,
    }

    impl SourceTransformer for Declarative {
        fn config(&self) -> &TransformationConfig {
            &self.config
        }
    }

    #[test]
    fn test_falls_back_to_declarative_mapping() {
        let source = Declarative {
            config: regalias_like(),
        };
        let input = table(json!([{"campo": "RUBIALES", "regaliascop": "5"}]));
        let outcome = map_source_rows(&input, &source);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.records[0].data["unidad"], "Bls/Kpc");
        assert_eq!(outcome.records[0].data["valor"], "5");
    }
}
