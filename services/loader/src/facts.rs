//! Fact table declarations: which dimensions a table references, which of
//! them a row cannot do without, which record fields become columns, and the
//! unique key the upsert conflicts on.

use std::collections::{BTreeMap, HashSet};

use crate::record::DimensionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionRef {
    pub kind: DimensionKind,
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactColumn {
    pub column: String,
    /// Field of `NormalizedRecord::data` the value is read from.
    pub field: String,
    pub numeric: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactTableSpec {
    pub name: String,
    pub dimensions: Vec<DimensionRef>,
    pub columns: Vec<FactColumn>,
    pub unique_key: Vec<String>,
}

impl FactTableSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dimensions: Vec::new(),
            columns: Vec::new(),
            unique_key: Vec::new(),
        }
    }

    pub fn dimension(mut self, kind: DimensionKind, mandatory: bool) -> Self {
        self.dimensions.push(DimensionRef { kind, mandatory });
        self
    }

    pub fn column(self, column: &str) -> Self {
        self.mapped(column, column, false)
    }

    pub fn numeric(self, column: &str) -> Self {
        self.mapped(column, column, true)
    }

    pub fn mapped(mut self, column: &str, field: &str, numeric: bool) -> Self {
        self.columns.push(FactColumn {
            column: column.to_string(),
            field: field.to_string(),
            numeric,
        });
        self
    }

    pub fn unique_key(mut self, columns: &[&str]) -> Self {
        self.unique_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn is_mandatory(&self, kind: DimensionKind) -> bool {
        self.dimensions
            .iter()
            .any(|d| d.kind == kind && d.mandatory)
    }

    /// Every column a prepared row carries, FKs first, then `source_id`.
    pub fn row_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .dimensions
            .iter()
            .map(|d| d.kind.fk_column().to_string())
            .collect();
        out.push("source_id".to_string());
        out.extend(self.columns.iter().map(|c| c.column.clone()));
        out
    }

    /// A unique key column must be a column the table actually fills.
    pub fn check(&self) -> Result<(), String> {
        if self.unique_key.is_empty() {
            return Err(format!("{} declares no unique key", self.name));
        }
        let known: HashSet<String> = self.row_columns().into_iter().collect();
        let unknown: Vec<&str> = self
            .unique_key
            .iter()
            .filter(|k| !known.contains(*k))
            .map(String::as_str)
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "{} unique key references unknown columns: {}",
                self.name,
                unknown.join(", ")
            ))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FactCatalog {
    tables: BTreeMap<String, FactTableSpec>,
}

impl FactCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(regalias());
        catalog.register(oferta_gas());
        catalog.register(demanda_gas());
        catalog
    }

    pub fn register(&mut self, spec: FactTableSpec) {
        self.tables.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&FactTableSpec> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &FactTableSpec> {
        self.tables.values()
    }
}

fn regalias() -> FactTableSpec {
    FactTableSpec::new("fact_regalias")
        .dimension(DimensionKind::Tiempo, true)
        .dimension(DimensionKind::Campo, true)
        .column("tipo_produccion")
        .column("tipo_hidrocarburo")
        .numeric("precio_usd")
        .numeric("porcentaje_regalia")
        .numeric("produccion_gravable")
        .numeric("volumen_regalia")
        .column("unidad")
        .numeric("valor_regalias_cop")
        .unique_key(&["tiempo_id", "campo_id", "tipo_hidrocarburo"])
}

fn oferta_gas() -> FactTableSpec {
    FactTableSpec::new("fact_oferta_gas")
        .dimension(DimensionKind::Tiempo, true)
        .dimension(DimensionKind::Campo, true)
        .dimension(DimensionKind::Resolucion, true)
        .column("operador")
        .column("tipo_produccion")
        .column("es_participacion_estado")
        .column("es_operador_campo")
        .numeric("valor_gbtud")
        .numeric("poder_calorifico_btu_pc")
        .unique_key(&[
            "tiempo_id",
            "campo_id",
            "resolucion_id",
            "tipo_produccion",
            "operador",
        ])
}

fn demanda_gas() -> FactTableSpec {
    FactTableSpec::new("fact_demanda_gas")
        .dimension(DimensionKind::Tiempo, true)
        .column("escenario")
        .column("sector")
        .column("region")
        .column("segmento")
        .column("nivel_agregacion")
        .numeric("valor_demanda_gbtud")
        .unique_key(&[
            "tiempo_id",
            "escenario",
            "sector",
            "region",
            "segmento",
            "nivel_agregacion",
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tables_are_consistent() {
        let catalog = FactCatalog::builtin();
        let names: Vec<&str> = catalog.tables().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["fact_demanda_gas", "fact_oferta_gas", "fact_regalias"]);
        for table in catalog.tables() {
            assert_eq!(table.check(), Ok(()), "{}", table.name);
        }
    }

    #[test]
    fn test_regalias_key_and_mandatory_dims() {
        let spec = FactCatalog::builtin().get("fact_regalias").cloned().unwrap();
        assert_eq!(spec.unique_key, vec!["tiempo_id", "campo_id", "tipo_hidrocarburo"]);
        assert!(spec.is_mandatory(DimensionKind::Tiempo));
        assert!(spec.is_mandatory(DimensionKind::Campo));
        assert!(!spec.is_mandatory(DimensionKind::Territorio));
    }

    #[test]
    fn test_check_flags_unknown_key_column() {
        let spec = FactTableSpec::new("fact_x")
            .dimension(DimensionKind::Tiempo, true)
            .unique_key(&["tiempo_id", "sector"]);
        assert_eq!(
            spec.check(),
            Err("fact_x unique key references unknown columns: sector".to_string())
        );
    }

    #[test]
    fn test_row_columns_order() {
        let spec = FactTableSpec::new("fact_x")
            .dimension(DimensionKind::Tiempo, true)
            .numeric("valor");
        assert_eq!(spec.row_columns(), vec!["tiempo_id", "source_id", "valor"]);
    }
}
