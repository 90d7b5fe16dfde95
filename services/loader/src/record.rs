//! The record contract shared by the mapping engine and the fact loader.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::{sanitize_row, Row, NULL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionKind {
    Tiempo,
    Territorio,
    Campo,
    Resolucion,
}

impl DimensionKind {
    pub const ALL: [DimensionKind; 4] = [
        DimensionKind::Tiempo,
        DimensionKind::Territorio,
        DimensionKind::Campo,
        DimensionKind::Resolucion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::Tiempo => "tiempo",
            DimensionKind::Territorio => "territorio",
            DimensionKind::Campo => "campo",
            DimensionKind::Resolucion => "resolucion",
        }
    }

    /// Foreign key column this dimension fills on a fact row.
    pub fn fk_column(&self) -> &'static str {
        match self {
            DimensionKind::Tiempo => "tiempo_id",
            DimensionKind::Territorio => "territorio_id",
            DimensionKind::Campo => "campo_id",
            DimensionKind::Resolucion => "resolucion_id",
        }
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{fact_table, data, dimensions}`: one fact-to-be plus the natural keys of
/// the dimensions it references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub fact_table: String,
    pub data: Row,
    pub dimensions: BTreeMap<DimensionKind, Row>,
}

impl NormalizedRecord {
    pub fn new(fact_table: &str) -> Self {
        Self {
            fact_table: fact_table.to_string(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_dimension(mut self, kind: DimensionKind, fields: Row) -> Self {
        self.dimensions.insert(kind, fields);
        self
    }

    pub fn dimension(&self, kind: DimensionKind) -> Option<&Row> {
        self.dimensions.get(&kind)
    }

    /// A field of a dimension, null when the dimension or field is absent.
    pub fn dimension_field(&self, kind: DimensionKind, field: &str) -> &Value {
        self.dimensions
            .get(&kind)
            .and_then(|row| row.get(field))
            .unwrap_or(&NULL)
    }

    /// Replace every non-finite number in data and dimensions with null.
    pub fn sanitize(self) -> Self {
        Self {
            fact_table: self.fact_table,
            data: sanitize_row(self.data),
            dimensions: self
                .dimensions
                .into_iter()
                .map(|(kind, row)| (kind, sanitize_row(row)))
                .collect(),
        }
    }
}
