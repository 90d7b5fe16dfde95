//! Declarative transformation configuration: validation rules, derivations
//! and the fact/dimension column mappings for one source.

use std::collections::HashSet;

use serde_json::Value;

use crate::record::DimensionKind;
use crate::table::{DataPath, Table};
use crate::value::{is_blank, key_text, parse_date, parse_number, Row, NULL};

// -----------------------------------------------------------------------------
// Validation
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationRule {
    NotNull,
    Range { min: f64, max: f64 },
    Enum(Vec<String>),
    Positive,
    NonNegative,
    /// Value in `[0, 100]`.
    Percentage,
    DateValid,
}

impl ValidationRule {
    /// Verdict for a single cell. `true` means the cell breaks the rule.
    pub fn rejects(&self, value: &Value) -> bool {
        match self {
            ValidationRule::NotNull => is_blank(value),
            ValidationRule::Range { min, max } => match parse_number(value) {
                Some(n) => n < *min || n > *max,
                None => true,
            },
            ValidationRule::Enum(allowed) => {
                is_blank(value) || !allowed.iter().any(|a| *a == key_text(value))
            }
            ValidationRule::Positive => !parse_number(value).is_some_and(|n| n > 0.0),
            ValidationRule::NonNegative => optional_number_rejected(value, |n| n >= 0.0),
            ValidationRule::Percentage => {
                optional_number_rejected(value, |n| (0.0..=100.0).contains(&n))
            }
            ValidationRule::DateValid => parse_date(value).is_none(),
        }
    }

    /// Invalid mask over a whole column. Each entry depends only on its own cell.
    pub fn invalid_mask<'a>(&self, column: impl Iterator<Item = &'a Value>) -> Vec<bool> {
        match self {
            ValidationRule::Enum(allowed) => {
                let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
                column
                    .map(|v| is_blank(v) || !allowed.contains(key_text(v).as_str()))
                    .collect()
            }
            rule => column.map(|v| rule.rejects(v)).collect(),
        }
    }
}

/// Nulls pass; anything present must be numeric and satisfy `ok`.
fn optional_number_rejected(value: &Value, ok: impl Fn(f64) -> bool) -> bool {
    if is_blank(value) {
        return false;
    }
    match parse_number(value) {
        Some(n) => !ok(n),
        None => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValidation {
    pub column: String,
    pub rule: ValidationRule,
    pub error_message: String,
}

impl ColumnValidation {
    pub fn new(column: &str, rule: ValidationRule, error_message: &str) -> Self {
        Self {
            column: column.to_string(),
            rule,
            error_message: error_message.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// Derivation
// -----------------------------------------------------------------------------

/// A pure function of one row. `Err` carries the reason the row could not be derived.
pub type DeriveFn = fn(&Row) -> Result<Value, String>;

#[derive(Debug, Clone)]
pub struct ColumnDerivation {
    pub target_column: String,
    pub source_columns: Vec<String>,
    pub function: DeriveFn,
    pub description: String,
}

impl ColumnDerivation {
    pub fn new(target_column: &str, source_columns: &[&str], function: DeriveFn) -> Self {
        Self {
            target_column: target_column.to_string(),
            source_columns: source_columns.iter().map(|c| c.to_string()).collect(),
            function,
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

// -----------------------------------------------------------------------------
// Mapping
// -----------------------------------------------------------------------------

/// Where a destination value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSource {
    /// Always read from this source column; the batch must have it.
    Column(String),
    /// Read from this source column, null when the batch lacks it.
    OptionalColumn(String),
    /// Always this constant.
    Literal(Value),
    /// Read the column when the batch has it, otherwise use the text as a constant.
    ColumnOrLiteral(String),
}

impl ColumnSource {
    pub fn column(name: &str) -> Self {
        ColumnSource::Column(name.to_string())
    }

    pub fn optional(name: &str) -> Self {
        ColumnSource::OptionalColumn(name.to_string())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ColumnSource::Literal(value.into())
    }

    /// Resolve against a batch once instead of per row.
    pub fn bind(&self, table: &Table) -> BoundSource {
        match self {
            ColumnSource::Column(name) | ColumnSource::OptionalColumn(name) => {
                BoundSource::Column(name.clone())
            }
            ColumnSource::Literal(value) => BoundSource::Literal(value.clone()),
            ColumnSource::ColumnOrLiteral(name) if table.has_column(name) => {
                BoundSource::Column(name.clone())
            }
            ColumnSource::ColumnOrLiteral(text) => BoundSource::Literal(Value::String(text.clone())),
        }
    }

    /// Source column this entry reads, when it can only be a column.
    pub fn required_column(&self) -> Option<&str> {
        match self {
            ColumnSource::Column(name) => Some(name),
            _ => None,
        }
    }
}

impl From<&str> for ColumnSource {
    fn from(value: &str) -> Self {
        ColumnSource::ColumnOrLiteral(value.to_string())
    }
}

impl From<bool> for ColumnSource {
    fn from(value: bool) -> Self {
        ColumnSource::Literal(Value::Bool(value))
    }
}

impl From<i64> for ColumnSource {
    fn from(value: i64) -> Self {
        ColumnSource::Literal(Value::from(value))
    }
}

impl From<f64> for ColumnSource {
    fn from(value: f64) -> Self {
        ColumnSource::Literal(Value::from(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoundSource {
    Column(String),
    Literal(Value),
}

impl BoundSource {
    pub fn value<'a>(&'a self, row: &'a Row) -> &'a Value {
        match self {
            BoundSource::Column(name) => row.get(name).unwrap_or(&NULL),
            BoundSource::Literal(value) => value,
        }
    }
}

/// Ordered destination-column to source pairs.
pub type ColumnMapping = Vec<(String, ColumnSource)>;

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionMapping {
    pub dimension: DimensionKind,
    pub column_mapping: ColumnMapping,
}

impl DimensionMapping {
    pub fn new(dimension: DimensionKind) -> Self {
        Self {
            dimension,
            column_mapping: Vec::new(),
        }
    }

    pub fn field(mut self, destination: &str, source: impl Into<ColumnSource>) -> Self {
        self.column_mapping
            .push((destination.to_string(), source.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactTableMapping {
    pub fact_table: String,
    pub column_mapping: ColumnMapping,
    pub dimension_mappings: Vec<DimensionMapping>,
}

impl FactTableMapping {
    pub fn new(fact_table: &str) -> Self {
        Self {
            fact_table: fact_table.to_string(),
            column_mapping: Vec::new(),
            dimension_mappings: Vec::new(),
        }
    }

    pub fn field(mut self, destination: &str, source: impl Into<ColumnSource>) -> Self {
        self.column_mapping
            .push((destination.to_string(), source.into()));
        self
    }

    pub fn dimension(mut self, mapping: DimensionMapping) -> Self {
        self.dimension_mappings.push(mapping);
        self
    }
}

// -----------------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransformationConfig {
    pub source_id: String,
    pub description: String,
    pub data_path: DataPath,
    pub column_validations: Vec<ColumnValidation>,
    pub column_derivations: Vec<ColumnDerivation>,
    pub fact_mapping: FactTableMapping,
}

impl TransformationConfig {
    pub fn new(source_id: &str, fact_mapping: FactTableMapping) -> Self {
        Self {
            source_id: source_id.to_string(),
            description: String::new(),
            data_path: DataPath::default(),
            column_validations: Vec::new(),
            column_derivations: Vec::new(),
            fact_mapping,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn data_path(mut self, data_path: DataPath) -> Self {
        self.data_path = data_path;
        self
    }

    pub fn validate(mut self, validation: ColumnValidation) -> Self {
        self.column_validations.push(validation);
        self
    }

    pub fn derive(mut self, derivation: ColumnDerivation) -> Self {
        self.column_derivations.push(derivation);
        self
    }

    /// Columns the raw batch must contain: validated columns, derivation inputs
    /// and explicit column references, minus anything a derivation produces.
    pub fn required_columns(&self) -> Vec<String> {
        fn push(required: &mut Vec<String>, name: &str) {
            if !required.iter().any(|r| r == name) {
                required.push(name.to_string());
            }
        }

        let mut required: Vec<String> = Vec::new();
        let mut produced: HashSet<&str> = HashSet::new();
        for validation in &self.column_validations {
            push(&mut required, &validation.column);
        }
        for derivation in &self.column_derivations {
            for column in &derivation.source_columns {
                if !produced.contains(column.as_str()) {
                    push(&mut required, column);
                }
            }
            produced.insert(derivation.target_column.as_str());
        }
        let mapped = self.fact_mapping.column_mapping.iter().chain(
            self.fact_mapping
                .dimension_mappings
                .iter()
                .flat_map(|d| d.column_mapping.iter()),
        );
        for (_, source) in mapped {
            if let Some(column) = source.required_column() {
                if !produced.contains(column) {
                    push(&mut required, column);
                }
            }
        }
        required
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mask(rule: ValidationRule, cells: &[Value]) -> Vec<bool> {
        rule.invalid_mask(cells.iter())
    }

    // -------------------------------------------------------------------------
    // Rules
    // -------------------------------------------------------------------------

    #[test]
    fn test_range_flags_out_of_range_and_unparseable() {
        let rule = ValidationRule::Range { min: 1.0, max: 12.0 };
        let cells = [json!("1"), json!("12"), json!("13"), json!("x"), Value::Null];
        assert_eq!(mask(rule, &cells), vec![false, false, true, true, true]);
    }

    #[test]
    fn test_enum_membership() {
        let rule = ValidationRule::Enum(vec!["G".into(), "O".into()]);
        let cells = [json!("G"), json!(" O "), json!("X"), Value::Null];
        assert_eq!(mask(rule, &cells), vec![false, false, true, true]);
    }

    #[test]
    fn test_non_negative_ignores_nulls() {
        let cells = [json!("0"), json!("-1"), Value::Null, json!(""), json!("abc")];
        assert_eq!(
            mask(ValidationRule::NonNegative, &cells),
            vec![false, true, false, false, true]
        );
    }

    #[test]
    fn test_percentage_bounds() {
        let cells = [json!("0"), json!("100"), json!("100,5"), json!("-0.1"), Value::Null];
        assert_eq!(
            mask(ValidationRule::Percentage, &cells),
            vec![false, false, true, true, false]
        );
    }

    #[test]
    fn test_positive_and_not_null() {
        let cells = [json!("1"), json!("0"), Value::Null];
        assert_eq!(mask(ValidationRule::Positive, &cells), vec![false, true, true]);
        let cells = [json!("a"), json!("  "), Value::Null, json!(0)];
        assert_eq!(
            mask(ValidationRule::NotNull, &cells),
            vec![false, true, true, false]
        );
    }

    #[test]
    fn test_date_valid() {
        let cells = [json!("2024-02-29"), json!("2023-02-29"), json!("ayer")];
        assert_eq!(mask(ValidationRule::DateValid, &cells), vec![false, true, true]);
    }

    #[test]
    fn test_mask_matches_standalone_verdicts() {
        let rule = ValidationRule::Enum(vec!["MEDIO".into(), "ALTO".into()]);
        let cells = [json!("MEDIO"), json!("BAJO"), json!(3), Value::Null, json!("ALTO")];
        let batch = mask(rule.clone(), &cells);
        let single: Vec<bool> = cells.iter().map(|c| rule.rejects(c)).collect();
        assert_eq!(batch, single);
    }

    // -------------------------------------------------------------------------
    // Mapping sources
    // -------------------------------------------------------------------------

    #[test]
    fn test_column_or_literal_binds_per_batch() {
        let table = Table::from_rows(vec![json!({"campo": "A"}).as_object().unwrap().clone()]);
        let as_column = ColumnSource::from("campo").bind(&table);
        let as_literal = ColumnSource::from("Bls/Kpc").bind(&table);
        assert_eq!(as_column, BoundSource::Column("campo".into()));
        assert_eq!(as_literal, BoundSource::Literal(json!("Bls/Kpc")));
        let row = &table.rows()[0];
        assert_eq!(as_column.value(row), &json!("A"));
        assert_eq!(as_literal.value(row), &json!("Bls/Kpc"));
    }

    #[test]
    fn test_optional_column_is_not_required() {
        let config = TransformationConfig::new(
            "demo",
            FactTableMapping::new("fact_demo")
                .field("campo_nombre", ColumnSource::column("campo"))
                .field("latitud", ColumnSource::optional("latitud"))
                .field("unidad", ColumnSource::literal("Bls/Kpc")),
        );
        assert_eq!(config.required_columns(), vec!["campo"]);
        let table = Table::from_rows(vec![json!({"campo": "A"}).as_object().unwrap().clone()]);
        let bound = ColumnSource::optional("latitud").bind(&table);
        assert_eq!(bound.value(&table.rows()[0]), &Value::Null);
    }

    #[test]
    fn test_explicit_column_reads_null_when_absent() {
        let table = Table::from_rows(vec![Row::new()]);
        let bound = ColumnSource::column("campo").bind(&table);
        assert_eq!(bound.value(&table.rows()[0]), &Value::Null);
    }

    // -------------------------------------------------------------------------
    // Required columns
    // -------------------------------------------------------------------------

    fn derive_ok(_: &Row) -> Result<Value, String> {
        Ok(Value::Null)
    }

    #[test]
    fn test_required_columns_skip_derived_inputs() {
        let config = TransformationConfig::new("demo", FactTableMapping::new("fact_demo"))
            .validate(ColumnValidation::new("mes", ValidationRule::NotNull, "mes"))
            .derive(ColumnDerivation::new("fecha", &["a_o", "mes"], derive_ok))
            .derive(ColumnDerivation::new("trimestre", &["fecha"], derive_ok));
        assert_eq!(config.required_columns(), vec!["mes", "a_o"]);
    }
}
