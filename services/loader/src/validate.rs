//! Validation/derivation engine.
//!
//! Rules are applied column by column over the whole batch. A row broken by
//! any rule is reported once, with the message of the first rule it broke,
//! and takes no further part in derivation or mapping.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::TransformationConfig;
use crate::error::{EtlError, EtlResult};
use crate::table::Table;
use crate::value::{sanitize, Row};

/// A row excluded from the batch, with its position in the original payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    pub record_index: usize,
    pub error: String,
    pub raw_record: Row,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub valid: Table,
    pub invalid: Vec<RowError>,
    pub error_categories: BTreeMap<String, usize>,
}

impl ValidationOutcome {
    pub fn total(&self) -> usize {
        self.valid.len() + self.invalid.len()
    }
}

/// Category of an error message: the text before the first `(`, trimmed.
pub fn categorize(message: &str) -> String {
    message.split('(').next().unwrap_or(message).trim().to_string()
}

pub fn error_categories(errors: &[RowError]) -> BTreeMap<String, usize> {
    let mut categories = BTreeMap::new();
    for error in errors {
        *categories.entry(categorize(&error.error)).or_insert(0) += 1;
    }
    categories
}

pub fn derivation_error(target: &str, reason: &str) -> String {
    format!("derivation error for {target} ({reason})")
}

pub fn validate_and_derive(
    mut table: Table,
    config: &TransformationConfig,
) -> EtlResult<ValidationOutcome> {
    if table.is_empty() {
        return Ok(ValidationOutcome::default());
    }

    let missing: Vec<String> = config
        .required_columns()
        .into_iter()
        .filter(|c| !table.has_column(c))
        .collect();
    if !missing.is_empty() {
        return Err(EtlError::Structural {
            source_id: config.source_id.clone(),
            missing,
        });
    }

    // ---- rules ----
    let mut first_error: Vec<Option<&str>> = vec![None; table.len()];
    for validation in &config.column_validations {
        let mask = validation
            .rule
            .invalid_mask(table.column(&validation.column));
        for (slot, invalid) in first_error.iter_mut().zip(mask) {
            if invalid && slot.is_none() {
                *slot = Some(validation.error_message.as_str());
            }
        }
    }

    let mut invalid: Vec<RowError> = Vec::new();
    for (i, (position, row)) in table.indexed_rows().enumerate() {
        if let Some(message) = first_error[i] {
            invalid.push(RowError {
                record_index: position,
                error: message.to_string(),
                raw_record: row.clone(),
            });
        }
    }
    let keep: Vec<bool> = first_error.iter().map(Option::is_none).collect();
    table.retain_mask(&keep);

    // ---- derivations ----
    let mut alive = vec![true; table.len()];
    for derivation in &config.column_derivations {
        table.add_column(&derivation.target_column);
        let positions: Vec<usize> = (0..table.len()).map(|i| table.original_index(i)).collect();
        for (i, row) in table.rows_mut().iter_mut().enumerate() {
            if !alive[i] {
                continue;
            }
            match (derivation.function)(row) {
                Ok(value) => {
                    row.insert(derivation.target_column.clone(), sanitize(value));
                }
                Err(reason) => {
                    debug!(
                        source_id = %config.source_id,
                        target = %derivation.target_column,
                        record_index = positions[i],
                        %reason,
                        "derivation failed"
                    );
                    alive[i] = false;
                    invalid.push(RowError {
                        record_index: positions[i],
                        error: derivation_error(&derivation.target_column, &reason),
                        raw_record: row.clone(),
                    });
                }
            }
        }
    }
    table.retain_mask(&alive);

    invalid.sort_by_key(|e| e.record_index);
    let error_categories = error_categories(&invalid);

    info!(
        source_id = %config.source_id,
        valid = table.len(),
        invalid = invalid.len(),
        "validation complete"
    );

    Ok(ValidationOutcome {
        valid: table,
        invalid,
        error_categories,
    })
}
