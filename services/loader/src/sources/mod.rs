//! Compile-time registry of per-source transformers.

pub mod demanda_gas;
pub mod oferta_gas;
pub mod regalias;

use std::collections::BTreeMap;

use crate::config::TransformationConfig;
use crate::error::{EtlError, EtlResult};
use crate::record::NormalizedRecord;
use crate::value::Row;

/// What a source plugs into the generic engine.
///
/// Sources too irregular for declarative mapping override `validate_row`
/// and/or `transform_row`; the defaults defer to the configuration.
pub trait SourceTransformer: Send + Sync {
    fn config(&self) -> &TransformationConfig;

    fn source_id(&self) -> &str {
        &self.config().source_id
    }

    /// Row-level check run before mapping. `Some(message)` skips the row.
    fn validate_row(&self, _row: &Row) -> Option<String> {
        None
    }

    /// Replaces declarative mapping when it returns `Some`.
    fn transform_row(
        &self,
        _row: &Row,
        _source_id: &str,
    ) -> Option<Result<NormalizedRecord, String>> {
        None
    }
}

/// Source id to transformer. Built once per process and passed around by
/// reference; nothing here is mutated after construction.
#[derive(Default)]
pub struct Registry {
    transformers: BTreeMap<String, Box<dyn SourceTransformer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every source shipped with the loader.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(regalias::RegaliasTransformer::new()));
        registry.register(Box::new(oferta_gas::OfertaGasTransformer::new()));
        registry.register(Box::new(demanda_gas::DemandaGasTransformer::new()));
        registry
    }

    pub fn register(&mut self, transformer: Box<dyn SourceTransformer>) {
        self.transformers
            .insert(transformer.source_id().to_string(), transformer);
    }

    pub fn get(&self, source_id: &str) -> EtlResult<&dyn SourceTransformer> {
        self.transformers
            .get(source_id)
            .map(|t| t.as_ref())
            .ok_or_else(|| EtlError::UnknownSource(source_id.to_string()))
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.transformers.contains_key(source_id)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.transformers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn SourceTransformer> {
        self.transformers.values().map(|t| t.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sources_registered() {
        let registry = Registry::builtin();
        let ids: Vec<&str> = registry.source_ids().collect();
        assert_eq!(ids, vec!["api_regalias", "minminas_oferta", "upme_demanda"]);
    }

    #[test]
    fn test_unknown_source_is_error() {
        let registry = Registry::builtin();
        assert!(matches!(
            registry.get("nope"),
            Err(EtlError::UnknownSource(id)) if id == "nope"
        ));
    }
}
