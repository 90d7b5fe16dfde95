//! Energy Loader - Transform/Load engine for Colombian energy data
//!
//! Responsibilities:
//! - Validate and derive columns over raw batches (declarative rules)
//! - Map valid rows to normalized records (declarative or per-source)
//! - Resolve natural keys to dimension surrogate ids (cache first)
//! - Upsert facts in batches with row-level fallback
//!
//! Re-running a load with the same input leaves the warehouse unchanged.

pub mod config;
pub mod error;
pub mod facts;
pub mod loader;
pub mod mapping;
pub mod pipeline;
pub mod record;
pub mod resolver;
pub mod runner;
pub mod seed;
pub mod settings;
pub mod sources;
pub mod store;
pub mod table;
pub mod validate;
pub mod value;

pub use config::{
    ColumnDerivation, ColumnSource, ColumnValidation, DimensionMapping, FactTableMapping,
    TransformationConfig, ValidationRule,
};
pub use error::{EtlError, EtlResult};
pub use facts::{FactCatalog, FactTableSpec};
pub use loader::{FactLoader, LoadResult, LoadStatus};
pub use mapping::{map_source_rows, map_to_records};
pub use pipeline::{run_source, transform_files, transform_table, LoadOptions, RawFile, RunReport};
pub use record::{DimensionKind, NormalizedRecord};
pub use resolver::{DimensionResolver, ResolvedKeys, ResolverStats};
pub use settings::Settings;
pub use sources::{Registry, SourceTransformer};
pub use store::{MemoryWarehouse, PgWarehouse, Warehouse};
pub use table::{DataPath, Table};
pub use validate::{validate_and_derive, RowError, ValidationOutcome};
pub use value::Row;
