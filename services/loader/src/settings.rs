//! Runtime settings from the environment (`.env` is read by the binary).

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{EtlError, EtlResult};
use crate::loader::{DEFAULT_BATCH_SIZE, DEFAULT_ERROR_SAMPLE};
use crate::pipeline::LoadOptions;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub db_url: Option<String>,
    pub db_max_connections: u32,
    pub batch_size: usize,
    pub max_workers: usize,
    pub raw_fs_dir: PathBuf,
    pub error_sample: usize,
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> EtlResult<T> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| EtlError::config(format!("{key} must be a number, got '{raw}'"))),
        _ => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> EtlResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EtlResult<Self> {
        let batch_size: usize = parse_var(&lookup, "ETL_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(EtlError::config("ETL_BATCH_SIZE must be at least 1"));
        }
        Ok(Self {
            db_url: lookup("DB_URL").filter(|url| !url.trim().is_empty()),
            db_max_connections: parse_var(&lookup, "DB_MAX_CONNECTIONS", 5)?,
            batch_size,
            max_workers: parse_var(&lookup, "ETL_MAX_WORKERS", 4)?,
            raw_fs_dir: PathBuf::from(
                lookup("RAW_FS_DIR").unwrap_or_else(|| "./data/raw".to_string()),
            ),
            error_sample: parse_var(&lookup, "ETL_ERROR_SAMPLE", DEFAULT_ERROR_SAMPLE)?,
        })
    }

    pub fn db_url(&self) -> EtlResult<&str> {
        self.db_url
            .as_deref()
            .ok_or_else(|| EtlError::config("DB_URL env var missing"))
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            batch_size: self.batch_size,
            error_sample: self.error_sample,
        }
    }
}
