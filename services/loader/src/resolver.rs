//! Dimension resolver: natural keys to surrogate ids, cache first.
//!
//! Each dimension is preloaded in full on first use. After that a cache miss
//! for `tiempo` or `territorio` is final (those tables are seeded, never
//! written here) while a miss for `campo` or `resolucion` becomes an upsert.
//! One resolver serves one run; it is not meant to be shared.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::EtlError;
use crate::record::{DimensionKind, NormalizedRecord};
use crate::store::{DimensionStore, NewCampo, NewResolucion};
use crate::value::{as_text, parse_bool, parse_date, NULL};

/// Accent and case insensitive form of a place name: canonical decomposition,
/// combining marks dropped, upper-cased, whitespace collapsed.
pub fn normalize_place(text: &str) -> String {
    let stripped: String = text.nfd().filter(|c| !is_combining_mark(*c)).collect();
    collapse(&stripped.to_uppercase())
}

/// Cache key for field names and resolution numbers.
pub fn normalize_name(text: &str) -> String {
    collapse(&text.to_uppercase())
}

/// Natural key of a territory as stored in `dim_territorios.clave`.
pub fn territorio_key(departamento: &str, municipio: &str) -> String {
    format!("{}|{}", normalize_place(departamento), normalize_place(municipio))
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn month_start(fecha: NaiveDate) -> NaiveDate {
    fecha.with_day(1).unwrap_or(fecha)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DimensionCounters {
    pub lookups: u64,
    pub cache_hits: u64,
    pub misses: u64,
    pub created: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolverStats {
    pub counters: BTreeMap<DimensionKind, DimensionCounters>,
    pub cache_sizes: BTreeMap<DimensionKind, usize>,
    pub campos_created_range: String,
    pub resoluciones_created: usize,
    pub unresolved_tiempo: Vec<String>,
    pub unresolved_territorio: Vec<String>,
    pub store_errors: u64,
}

/// Surrogate ids resolved for one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedKeys {
    pub tiempo_id: Option<i64>,
    pub territorio_id: Option<i64>,
    pub campo_id: Option<i64>,
    pub resolucion_id: Option<i64>,
}

impl ResolvedKeys {
    pub fn get(&self, kind: DimensionKind) -> Option<i64> {
        match kind {
            DimensionKind::Tiempo => self.tiempo_id,
            DimensionKind::Territorio => self.territorio_id,
            DimensionKind::Campo => self.campo_id,
            DimensionKind::Resolucion => self.resolucion_id,
        }
    }
}

/// "IDs a - b (n campos)" over the ids created in this run.
fn created_summary(ids: &[i64]) -> String {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    match sorted.as_slice() {
        [] => "ninguno".to_string(),
        [only] => format!("ID {only}"),
        [first, .., last] => format!("IDs {first} - {last} ({} campos)", sorted.len()),
    }
}

pub struct DimensionResolver<'a, S: DimensionStore + ?Sized> {
    store: &'a S,
    loaded: HashSet<DimensionKind>,
    tiempo: HashMap<NaiveDate, Option<i64>>,
    territorio: HashMap<(String, String), Option<i64>>,
    campo: HashMap<String, i64>,
    resolucion: HashMap<String, i64>,
    counters: BTreeMap<DimensionKind, DimensionCounters>,
    campos_created: Vec<i64>,
    resoluciones_created: Vec<i64>,
    unresolved_tiempo: BTreeSet<String>,
    unresolved_territorio: BTreeSet<String>,
    store_errors: u64,
}

impl<'a, S: DimensionStore + ?Sized> DimensionResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            loaded: HashSet::new(),
            tiempo: HashMap::new(),
            territorio: HashMap::new(),
            campo: HashMap::new(),
            resolucion: HashMap::new(),
            counters: BTreeMap::new(),
            campos_created: Vec::new(),
            resoluciones_created: Vec::new(),
            unresolved_tiempo: BTreeSet::new(),
            unresolved_territorio: BTreeSet::new(),
            store_errors: 0,
        }
    }

    fn counter(&mut self, kind: DimensionKind) -> &mut DimensionCounters {
        self.counters.entry(kind).or_default()
    }

    fn store_error(&mut self, kind: DimensionKind, action: &str, err: &EtlError) {
        self.store_errors += 1;
        warn!(dimension = %kind, action, error = %err, "dimension store error");
    }

    // -------------------------------------------------------------------------
    // Preload
    // -------------------------------------------------------------------------

    /// Load every existing row of `kind` into the cache. Runs once per kind;
    /// a failed load is logged and leaves the cache empty.
    async fn ensure_loaded(&mut self, kind: DimensionKind) -> usize {
        if !self.loaded.insert(kind) {
            return 0;
        }
        let loaded = match kind {
            DimensionKind::Tiempo => self.store.load_tiempo().await.map(|rows| {
                for row in &rows {
                    self.tiempo.insert(month_start(row.fecha), Some(row.id));
                }
                rows.len()
            }),
            DimensionKind::Territorio => self.store.load_territorios().await.map(|rows| {
                for row in &rows {
                    let key = (
                        normalize_place(&row.departamento),
                        normalize_place(&row.municipio),
                    );
                    self.territorio.insert(key, Some(row.id));
                }
                rows.len()
            }),
            DimensionKind::Campo => self.store.load_campos().await.map(|rows| {
                for row in &rows {
                    self.campo.insert(normalize_name(&row.key), row.id);
                }
                rows.len()
            }),
            DimensionKind::Resolucion => self.store.load_resoluciones().await.map(|rows| {
                for row in &rows {
                    self.resolucion.insert(normalize_name(&row.key), row.id);
                }
                rows.len()
            }),
        };
        match loaded {
            Ok(count) => {
                debug!(dimension = %kind, rows = count, "dimension cache preloaded");
                count
            }
            Err(err) => {
                self.store_error(kind, "preload", &err);
                0
            }
        }
    }

    /// Preload every dimension. Returns rows loaded per dimension.
    pub async fn preload_all_caches(&mut self) -> BTreeMap<DimensionKind, usize> {
        let mut loaded = BTreeMap::new();
        for kind in DimensionKind::ALL {
            let count = self.ensure_loaded(kind).await;
            loaded.insert(kind, count);
        }
        info!(
            tiempo = self.tiempo.len(),
            territorio = self.territorio.len(),
            campo = self.campo.len(),
            resolucion = self.resolucion.len(),
            "dimension caches ready"
        );
        loaded
    }

    // -------------------------------------------------------------------------
    // Seeded dimensions
    // -------------------------------------------------------------------------

    /// Id of the month containing `fecha`.
    pub async fn resolve_tiempo(&mut self, fecha: NaiveDate) -> Option<i64> {
        self.ensure_loaded(DimensionKind::Tiempo).await;
        let key = month_start(fecha);
        self.counter(DimensionKind::Tiempo).lookups += 1;
        if let Some(cached) = self.tiempo.get(&key).copied() {
            if cached.is_some() {
                self.counter(DimensionKind::Tiempo).cache_hits += 1;
            } else {
                self.counter(DimensionKind::Tiempo).misses += 1;
            }
            return cached;
        }
        self.counter(DimensionKind::Tiempo).misses += 1;
        self.tiempo.insert(key, None);
        self.unresolved_tiempo.insert(key.to_string());
        debug!(fecha = %fecha, "tiempo not found");
        None
    }

    pub async fn resolve_territorio(&mut self, departamento: &str, municipio: &str) -> Option<i64> {
        self.ensure_loaded(DimensionKind::Territorio).await;
        let key = (normalize_place(departamento), normalize_place(municipio));
        if key.0.is_empty() || key.1.is_empty() {
            return None;
        }
        self.counter(DimensionKind::Territorio).lookups += 1;
        if let Some(cached) = self.territorio.get(&key).copied() {
            if cached.is_some() {
                self.counter(DimensionKind::Territorio).cache_hits += 1;
            } else {
                self.counter(DimensionKind::Territorio).misses += 1;
            }
            return cached;
        }
        self.counter(DimensionKind::Territorio).misses += 1;
        self.unresolved_territorio
            .insert(format!("{} / {}", key.0, key.1));
        debug!(departamento, municipio, "territorio not found");
        self.territorio.insert(key, None);
        None
    }

    // -------------------------------------------------------------------------
    // Upserted dimensions
    // -------------------------------------------------------------------------

    pub async fn resolve_or_create_campo(&mut self, campo: &NewCampo) -> Option<i64> {
        // stored under the normalized name
        let nombre = normalize_name(&campo.nombre_campo);
        if nombre.is_empty() {
            return None;
        }
        self.ensure_loaded(DimensionKind::Campo).await;
        let key = nombre.clone();
        self.counter(DimensionKind::Campo).lookups += 1;
        if let Some(id) = self.campo.get(&key).copied() {
            self.counter(DimensionKind::Campo).cache_hits += 1;
            return Some(id);
        }
        self.counter(DimensionKind::Campo).misses += 1;

        let mut new_campo = campo.clone();
        new_campo.nombre_campo = nombre.clone();
        let id = match self.store.upsert_campo(&new_campo).await {
            Ok(upserted) => {
                if upserted.created {
                    self.counter(DimensionKind::Campo).created += 1;
                    self.campos_created.push(upserted.id);
                    debug!(nombre_campo = %nombre, id = upserted.id, "campo created");
                }
                upserted.id
            }
            Err(err) if err.is_conflict() => match self.store.find_campo(&nombre).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    self.store_error(DimensionKind::Campo, "upsert", &err);
                    return None;
                }
                Err(lookup) => {
                    self.store_error(DimensionKind::Campo, "lookup", &lookup);
                    return None;
                }
            },
            Err(err) => {
                self.store_error(DimensionKind::Campo, "upsert", &err);
                return None;
            }
        };
        self.campo.insert(key, id);
        Some(id)
    }

    pub async fn resolve_or_create_resolucion(&mut self, resolucion: &NewResolucion) -> Option<i64> {
        let numero = normalize_name(&resolucion.numero_resolucion);
        if numero.is_empty() {
            return None;
        }
        self.ensure_loaded(DimensionKind::Resolucion).await;
        let key = numero.clone();
        self.counter(DimensionKind::Resolucion).lookups += 1;
        if let Some(id) = self.resolucion.get(&key).copied() {
            self.counter(DimensionKind::Resolucion).cache_hits += 1;
            return Some(id);
        }
        self.counter(DimensionKind::Resolucion).misses += 1;

        let mut new_resolucion = resolucion.clone();
        new_resolucion.numero_resolucion = numero.clone();
        let id = match self.store.upsert_resolucion(&new_resolucion).await {
            Ok(upserted) => {
                if upserted.created {
                    self.counter(DimensionKind::Resolucion).created += 1;
                    self.resoluciones_created.push(upserted.id);
                    debug!(numero_resolucion = %numero, id = upserted.id, "resolucion created");
                }
                upserted.id
            }
            Err(err) if err.is_conflict() => match self.store.find_resolucion(&numero).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    self.store_error(DimensionKind::Resolucion, "upsert", &err);
                    return None;
                }
                Err(lookup) => {
                    self.store_error(DimensionKind::Resolucion, "lookup", &lookup);
                    return None;
                }
            },
            Err(err) => {
                self.store_error(DimensionKind::Resolucion, "upsert", &err);
                return None;
            }
        };
        self.resolucion.insert(key, id);
        Some(id)
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Resolve every dimension a record names. Dimension fields win; the
    /// record's data is consulted when the dimension block lacks a field.
    /// A resolved territory is attached to a newly created field.
    pub async fn resolve_record(&mut self, record: &NormalizedRecord) -> ResolvedKeys {
        let field = |kind: DimensionKind, name: &str, fallback: &str| -> Value {
            let value = record.dimension_field(kind, name);
            if value.is_null() {
                record.data.get(fallback).unwrap_or(&NULL).clone()
            } else {
                value.clone()
            }
        };
        let text = |kind: DimensionKind, name: &str, fallback: &str| as_text(&field(kind, name, fallback));
        let date = |kind: DimensionKind, name: &str, fallback: &str| parse_date(&field(kind, name, fallback));

        let mut keys = ResolvedKeys::default();

        let fecha = date(DimensionKind::Tiempo, "fecha", "tiempo_fecha");
        if let Some(fecha) = fecha {
            keys.tiempo_id = self.resolve_tiempo(fecha).await;
        }

        let departamento = text(DimensionKind::Territorio, "departamento", "departamento");
        let municipio = text(DimensionKind::Territorio, "municipio", "municipio");
        if let (Some(departamento), Some(municipio)) = (departamento, municipio) {
            keys.territorio_id = self.resolve_territorio(&departamento, &municipio).await;
        }

        if let Some(nombre) = text(DimensionKind::Campo, "nombre_campo", "campo_nombre") {
            let campo = NewCampo {
                nombre_campo: nombre,
                contrato: text(DimensionKind::Campo, "contrato", "contrato"),
                operador: text(DimensionKind::Campo, "operador", "campo_operador"),
                territorio_id: keys.territorio_id,
                activo: parse_bool(&field(DimensionKind::Campo, "activo", "activo"))
                    .unwrap_or(true),
            };
            keys.campo_id = self.resolve_or_create_campo(&campo).await;
        }

        if let Some(numero) = text(DimensionKind::Resolucion, "numero_resolucion", "resolucion_numero") {
            let resolucion = NewResolucion {
                numero_resolucion: numero,
                periodo_desde: date(DimensionKind::Resolucion, "periodo_desde", "periodo_desde"),
                periodo_hasta: date(DimensionKind::Resolucion, "periodo_hasta", "periodo_hasta"),
                url_pdf: text(DimensionKind::Resolucion, "url_pdf", "url_pdf"),
                url_soporte_magnetico: text(
                    DimensionKind::Resolucion,
                    "url_soporte_magnetico",
                    "url_soporte_magnetico",
                ),
                titulo: text(DimensionKind::Resolucion, "titulo", "titulo_resolucion"),
            };
            keys.resolucion_id = self.resolve_or_create_resolucion(&resolucion).await;
        }

        keys
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    pub fn get_stats(&self) -> ResolverStats {
        let cache_sizes = BTreeMap::from([
            (DimensionKind::Tiempo, self.tiempo.len()),
            (DimensionKind::Territorio, self.territorio.len()),
            (DimensionKind::Campo, self.campo.len()),
            (DimensionKind::Resolucion, self.resolucion.len()),
        ]);
        ResolverStats {
            counters: self.counters.clone(),
            cache_sizes,
            campos_created_range: created_summary(&self.campos_created),
            resoluciones_created: self.resoluciones_created.len(),
            unresolved_tiempo: self.unresolved_tiempo.iter().cloned().collect(),
            unresolved_territorio: self.unresolved_territorio.iter().cloned().collect(),
            store_errors: self.store_errors,
        }
    }

    /// One line per kind of gap, instead of one per row.
    pub fn log_summary(&self) {
        if !self.unresolved_tiempo.is_empty() {
            warn!(
                count = self.unresolved_tiempo.len(),
                fechas = ?self.unresolved_tiempo,
                "fechas without a dim_tiempo row"
            );
        }
        if !self.unresolved_territorio.is_empty() {
            warn!(
                count = self.unresolved_territorio.len(),
                territorios = ?self.unresolved_territorio,
                "territorios without a dim_territorios row"
            );
        }
        if !self.campos_created.is_empty() {
            info!(created = %created_summary(&self.campos_created), "campos created");
        }
        if !self.resoluciones_created.is_empty() {
            info!(created = self.resoluciones_created.len(), "resoluciones created");
        }
    }

    /// Drop caches, counters and gap sets so the resolver can serve another run.
    pub fn clear_caches(&mut self) {
        self.loaded.clear();
        self.tiempo.clear();
        self.territorio.clear();
        self.campo.clear();
        self.resolucion.clear();
        self.counters.clear();
        self.campos_created.clear();
        self.resoluciones_created.clear();
        self.unresolved_tiempo.clear();
        self.unresolved_territorio.clear();
        self.store_errors = 0;
        debug!("dimension caches cleared");
    }
}
