//! Seed rows for the pre-populated dimensions: one `dim_tiempo` row per month
//! and `dim_territorios` from the DIVIPOLA municipality list.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::resolver::territorio_key;
use crate::table::Table;
use crate::value::{as_text, parse_int, parse_number, Row, NULL};

pub const NOMBRES_MES: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TiempoSeed {
    pub fecha: NaiveDate,
    pub anio: i32,
    pub mes: u32,
    pub nombre_mes: &'static str,
    pub es_proyeccion: bool,
}

/// First day of every month from January `start_year` to December `end_year`.
/// Months after the month of `reference` are projections.
pub fn generate_tiempo_records(start_year: i32, end_year: i32, reference: NaiveDate) -> Vec<TiempoSeed> {
    let current = NaiveDate::from_ymd_opt(reference.year(), reference.month(), 1);
    let mut records = Vec::new();
    for anio in start_year..=end_year {
        for mes in 1..=12u32 {
            let Some(fecha) = NaiveDate::from_ymd_opt(anio, mes, 1) else {
                continue;
            };
            records.push(TiempoSeed {
                fecha,
                anio,
                mes,
                nombre_mes: NOMBRES_MES[(mes - 1) as usize],
                es_proyeccion: current.is_some_and(|c| fecha > c),
            });
        }
    }
    records
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerritorioSeed {
    /// Accent and case insensitive natural key, see [`territorio_key`].
    pub clave: String,
    pub departamento: String,
    pub municipio: String,
    pub latitud: Option<f64>,
    pub longitud: Option<f64>,
    /// Two-digit department code followed by three-digit municipality code.
    pub divipola: Option<String>,
}

fn first_of<'a>(row: &'a Row, keys: &[&str]) -> &'a Value {
    keys.iter()
        .find_map(|k| row.get(*k).filter(|v| !v.is_null()))
        .unwrap_or(&NULL)
}

/// Parse DIVIPOLA records (`nom_dpto`, `nom_mpio`, `cod_dpto`, `cod_mpio`,
/// `latitud`, `longitud`, either case). Rows without names are dropped and
/// places sharing a normalized (departamento, municipio) key keep the first
/// occurrence.
pub fn generate_territorio_records(table: &Table) -> Vec<TerritorioSeed> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for row in table.rows() {
        let departamento = as_text(first_of(row, &["nom_dpto", "NOM_DPTO"]));
        let municipio = as_text(first_of(row, &["nom_mpio", "NOM_MPIO"]));
        let (Some(departamento), Some(municipio)) = (departamento, municipio) else {
            continue;
        };
        let clave = territorio_key(&departamento, &municipio);
        if !seen.insert(clave.clone()) {
            continue;
        }
        let departamento = departamento.to_uppercase();
        let municipio = municipio.to_uppercase();

        let cod_dpto = first_of(row, &["cod_dpto", "COD_DPTO"]);
        let cod_mpio = first_of(row, &["cod_mpio", "COD_MPIO"]);
        let divipola = match (parse_int(cod_dpto), parse_int(cod_mpio)) {
            (Some(d), Some(m)) => Some(format!("{d:02}{m:03}")),
            _ => match (as_text(cod_dpto), as_text(cod_mpio)) {
                (Some(d), Some(m)) => Some(format!("{d}{m}")),
                _ => None,
            },
        };

        records.push(TerritorioSeed {
            clave,
            departamento,
            municipio,
            latitud: parse_number(first_of(row, &["latitud", "LATITUD"])),
            longitud: parse_number(first_of(row, &["longitud", "LONGITUD"])),
            divipola,
        });
    }
    info!(
        unique = records.len(),
        total = table.len(),
        "territorio seed records generated"
    );
    records
}
