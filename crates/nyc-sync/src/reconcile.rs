//! Merges the per-metric census tables into one [`HousingMetric`] row per NYC ZIP.
//!
//! The join is a full outer join on ZIP: a ZIP present in any table survives
//! with nulls for the fields it lacks. Derived fields are computed after the
//! merge and after negative sentinels have been nulled, and the result is then
//! restricted to the authoritative ZIP list.

use std::collections::{BTreeMap, HashSet};

use nyc_adapters::CensusTable;
use nyc_core::HousingMetric;

/// Merged, not yet cleansed, values for one ZIP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedRow {
    pub name: Option<String>,
    pub median_rent: Option<f64>,
    pub median_income: Option<f64>,
    pub rent_burden: Option<f64>,
    pub housing_units: Option<f64>,
    pub total_units: Option<f64>,
    pub occupied_units: Option<f64>,
    pub vacant_units: Option<f64>,
}

impl MergedRow {
    fn set(&mut self, column: &str, value: Option<f64>) {
        let slot = match column {
            "median_rent" => &mut self.median_rent,
            "median_income" => &mut self.median_income,
            "rent_burden" => &mut self.rent_burden,
            "housing_units" => &mut self.housing_units,
            "total_units" => &mut self.total_units,
            "occupied_units" => &mut self.occupied_units,
            "vacant_units" => &mut self.vacant_units,
            _ => return,
        };
        *slot = value;
    }
}

/// Full outer join of every table on ZIP. The first non-empty NAME wins.
pub fn merge_tables(tables: &[CensusTable]) -> BTreeMap<String, MergedRow> {
    let mut merged: BTreeMap<String, MergedRow> = BTreeMap::new();
    for table in tables {
        let columns: Vec<&str> = table.columns().collect();
        for row in &table.rows {
            let entry = merged.entry(row.zip.clone()).or_default();
            if entry.name.is_none() {
                entry.name = row.name.clone().filter(|n| !n.trim().is_empty());
            }
            for (column, value) in columns.iter().zip(&row.values) {
                entry.set(column, *value);
            }
        }
    }
    merged
}

/// Census reports suppressed or unavailable estimates as large negative sentinels.
fn non_negative(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v >= 0.0)
}

fn count(value: Option<f64>) -> Option<i64> {
    non_negative(value).map(|v| v.round() as i64)
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Annual median to monthly. Negative input is nulled and never divided.
pub fn monthly_income(annual: Option<f64>) -> Option<f64> {
    non_negative(annual).map(|income| income / 12.0)
}

pub fn vacancy_rate(vacant: Option<i64>, total: Option<i64>) -> Option<f64> {
    match (vacant, total) {
        (Some(vacant), Some(total)) if total > 0 => Some(round_to(vacant as f64 / total as f64, 4)),
        _ => None,
    }
}

pub fn rent_burden_rate(median_rent: Option<f64>, median_income: Option<f64>) -> Option<f64> {
    match (median_rent, median_income) {
        (Some(rent), Some(income)) if income > 0.0 => Some(rent / income * 100.0),
        _ => None,
    }
}

pub fn derive_metric(zip: String, row: MergedRow) -> HousingMetric {
    let median_rent = non_negative(row.median_rent);
    let median_income = monthly_income(row.median_income);
    let total_units = count(row.total_units);
    let vacant_units = count(row.vacant_units);

    HousingMetric {
        zip,
        name: row.name,
        median_rent,
        median_income,
        rent_burden: non_negative(row.rent_burden),
        rent_burden_rate: rent_burden_rate(median_rent, median_income),
        housing_units: count(row.housing_units),
        total_units,
        occupied_units: count(row.occupied_units),
        vacant_units,
        vacancy_rate: vacancy_rate(vacant_units, total_units),
    }
}

/// Reconcile raw tables into final rows, ordered by ZIP and limited to `nyc_zips`.
pub fn reconcile(tables: &[CensusTable], nyc_zips: &HashSet<String>) -> Vec<HousingMetric> {
    merge_tables(tables)
        .into_iter()
        .filter(|(zip, _)| nyc_zips.contains(zip))
        .map(|(zip, row)| derive_metric(zip, row))
        .collect()
}
