use std::collections::BTreeMap;

use nyc_core::{BuildingRecord, BuildingStats};

#[derive(Debug, Default)]
struct Accumulator {
    total: i64,
    floors_sum: f64,
    floors_n: u32,
    year_sum: i64,
    year_n: i64,
    units: i64,
    pre_1950: i64,
    mid_century: i64,
    post_2000: i64,
}

impl Accumulator {
    fn add(&mut self, record: &BuildingRecord) {
        self.total += 1;
        if let Some(floors) = record.numfloors {
            self.floors_sum += floors;
            self.floors_n += 1;
        }
        if let Some(year) = record.yearbuilt {
            self.year_sum += i64::from(year);
            self.year_n += 1;
            match year {
                y if y < 1950 => self.pre_1950 += 1,
                y if y <= 2000 => self.mid_century += 1,
                _ => self.post_2000 += 1,
            }
        }
        self.units += record.unitsres.unwrap_or(0);
    }

    fn finish(self, zip: String) -> BuildingStats {
        BuildingStats {
            zip,
            total_buildings: self.total,
            avg_floors: (self.floors_n > 0).then(|| self.floors_sum / f64::from(self.floors_n)),
            avg_year_built: (self.year_n > 0)
                .then(|| (self.year_sum as f64 / self.year_n as f64).round() as i32),
            total_residential_units: self.units,
            buildings_pre_1950: self.pre_1950,
            buildings_1950_2000: self.mid_century,
            buildings_post_2000: self.post_2000,
        }
    }
}

/// Group buildings by ZIP and compute one stats row per ZIP, ordered by ZIP.
///
/// Records without a ZIP are skipped. Year buckets are `< 1950`, `1950..=2000`
/// and `> 2000`; a missing year counts toward the total only.
pub fn compute_building_stats<'a>(
    records: impl IntoIterator<Item = &'a BuildingRecord>,
) -> Vec<BuildingStats> {
    let mut groups: BTreeMap<&str, Accumulator> = BTreeMap::new();
    for record in records {
        if let Some(zip) = record.zipcode.as_deref() {
            groups.entry(zip).or_default().add(record);
        }
    }
    groups
        .into_iter()
        .map(|(zip, acc)| acc.finish(zip.to_string()))
        .collect()
}
