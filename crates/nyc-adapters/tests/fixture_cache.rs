// Checked-in cache fixtures must stay in step with the live-shaped JSON fixtures.

use std::path::{Path, PathBuf};

use nyc_adapters::{
    parse_building_page, parse_census_response, parse_zip_list, CachedSource, CensusDataset,
    HousingSource, PlutoQuery,
};
use nyc_storage::CacheDir;
use serde_json::{Map, Value};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn json<T: serde::de::DeserializeOwned>(rel: &str) -> T {
    serde_json::from_str(&std::fs::read_to_string(fixtures().join(rel)).unwrap()).unwrap()
}

#[tokio::test]
async fn cached_files_match_json_fixtures() {
    let source = CachedSource::new(CacheDir::new(fixtures().join("cache")));

    let zips = parse_zip_list(&json::<Vec<Map<String, Value>>>("socrata/zip_list.json"));
    assert_eq!(source.zip_list().await.unwrap(), zips);

    let cached = source.census_tables().await.unwrap();
    for (dataset, cached) in CensusDataset::ALL.into_iter().zip(&cached) {
        let file = format!(
            "census/{}.json",
            dataset.file_name().trim_start_matches("nyc_").trim_end_matches(".csv")
        );
        let live = parse_census_response(dataset, &json::<Vec<Vec<Value>>>(&file)).unwrap();
        assert_eq!(&live, cached, "{file} disagrees with {}", dataset.file_name());
    }

    let live_buildings =
        parse_building_page(&json::<Vec<Map<String, Value>>>("socrata/pluto_page.json"));
    assert_eq!(
        source.buildings(&PlutoQuery::default()).await.unwrap(),
        live_buildings
    );
}
