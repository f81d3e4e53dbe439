// Live clients against a local server replaying the JSON fixtures.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nyc_adapters::{
    parse_building_page, AdapterError, CensusClient, CensusDataset, PlutoQuery, SocrataClient,
};
use nyc_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn fixture(rel: &str) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    std::fs::read_to_string(root.join(rel)).unwrap()
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig::default()).unwrap()
}

/// Serve each request with `respond(request_head)`; returns the base URL and every request head.
async fn serve<F>(respond: F) -> (String, Arc<Mutex<Vec<String>>>)
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut head = Vec::new();
            let mut buf = [0u8; 4096];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let head = String::from_utf8_lossy(&head).into_owned();
            let (status, body) = respond(&head);
            log.lock().unwrap().push(head);
            let response = format!(
                "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), seen)
}

/// Census fixture whose variable codes appear in the request line.
fn census_fixture_for(head: &str) -> Option<String> {
    let request_line = head.lines().next().unwrap_or_default();
    ["rent", "income", "burden", "housing", "vacancy"]
        .into_iter()
        .map(|name| fixture(&format!("census/{name}.json")))
        .find(|body| {
            let rows: Vec<Vec<Value>> = serde_json::from_str(body).unwrap();
            rows[0]
                .iter()
                .filter_map(Value::as_str)
                .filter(|h| h.starts_with('B'))
                .all(|code| request_line.contains(code))
        })
}

fn query_number(request_line: &str, key: &str) -> Option<usize> {
    let start = request_line.find(&format!("{key}="))? + key.len() + 1;
    let digits: String = request_line[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[tokio::test]
async fn census_tables_decode_header_rows_over_http() {
    let (base, seen) = serve(|head| match census_fixture_for(head) {
        Some(body) => (200, body),
        None => (404, "[]".to_string()),
    })
    .await;
    let client = CensusClient::new(fetcher(), "2022").with_base_url(format!("{base}/acs5"));

    let rent = client.fetch_table(CensusDataset::Rent).await.unwrap();
    assert_eq!(rent.dataset, CensusDataset::Rent);
    assert_eq!(rent.rows.len(), 4);
    assert_eq!(rent.rows[0].zip, "10001");
    assert_eq!(rent.rows[0].name.as_deref(), Some("ZCTA5 10001"));
    assert_eq!(rent.rows[0].values, vec![Some(2210.0)]);
    assert!(rent.rows.iter().any(|r| r.zip == "00501"));

    let tables = client.fetch_all().await.unwrap();
    let datasets: Vec<_> = tables.iter().map(|t| t.dataset).collect();
    assert_eq!(datasets, CensusDataset::ALL.to_vec());
    let vacancy = tables.last().unwrap();
    assert_eq!(vacancy.rows[0].values, vec![Some(15000.0), Some(13500.0), Some(1500.0)]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1 + CensusDataset::ALL.len());
    assert!(seen.iter().all(|head| head.starts_with("GET /acs5?")));
}

#[tokio::test]
async fn census_error_status_fails_the_fetch() {
    let (base, _seen) = serve(|head| {
        if head.contains("B19013_001E") {
            (503, String::new())
        } else {
            (200, census_fixture_for(head).unwrap_or_else(|| "[]".to_string()))
        }
    })
    .await;
    let client = CensusClient::new(fetcher(), "2022").with_base_url(format!("{base}/acs5"));

    assert!(client.fetch_table(CensusDataset::Rent).await.is_ok());
    let err = client.fetch_all().await.unwrap_err();
    assert!(
        matches!(err, AdapterError::Fetch(FetchError::HttpStatus { status: 503, .. })),
        "{err:?}"
    );
}

#[tokio::test]
async fn zip_list_is_fetched_with_the_app_token() {
    let (base, seen) = serve(|_| (200, fixture("socrata/zip_list.json"))).await;
    let client = SocrataClient::new(fetcher(), Some("tok".to_string()))
        .with_urls(format!("{base}/zips.json"), format!("{base}/pluto.json"));

    let zips = client.fetch_zip_list().await.unwrap();
    assert_eq!(zips, ["10001", "10002", "10003", "11201"]);

    let seen = seen.lock().unwrap();
    assert!(seen[0].starts_with("GET /zips.json?"));
    assert!(seen[0].contains("modzcta"));
    assert!(seen[0].to_ascii_lowercase().contains("x-app-token: tok"));
}

#[tokio::test]
async fn pluto_pages_until_a_short_page() {
    let rows: Vec<Map<String, Value>> =
        serde_json::from_str(&fixture("socrata/pluto_page.json")).unwrap();
    let expected = parse_building_page(&rows);
    let (base, seen) = serve(move |head| {
        let request_line = head.lines().next().unwrap_or_default();
        let offset = query_number(request_line, "offset").unwrap_or(0);
        let limit = query_number(request_line, "limit").unwrap_or(rows.len());
        let end = (offset + limit).min(rows.len());
        (200, serde_json::to_string(&rows[offset.min(end)..end]).unwrap())
    })
    .await;
    let client = SocrataClient::new(fetcher(), None)
        .with_urls(format!("{base}/zips.json"), format!("{base}/pluto.json"));
    let query = PlutoQuery {
        limit: 100,
        page_size: 2,
        page_delay: Duration::ZERO,
        ..Default::default()
    };

    let buildings = client.fetch_buildings(&query).await.unwrap();
    assert_eq!(buildings, expected);

    let offsets: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|head| query_number(head.lines().next().unwrap(), "offset").unwrap())
        .collect();
    assert_eq!(offsets, [0, 2, 4]);
}

#[tokio::test]
async fn pluto_error_status_fails_the_pull() {
    let (base, _seen) = serve(|_| (500, String::new())).await;
    let client = SocrataClient::new(fetcher(), None)
        .with_urls(format!("{base}/zips.json"), format!("{base}/pluto.json"));
    let query = PlutoQuery {
        page_delay: Duration::ZERO,
        ..Default::default()
    };

    let err = client.fetch_buildings(&query).await.unwrap_err();
    assert!(
        matches!(err, AdapterError::Fetch(FetchError::HttpStatus { status: 500, .. })),
        "{err:?}"
    );
}
