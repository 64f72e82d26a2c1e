//! Backend-agnosticism tests: the same operation sequence against the
//! SQLite, CSV, and REST backends must produce equivalent observable
//! state, and the property export must be byte-identical.
//!
//! The REST backend runs against a small in-process emulator that
//! implements just enough of the PostgREST query grammar.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use finncrawl_core::storage::{CsvBackend, RestBackend, SqliteBackend};
use finncrawl_core::{ListingFilter, ListingStatus, PropertyRecord, StorageBackend};
use serde_json::{Map, Value};
use tempfile::TempDir;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// ==================== PostgREST Emulator ====================

type Row = Map<String, Value>;

#[derive(Default)]
struct Tables {
    finn_codes: BTreeMap<String, Row>,
    properties: BTreeMap<String, Row>,
}

#[derive(Clone, Default)]
struct PostgrestEmulator {
    state: Arc<Mutex<Tables>>,
}

enum Filter {
    Eq(String, String),
    Neq(String, String),
    In(String, Vec<String>),
    NotNull,
}

impl Filter {
    fn matches(&self, row: &Row) -> bool {
        let field = |name: &str| row.get(name).and_then(Value::as_str).unwrap_or_default();
        match self {
            Self::Eq(name, value) => field(name) == value,
            Self::Neq(name, value) => field(name) != value,
            Self::In(name, values) => values.iter().any(|v| v == field(name)),
            Self::NotNull => true,
        }
    }
}

fn parse_filters(request: &Request) -> (Vec<Filter>, Vec<String>) {
    let mut filters = Vec::new();
    let mut order = Vec::new();
    for (name, value) in request.url.query_pairs() {
        match name.as_ref() {
            "select" => {}
            "order" => {
                order = value
                    .split(',')
                    .map(|clause| clause.trim_end_matches(".asc").to_string())
                    .collect();
            }
            column => {
                if let Some(v) = value.strip_prefix("eq.") {
                    filters.push(Filter::Eq(column.to_string(), v.to_string()));
                } else if let Some(v) = value.strip_prefix("neq.") {
                    filters.push(Filter::Neq(column.to_string(), v.to_string()));
                } else if let Some(v) = value.strip_prefix("in.(") {
                    let values = v
                        .trim_end_matches(')')
                        .split(',')
                        .map(ToString::to_string)
                        .collect();
                    filters.push(Filter::In(column.to_string(), values));
                } else if value == "not.is.null" {
                    filters.push(Filter::NotNull);
                }
            }
        }
    }
    (filters, order)
}

fn row_key(row: &Row, order: &[String]) -> Vec<String> {
    order
        .iter()
        .map(|name| {
            row.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

fn wants_representation(request: &Request) -> bool {
    request
        .headers
        .get("Prefer")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("return=representation"))
}

impl Respond for PostgrestEmulator {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = self.state.lock().unwrap();
        let table = match request.url.path() {
            "/finn_codes" => &mut state.finn_codes,
            "/properties" => &mut state.properties,
            _ => return ResponseTemplate::new(404),
        };
        let (filters, order) = parse_filters(request);

        match request.method.as_str() {
            "GET" => {
                let mut rows: Vec<&Row> = table
                    .values()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .collect();
                if !order.is_empty() {
                    rows.sort_by_key(|row| row_key(row, &order));
                }
                ResponseTemplate::new(200).set_body_json(rows)
            }
            "POST" => {
                let Ok(row) = serde_json::from_slice::<Row>(&request.body) else {
                    return ResponseTemplate::new(400);
                };
                let Some(code) = row.get("finn_code").and_then(Value::as_str) else {
                    return ResponseTemplate::new(400);
                };
                let merge = request
                    .headers
                    .get("Prefer")
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.contains("merge-duplicates"));
                if table.contains_key(code) && !merge {
                    return ResponseTemplate::new(409);
                }
                table.insert(code.to_string(), row);
                ResponseTemplate::new(201)
            }
            "PATCH" => {
                let Ok(patch) = serde_json::from_slice::<Row>(&request.body) else {
                    return ResponseTemplate::new(400);
                };
                let mut changed = Vec::new();
                for row in table.values_mut() {
                    if filters.iter().all(|f| f.matches(row)) {
                        for (name, value) in &patch {
                            row.insert(name.clone(), value.clone());
                        }
                        changed.push(row.clone());
                    }
                }
                if wants_representation(request) {
                    ResponseTemplate::new(200).set_body_json(changed)
                } else {
                    ResponseTemplate::new(204)
                }
            }
            "DELETE" => {
                table.retain(|_, row| !filters.iter().all(|f| f.matches(row)));
                ResponseTemplate::new(204)
            }
            _ => ResponseTemplate::new(405),
        }
    }
}

async fn rest_fixture() -> (MockServer, RestBackend) {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(PostgrestEmulator::default())
        .mount(&server)
        .await;
    let backend = RestBackend::new(&server.uri(), None).unwrap();
    (server, backend)
}

// ==================== Shared Lifecycle ====================

fn record(code: &str, title: &str) -> PropertyRecord {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), title.to_string());
    fields.insert("address".to_string(), format!("Gate {code}"));
    fields.insert("asking_price".to_string(), "2500000".to_string());
    let mut record = PropertyRecord::from_fields(code, &fields);
    record.scrape_status = ListingStatus::Scraped.as_str().to_string();
    record
}

/// The lifecycle every backend is driven through: discovery, scraping,
/// a failure, a disappearance, and a reaffirmation pass.
async fn drive(storage: &dyn StorageBackend) {
    for code in ["100", "200", "300", "400"] {
        storage
            .upsert_identifier(code, ListingStatus::Pending)
            .await
            .unwrap();
    }

    storage.upsert_record(&record("100", "Enebolig")).await.unwrap();
    storage
        .upsert_identifier("100", ListingStatus::Scraped)
        .await
        .unwrap();
    storage
        .upsert_identifier("200", ListingStatus::Failed)
        .await
        .unwrap();

    // 300 disappears from search results
    let live: BTreeSet<String> = ["100", "200", "400"]
        .iter()
        .map(ToString::to_string)
        .collect();
    storage.mark_inactive(&live).await.unwrap();

    // a later crawl reaffirms the survivors
    for code in ["100", "200", "400"] {
        storage
            .upsert_identifier(code, ListingStatus::Pending)
            .await
            .unwrap();
    }

    storage.upsert_record(&record("400", "Rekkehus")).await.unwrap();
    storage
        .upsert_identifier("400", ListingStatus::Scraped)
        .await
        .unwrap();
}

/// (code, status) pairs in enumeration order.
async fn observed(storage: &dyn StorageBackend) -> Vec<(String, String)> {
    storage
        .list_identifiers(ListingFilter::All)
        .await
        .unwrap()
        .into_iter()
        .map(|id| (id.finn_code, id.scrape_status))
        .collect()
}

fn expected_state() -> Vec<(String, String)> {
    vec![
        ("100".to_string(), "scraped".to_string()),
        ("200".to_string(), "failed".to_string()),
        ("300".to_string(), "inactive".to_string()),
        ("400".to_string(), "scraped".to_string()),
    ]
}

// ==================== Equivalence Tests ====================

#[tokio::test]
async fn test_all_backends_reach_identical_state() {
    let sqlite = SqliteBackend::open_in_memory().await.unwrap();
    let dir = TempDir::new().unwrap();
    let csv = CsvBackend::open(
        dir.path().join("finn_codes.csv"),
        dir.path().join("properties.csv"),
    )
    .await
    .unwrap();
    let (_server, rest) = rest_fixture().await;

    drive(&sqlite).await;
    drive(&csv).await;
    drive(&rest).await;

    assert_eq!(observed(&sqlite).await, expected_state());
    assert_eq!(observed(&csv).await, expected_state());
    assert_eq!(observed(&rest).await, expected_state());

    let sqlite_records = sqlite.fetch_records().await.unwrap();
    assert_eq!(sqlite_records, csv.fetch_records().await.unwrap());
    assert_eq!(sqlite_records, rest.fetch_records().await.unwrap());
}

#[tokio::test]
async fn test_property_exports_are_byte_identical() {
    let sqlite = SqliteBackend::open_in_memory().await.unwrap();
    let dir = TempDir::new().unwrap();
    let csv_backend = CsvBackend::open(
        dir.path().join("finn_codes.csv"),
        dir.path().join("properties.csv"),
    )
    .await
    .unwrap();
    let (_server, rest) = rest_fixture().await;

    drive(&sqlite).await;
    drive(&csv_backend).await;
    drive(&rest).await;

    let out = TempDir::new().unwrap();
    let backends: [(&str, &dyn StorageBackend); 3] =
        [("sqlite", &sqlite), ("csv", &csv_backend), ("rest", &rest)];
    for (name, backend) in backends {
        backend
            .export(
                &out.path().join(format!("{name}_ids.csv")),
                &out.path().join(format!("{name}_props.csv")),
            )
            .await
            .unwrap();
    }

    let sqlite_props = std::fs::read(out.path().join("sqlite_props.csv")).unwrap();
    assert_eq!(
        sqlite_props,
        std::fs::read(out.path().join("csv_props.csv")).unwrap()
    );
    assert_eq!(
        sqlite_props,
        std::fs::read(out.path().join("rest_props.csv")).unwrap()
    );

    // The identifier exports carry wall-clock discovery times; compare
    // them with that column dropped.
    let strip = |name: &str| -> Vec<Vec<String>> {
        let mut reader = csv::Reader::from_path(out.path().join(format!("{name}_ids.csv"))).unwrap();
        reader
            .records()
            .map(|row| {
                let row = row.unwrap();
                vec![row[0].to_string(), row[2].to_string()]
            })
            .collect()
    };
    assert_eq!(strip("sqlite"), strip("csv"));
    assert_eq!(strip("sqlite"), strip("rest"));
}

#[tokio::test]
async fn test_export_column_order_is_stable() {
    let sqlite = SqliteBackend::open_in_memory().await.unwrap();
    drive(&sqlite).await;

    let out = TempDir::new().unwrap();
    let ids = out.path().join("ids.csv");
    let props = out.path().join("props.csv");
    sqlite.export(&ids, &props).await.unwrap();

    let header = std::fs::read_to_string(&props).unwrap();
    let header = header.lines().next().unwrap();
    assert!(header.starts_with("finn_code,title,address,asking_price"));
    assert!(header.ends_with("latitude,longitude,scrape_status"));

    let ids_header = std::fs::read_to_string(&ids).unwrap();
    assert_eq!(
        ids_header.lines().next().unwrap(),
        "finn_code,fetched_at,scrape_status"
    );
}

#[tokio::test]
async fn test_drop_schema_equivalence() {
    let sqlite = SqliteBackend::open_in_memory().await.unwrap();
    let dir = TempDir::new().unwrap();
    let csv_backend = CsvBackend::open(
        dir.path().join("finn_codes.csv"),
        dir.path().join("properties.csv"),
    )
    .await
    .unwrap();
    let (_server, rest) = rest_fixture().await;

    let backends: [&dyn StorageBackend; 3] = [&sqlite, &csv_backend, &rest];
    for storage in backends {
        drive(storage).await;
        storage.drop_schema().await.unwrap();
        assert!(storage
            .list_identifiers(ListingFilter::All)
            .await
            .unwrap()
            .is_empty());
        assert!(storage.fetch_records().await.unwrap().is_empty());
    }
}
