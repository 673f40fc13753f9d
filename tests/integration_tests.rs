use ev_adoption::analyzers::aggregate::{Order, RankMetric, aggregate, drilldown, rank};
use ev_adoption::analyzers::filter::{FilterSpec, QuarterSelection};
use ev_adoption::analyzers::trends::trends;
use ev_adoption::analyzers::types::{GroupKey, Grouping, Period};
use ev_adoption::cleaner::{CleanerSettings, clean};
use ev_adoption::config::PipelineConfig;
use ev_adoption::error::{MalformedReason, PipelineError};
use ev_adoption::fetch::BasicClient;
use ev_adoption::loader::{SourceOrigin, load, load_with};
use ev_adoption::output::{ExportFormat, export_views, read_views};
use ev_adoption::snapshot::load_snapshot;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const FIXTURE: &[u8] = include_bytes!("fixtures/sample_communes.csv");

fn fixture_path() -> String {
    format!("{}/tests/fixtures/sample_communes.csv", env!("CARGO_MANIFEST_DIR"))
}

fn temp_path(name: &str) -> PathBuf {
    env::temp_dir().join(name)
}

fn config_for(source: &str) -> PipelineConfig {
    PipelineConfig {
        source: source.to_string(),
        ..PipelineConfig::default()
    }
}

fn quarter(year: i32, q: u8) -> QuarterSelection {
    QuarterSelection::Single(Period::new(year, q).unwrap())
}

/// Serves `body` once over plain HTTP and returns the URL.
async fn serve_once(body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}/voitures.csv")
}

#[tokio::test]
async fn test_full_pipeline() {
    let config = config_for(&fixture_path());
    let raw = load(&config).await.expect("Failed to load fixture");
    assert_eq!(raw.origin, SourceOrigin::Local);
    assert_eq!(raw.records.len(), 14);

    let cleaned = clean(&raw.records, &CleanerSettings::from_config(&config));
    let report = &cleaned.report;
    assert_eq!(report.sentinel_dropped, 2);
    assert_eq!(report.malformed.get(&MalformedReason::MissingCount), Some(&1));
    assert_eq!(report.kept_rows, 11);
    assert_eq!(report.undefined_rates, 1);
    assert_eq!(report.input_rows, report.kept_rows + report.dropped_total());

    let filter = FilterSpec::default().with_quarter(quarter(2024, 2));
    let departments = aggregate(
        &cleaned.records,
        &filter,
        Grouping::Department,
        config.rate_bounds,
    );
    let keys: Vec<&str> = departments.iter().map(|v| v.key.code()).collect();
    assert_eq!(keys, ["01", "13", "75", "971"]);

    // Aix-en-Provence lost its EV count, so only Marseille remains.
    let bdr = &departments[1];
    assert_eq!(bdr.fleet_size, 421_000);
    assert_eq!(bdr.ev_electric_count, 10_400);
    assert_eq!(bdr.weighted_rate, Some(10_400.0 / 421_000.0 * 100.0));

    let national = aggregate(&cleaned.records, &filter, Grouping::National, config.rate_bounds);
    assert_eq!(national.len(), 1);
    assert_eq!(national[0].fleet_size, 1_020_102);
    assert_eq!(national[0].ev_electric_count, 43_465);
}

#[tokio::test]
async fn test_export_reimports_identically() {
    let config = config_for(&fixture_path());
    let snapshot = load_snapshot(&config).await.unwrap();
    let filter = FilterSpec {
        exclude_overseas: true,
        ..FilterSpec::default()
    };

    for grouping in [Grouping::Commune, Grouping::Department, Grouping::National] {
        let views = aggregate(&snapshot.records, &filter, grouping, config.rate_bounds);
        let bytes = export_views(&views, &filter.quarter, ExportFormat::Csv).unwrap();
        let restored = read_views(&bytes).unwrap();

        assert_eq!(restored, views);
        for view in &restored {
            assert_ne!(view.key.code(), "971");
            assert_eq!(
                config.rate_bounds.rate(view.ev_electric_count, view.fleet_size),
                view.weighted_rate
            );
        }
    }
}

#[tokio::test]
async fn test_no_data_commune_listed_but_never_ranked() {
    let config = config_for(&fixture_path());
    let snapshot = load_snapshot(&config).await.unwrap();
    let filter = FilterSpec::default().with_quarter(quarter(2024, 2));

    let communes = aggregate(&snapshot.records, &filter, Grouping::Commune, config.rate_bounds);
    let varey = communes.iter().find(|v| v.key.code() == "01002").unwrap();
    assert_eq!(varey.weighted_rate, None);

    let bytes = export_views(&communes, &filter.quarter, ExportFormat::Csv).unwrap();
    let exported = String::from_utf8(bytes).unwrap();
    let line = exported.lines().find(|l| l.contains("01002")).unwrap();
    assert!(line.ends_with(','));

    let top = rank(&communes, Order::Top, RankMetric::Rate, 1, 100);
    assert_eq!(top[0].key.code(), "75056");
    let bottom = rank(&communes, Order::Bottom, RankMetric::Rate, 10, 100);
    assert_eq!(bottom[0].key.code(), "97101");
    assert!(bottom.iter().all(|v| v.key.code() != "01002"));

    let ain = drilldown(&snapshot.records, "01", &filter, config.rate_bounds);
    let codes: Vec<&str> = ain.iter().map(|v| v.key.code()).collect();
    assert_eq!(codes, ["01001", "01004", "01002"]);
}

#[tokio::test]
async fn test_national_trend_has_quarter_delta() {
    let config = config_for(&fixture_path());
    let snapshot = load_snapshot(&config).await.unwrap();

    let series = trends(
        &snapshot.records,
        &GroupKey::National,
        &FilterSpec::default(),
        config.rate_bounds,
    );
    assert_eq!(series.points.len(), 2);
    assert_eq!(series.points[0].delta, None);

    let q1 = 41_322.0 / 1_019_980.0 * 100.0;
    let q2 = 43_465.0 / 1_020_102.0 * 100.0;
    assert!((series.points[1].delta.unwrap() - (q2 - q1)).abs() < 1e-9);
}

#[tokio::test]
async fn test_missing_column_is_schema_mismatch() {
    let path = temp_path("ev_adoption_it_missing_column.csv");
    fs::write(
        &path,
        "CODGEO;LIBGEO;DATE_ARRETE;NB_VP_RECHARGEABLES_EL;NB_VP_RECHARGEABLES_GAZ\n01001;A;2024-03-31;1;0\n",
    )
    .unwrap();

    let err = load(&config_for(path.to_str().unwrap())).await.unwrap_err();
    match err {
        PipelineError::SchemaMismatch { missing } => assert_eq!(missing, vec!["NB_VP".to_string()]),
        other => panic!("unexpected error: {other}"),
    }

    fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_remote_fetch_refreshes_cache_and_falls_back() {
    let cache = temp_path("ev_adoption_it_cache/voitures.csv");
    let _ = fs::remove_file(&cache);
    let client = BasicClient::new(Duration::from_secs(5)).unwrap();

    let url = serve_once(FIXTURE).await;
    let remote = load_with(&client, &url, Some(&cache)).await.unwrap();
    assert_eq!(remote.origin, SourceOrigin::Remote);
    assert_eq!(fs::read(&cache).unwrap(), FIXTURE);

    // Nothing listens on port 1.
    let offline = load_with(&client, "http://127.0.0.1:1/voitures.csv", Some(&cache))
        .await
        .unwrap();
    assert_eq!(offline.origin, SourceOrigin::Cache);
    assert_eq!(offline.digest, remote.digest);
    assert_eq!(offline.records, remote.records);

    let err = load_with(&client, "http://127.0.0.1:1/voitures.csv", None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    assert!(err.to_string().starts_with("loader:"));

    fs::remove_file(&cache).unwrap();
}

#[tokio::test]
async fn test_unparseable_remote_body_keeps_cache() {
    let cache = temp_path("ev_adoption_it_cache_bad_body/voitures.csv");
    fs::create_dir_all(cache.parent().unwrap()).unwrap();
    fs::write(&cache, FIXTURE).unwrap();
    let client = BasicClient::new(Duration::from_secs(5)).unwrap();

    let url = serve_once(b"<html>maintenance</html>\n").await;
    let fallback = load_with(&client, &url, Some(&cache)).await.unwrap();
    assert_eq!(fallback.origin, SourceOrigin::Cache);
    assert_eq!(fs::read(&cache).unwrap(), FIXTURE);

    let offline = load_with(&client, "http://127.0.0.1:1/voitures.csv", Some(&cache))
        .await
        .unwrap();
    assert_eq!(offline.origin, SourceOrigin::Cache);
    assert_eq!(offline.records, fallback.records);
    assert_eq!(offline.records.len(), 14);

    // Without a cache the parse failure itself is reported.
    let url = serve_once(b"<html>maintenance</html>\n").await;
    let err = load_with(&client, &url, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::SchemaMismatch { .. }));

    fs::remove_file(&cache).unwrap();
}
