//! End-to-end pipeline runs against in-memory fixture sources.

use std::collections::HashMap;
use std::io::{Cursor, Write};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;
use tcph_core::{parse_day, DateRange, GroupRecord, ProductRecord};
use tcph_pipeline::{read_curated, Pipeline, PipelineConfig};
use tcph_source::{ArchiveSource, MetadataSource, SourceError};
use tcph_storage::{partition_dates, DatasetLayout};
use tempfile::tempdir;
use zip::write::SimpleFileOptions;

fn day(s: &str) -> NaiveDate {
    parse_day(s).expect("test date")
}

fn day_zip(listings: &[(i64, &str)]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut cursor);
    let options = SimpleFileOptions::default();
    for (group_id, body) in listings {
        writer
            .start_file(format!("3/{group_id}/prices"), options)
            .expect("start zip entry");
        writer.write_all(body.as_bytes()).expect("write zip entry");
    }
    writer.finish().expect("finish zip");
    cursor.into_inner()
}

fn listing(product_id: i64, market: f64) -> String {
    format!(
        r#"{{"results": [{{"productId": {product_id}, "subTypeName": "Normal", "marketPrice": {market}}}]}}"#
    )
}

struct FixtureArchive {
    days: HashMap<NaiveDate, Vec<u8>>,
    fail_on: Option<NaiveDate>,
}

impl FixtureArchive {
    fn new(days: HashMap<NaiveDate, Vec<u8>>) -> Self {
        Self {
            days,
            fail_on: None,
        }
    }
}

#[async_trait]
impl ArchiveSource for FixtureArchive {
    async fn fetch_day(&self, date: NaiveDate) -> Result<Option<Vec<u8>>, SourceError> {
        if self.fail_on == Some(date) {
            return Err(SourceError::Other(anyhow!("upstream unavailable")));
        }
        Ok(self.days.get(&date).cloned())
    }
}

struct FixtureMeta;

#[async_trait]
impl MetadataSource for FixtureMeta {
    async fn fetch_groups(&self) -> Result<Vec<GroupRecord>, SourceError> {
        Ok(vec![GroupRecord {
            group_id: 604,
            name: "Base Set".to_string(),
            abbreviation: Some("BS".to_string()),
            release_date: Some(day("1999-01-09")),
            category_id: Some(3),
        }])
    }

    async fn fetch_products(&self) -> Result<Vec<ProductRecord>, SourceError> {
        Ok(vec![ProductRecord {
            product_id: 42,
            name: "Charizard".to_string(),
            clean_name: Some("charizard".to_string()),
            group_id: 604,
            category_id: Some(3),
            rarity: Some("Holo Rare".to_string()),
            card_number: Some("4".to_string()),
        }])
    }
}

struct EmptyMeta;

#[async_trait]
impl MetadataSource for EmptyMeta {
    async fn fetch_groups(&self) -> Result<Vec<GroupRecord>, SourceError> {
        Ok(Vec::new())
    }

    async fn fetch_products(&self) -> Result<Vec<ProductRecord>, SourceError> {
        Ok(Vec::new())
    }
}

struct FailingMeta;

#[async_trait]
impl MetadataSource for FailingMeta {
    async fn fetch_groups(&self) -> Result<Vec<GroupRecord>, SourceError> {
        Err(SourceError::Other(anyhow!("metadata endpoint down")))
    }

    async fn fetch_products(&self) -> Result<Vec<ProductRecord>, SourceError> {
        Err(SourceError::Other(anyhow!("metadata endpoint down")))
    }
}

#[tokio::test]
async fn run_produces_partitions_and_curated_join() {
    let dir = tempdir().expect("tempdir");
    let layout = DatasetLayout::new(dir.path());
    let d1 = day("2024-02-08");

    let archive = FixtureArchive::new(HashMap::from([(
        d1,
        day_zip(&[(604, &listing(42, 12.5)), (604999, &listing(7, 0.5))]),
    )]));
    let meta = FixtureMeta;
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, PipelineConfig::default());

    let summary = pipeline
        .run(DateRange::daily(d1, d1))
        .await
        .expect("run succeeds");

    assert!(!summary.failed());
    assert_eq!(summary.days_ok, vec![d1]);
    assert_eq!(summary.rows_written, 2);

    let curated = read_curated(&layout.curated_partition(d1)).expect("read curated");
    assert_eq!(curated.len(), 2);

    let known = curated.iter().find(|r| r.price.product_id == 42).unwrap();
    assert_eq!(known.product_name.as_deref(), Some("Charizard"));
    assert_eq!(known.set_name.as_deref(), Some("Base Set"));

    // Product 7 has no metadata match; the row still survives the join.
    let unknown = curated.iter().find(|r| r.price.product_id == 7).unwrap();
    assert!(unknown.product_name.is_none());
    assert!(unknown.set_name.is_none());

    // Metadata caches were materialized, transient dirs cleaned up.
    assert!(layout.products_path().exists());
    assert!(layout.groups_path().exists());
    assert!(!layout.archives_dir().exists());
    assert!(!layout.extracted_dir().exists());
}

#[tokio::test]
async fn rerunning_a_date_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let layout = DatasetLayout::new(dir.path());
    let d1 = day("2024-02-08");

    let archive = FixtureArchive::new(HashMap::from([(d1, day_zip(&[(604, &listing(42, 12.5))]))]));
    let meta = FixtureMeta;
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, PipelineConfig::default());

    pipeline.run(DateRange::daily(d1, d1)).await.expect("first run");
    let first = read_curated(&layout.curated_partition(d1)).expect("read");
    pipeline.run(DateRange::daily(d1, d1)).await.expect("second run");
    let second = read_curated(&layout.curated_partition(d1)).expect("read");

    assert_eq!(first, second);
}

#[tokio::test]
async fn empty_day_succeeds_with_zero_row_partition() {
    let dir = tempdir().expect("tempdir");
    let layout = DatasetLayout::new(dir.path());
    let d1 = day("2024-02-08");

    let archive = FixtureArchive::new(HashMap::new());
    let meta = FixtureMeta;
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, PipelineConfig::default());

    let summary = pipeline
        .run(DateRange::daily(d1, d1))
        .await
        .expect("run succeeds");

    assert!(!summary.failed());
    assert_eq!(summary.days_empty, vec![d1]);
    assert!(summary.days_ok.is_empty());

    let curated = read_curated(&layout.curated_partition(d1)).expect("read curated");
    assert!(curated.is_empty());
}

#[tokio::test]
async fn empty_metadata_tables_still_curate_every_price_row() {
    let dir = tempdir().expect("tempdir");
    let layout = DatasetLayout::new(dir.path());
    let d1 = day("2024-02-08");

    let archive = FixtureArchive::new(HashMap::from([(d1, day_zip(&[(604, &listing(42, 12.5))]))]));
    let meta = EmptyMeta;
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, PipelineConfig::default());

    let summary = pipeline
        .run(DateRange::daily(d1, d1))
        .await
        .expect("run succeeds with empty metadata");

    assert!(!summary.failed());
    assert_eq!(summary.days_ok, vec![d1]);

    let curated = read_curated(&layout.curated_partition(d1)).expect("read curated");
    assert_eq!(curated.len(), 1);
    assert!(curated[0].product_name.is_none());
    assert!(curated[0].set_name.is_none());
}

#[tokio::test]
async fn failing_date_is_isolated_and_reflected_in_summary() {
    let dir = tempdir().expect("tempdir");
    let layout = DatasetLayout::new(dir.path());
    let d1 = day("2024-02-08");
    let d2 = day("2024-02-09");

    let mut archive =
        FixtureArchive::new(HashMap::from([(d1, day_zip(&[(604, &listing(42, 12.5))]))]));
    archive.fail_on = Some(d2);
    let meta = FixtureMeta;
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, PipelineConfig::default());

    let summary = pipeline
        .run(DateRange::daily(d1, d2))
        .await
        .expect("run completes despite failed date");

    assert!(summary.failed());
    assert_eq!(summary.days_ok, vec![d1]);
    assert_eq!(summary.days_failed, vec![d2]);
    assert!(layout.curated_partition(d1).exists());
    assert!(!layout.curated_partition(d2).exists());
}

#[tokio::test]
async fn metadata_failure_aborts_before_any_date() {
    let dir = tempdir().expect("tempdir");
    let layout = DatasetLayout::new(dir.path());
    let d1 = day("2024-02-08");

    let archive = FixtureArchive::new(HashMap::from([(d1, day_zip(&[(604, &listing(42, 12.5))]))]));
    let meta = FailingMeta;
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, PipelineConfig::default());

    let err = pipeline
        .run(DateRange::daily(d1, d1))
        .await
        .expect_err("run aborts");
    assert!(format!("{err:#}").contains("metadata"));
    assert!(!layout.curated_partition(d1).exists());
    assert!(!layout.raw_partition(d1).exists());
}

#[tokio::test]
async fn retention_bounds_raw_partitions_but_not_curated() {
    let dir = tempdir().expect("tempdir");
    let layout = DatasetLayout::new(dir.path());
    let d1 = day("2024-02-08");
    let d2 = day("2024-02-09");
    let d3 = day("2024-02-10");

    let archive = FixtureArchive::new(HashMap::from([
        (d1, day_zip(&[(604, &listing(42, 1.0))])),
        (d2, day_zip(&[(604, &listing(42, 2.0))])),
        (d3, day_zip(&[(604, &listing(42, 3.0))])),
    ]));
    let meta = FixtureMeta;
    let config = PipelineConfig {
        raw_retention: 1,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, config);

    pipeline.run(DateRange::daily(d1, d3)).await.expect("run");

    let raw = partition_dates(&layout.raw_daily_dir()).expect("list raw");
    assert_eq!(raw, vec![d3]);
    let curated = partition_dates(&layout.curated_dir()).expect("list curated");
    assert_eq!(curated, vec![d1, d2, d3]);
}

#[tokio::test]
async fn overlapping_runs_keep_combined_dataset_deduplicated() {
    let dir = tempdir().expect("tempdir");
    let layout = DatasetLayout::new(dir.path());
    let d1 = day("2024-02-08");
    let d2 = day("2024-02-09");
    let d3 = day("2024-02-10");
    let meta = FixtureMeta;
    let config = PipelineConfig {
        full_file: true,
        ..PipelineConfig::default()
    };

    // First run covers [d1, d2].
    let archive = FixtureArchive::new(HashMap::from([
        (d1, day_zip(&[(604, &listing(42, 1.0))])),
        (d2, day_zip(&[(604, &listing(42, 2.0))])),
    ]));
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, config.clone());
    let summary = pipeline.run(DateRange::daily(d1, d2)).await.expect("run one");
    let compaction = summary.compaction.expect("compaction ran");
    assert!(compaction.rebuilt);
    assert_eq!(compaction.total_rows, 2);

    // Second run covers [d2, d3] with a revised d2 price.
    let archive = FixtureArchive::new(HashMap::from([
        (d2, day_zip(&[(604, &listing(42, 20.0))])),
        (d3, day_zip(&[(604, &listing(42, 3.0))])),
    ]));
    let pipeline = Pipeline::new(layout.clone(), &archive, &meta, config);
    let summary = pipeline.run(DateRange::daily(d2, d3)).await.expect("run two");
    let compaction = summary.compaction.expect("compaction ran");
    assert!(!compaction.rebuilt);
    assert_eq!(compaction.dates_replaced, 1);
    assert_eq!(compaction.total_rows, 3);

    let combined = read_curated(&layout.combined_path()).expect("read combined");
    let rows_for = |d: NaiveDate| {
        combined
            .iter()
            .filter(|r| r.price.date == d)
            .collect::<Vec<_>>()
    };
    assert_eq!(rows_for(d1).len(), 1);
    assert_eq!(rows_for(d1)[0].price.market_price, Some(1.0));
    assert_eq!(rows_for(d2).len(), 1);
    assert_eq!(rows_for(d2)[0].price.market_price, Some(20.0));
    assert_eq!(rows_for(d3).len(), 1);
    assert_eq!(rows_for(d3)[0].price.market_price, Some(3.0));
}
