//! Harvest pipeline: normalize raw day archives, merge with metadata,
//! maintain the partitioned and combined parquet datasets.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use tcph_core::{
    format_day, parse_day, CuratedRow, DateRange, GroupRecord, PriceRow, ProductRecord,
};
use tcph_source::{extract_day_archive, parse_price_listing, ArchiveSource, MetadataSource};
use tcph_storage::{
    partition_dates, prepare_staging, promote, prune_raw_partitions, remove_transient_dirs,
    write_bytes_atomic, DatasetLayout,
};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcph-pipeline";

/// Default rolling window of raw per-day tables kept on disk.
pub const RAW_RETENTION_DAYS: usize = 7;

fn price_fields() -> Vec<ArrowField> {
    vec![
        ArrowField::new("product_id", DataType::Int64, false),
        ArrowField::new("group_id", DataType::Int64, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("sub_type_name", DataType::Utf8, true),
        ArrowField::new("low_price", DataType::Float64, true),
        ArrowField::new("mid_price", DataType::Float64, true),
        ArrowField::new("high_price", DataType::Float64, true),
        ArrowField::new("market_price", DataType::Float64, true),
        ArrowField::new("direct_low_price", DataType::Float64, true),
    ]
}

pub fn price_schema() -> SchemaRef {
    Arc::new(Schema::new(price_fields()))
}

pub fn curated_schema() -> SchemaRef {
    let mut fields = price_fields();
    fields.extend([
        ArrowField::new("product_name", DataType::Utf8, true),
        ArrowField::new("clean_name", DataType::Utf8, true),
        ArrowField::new("category_id", DataType::Int64, true),
        ArrowField::new("rarity", DataType::Utf8, true),
        ArrowField::new("card_number", DataType::Utf8, true),
        ArrowField::new("set_name", DataType::Utf8, true),
        ArrowField::new("set_abbreviation", DataType::Utf8, true),
        ArrowField::new("set_release_date", DataType::Utf8, true),
    ]);
    Arc::new(Schema::new(fields))
}

pub fn product_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("product_id", DataType::Int64, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("clean_name", DataType::Utf8, true),
        ArrowField::new("group_id", DataType::Int64, false),
        ArrowField::new("category_id", DataType::Int64, true),
        ArrowField::new("rarity", DataType::Utf8, true),
        ArrowField::new("card_number", DataType::Utf8, true),
    ]))
}

pub fn group_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("group_id", DataType::Int64, false),
        ArrowField::new("set_name", DataType::Utf8, false),
        ArrowField::new("abbreviation", DataType::Utf8, true),
        ArrowField::new("release_date", DataType::Utf8, true),
        ArrowField::new("category_id", DataType::Int64, true),
    ]))
}

fn i64_array(values: Vec<i64>) -> ArrayRef {
    Arc::new(Int64Array::from(values))
}

fn opt_i64_array(values: Vec<Option<i64>>) -> ArrayRef {
    Arc::new(Int64Array::from(values))
}

fn f64_array(values: Vec<Option<f64>>) -> ArrayRef {
    Arc::new(Float64Array::from(values))
}

fn utf8_array(values: Vec<Option<String>>) -> ArrayRef {
    Arc::new(StringArray::from(values))
}

/// Write a record batch behind a staging file and atomic rename, so a
/// half-written table is never visible at the canonical path.
fn write_batch(path: &Path, batch: RecordBatch) -> Result<()> {
    let staging = prepare_staging(path)?;
    let result = (|| {
        let file = File::create(&staging)
            .with_context(|| format!("creating {}", staging.display()))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .with_context(|| format!("opening parquet writer {}", staging.display()))?;
        writer
            .write(&batch)
            .with_context(|| format!("writing record batch {}", staging.display()))?;
        writer
            .close()
            .with_context(|| format!("closing parquet writer {}", staging.display()))?;
        promote(&staging, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    result
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata of {}", path.display()))?
        .build()
        .with_context(|| format!("opening parquet reader for {}", path.display()))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.with_context(|| format!("decoding record batch of {}", path.display()))?);
    }
    Ok(batches)
}

fn utf8_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("column {name} missing"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column {name} is not utf8"))
}

fn i64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .with_context(|| format!("column {name} missing"))?
        .as_any()
        .downcast_ref::<Int64Array>()
        .with_context(|| format!("column {name} is not int64"))
}

fn f64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    batch
        .column_by_name(name)
        .with_context(|| format!("column {name} missing"))?
        .as_any()
        .downcast_ref::<Float64Array>()
        .with_context(|| format!("column {name} is not float64"))
}

fn opt_str(arr: &StringArray, i: usize) -> Option<String> {
    (!arr.is_null(i)).then(|| arr.value(i).to_string())
}

fn opt_f64(arr: &Float64Array, i: usize) -> Option<f64> {
    (!arr.is_null(i)).then(|| arr.value(i))
}

fn opt_i64(arr: &Int64Array, i: usize) -> Option<i64> {
    (!arr.is_null(i)).then(|| arr.value(i))
}

fn col_date(arr: &StringArray, i: usize) -> Result<NaiveDate> {
    parse_day(arr.value(i)).with_context(|| format!("unparseable date {:?}", arr.value(i)))
}

pub fn write_price_partition(path: &Path, rows: &[PriceRow]) -> Result<()> {
    let columns = vec![
        i64_array(rows.iter().map(|r| r.product_id).collect()),
        i64_array(rows.iter().map(|r| r.group_id).collect()),
        utf8_array(rows.iter().map(|r| Some(format_day(r.date))).collect()),
        utf8_array(rows.iter().map(|r| r.sub_type_name.clone()).collect()),
        f64_array(rows.iter().map(|r| r.low_price).collect()),
        f64_array(rows.iter().map(|r| r.mid_price).collect()),
        f64_array(rows.iter().map(|r| r.high_price).collect()),
        f64_array(rows.iter().map(|r| r.market_price).collect()),
        f64_array(rows.iter().map(|r| r.direct_low_price).collect()),
    ];
    let batch = RecordBatch::try_new(price_schema(), columns)
        .context("building price record batch")?;
    write_batch(path, batch)
}

pub fn read_price_partition(path: &Path) -> Result<Vec<PriceRow>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let product_id = i64_col(&batch, "product_id")?;
        let group_id = i64_col(&batch, "group_id")?;
        let date = utf8_col(&batch, "date")?;
        let sub_type_name = utf8_col(&batch, "sub_type_name")?;
        let low = f64_col(&batch, "low_price")?;
        let mid = f64_col(&batch, "mid_price")?;
        let high = f64_col(&batch, "high_price")?;
        let market = f64_col(&batch, "market_price")?;
        let direct_low = f64_col(&batch, "direct_low_price")?;
        for i in 0..batch.num_rows() {
            rows.push(PriceRow {
                product_id: product_id.value(i),
                group_id: group_id.value(i),
                date: col_date(date, i)?,
                sub_type_name: opt_str(sub_type_name, i),
                low_price: opt_f64(low, i),
                mid_price: opt_f64(mid, i),
                high_price: opt_f64(high, i),
                market_price: opt_f64(market, i),
                direct_low_price: opt_f64(direct_low, i),
            });
        }
    }
    Ok(rows)
}

pub fn write_curated(path: &Path, rows: &[CuratedRow]) -> Result<()> {
    let columns = vec![
        i64_array(rows.iter().map(|r| r.price.product_id).collect()),
        i64_array(rows.iter().map(|r| r.price.group_id).collect()),
        utf8_array(rows.iter().map(|r| Some(format_day(r.price.date))).collect()),
        utf8_array(rows.iter().map(|r| r.price.sub_type_name.clone()).collect()),
        f64_array(rows.iter().map(|r| r.price.low_price).collect()),
        f64_array(rows.iter().map(|r| r.price.mid_price).collect()),
        f64_array(rows.iter().map(|r| r.price.high_price).collect()),
        f64_array(rows.iter().map(|r| r.price.market_price).collect()),
        f64_array(rows.iter().map(|r| r.price.direct_low_price).collect()),
        utf8_array(rows.iter().map(|r| r.product_name.clone()).collect()),
        utf8_array(rows.iter().map(|r| r.clean_name.clone()).collect()),
        opt_i64_array(rows.iter().map(|r| r.category_id).collect()),
        utf8_array(rows.iter().map(|r| r.rarity.clone()).collect()),
        utf8_array(rows.iter().map(|r| r.card_number.clone()).collect()),
        utf8_array(rows.iter().map(|r| r.set_name.clone()).collect()),
        utf8_array(rows.iter().map(|r| r.set_abbreviation.clone()).collect()),
        utf8_array(
            rows.iter()
                .map(|r| r.set_release_date.map(format_day))
                .collect(),
        ),
    ];
    let batch = RecordBatch::try_new(curated_schema(), columns)
        .context("building curated record batch")?;
    write_batch(path, batch)
}

pub fn read_curated(path: &Path) -> Result<Vec<CuratedRow>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let product_id = i64_col(&batch, "product_id")?;
        let group_id = i64_col(&batch, "group_id")?;
        let date = utf8_col(&batch, "date")?;
        let sub_type_name = utf8_col(&batch, "sub_type_name")?;
        let low = f64_col(&batch, "low_price")?;
        let mid = f64_col(&batch, "mid_price")?;
        let high = f64_col(&batch, "high_price")?;
        let market = f64_col(&batch, "market_price")?;
        let direct_low = f64_col(&batch, "direct_low_price")?;
        let product_name = utf8_col(&batch, "product_name")?;
        let clean_name = utf8_col(&batch, "clean_name")?;
        let category_id = i64_col(&batch, "category_id")?;
        let rarity = utf8_col(&batch, "rarity")?;
        let card_number = utf8_col(&batch, "card_number")?;
        let set_name = utf8_col(&batch, "set_name")?;
        let set_abbreviation = utf8_col(&batch, "set_abbreviation")?;
        let set_release_date = utf8_col(&batch, "set_release_date")?;
        for i in 0..batch.num_rows() {
            rows.push(CuratedRow {
                price: PriceRow {
                    product_id: product_id.value(i),
                    group_id: group_id.value(i),
                    date: col_date(date, i)?,
                    sub_type_name: opt_str(sub_type_name, i),
                    low_price: opt_f64(low, i),
                    mid_price: opt_f64(mid, i),
                    high_price: opt_f64(high, i),
                    market_price: opt_f64(market, i),
                    direct_low_price: opt_f64(direct_low, i),
                },
                product_name: opt_str(product_name, i),
                clean_name: opt_str(clean_name, i),
                category_id: opt_i64(category_id, i),
                rarity: opt_str(rarity, i),
                card_number: opt_str(card_number, i),
                set_name: opt_str(set_name, i),
                set_abbreviation: opt_str(set_abbreviation, i),
                set_release_date: opt_str(set_release_date, i)
                    .map(|s| parse_day(&s))
                    .transpose()
                    .with_context(|| format!("unparseable set_release_date in {}", path.display()))?,
            });
        }
    }
    Ok(rows)
}

pub fn write_products(path: &Path, records: &[ProductRecord]) -> Result<()> {
    let columns = vec![
        i64_array(records.iter().map(|r| r.product_id).collect()),
        utf8_array(records.iter().map(|r| Some(r.name.clone())).collect()),
        utf8_array(records.iter().map(|r| r.clean_name.clone()).collect()),
        i64_array(records.iter().map(|r| r.group_id).collect()),
        opt_i64_array(records.iter().map(|r| r.category_id).collect()),
        utf8_array(records.iter().map(|r| r.rarity.clone()).collect()),
        utf8_array(records.iter().map(|r| r.card_number.clone()).collect()),
    ];
    let batch = RecordBatch::try_new(product_schema(), columns)
        .context("building products record batch")?;
    write_batch(path, batch)
}

pub fn read_products(path: &Path) -> Result<Vec<ProductRecord>> {
    let mut records = Vec::new();
    for batch in read_batches(path)? {
        let product_id = i64_col(&batch, "product_id")?;
        let name = utf8_col(&batch, "name")?;
        let clean_name = utf8_col(&batch, "clean_name")?;
        let group_id = i64_col(&batch, "group_id")?;
        let category_id = i64_col(&batch, "category_id")?;
        let rarity = utf8_col(&batch, "rarity")?;
        let card_number = utf8_col(&batch, "card_number")?;
        for i in 0..batch.num_rows() {
            records.push(ProductRecord {
                product_id: product_id.value(i),
                name: name.value(i).to_string(),
                clean_name: opt_str(clean_name, i),
                group_id: group_id.value(i),
                category_id: opt_i64(category_id, i),
                rarity: opt_str(rarity, i),
                card_number: opt_str(card_number, i),
            });
        }
    }
    Ok(records)
}

pub fn write_groups(path: &Path, records: &[GroupRecord]) -> Result<()> {
    let columns = vec![
        i64_array(records.iter().map(|r| r.group_id).collect()),
        utf8_array(records.iter().map(|r| Some(r.name.clone())).collect()),
        utf8_array(records.iter().map(|r| r.abbreviation.clone()).collect()),
        utf8_array(records.iter().map(|r| r.release_date.map(format_day)).collect()),
        opt_i64_array(records.iter().map(|r| r.category_id).collect()),
    ];
    let batch = RecordBatch::try_new(group_schema(), columns)
        .context("building groups record batch")?;
    write_batch(path, batch)
}

pub fn read_groups(path: &Path) -> Result<Vec<GroupRecord>> {
    let mut records = Vec::new();
    for batch in read_batches(path)? {
        let group_id = i64_col(&batch, "group_id")?;
        let set_name = utf8_col(&batch, "set_name")?;
        let abbreviation = utf8_col(&batch, "abbreviation")?;
        let release_date = utf8_col(&batch, "release_date")?;
        let category_id = i64_col(&batch, "category_id")?;
        for i in 0..batch.num_rows() {
            records.push(GroupRecord {
                group_id: group_id.value(i),
                name: set_name.value(i).to_string(),
                abbreviation: opt_str(abbreviation, i),
                release_date: opt_str(release_date, i)
                    .map(|s| parse_day(&s))
                    .transpose()
                    .with_context(|| format!("unparseable release_date in {}", path.display()))?,
                category_id: opt_i64(category_id, i),
            });
        }
    }
    Ok(records)
}

/// Read-only id-keyed view of the reference tables, built once per run and
/// shared by every date's merge.
#[derive(Debug, Clone, Default)]
pub struct MetadataSnapshot {
    products: HashMap<i64, ProductRecord>,
    groups: HashMap<i64, GroupRecord>,
}

impl MetadataSnapshot {
    pub fn new(products: Vec<ProductRecord>, groups: Vec<GroupRecord>) -> Self {
        let mut product_map = HashMap::with_capacity(products.len());
        for record in products {
            product_map.entry(record.product_id).or_insert(record);
        }
        let mut group_map = HashMap::with_capacity(groups.len());
        for record in groups {
            group_map.entry(record.group_id).or_insert(record);
        }
        Self {
            products: product_map,
            groups: group_map,
        }
    }

    pub fn product(&self, product_id: i64) -> Option<&ProductRecord> {
        self.products.get(&product_id)
    }

    pub fn group(&self, group_id: i64) -> Option<&GroupRecord> {
        self.groups.get(&group_id)
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Disk-backed cache over a [`MetadataSource`]. Tables are loaded from
/// `products.parquet` / `groups.parquet` when present; a refresh (or a cold
/// cache) fetches upstream and overwrites the cache files wholesale.
pub struct MetadataCache<'a> {
    layout: &'a DatasetLayout,
    source: &'a dyn MetadataSource,
    refresh: bool,
}

impl<'a> MetadataCache<'a> {
    pub fn new(layout: &'a DatasetLayout, source: &'a dyn MetadataSource, refresh: bool) -> Self {
        Self {
            layout,
            source,
            refresh,
        }
    }

    pub async fn snapshot(&self) -> Result<MetadataSnapshot> {
        let groups = self.load_groups().await?;
        let products = self.load_products().await?;
        let snapshot = MetadataSnapshot::new(products, groups);
        info!(
            products = snapshot.product_count(),
            groups = snapshot.group_count(),
            "metadata snapshot ready"
        );
        Ok(snapshot)
    }

    async fn load_groups(&self) -> Result<Vec<GroupRecord>> {
        let path = self.layout.groups_path();
        if !self.refresh && path.exists() {
            return read_groups(&path);
        }
        let fetched = self
            .source
            .fetch_groups()
            .await
            .context("fetching groups metadata")?;
        write_groups(&path, &fetched)?;
        Ok(fetched)
    }

    async fn load_products(&self) -> Result<Vec<ProductRecord>> {
        let path = self.layout.products_path();
        if !self.refresh && path.exists() {
            return read_products(&path);
        }
        let fetched = self
            .source
            .fetch_products()
            .await
            .context("fetching products metadata")?;
        write_products(&path, &fetched)?;
        Ok(fetched)
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct NormalizeReport {
    pub rows: usize,
    pub groups_read: usize,
    pub groups_skipped: usize,
    pub rows_skipped: usize,
}

/// Turn one day's extracted per-group listings into the raw per-day price
/// table. `group_root` is `None` for dates with no upstream archive; those
/// still materialize an empty table so the day reads as zero rows, not as
/// missing.
pub fn normalize_day(
    layout: &DatasetLayout,
    date: NaiveDate,
    group_root: Option<&Path>,
) -> Result<(Vec<PriceRow>, NormalizeReport)> {
    let mut rows = Vec::new();
    let mut report = NormalizeReport::default();

    if let Some(root) = group_root.filter(|r| r.is_dir()) {
        let mut group_dirs: Vec<_> = std::fs::read_dir(root)
            .with_context(|| format!("listing {}", root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str()
                    .and_then(|n| n.parse::<i64>().ok())
                    .map(|group_id| (group_id, entry.path()))
            })
            .collect();
        group_dirs.sort_by_key(|(group_id, _)| *group_id);

        for (group_id, group_dir) in group_dirs {
            let Some(listing) = listing_file(&group_dir) else {
                report.groups_skipped += 1;
                continue;
            };
            let bytes = match std::fs::read(&listing) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(group = group_id, "unreadable price listing, skipping group: {err}");
                    report.groups_skipped += 1;
                    continue;
                }
            };
            match parse_price_listing(&bytes, group_id, date) {
                Ok(parsed) => {
                    report.groups_read += 1;
                    report.rows_skipped += parsed.rows_skipped;
                    rows.extend(parsed.rows);
                }
                Err(err) => {
                    warn!(group = group_id, "undecodable price listing, skipping group: {err}");
                    report.groups_skipped += 1;
                }
            }
        }
    }

    write_price_partition(&layout.raw_partition(date), &rows)?;
    report.rows = rows.len();
    Ok((rows, report))
}

/// Raw listings are named `prices` in the archives; tolerate an explicit
/// `.json` extension as well.
fn listing_file(group_dir: &Path) -> Option<std::path::PathBuf> {
    for name in ["prices", "prices.json"] {
        let candidate = group_dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Left join the day's price rows against the metadata snapshot and commit
/// the curated partition. Every price row survives; duplicate
/// (product, sub-key) pairs collapse to the first occurrence.
pub fn merge_day(
    layout: &DatasetLayout,
    date: NaiveDate,
    rows: &[PriceRow],
    meta: &MetadataSnapshot,
) -> Result<usize> {
    let mut seen: HashSet<(i64, Option<String>)> = HashSet::with_capacity(rows.len());
    let mut curated = Vec::with_capacity(rows.len());

    for row in rows {
        if !seen.insert((row.product_id, row.sub_type_name.clone())) {
            continue;
        }
        let product = meta.product(row.product_id);
        let group = meta.group(row.group_id);
        curated.push(CuratedRow {
            price: row.clone(),
            product_name: product.map(|p| p.name.clone()),
            clean_name: product.and_then(|p| p.clean_name.clone()),
            category_id: product.and_then(|p| p.category_id),
            rarity: product.and_then(|p| p.rarity.clone()),
            card_number: product.and_then(|p| p.card_number.clone()),
            set_name: group.map(|g| g.name.clone()),
            set_abbreviation: group.and_then(|g| g.abbreviation.clone()),
            set_release_date: group.and_then(|g| g.release_date),
        });
    }

    write_curated(&layout.curated_partition(date), &curated)?;
    Ok(curated.len())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactReport {
    pub total_rows: usize,
    pub appended_rows: usize,
    pub dates_replaced: usize,
    pub rebuilt: bool,
}

/// Fold this run's partitions into the combined dataset. The combined file
/// ends up holding each date's slice exactly once: rows for touched dates
/// are dropped from the existing file and the fresh partitions appended.
/// A missing combined file triggers the full rebuild path instead.
pub fn compact(layout: &DatasetLayout, touched: &[NaiveDate]) -> Result<CompactReport> {
    let combined = layout.combined_path();
    if !combined.exists() {
        return rebuild_combined(layout);
    }

    let touched_set: HashSet<NaiveDate> = touched.iter().copied().collect();
    let mut touched_sorted: Vec<NaiveDate> = touched_set.iter().copied().collect();
    touched_sorted.sort_unstable();

    let existing = read_curated(&combined)
        .with_context(|| format!("reading combined dataset {}", combined.display()))?;
    let mut replaced_dates: HashSet<NaiveDate> = HashSet::new();
    let mut rows: Vec<CuratedRow> = Vec::with_capacity(existing.len());
    for row in existing {
        if touched_set.contains(&row.price.date) {
            replaced_dates.insert(row.price.date);
        } else {
            rows.push(row);
        }
    }

    let mut appended_rows = 0usize;
    for date in touched_sorted {
        let partition = layout.curated_partition(date);
        if !partition.exists() {
            warn!(date = %format_day(date), "no curated partition for touched date");
            continue;
        }
        let fresh = read_curated(&partition)?;
        appended_rows += fresh.len();
        rows.extend(fresh);
    }

    write_curated(&combined, &rows)?;
    let report = CompactReport {
        total_rows: rows.len(),
        appended_rows,
        dates_replaced: replaced_dates.len(),
        rebuilt: false,
    };
    info!(
        total = report.total_rows,
        appended = report.appended_rows,
        replaced = report.dates_replaced,
        "combined dataset updated"
    );
    Ok(report)
}

/// Initialization/repair path: rebuild the combined dataset from every
/// curated partition on disk, in date order.
pub fn rebuild_combined(layout: &DatasetLayout) -> Result<CompactReport> {
    let dates = partition_dates(&layout.curated_dir())?;
    let mut rows = Vec::new();
    for date in &dates {
        rows.extend(read_curated(&layout.curated_partition(*date))?);
    }
    write_curated(&layout.combined_path(), &rows)?;
    info!(partitions = dates.len(), rows = rows.len(), "combined dataset rebuilt");
    Ok(CompactReport {
        total_rows: rows.len(),
        appended_rows: rows.len(),
        dates_replaced: 0,
        rebuilt: true,
    })
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub keep_extracted: bool,
    pub full_file: bool,
    pub refresh_metadata: bool,
    pub raw_retention: usize,
    pub category_id: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            keep_extracted: false,
            full_file: false,
            refresh_metadata: false,
            raw_retention: RAW_RETENTION_DAYS,
            category_id: tcph_source::DEFAULT_CATEGORY_ID,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub days_ok: Vec<NaiveDate>,
    pub days_empty: Vec<NaiveDate>,
    pub days_failed: Vec<NaiveDate>,
    pub rows_written: usize,
    pub rows_skipped: usize,
    pub compaction: Option<CompactReport>,
}

impl RunSummary {
    pub fn failed(&self) -> bool {
        !self.days_failed.is_empty()
    }
}

struct DayReport {
    curated_rows: usize,
    rows_skipped: usize,
}

/// Sequential per-date driver: metadata snapshot first (fatal on failure),
/// then download → extract → normalize → merge per date with per-date
/// failure isolation, then retention and optional compaction.
pub struct Pipeline<'a> {
    layout: DatasetLayout,
    archive: &'a dyn ArchiveSource,
    metadata: &'a dyn MetadataSource,
    config: PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        layout: DatasetLayout,
        archive: &'a dyn ArchiveSource,
        metadata: &'a dyn MetadataSource,
        config: PipelineConfig,
    ) -> Self {
        Self {
            layout,
            archive,
            metadata,
            config,
        }
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    pub async fn run(&self, range: DateRange) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            start = %format_day(range.start),
            end = %format_day(range.end),
            step = range.step_days,
            "starting harvest run"
        );

        self.layout.ensure_base_dirs()?;
        let cache = MetadataCache::new(&self.layout, self.metadata, self.config.refresh_metadata);
        let meta = cache
            .snapshot()
            .await
            .context("metadata refresh failed, aborting run")?;

        let mut days_ok = Vec::new();
        let mut days_empty = Vec::new();
        let mut days_failed = Vec::new();
        let mut touched = Vec::new();
        let mut rows_written = 0usize;
        let mut rows_skipped = 0usize;

        for date in range {
            match self.process_day(date, &meta).await {
                Ok(report) => {
                    touched.push(date);
                    rows_written += report.curated_rows;
                    rows_skipped += report.rows_skipped;
                    if report.curated_rows == 0 {
                        days_empty.push(date);
                    } else {
                        days_ok.push(date);
                    }
                }
                Err(err) => {
                    warn!(date = %format_day(date), "date failed, continuing: {err:#}");
                    days_failed.push(date);
                }
            }
        }

        if let Err(err) = prune_raw_partitions(&self.layout, self.config.raw_retention) {
            warn!("raw partition retention failed: {err:#}");
        }
        if let Err(err) = remove_transient_dirs(&self.layout, self.config.keep_extracted) {
            warn!("transient directory cleanup failed: {err:#}");
        }

        let compaction = if self.config.full_file {
            Some(compact(&self.layout, &touched)?)
        } else {
            None
        };

        let finished_at = Utc::now();
        info!(
            ok = days_ok.len(),
            empty = days_empty.len(),
            failed = days_failed.len(),
            rows = rows_written,
            "run complete"
        );
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            days_ok,
            days_empty,
            days_failed,
            rows_written,
            rows_skipped,
            compaction,
        })
    }

    async fn process_day(&self, date: NaiveDate, meta: &MetadataSnapshot) -> Result<DayReport> {
        let bytes = match self.cached_archive(date).await? {
            Some(bytes) => Some(bytes),
            None => {
                let fetched = self.archive.fetch_day(date).await?;
                if let Some(bytes) = &fetched {
                    write_bytes_atomic(&self.layout.archive_path(date), bytes).await?;
                }
                fetched
            }
        };

        let group_root = match &bytes {
            Some(bytes) => Some(extract_day_archive(
                bytes,
                &self.layout.extracted_dir(),
                date,
                self.config.category_id,
            )?),
            None => {
                info!(date = %format_day(date), "no upstream archive, zero-row day");
                None
            }
        };

        let (rows, report) = normalize_day(&self.layout, date, group_root.as_deref())?;
        let curated_rows = merge_day(&self.layout, date, &rows, meta)?;
        info!(
            date = %format_day(date),
            rows = curated_rows,
            groups = report.groups_read,
            skipped_rows = report.rows_skipped,
            "date processed"
        );
        Ok(DayReport {
            curated_rows,
            rows_skipped: report.rows_skipped,
        })
    }

    /// Reuse an archive already downloaded by an earlier (possibly
    /// interrupted) run instead of re-fetching it.
    async fn cached_archive(&self, date: NaiveDate) -> Result<Option<Vec<u8>>> {
        let path = self.layout.archive_path(date);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading cached archive {}", path.display()))?;
                Ok(Some(bytes))
            }
            _ => Ok(None),
        }
    }
}
