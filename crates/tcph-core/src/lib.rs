//! Core domain model and date arithmetic for the price-history pipeline.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tcph-core";

/// Column/partition date format used everywhere a date is persisted.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

pub fn format_day(date: NaiveDate) -> String {
    date.format(DAY_FORMAT).to_string()
}

pub fn parse_day(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, DAY_FORMAT)
}

/// One normalized price observation: a (product, date, printing sub-key)
/// triple with the fixed set of nullable price points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub product_id: i64,
    pub group_id: i64,
    pub date: NaiveDate,
    pub sub_type_name: Option<String>,
    pub low_price: Option<f64>,
    pub mid_price: Option<f64>,
    pub high_price: Option<f64>,
    pub market_price: Option<f64>,
    pub direct_low_price: Option<f64>,
}

/// Product reference metadata, keyed by product id. Overwritten wholesale on
/// refresh, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: i64,
    pub name: String,
    pub clean_name: Option<String>,
    pub group_id: i64,
    pub category_id: Option<i64>,
    pub rarity: Option<String>,
    pub card_number: Option<String>,
}

/// Group (set) reference metadata, keyed by group id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: i64,
    pub name: String,
    pub abbreviation: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub category_id: Option<i64>,
}

/// A price row enriched with its (possibly absent) product and group
/// metadata. A missing metadata match leaves the fields null; the price
/// observation itself is never dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedRow {
    pub price: PriceRow,
    pub product_name: Option<String>,
    pub clean_name: Option<String>,
    pub category_id: Option<i64>,
    pub rarity: Option<String>,
    pub card_number: Option<String>,
    pub set_name: Option<String>,
    pub set_abbreviation: Option<String>,
    pub set_release_date: Option<NaiveDate>,
}

/// Inclusive date range stepped by a day stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub step_days: u32,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate, step_days: u32) -> Self {
        Self {
            start,
            end,
            step_days: step_days.max(1),
        }
    }

    pub fn daily(start: NaiveDate, end: NaiveDate) -> Self {
        Self::new(start, end, 1)
    }

    pub fn iter(&self) -> DateRangeIter {
        DateRangeIter {
            next: (self.start <= self.end).then_some(self.start),
            end: self.end,
            step_days: self.step_days.max(1),
        }
    }
}

impl IntoIterator for DateRange {
    type Item = NaiveDate;
    type IntoIter = DateRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct DateRangeIter {
    next: Option<NaiveDate>,
    end: NaiveDate,
    step_days: u32,
}

impl Iterator for DateRangeIter {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let current = self.next?;
        self.next = current
            .checked_add_days(Days::new(u64::from(self.step_days)))
            .filter(|d| *d <= self.end);
        Some(current)
    }
}
