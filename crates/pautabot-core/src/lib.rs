//! Core domain model for pautabot: purchase orders, ledger outcomes and the
//! durable reconciliation state.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "pautabot-core";

/// Globally unique identity of a purchase order: (fiscal year, order number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub fiscal_year: i32,
    pub order_number: u64,
}

impl NaturalKey {
    pub fn new(fiscal_year: i32, order_number: u64) -> Self {
        Self {
            fiscal_year,
            order_number,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fiscal_year, self.order_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized purchase date {0:?} (expected dd/mm/yyyy, dd-mm-yyyy or yyyy-mm-dd)")]
pub struct DateParseError(pub String);

/// Order date. The remote feed reports day-month-year; persisted as `dd/mm/yyyy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PurchaseDate(NaiveDate);

impl PurchaseDate {
    const PERSISTED_FORMAT: &'static str = "%d/%m/%Y";
    const ACCEPTED_FORMATS: [&'static str; 3] = ["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d"];

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn parse(input: &str) -> Result<Self, DateParseError> {
        // Some feeds append a time component ("2023-01-05T00:00:00", "05/01/2023 00:00").
        let date_part = input
            .trim()
            .split(|c| c == 'T' || c == ' ')
            .next()
            .unwrap_or_default();
        Self::ACCEPTED_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
            .map(Self)
            .ok_or_else(|| DateParseError(input.to_string()))
    }

    pub fn naive(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for PurchaseDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::PERSISTED_FORMAT))
    }
}

impl Serialize for PurchaseDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PurchaseDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PurchaseDate::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Numeric fields in the open-data feeds arrive either as JSON numbers or as strings.
mod lenient {
    use serde::{de::Error, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    pub fn i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => i32::try_from(v).map_err(D::Error::custom),
            Raw::Float(v) if v.fract() == 0.0 => Ok(v as i32),
            Raw::Float(v) => Err(D::Error::custom(format!("expected integer, got {v}"))),
            Raw::Text(s) => s.trim().parse().map_err(D::Error::custom),
        }
    }

    pub fn u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => u64::try_from(v).map_err(D::Error::custom),
            Raw::Float(v) if v.fract() == 0.0 && v >= 0.0 => Ok(v as u64),
            Raw::Float(v) => Err(D::Error::custom(format!("expected order number, got {v}"))),
            Raw::Text(s) => s.trim().parse().map_err(D::Error::custom),
        }
    }

    pub fn f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => Ok(v as f64),
            Raw::Float(v) => Ok(v),
            Raw::Text(s) => super::parse_amount(&s)
                .ok_or_else(|| D::Error::custom(format!("invalid amount {s:?}"))),
        }
    }
}

/// Parses an amount written either as `1234.5` or with a decimal comma `1234,5`.
pub fn parse_amount(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }
    if trimmed.contains(',') && !trimmed.contains('.') {
        return trimmed.replace(',', ".").parse().ok();
    }
    None
}

/// One procurement order as published in the catalog feed. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    #[serde(rename = "ejercicio", deserialize_with = "lenient::i32")]
    pub fiscal_year: i32,
    #[serde(rename = "ordencompra", deserialize_with = "lenient::u64")]
    pub order_number: u64,
    #[serde(rename = "fecha")]
    pub date: PurchaseDate,
    #[serde(rename = "importe", deserialize_with = "lenient::f64")]
    pub amount: f64,
    #[serde(rename = "proveedor")]
    pub seller: String,
    #[serde(rename = "dependencia")]
    pub department: String,
    #[serde(rename = "expediente", default)]
    pub docket: String,
}

impl Purchase {
    pub fn key(&self) -> NaturalKey {
        NaturalKey::new(self.fiscal_year, self.order_number)
    }
}

/// What happened to a purchase the one time it was looked at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Processed { notification_id: String },
    Dropped,
    Error { reason: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Processed { .. } => "processed",
            Outcome::Dropped => "dropped",
            Outcome::Error { .. } => "error",
        }
    }

    pub fn notification_id(&self) -> Option<&str> {
        match self {
            Outcome::Processed { notification_id } => Some(notification_id),
            _ => None,
        }
    }
}

/// Ledger entry: the purchase as it was fetched plus the recorded outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedPurchase {
    pub purchase: Purchase,
    pub processed_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl ProcessedPurchase {
    pub fn key(&self) -> NaturalKey {
        self.purchase.key()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellerTotal {
    #[serde(rename = "proveedor")]
    pub seller: String,
    #[serde(rename = "monto", deserialize_with = "lenient::f64")]
    pub amount: f64,
}

/// Seller -> cumulative spend, in the order sellers first appeared in the feed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<SellerTotal>", into = "Vec<SellerTotal>")]
pub struct SellerTotals {
    entries: Vec<SellerTotal>,
}

impl SellerTotals {
    /// Repeated sellers keep their first position and take the last amount.
    pub fn from_rows(rows: impl IntoIterator<Item = SellerTotal>) -> Self {
        let mut entries: Vec<SellerTotal> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for row in rows {
            match positions.get(&row.seller) {
                Some(&idx) => entries[idx].amount = row.amount,
                None => {
                    positions.insert(row.seller.clone(), entries.len());
                    entries.push(row);
                }
            }
        }
        Self { entries }
    }

    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self::from_rows(pairs.into_iter().map(|(seller, amount)| SellerTotal {
            seller: seller.into(),
            amount,
        }))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|e| (e.seller.as_str(), e.amount))
    }

    pub fn get(&self, seller: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.seller == seller)
            .map(|e| e.amount)
    }

    pub fn as_lookup(&self) -> HashMap<&str, f64> {
        self.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<SellerTotal>> for SellerTotals {
    fn from(rows: Vec<SellerTotal>) -> Self {
        Self::from_rows(rows)
    }
}

impl From<SellerTotals> for Vec<SellerTotal> {
    fn from(totals: SellerTotals) -> Self {
        totals.entries
    }
}

/// The single unit of durable state carried from one cycle to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub last_run: DateTime<Utc>,
    pub totals: SellerTotals,
    pub catalog: Vec<Purchase>,
    ledger: Vec<ProcessedPurchase>,
}

impl ReconciliationState {
    pub fn new(
        last_run: DateTime<Utc>,
        totals: SellerTotals,
        catalog: Vec<Purchase>,
        ledger: Vec<ProcessedPurchase>,
    ) -> Self {
        Self {
            last_run,
            totals,
            catalog,
            ledger,
        }
    }

    pub fn empty(now: DateTime<Utc>) -> Self {
        Self::new(now, SellerTotals::default(), Vec::new(), Vec::new())
    }

    /// Append-only view of every outcome ever recorded.
    pub fn ledger(&self) -> &[ProcessedPurchase] {
        &self.ledger
    }

    pub fn record(&mut self, entry: ProcessedPurchase) {
        self.ledger.push(entry);
    }

    pub fn ledger_entry(&self, key: NaturalKey) -> Option<&ProcessedPurchase> {
        self.ledger.iter().find(|entry| entry.key() == key)
    }
}
