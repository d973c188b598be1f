//! Retail transaction log ingestion and cleaning.
//!
//! Reads the raw Online Retail style CSV export into [`RawTransaction`]s and
//! applies the minimal cleaning the feature table expects:
//! - refunds and cancellations (`Quantity <= 0`) are dropped
//! - rows without a customer id are dropped
//! - customer ids serialized as floats (`12346.0`) are normalized to `12346`

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const COL_INVOICE: &str = "Invoice";
const COL_STOCK_CODE: &str = "StockCode";
const COL_CUSTOMER_ID: &str = "CustomerID";
const COL_CUSTOMER_ID_ALIAS: &str = "Customer ID";
const COL_QUANTITY: &str = "Quantity";
const COL_PRICE: &str = "Price";
const COL_INVOICE_DATE: &str = "InvoiceDate";
const COL_COUNTRY: &str = "Country";

const TIMESTAMP_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

/// One cleaned transaction line. Quantity is positive and the customer id is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub invoice_id: String,
    pub stock_code: String,
    pub customer_id: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub invoice_timestamp: NaiveDateTime,
    pub country: String,
}

impl Transaction {
    pub fn revenue(&self) -> f64 {
        self.quantity as f64 * self.unit_price
    }
}

/// A transaction line as exported, before cleaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub invoice_id: String,
    pub stock_code: String,
    pub customer_id: Option<String>,
    pub quantity: i64,
    pub unit_price: f64,
    pub invoice_timestamp: NaiveDateTime,
    pub country: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningReport {
    pub input_rows: u64,
    pub dropped_non_positive_quantity: u64,
    pub dropped_missing_customer: u64,
    pub output_rows: u64,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("input is missing required column {0}")]
    MissingColumn(&'static str),
    #[error("row {row}: failed to parse field {field} value '{value}'")]
    ParseField {
        row: u64,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    invoice: usize,
    stock_code: usize,
    customer_id: usize,
    quantity: usize,
    price: usize,
    invoice_date: usize,
    country: usize,
}

impl ColumnIndex {
    fn from_headers(headers: &StringRecord) -> Result<Self, IngestError> {
        let find = |name: &'static str| -> Result<usize, IngestError> {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or(IngestError::MissingColumn(name))
        };
        let customer_id = headers
            .iter()
            .position(|h| {
                let h = h.trim();
                h == COL_CUSTOMER_ID || h == COL_CUSTOMER_ID_ALIAS
            })
            .ok_or(IngestError::MissingColumn(COL_CUSTOMER_ID))?;

        Ok(Self {
            invoice: find(COL_INVOICE)?,
            stock_code: find(COL_STOCK_CODE)?,
            customer_id,
            quantity: find(COL_QUANTITY)?,
            price: find(COL_PRICE)?,
            invoice_date: find(COL_INVOICE_DATE)?,
            country: find(COL_COUNTRY)?,
        })
    }
}

pub fn load_raw_csv(path: &Path) -> Result<Vec<RawTransaction>, IngestError> {
    let file = File::open(path)?;
    let rows = read_raw_csv(file)?;
    info!(
        component = "transactions",
        event = "transactions.load.finish",
        path = %path.display(),
        rows = rows.len()
    );
    Ok(rows)
}

/// Parses a header-bearing CSV stream. Required columns are resolved before any
/// row is read, so a schema problem never yields a partial result.
pub fn read_raw_csv<R: Read>(reader: R) -> Result<Vec<RawTransaction>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let columns = ColumnIndex::from_headers(reader.headers()?)?;

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        // 1-based, counting the header line
        let row = idx as u64 + 2;
        rows.push(parse_raw_record(&record, &columns, row)?);
    }
    Ok(rows)
}

pub fn clean_raw(raw: Vec<RawTransaction>) -> (Vec<Transaction>, CleaningReport) {
    let mut report = CleaningReport {
        input_rows: raw.len() as u64,
        ..CleaningReport::default()
    };

    let mut out = Vec::with_capacity(raw.len());
    for row in raw {
        if row.quantity <= 0 {
            report.dropped_non_positive_quantity += 1;
            continue;
        }
        let Some(customer_id) = row.customer_id.as_deref().and_then(normalize_customer_id)
        else {
            report.dropped_missing_customer += 1;
            continue;
        };
        out.push(Transaction {
            invoice_id: row.invoice_id,
            stock_code: row.stock_code,
            customer_id,
            quantity: row.quantity,
            unit_price: row.unit_price,
            invoice_timestamp: row.invoice_timestamp,
            country: row.country,
        });
    }
    report.output_rows = out.len() as u64;

    info!(
        component = "transactions",
        event = "transactions.clean.finish",
        input_rows = report.input_rows,
        dropped_non_positive_quantity = report.dropped_non_positive_quantity,
        dropped_missing_customer = report.dropped_missing_customer,
        output_rows = report.output_rows
    );

    (out, report)
}

pub fn parse_invoice_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
}

fn normalize_customer_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return None;
    }
    if let Some((int_part, frac)) = trimmed.split_once('.') {
        let int_digits = !int_part.is_empty() && int_part.bytes().all(|b| b.is_ascii_digit());
        if int_digits && frac.bytes().all(|b| b == b'0') {
            return Some(int_part.to_string());
        }
    }
    Some(trimmed.to_string())
}

fn parse_raw_record(
    record: &StringRecord,
    columns: &ColumnIndex,
    row: u64,
) -> Result<RawTransaction, IngestError> {
    let date_raw = field(record, columns.invoice_date);
    let invoice_timestamp =
        parse_invoice_timestamp(date_raw).ok_or_else(|| IngestError::ParseField {
            row,
            field: COL_INVOICE_DATE,
            value: date_raw.to_string(),
        })?;

    let customer_raw = field(record, columns.customer_id).trim();
    let customer_id = (!customer_raw.is_empty()).then(|| customer_raw.to_string());

    Ok(RawTransaction {
        invoice_id: field(record, columns.invoice).trim().to_string(),
        stock_code: field(record, columns.stock_code).trim().to_string(),
        customer_id,
        quantity: parse_i64(record, columns.quantity, COL_QUANTITY, row)?,
        unit_price: parse_f64(record, columns.price, COL_PRICE, row)?,
        invoice_timestamp,
        country: field(record, columns.country).trim().to_string(),
    })
}

fn field(record: &StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or_default()
}

fn parse_i64(
    record: &StringRecord,
    idx: usize,
    field_name: &'static str,
    row: u64,
) -> Result<i64, IngestError> {
    let raw = field(record, idx).trim();
    raw.parse::<i64>().map_err(|_| IngestError::ParseField {
        row,
        field: field_name,
        value: raw.to_string(),
    })
}

fn parse_f64(
    record: &StringRecord,
    idx: usize,
    field_name: &'static str,
    row: u64,
) -> Result<f64, IngestError> {
    let raw = field(record, idx).trim();
    raw.parse::<f64>().map_err(|_| IngestError::ParseField {
        row,
        field: field_name,
        value: raw.to_string(),
    })
}
