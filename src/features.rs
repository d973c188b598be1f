//! Per-customer feature table built from a cleaned transaction log.
//!
//! The table is a pure function of the log: every call regroups the whole
//! input, there is no incremental state. Sub-tables are keyed by customer id
//! and left-joined onto the customer aggregates in a fixed order.
//!
//! Ordering rules:
//! - customers are emitted in lexicographic customer id order
//! - within a customer, transactions are ordered by timestamp, ties keep input order
//! - a customer's country is the one on its first record in input order
//! - day differences are whole days, truncated (`23h59m` is `0` days)
//! - weekdays count from Monday = 0

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoder::{CountryEncoder, Encoded, UnseenCategoryPolicy};
use crate::transactions::Transaction;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const NO_EVENT_SENTINEL: i64 = 999;

pub const COL_CUSTOMER_ID: &str = "customer_id";
pub const COL_FIRST_DATE: &str = "first_date";
pub const COL_LAST_DATE: &str = "last_date";
pub const COL_DAYS_TO_REPURCHASE: &str = "days_to_repurchase";
pub const COL_RECENCY_2ND: &str = "recency_2nd";

/// `did_repurchase_{h}d`; the default horizon gives `did_repurchase_7d`.
pub fn label_column_name(horizon_days: u32) -> String {
    format!("did_repurchase_{horizon_days}d")
}

pub fn rfm_frequency_column_name(window_days: u32) -> String {
    format!("freq_{window_days}d")
}

pub fn rfm_monetary_column_name(window_days: u32) -> String {
    format!("monetary_{window_days}d")
}

pub fn diversity_window_column_name(window_days: u32) -> String {
    format!("diversity_{window_days}d")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    Str,
    I64,
    F64,
    Bool,
    DateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnRole {
    Identity,
    Label,
    /// Derived from the full history; must not be fed to a model.
    Leakage,
    Feature,
}

/// Value used for a customer the joined sub-table has no row for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillPolicy {
    Zero,
    /// "No qualifying event observed"; distinct from a real gap of 0 days.
    Sentinel(i64),
}

impl FillPolicy {
    pub fn fill_value(self) -> i64 {
        match self {
            Self::Zero => 0,
            Self::Sentinel(sentinel) => sentinel,
        }
    }

    pub fn fill_i64(self, value: Option<i64>) -> i64 {
        value.unwrap_or(self.fill_value())
    }

    pub fn fill_f64(self, value: Option<f64>) -> f64 {
        value.unwrap_or(self.fill_value() as f64)
    }

    /// Unsigned counts; a fill value that does not fit the type becomes 0.
    pub fn fill_count<T>(self, value: Option<T>) -> T
    where
        T: TryFrom<i64> + Default,
    {
        value.unwrap_or_else(|| T::try_from(self.fill_value()).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
    pub role: ColumnRole,
    pub fill: Option<FillPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTableConfig {
    pub rfm_window_days: u32,
    pub diversity_window_days: u32,
    pub repurchase_horizon_days: u32,
    pub no_event_sentinel: i64,
    pub unseen_category: UnseenCategoryPolicy,
    pub schema_version: u32,
}

impl Default for FeatureTableConfig {
    fn default() -> Self {
        Self {
            rfm_window_days: 3,
            diversity_window_days: 7,
            repurchase_horizon_days: 7,
            no_event_sentinel: NO_EVENT_SENTINEL,
            unseen_category: UnseenCategoryPolicy::AllZero,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("input row {row} violates the transaction contract: {reason}")]
    InputSchema { row: usize, reason: String },
    #[error("invalid feature table config: {0}")]
    InvalidConfig(String),
    #[error("country '{0}' is not in the pinned vocabulary")]
    UnseenCategory(String),
    #[error("column {0} is not numeric and cannot be a model input")]
    NonNumericFeature(String),
    #[error("total quantity for customer {customer_id} overflows i64")]
    QuantityOverflow { customer_id: String },
    #[error("row for customer {customer_id} has {found} cells, schema has {expected} columns")]
    RowWidth {
        customer_id: String,
        found: usize,
        expected: usize,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("vocabulary I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("vocabulary JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerAggregate {
    pub customer_id: String,
    pub total_orders: u64,
    pub total_quantity: i64,
    pub first_date: NaiveDateTime,
    pub last_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstTransaction {
    pub invoice_timestamp: NaiveDateTime,
    pub first_quantity: i64,
    pub first_revenue: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RfmWindow {
    pub frequency: u64,
    pub monetary: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstPurchaseTime {
    pub hour: u32,
    pub weekday: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepurchaseLabel {
    pub did_repurchase: u8,
    pub days_to_repurchase: i64,
}

/// Field names are horizon/window neutral; the schema carries the configured
/// column names (`freq_3d`, `diversity_7d`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerFeatureRow {
    pub customer_id: String,
    pub did_repurchase: u8,
    pub first_date: NaiveDateTime,
    pub last_date: NaiveDateTime,
    pub days_to_repurchase: i64,
    pub total_orders: u64,
    pub total_quantity: i64,
    pub first_quantity: i64,
    pub first_revenue: f64,
    pub diversity_first_day: u64,
    /// Aligned with the encoder vocabulary.
    pub countries: Vec<bool>,
    pub recency_2nd: i64,
    pub freq_window: u64,
    pub monetary_window: f64,
    pub first_hour: u32,
    pub first_dow: u32,
    pub diversity_window: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue<'a> {
    Str(&'a str),
    I64(i64),
    F64(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

impl FeatureValue<'_> {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::I64(v) => Some(*v as f64),
            Self::F64(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Str(_) | Self::DateTime(_) => None,
        }
    }
}

impl CustomerFeatureRow {
    /// Cells in schema column order.
    pub fn cells(&self) -> Vec<FeatureValue<'_>> {
        let mut cells = vec![
            FeatureValue::Str(&self.customer_id),
            FeatureValue::I64(i64::from(self.did_repurchase)),
            FeatureValue::DateTime(self.first_date),
            FeatureValue::DateTime(self.last_date),
            FeatureValue::I64(self.days_to_repurchase),
            FeatureValue::I64(self.total_orders as i64),
            FeatureValue::I64(self.total_quantity),
            FeatureValue::I64(self.first_quantity),
            FeatureValue::F64(self.first_revenue),
            FeatureValue::I64(self.diversity_first_day as i64),
        ];
        cells.extend(self.countries.iter().map(|v| FeatureValue::Bool(*v)));
        cells.extend([
            FeatureValue::I64(self.recency_2nd),
            FeatureValue::I64(self.freq_window as i64),
            FeatureValue::F64(self.monetary_window),
            FeatureValue::I64(i64::from(self.first_hour)),
            FeatureValue::I64(i64::from(self.first_dow)),
            FeatureValue::I64(self.diversity_window as i64),
        ]);
        cells
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTableReport {
    pub input_rows: u64,
    pub customers: u64,
    pub single_purchase_customers: u64,
    pub repurchased_customers: u64,
    pub unseen_country_customers: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub encoder: CountryEncoder,
    pub rows: Vec<CustomerFeatureRow>,
    pub report: FeatureTableReport,
}

/// Model-facing projection: feature columns only, label split out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInputs {
    pub customer_ids: Vec<String>,
    pub feature_names: Vec<String>,
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<u8>,
}

impl FeatureTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, customer_id: &str) -> Option<&CustomerFeatureRow> {
        self.rows
            .binary_search_by(|r| r.customer_id.as_str().cmp(customer_id))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn model_inputs(&self) -> Result<ModelInputs, FeatureError> {
        let feature_idx: Vec<usize> = self
            .schema
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.role == ColumnRole::Feature)
            .map(|(idx, _)| idx)
            .collect();
        let feature_names = feature_idx
            .iter()
            .map(|idx| self.schema.columns[*idx].name.clone())
            .collect();

        let expected = self.schema.columns.len();
        let mut features = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let cells = row.cells();
            if cells.len() != expected {
                return Err(FeatureError::RowWidth {
                    customer_id: row.customer_id.clone(),
                    found: cells.len(),
                    expected,
                });
            }
            let mut values = Vec::with_capacity(feature_idx.len());
            for idx in &feature_idx {
                let value = cells[*idx].as_f64().ok_or_else(|| {
                    FeatureError::NonNumericFeature(self.schema.columns[*idx].name.clone())
                })?;
                values.push(value);
            }
            features.push(values);
        }

        Ok(ModelInputs {
            customer_ids: self.rows.iter().map(|r| r.customer_id.clone()).collect(),
            feature_names,
            features,
            labels: self.rows.iter().map(|r| r.did_repurchase).collect(),
        })
    }
}

/// Fits the country vocabulary on this log and builds the table.
pub fn build_feature_table(
    log: &[Transaction],
    cfg: &FeatureTableConfig,
) -> Result<FeatureTable, FeatureError> {
    validate_config(cfg)?;
    validate_transactions(log)?;
    let countries = first_countries(log);
    let encoder = CountryEncoder::fit(countries.values(), cfg.unseen_category);
    assemble(log, cfg, encoder, countries)
}

/// Builds the table against a vocabulary pinned at training time. The config's
/// unseen-category policy overrides the one stored with the vocabulary.
pub fn build_feature_table_with_encoder(
    log: &[Transaction],
    cfg: &FeatureTableConfig,
    encoder: &CountryEncoder,
) -> Result<FeatureTable, FeatureError> {
    validate_config(cfg)?;
    validate_transactions(log)?;
    let countries = first_countries(log);
    let encoder = encoder.clone().with_unseen_policy(cfg.unseen_category);
    assemble(log, cfg, encoder, countries)
}

pub fn build_feature_schema(cfg: &FeatureTableConfig, encoder: &CountryEncoder) -> FeatureSchema {
    use ColumnRole::{Feature, Identity, Label, Leakage};
    use FeatureDType::{Bool, DateTime, Str, F64, I64};

    fn column(
        name: &str,
        dtype: FeatureDType,
        role: ColumnRole,
        fill: Option<FillPolicy>,
    ) -> FeatureColumn {
        FeatureColumn {
            name: name.to_string(),
            dtype,
            role,
            fill,
        }
    }

    let zero = Some(FillPolicy::Zero);
    let sentinel = Some(FillPolicy::Sentinel(cfg.no_event_sentinel));

    let mut columns = vec![
        column(COL_CUSTOMER_ID, Str, Identity, None),
        column(&label_column_name(cfg.repurchase_horizon_days), I64, Label, None),
        column(COL_FIRST_DATE, DateTime, Leakage, None),
        column(COL_LAST_DATE, DateTime, Leakage, None),
        column(COL_DAYS_TO_REPURCHASE, I64, Leakage, sentinel),
        column("total_orders", I64, Feature, zero),
        column("total_quantity", I64, Feature, zero),
        column("first_quantity", I64, Feature, zero),
        column("first_revenue", F64, Feature, zero),
        column("diversity_first_day", I64, Feature, zero),
    ];
    for name in encoder.column_names() {
        columns.push(column(&name, Bool, Feature, zero));
    }
    columns.extend([
        column(COL_RECENCY_2ND, I64, Feature, sentinel),
        column(&rfm_frequency_column_name(cfg.rfm_window_days), I64, Feature, zero),
        column(&rfm_monetary_column_name(cfg.rfm_window_days), F64, Feature, zero),
        column("first_hour", I64, Feature, zero),
        column("first_dow", I64, Feature, zero),
        column(
            &diversity_window_column_name(cfg.diversity_window_days),
            I64,
            Feature,
            zero,
        ),
    ]);

    let fingerprint = schema_fingerprint(cfg, &columns);
    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

pub fn validate_transactions(log: &[Transaction]) -> Result<(), FeatureError> {
    for (row, tx) in log.iter().enumerate() {
        let reason = if tx.customer_id.trim().is_empty() {
            Some("customer_id is empty".to_string())
        } else if tx.quantity <= 0 {
            Some(format!("quantity must be > 0, got {}", tx.quantity))
        } else if !tx.unit_price.is_finite() || tx.unit_price < 0.0 {
            Some(format!(
                "unit_price must be finite and >= 0, got {}",
                tx.unit_price
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(FeatureError::InputSchema { row, reason });
        }
    }
    Ok(())
}

/// One aggregate per distinct customer, ordered by customer id.
pub fn aggregate_customers(
    log: &[Transaction],
) -> Result<Vec<CustomerAggregate>, FeatureError> {
    struct Acc<'a> {
        invoices: BTreeSet<&'a str>,
        total_quantity: i64,
        first_date: NaiveDateTime,
        last_date: NaiveDateTime,
    }

    let mut groups: BTreeMap<&str, Acc<'_>> = BTreeMap::new();
    for tx in log {
        let ts = tx.invoice_timestamp;
        let acc = groups.entry(tx.customer_id.as_str()).or_insert_with(|| Acc {
            invoices: BTreeSet::new(),
            total_quantity: 0,
            first_date: ts,
            last_date: ts,
        });
        acc.invoices.insert(tx.invoice_id.as_str());
        acc.total_quantity = acc.total_quantity.checked_add(tx.quantity).ok_or_else(|| {
            FeatureError::QuantityOverflow {
                customer_id: tx.customer_id.clone(),
            }
        })?;
        acc.first_date = acc.first_date.min(ts);
        acc.last_date = acc.last_date.max(ts);
    }

    Ok(groups
        .into_iter()
        .map(|(customer_id, acc)| CustomerAggregate {
            customer_id: customer_id.to_string(),
            total_orders: acc.invoices.len() as u64,
            total_quantity: acc.total_quantity,
            first_date: acc.first_date,
            last_date: acc.last_date,
        })
        .collect())
}

pub fn first_transactions(log: &[Transaction]) -> BTreeMap<String, FirstTransaction> {
    customer_timelines(log)
        .into_iter()
        .filter_map(|(customer_id, txs)| {
            let first = txs.first()?;
            Some((
                customer_id.to_string(),
                FirstTransaction {
                    invoice_timestamp: first.invoice_timestamp,
                    first_quantity: first.quantity,
                    first_revenue: first.revenue(),
                },
            ))
        })
        .collect()
}

pub fn first_dates(aggregates: &[CustomerAggregate]) -> BTreeMap<String, NaiveDateTime> {
    aggregates
        .iter()
        .map(|a| (a.customer_id.clone(), a.first_date))
        .collect()
}

/// Distinct stock codes bought on the calendar day of the first purchase.
pub fn diversity_first_day(
    log: &[Transaction],
    first_dates: &BTreeMap<String, NaiveDateTime>,
) -> BTreeMap<String, u64> {
    distinct_stock_codes(log, |tx| {
        first_dates
            .get(tx.customer_id.as_str())
            .is_some_and(|first| tx.invoice_timestamp.date() == first.date())
    })
}

/// Whole days between the first and second transaction; absent for one-purchase customers.
pub fn recency_to_second_purchase(log: &[Transaction]) -> BTreeMap<String, i64> {
    customer_timelines(log)
        .into_iter()
        .filter_map(|(customer_id, txs)| match txs.as_slice() {
            [first, second, ..] => Some((
                customer_id.to_string(),
                whole_days(second.invoice_timestamp, first.invoice_timestamp),
            )),
            _ => None,
        })
        .collect()
}

pub fn rfm_window(
    log: &[Transaction],
    first_dates: &BTreeMap<String, NaiveDateTime>,
    window_days: u32,
) -> BTreeMap<String, RfmWindow> {
    let mut groups: BTreeMap<&str, (BTreeSet<&str>, f64)> = BTreeMap::new();
    for tx in log {
        if !within_window(tx, first_dates, window_days) {
            continue;
        }
        let entry = groups.entry(tx.customer_id.as_str()).or_default();
        entry.0.insert(tx.invoice_id.as_str());
        entry.1 += tx.revenue();
    }

    groups
        .into_iter()
        .map(|(customer_id, (invoices, monetary))| {
            (
                customer_id.to_string(),
                RfmWindow {
                    frequency: invoices.len() as u64,
                    monetary,
                },
            )
        })
        .collect()
}

pub fn first_purchase_time(
    firsts: &BTreeMap<String, FirstTransaction>,
) -> BTreeMap<String, FirstPurchaseTime> {
    firsts
        .iter()
        .map(|(customer_id, first)| {
            let ts = first.invoice_timestamp;
            (
                customer_id.clone(),
                FirstPurchaseTime {
                    hour: ts.hour(),
                    weekday: ts.weekday().num_days_from_monday(),
                },
            )
        })
        .collect()
}

pub fn diversity_window(
    log: &[Transaction],
    first_dates: &BTreeMap<String, NaiveDateTime>,
    window_days: u32,
) -> BTreeMap<String, u64> {
    distinct_stock_codes(log, |tx| within_window(tx, first_dates, window_days))
}

/// Country on each customer's first record in input order.
pub fn first_countries(log: &[Transaction]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for tx in log {
        out.entry(tx.customer_id.clone())
            .or_insert_with(|| tx.country.clone());
    }
    out
}

/// Label and days-to-repurchase from a customer's timestamps sorted ascending.
///
/// Both values derive from the minimum whole-day gap between consecutive
/// transactions. With fewer than two transactions there is no gap: the label is
/// 0 and the day count is the sentinel.
pub fn repurchase_label(
    sorted_timestamps: &[NaiveDateTime],
    horizon_days: u32,
    sentinel: i64,
) -> RepurchaseLabel {
    let min_gap = sorted_timestamps
        .windows(2)
        .map(|pair| whole_days(pair[1], pair[0]))
        .min();

    match min_gap {
        Some(gap) => RepurchaseLabel {
            did_repurchase: u8::from(gap <= i64::from(horizon_days)),
            days_to_repurchase: gap,
        },
        None => RepurchaseLabel {
            did_repurchase: 0,
            days_to_repurchase: sentinel,
        },
    }
}

fn assemble(
    log: &[Transaction],
    cfg: &FeatureTableConfig,
    encoder: CountryEncoder,
    countries: BTreeMap<String, String>,
) -> Result<FeatureTable, FeatureError> {
    info!(
        component = "features",
        event = "features.table.start",
        input_rows = log.len(),
        rfm_window_days = cfg.rfm_window_days,
        diversity_window_days = cfg.diversity_window_days,
        repurchase_horizon_days = cfg.repurchase_horizon_days,
        vocabulary_size = encoder.categories().len(),
        unseen_category = ?encoder.unseen_policy()
    );

    let schema = build_feature_schema(cfg, &encoder);
    let fills = RowFills::from_schema(&schema, cfg);

    let aggregates = aggregate_customers(log)?;
    let starts = first_dates(&aggregates);
    let firsts = first_transactions(log);
    let diversity_fd = diversity_first_day(log, &starts);
    let recency = recency_to_second_purchase(log);
    let rfm = rfm_window(log, &starts, cfg.rfm_window_days);
    let times = first_purchase_time(&firsts);
    let diversity_w = diversity_window(log, &starts, cfg.diversity_window_days);
    let timelines = customer_timelines(log);

    debug!(
        component = "features",
        event = "features.calculators.done",
        customers = aggregates.len(),
        first_day_rows = diversity_fd.len(),
        recency_rows = recency.len(),
        rfm_rows = rfm.len(),
        diversity_window_rows = diversity_w.len()
    );

    let mut report = FeatureTableReport {
        input_rows: log.len() as u64,
        customers: aggregates.len() as u64,
        ..FeatureTableReport::default()
    };
    let mut unseen: BTreeSet<&str> = BTreeSet::new();

    let mut rows = Vec::with_capacity(aggregates.len());
    for agg in &aggregates {
        let id = agg.customer_id.as_str();
        let first = firsts.get(id);
        let rfm_row = rfm.get(id);
        let time = times.get(id);

        let country_columns = match countries.get(id) {
            Some(country) => match encoder.encode(country)? {
                Encoded::Known(columns) => columns,
                Encoded::Unseen(columns) => {
                    unseen.insert(country.as_str());
                    report.unseen_country_customers += 1;
                    columns
                }
            },
            None => vec![false; encoder.categories().len()],
        };

        let timestamps: Vec<NaiveDateTime> = timelines
            .get(id)
            .map(|txs| txs.iter().map(|tx| tx.invoice_timestamp).collect())
            .unwrap_or_default();
        let label = repurchase_label(
            &timestamps,
            cfg.repurchase_horizon_days,
            fills.days_to_repurchase.fill_value(),
        );
        if timestamps.len() < 2 {
            report.single_purchase_customers += 1;
        }
        report.repurchased_customers += u64::from(label.did_repurchase);

        rows.push(CustomerFeatureRow {
            customer_id: agg.customer_id.clone(),
            did_repurchase: label.did_repurchase,
            first_date: agg.first_date,
            last_date: agg.last_date,
            days_to_repurchase: label.days_to_repurchase,
            total_orders: agg.total_orders,
            total_quantity: agg.total_quantity,
            first_quantity: fills.first_quantity.fill_i64(first.map(|f| f.first_quantity)),
            first_revenue: fills.first_revenue.fill_f64(first.map(|f| f.first_revenue)),
            diversity_first_day: fills
                .diversity_first_day
                .fill_count(diversity_fd.get(id).copied()),
            countries: country_columns,
            recency_2nd: fills.recency_2nd.fill_i64(recency.get(id).copied()),
            freq_window: fills.freq_window.fill_count(rfm_row.map(|r| r.frequency)),
            monetary_window: fills.monetary_window.fill_f64(rfm_row.map(|r| r.monetary)),
            first_hour: fills.first_hour.fill_count(time.map(|t| t.hour)),
            first_dow: fills.first_dow.fill_count(time.map(|t| t.weekday)),
            diversity_window: fills
                .diversity_window
                .fill_count(diversity_w.get(id).copied()),
        });
    }

    if !unseen.is_empty() {
        warn!(
            component = "features",
            event = "features.encoder.unseen_category",
            customers = report.unseen_country_customers,
            countries = ?unseen,
            policy = ?encoder.unseen_policy()
        );
    }

    info!(
        component = "features",
        event = "features.table.finish",
        customers = report.customers,
        single_purchase_customers = report.single_purchase_customers,
        repurchased_customers = report.repurchased_customers,
        column_count = schema.columns.len(),
        fingerprint = %schema.fingerprint
    );

    Ok(FeatureTable {
        schema,
        encoder,
        rows,
        report,
    })
}

/// Fill policies of the joined columns, read back from the schema so the values
/// written always match what the schema declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowFills {
    days_to_repurchase: FillPolicy,
    first_quantity: FillPolicy,
    first_revenue: FillPolicy,
    diversity_first_day: FillPolicy,
    recency_2nd: FillPolicy,
    freq_window: FillPolicy,
    monetary_window: FillPolicy,
    first_hour: FillPolicy,
    first_dow: FillPolicy,
    diversity_window: FillPolicy,
}

impl RowFills {
    fn from_schema(schema: &FeatureSchema, cfg: &FeatureTableConfig) -> Self {
        let fill = |name: &str| {
            schema
                .column_index(name)
                .and_then(|idx| schema.columns[idx].fill)
                .unwrap_or(FillPolicy::Zero)
        };
        Self {
            days_to_repurchase: fill(COL_DAYS_TO_REPURCHASE),
            first_quantity: fill("first_quantity"),
            first_revenue: fill("first_revenue"),
            diversity_first_day: fill("diversity_first_day"),
            recency_2nd: fill(COL_RECENCY_2ND),
            freq_window: fill(rfm_frequency_column_name(cfg.rfm_window_days).as_str()),
            monetary_window: fill(rfm_monetary_column_name(cfg.rfm_window_days).as_str()),
            first_hour: fill("first_hour"),
            first_dow: fill("first_dow"),
            diversity_window: fill(
                diversity_window_column_name(cfg.diversity_window_days).as_str(),
            ),
        }
    }
}

fn validate_config(cfg: &FeatureTableConfig) -> Result<(), FeatureError> {
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }
    if cfg.rfm_window_days == 0
        || cfg.diversity_window_days == 0
        || cfg.repurchase_horizon_days == 0
    {
        return Err(FeatureError::InvalidConfig(
            "window and horizon lengths must be > 0 days".to_string(),
        ));
    }
    if cfg.no_event_sentinel <= 0 {
        return Err(FeatureError::InvalidConfig(
            "no_event_sentinel must be > 0 so it cannot collide with a real gap".to_string(),
        ));
    }
    Ok(())
}

/// Per customer, transactions ordered by timestamp. `sort_by_key` is stable, so
/// equal timestamps keep their input order.
fn customer_timelines(log: &[Transaction]) -> BTreeMap<&str, Vec<&Transaction>> {
    let mut groups: BTreeMap<&str, Vec<&Transaction>> = BTreeMap::new();
    for tx in log {
        groups.entry(tx.customer_id.as_str()).or_default().push(tx);
    }
    for txs in groups.values_mut() {
        txs.sort_by_key(|tx| tx.invoice_timestamp);
    }
    groups
}

fn distinct_stock_codes(
    log: &[Transaction],
    keep: impl Fn(&Transaction) -> bool,
) -> BTreeMap<String, u64> {
    let mut groups: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for tx in log.iter().filter(|tx| keep(tx)) {
        groups
            .entry(tx.customer_id.as_str())
            .or_default()
            .insert(tx.stock_code.as_str());
    }
    groups
        .into_iter()
        .map(|(customer_id, codes)| (customer_id.to_string(), codes.len() as u64))
        .collect()
}

fn within_window(
    tx: &Transaction,
    first_dates: &BTreeMap<String, NaiveDateTime>,
    window_days: u32,
) -> bool {
    first_dates
        .get(tx.customer_id.as_str())
        .is_some_and(|first| {
            whole_days(tx.invoice_timestamp, *first) <= i64::from(window_days)
        })
}

fn whole_days(later: NaiveDateTime, earlier: NaiveDateTime) -> i64 {
    (later - earlier).num_days()
}

fn schema_fingerprint(cfg: &FeatureTableConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("sentinel:{};", cfg.no_event_sentinel));
    hasher.update(format!(
        "horizon:{};rfm:{};diversity:{};",
        cfg.repurchase_horizon_days, cfg.rfm_window_days, cfg.diversity_window_days
    ));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{:?}:{:?};", column.dtype, column.role));
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2011, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn tx(customer: &str, invoice: &str, stock: &str, ts: NaiveDateTime) -> Transaction {
        Transaction {
            invoice_id: invoice.to_string(),
            stock_code: stock.to_string(),
            customer_id: customer.to_string(),
            quantity: 1,
            unit_price: 1.0,
            invoice_timestamp: ts,
            country: "UK".to_string(),
        }
    }

    #[test]
    fn repurchase_label_uses_minimum_consecutive_gap() {
        let label = repurchase_label(&[at(1, 9), at(20, 9), at(25, 9)], 7, NO_EVENT_SENTINEL);
        assert_eq!(
            label,
            RepurchaseLabel {
                did_repurchase: 1,
                days_to_repurchase: 5
            }
        );

        let far = repurchase_label(&[at(1, 9), at(10, 9)], 7, NO_EVENT_SENTINEL);
        assert_eq!(far.did_repurchase, 0);
        assert_eq!(far.days_to_repurchase, 9);

        let single = repurchase_label(&[at(1, 9)], 7, NO_EVENT_SENTINEL);
        assert_eq!(single.did_repurchase, 0);
        assert_eq!(single.days_to_repurchase, NO_EVENT_SENTINEL);
    }

    #[test]
    fn horizon_boundary_is_inclusive() {
        let label = repurchase_label(&[at(1, 9), at(8, 9)], 7, NO_EVENT_SENTINEL);
        assert_eq!(label.days_to_repurchase, 7);
        assert_eq!(label.did_repurchase, 1);
    }

    #[test]
    fn day_difference_truncates_partial_days() {
        assert_eq!(whole_days(at(2, 8), at(1, 9)), 0);
        assert_eq!(whole_days(at(2, 9), at(1, 9)), 1);
    }

    #[test]
    fn first_transaction_ties_keep_input_order() {
        let mut a = tx("1", "A", "X", at(1, 9));
        a.quantity = 4;
        let mut b = tx("1", "B", "Y", at(1, 9));
        b.quantity = 9;
        let firsts = first_transactions(&[a.clone(), b.clone()]);
        assert_eq!(firsts["1"].first_quantity, 4);

        let swapped = first_transactions(&[b, a]);
        assert_eq!(swapped["1"].first_quantity, 9);
    }

    #[test]
    fn sentinel_fill_is_distinct_from_zero_fill() {
        assert_eq!(FillPolicy::Zero.fill_i64(None), 0);
        assert_eq!(FillPolicy::Sentinel(999).fill_i64(None), 999);
        assert_eq!(FillPolicy::Sentinel(999).fill_i64(Some(0)), 0);
    }

    #[test]
    fn windows_are_inclusive_of_the_boundary_day() {
        let log = vec![
            tx("1", "A", "X", at(1, 9)),
            tx("1", "B", "Y", at(4, 9)),
            tx("1", "C", "Z", at(5, 9)),
        ];
        let starts = first_dates(&aggregate_customers(&log).unwrap());
        let rfm = rfm_window(&log, &starts, 3);
        assert_eq!(rfm["1"].frequency, 2);
        assert!((rfm["1"].monetary - 2.0).abs() < 1e-12);
        assert_eq!(diversity_window(&log, &starts, 3)["1"], 2);
        assert_eq!(diversity_window(&log, &starts, 7)["1"], 3);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = FeatureTableConfig {
            no_event_sentinel: 0,
            ..FeatureTableConfig::default()
        };
        assert!(matches!(
            build_feature_table(&[], &cfg).unwrap_err(),
            FeatureError::InvalidConfig(_)
        ));

        let cfg = FeatureTableConfig {
            rfm_window_days: 0,
            ..FeatureTableConfig::default()
        };
        assert!(matches!(
            build_feature_table(&[], &cfg).unwrap_err(),
            FeatureError::InvalidConfig(_)
        ));
    }

    #[test]
    fn quantity_sum_overflow_is_an_error() {
        let mut big = tx("1", "A", "X", at(1, 9));
        big.quantity = i64::MAX;
        let log = vec![big, tx("1", "B", "Y", at(2, 9))];

        let err = build_feature_table(&log, &FeatureTableConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            FeatureError::QuantityOverflow { customer_id } if customer_id == "1"
        ));
    }

    #[test]
    fn row_fills_follow_the_schema() {
        let cfg = FeatureTableConfig {
            no_event_sentinel: 500,
            ..FeatureTableConfig::default()
        };
        let encoder = CountryEncoder::fit(["UK"], UnseenCategoryPolicy::AllZero);
        let mut schema = build_feature_schema(&cfg, &encoder);

        let fills = RowFills::from_schema(&schema, &cfg);
        assert_eq!(fills.recency_2nd, FillPolicy::Sentinel(500));
        assert_eq!(fills.days_to_repurchase, FillPolicy::Sentinel(500));
        assert_eq!(fills.freq_window, FillPolicy::Zero);

        let idx = schema.column_index("diversity_7d").unwrap();
        schema.columns[idx].fill = Some(FillPolicy::Sentinel(42));
        let fills = RowFills::from_schema(&schema, &cfg);
        assert_eq!(fills.diversity_window, FillPolicy::Sentinel(42));
        assert_eq!(fills.diversity_window.fill_count::<u64>(None), 42);
    }

    #[test]
    fn count_fill_never_goes_negative() {
        assert_eq!(FillPolicy::Sentinel(-1).fill_count::<u64>(None), 0);
        assert_eq!(FillPolicy::Sentinel(999).fill_count::<u32>(None), 999);
        assert!((FillPolicy::Sentinel(999).fill_f64(None) - 999.0).abs() < 1e-12);
    }

    #[test]
    fn label_column_follows_the_horizon() {
        let cfg = FeatureTableConfig {
            repurchase_horizon_days: 3,
            ..FeatureTableConfig::default()
        };
        let log = vec![tx("1", "A", "X", at(1, 9)), tx("1", "B", "Y", at(6, 9))];
        let table = build_feature_table(&log, &cfg).unwrap();

        assert_eq!(table.schema.columns[1].name, "did_repurchase_3d");
        assert_eq!(table.schema.columns[1].role, ColumnRole::Label);
        assert!(table.schema.column_index("did_repurchase_7d").is_none());
        assert_eq!(table.rows[0].did_repurchase, 0);
        assert_eq!(table.rows[0].days_to_repurchase, 5);
    }

    #[test]
    fn model_inputs_reject_rows_wider_than_the_schema() {
        let log = vec![tx("1", "A", "X", at(1, 9))];
        let mut table = build_feature_table(&log, &FeatureTableConfig::default()).unwrap();
        table.rows[0].countries.push(true);

        let err = table.model_inputs().unwrap_err();
        assert!(matches!(
            err,
            FeatureError::RowWidth { found, expected, .. } if found == expected + 1
        ));
    }

    #[test]
    fn contract_violations_fail_fast() {
        let mut bad = tx("1", "A", "X", at(1, 9));
        bad.quantity = -1;
        let log = vec![tx("2", "B", "Y", at(1, 9)), bad];
        let err = build_feature_table(&log, &FeatureTableConfig::default()).unwrap_err();
        assert!(matches!(err, FeatureError::InputSchema { row: 1, .. }));
    }
}
