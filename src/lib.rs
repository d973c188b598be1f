//! UBP core crate: per-customer repurchase features from retail transaction logs.
//!
//! Current implemented scope:
//! - transaction CSV ingestion and cleaning
//! - deterministic feature table construction with repurchase labels
//! - pinned country vocabulary for train/inference schema stability
//! - model-input projection and CSV export
//! - env-configured load → clean → build → write pipeline

mod app;
mod encoder;
mod export;
mod features;
mod observability;
mod transactions;

pub use app::{
    app_config_from_env, run_pipeline, AppConfig, AppError, VocabMode, DEFAULT_INPUT_PATH,
    DEFAULT_OUTPUT_PATH,
};
pub use encoder::{CountryEncoder, Encoded, UnseenCategoryPolicy, COUNTRY_PREFIX};
pub use export::{write_feature_table, write_feature_table_csv, ExportError, DATE_FORMAT};
pub use features::{
    aggregate_customers, assert_schema_compatible, build_feature_schema, build_feature_table,
    build_feature_table_with_encoder, diversity_first_day, diversity_window,
    diversity_window_column_name, first_countries, first_dates, first_purchase_time,
    first_transactions, label_column_name, recency_to_second_purchase, repurchase_label,
    rfm_frequency_column_name, rfm_monetary_column_name, rfm_window, validate_transactions,
    ColumnRole, CustomerAggregate, CustomerFeatureRow, FeatureColumn, FeatureDType, FeatureError,
    FeatureSchema, FeatureTable, FeatureTableConfig, FeatureTableReport, FeatureValue, FillPolicy,
    FirstPurchaseTime, FirstTransaction, ModelInputs, RepurchaseLabel, RfmWindow, COL_CUSTOMER_ID,
    COL_DAYS_TO_REPURCHASE, COL_FIRST_DATE, COL_LAST_DATE, COL_RECENCY_2ND, FEATURE_SCHEMA_VERSION,
    NO_EVENT_SENTINEL,
};
pub use observability::{
    init_logging, log_app_finish, log_app_start, log_vocabulary_selected,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use transactions::{
    clean_raw, load_raw_csv, parse_invoice_timestamp, read_raw_csv, CleaningReport, IngestError,
    RawTransaction, Transaction,
};
