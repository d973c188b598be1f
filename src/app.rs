//! Env-configured driver behind the `build_feature_table` binary.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::encoder::{CountryEncoder, UnseenCategoryPolicy};
use crate::export::{write_feature_table_csv, ExportError};
use crate::features::{
    build_feature_table, build_feature_table_with_encoder, FeatureError, FeatureTable,
    FeatureTableConfig,
};
use crate::observability::log_vocabulary_selected;
use crate::transactions::{clean_raw, load_raw_csv, IngestError};

pub const DEFAULT_INPUT_PATH: &str = "data/raw/retail_2010_2011.csv";
pub const DEFAULT_OUTPUT_PATH: &str = "data/processed/features.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabMode {
    /// Fit the country vocabulary on the input, saving it when a path is set.
    Fit,
    /// Load a previously saved vocabulary.
    Pin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub vocab_mode: VocabMode,
    pub vocab_path: Option<PathBuf>,
    pub features: FeatureTableConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from(DEFAULT_INPUT_PATH),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            vocab_mode: VocabMode::Fit,
            vocab_path: None,
            features: FeatureTableConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid {var} '{value}' (expected {expected})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("UBP_VOCAB_MODE=pin requires UBP_COUNTRY_VOCAB_PATH")]
    MissingVocabularyPath,
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Reads `UBP_INPUT_PATH`, `UBP_OUTPUT_PATH`, `UBP_COUNTRY_VOCAB_PATH`,
/// `UBP_VOCAB_MODE`, `UBP_UNSEEN_COUNTRY` and the window overrides
/// `UBP_RFM_WINDOW_DAYS`, `UBP_DIVERSITY_WINDOW_DAYS`, `UBP_REPURCHASE_HORIZON_DAYS`.
pub fn app_config_from_env() -> Result<AppConfig, AppError> {
    let mut config = AppConfig::default();

    if let Some(path) = non_blank_var("UBP_INPUT_PATH") {
        config.input_path = PathBuf::from(path);
    }
    if let Some(path) = non_blank_var("UBP_OUTPUT_PATH") {
        config.output_path = PathBuf::from(path);
    }
    config.vocab_path = non_blank_var("UBP_COUNTRY_VOCAB_PATH").map(PathBuf::from);

    if let Some(raw) = non_blank_var("UBP_VOCAB_MODE") {
        config.vocab_mode = match raw.to_ascii_lowercase().as_str() {
            "fit" => VocabMode::Fit,
            "pin" => VocabMode::Pin,
            _ => return Err(invalid("UBP_VOCAB_MODE", raw, "fit|pin")),
        };
    }
    if let Some(raw) = non_blank_var("UBP_UNSEEN_COUNTRY") {
        config.features.unseen_category = match raw.to_ascii_lowercase().as_str() {
            "all_zero" | "zero" => UnseenCategoryPolicy::AllZero,
            "reject" => UnseenCategoryPolicy::Reject,
            _ => return Err(invalid("UBP_UNSEEN_COUNTRY", raw, "all_zero|reject")),
        };
    }

    if let Some(days) = days_var("UBP_RFM_WINDOW_DAYS")? {
        config.features.rfm_window_days = days;
    }
    if let Some(days) = days_var("UBP_DIVERSITY_WINDOW_DAYS")? {
        config.features.diversity_window_days = days;
    }
    if let Some(days) = days_var("UBP_REPURCHASE_HORIZON_DAYS")? {
        config.features.repurchase_horizon_days = days;
    }

    if config.vocab_mode == VocabMode::Pin && config.vocab_path.is_none() {
        return Err(AppError::MissingVocabularyPath);
    }

    Ok(config)
}

/// load → clean → build → write. Returns the table that was written.
pub fn run_pipeline(config: &AppConfig) -> Result<FeatureTable, AppError> {
    let raw = load_raw_csv(&config.input_path)?;
    let (log, _report) = clean_raw(raw);

    let table = match (config.vocab_mode, config.vocab_path.as_deref()) {
        (VocabMode::Pin, Some(path)) => {
            log_vocabulary_selected("pin", Some(path));
            let encoder = CountryEncoder::load(path)?;
            build_feature_table_with_encoder(&log, &config.features, &encoder)?
        }
        (VocabMode::Pin, None) => return Err(AppError::MissingVocabularyPath),
        (VocabMode::Fit, path) => {
            log_vocabulary_selected("fit", path);
            let table = build_feature_table(&log, &config.features)?;
            if let Some(path) = path {
                table.encoder.save(path)?;
            }
            table
        }
    };

    write_feature_table_csv(&config.output_path, &table)?;
    Ok(table)
}

fn non_blank_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn days_var(key: &'static str) -> Result<Option<u32>, AppError> {
    non_blank_var(key)
        .map(|raw| {
            raw.parse::<u32>()
                .map_err(|_| invalid(key, raw, "a whole number of days"))
        })
        .transpose()
}

fn invalid(var: &'static str, value: String, expected: &'static str) -> AppError {
    AppError::InvalidEnv {
        var,
        value,
        expected,
    }
}
