//! Country one-hot encoding with a pinned category vocabulary.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::features::FeatureError;

pub const COUNTRY_PREFIX: &str = "country_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnseenCategoryPolicy {
    /// Encode an unknown country as an all-false row.
    #[default]
    AllZero,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryEncoder {
    categories: Vec<String>,
    unseen: UnseenCategoryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Known(Vec<bool>),
    Unseen(Vec<bool>),
}

impl Encoded {
    pub fn into_columns(self) -> Vec<bool> {
        match self {
            Self::Known(columns) | Self::Unseen(columns) => columns,
        }
    }
}

impl CountryEncoder {
    /// Builds the vocabulary from observed values: sorted, de-duplicated.
    pub fn fit<I, S>(countries: I, unseen: UnseenCategoryPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let categories: BTreeSet<String> = countries
            .into_iter()
            .map(|c| c.as_ref().to_string())
            .collect();
        Self {
            categories: categories.into_iter().collect(),
            unseen,
        }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn unseen_policy(&self) -> UnseenCategoryPolicy {
        self.unseen
    }

    pub fn with_unseen_policy(mut self, unseen: UnseenCategoryPolicy) -> Self {
        self.unseen = unseen;
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.categories
            .iter()
            .map(|c| format!("{COUNTRY_PREFIX}{c}"))
            .collect()
    }

    pub fn encode(&self, country: &str) -> Result<Encoded, FeatureError> {
        let mut columns = vec![false; self.categories.len()];
        match self.categories.binary_search_by(|c| c.as_str().cmp(country)) {
            Ok(idx) => {
                columns[idx] = true;
                Ok(Encoded::Known(columns))
            }
            Err(_) => match self.unseen {
                UnseenCategoryPolicy::AllZero => Ok(Encoded::Unseen(columns)),
                UnseenCategoryPolicy::Reject => {
                    Err(FeatureError::UnseenCategory(country.to_string()))
                }
            },
        }
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update("countries:");
        for category in &self.categories {
            hasher.update(category.as_bytes());
            hasher.update(";");
        }
        hex::encode(hasher.finalize())
    }

    pub fn save(&self, path: &Path) -> Result<(), FeatureError> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)?;
        info!(
            component = "encoder",
            event = "encoder.vocabulary.saved",
            path = %path.display(),
            categories = self.categories.len(),
            fingerprint = self.fingerprint()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, FeatureError> {
        let bytes = fs::read(path)?;
        let mut encoder: Self = serde_json::from_slice(&bytes)?;
        // hand-edited files may be unsorted; binary search needs order
        encoder.categories.sort();
        encoder.categories.dedup();
        info!(
            component = "encoder",
            event = "encoder.vocabulary.loaded",
            path = %path.display(),
            categories = encoder.categories.len(),
            fingerprint = encoder.fingerprint()
        );
        Ok(encoder)
    }
}
