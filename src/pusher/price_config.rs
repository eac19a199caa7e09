//! Price Config
//!
//! The list of price feeds a pusher instance tracks, along with the thresholds
//! that decide when a feed needs an on-chain update. Loaded once at startup from
//! a YAML file; any validation failure aborts startup.

use {
    super::price::PriceId,
    serde::Deserialize,
    std::{
        collections::HashSet,
        path::{
            Path,
            PathBuf,
        },
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PriceConfig {
    /// Human readable name of the feed, used in logs.
    pub alias:            String,
    pub id:               PriceId,
    /// Push once the on-chain price is at least this many seconds older than the source.
    pub time_difference:  f64,
    /// Push once the source price deviates from the on-chain price by at least this percentage.
    pub price_deviation:  f64,
    /// Push once the source confidence interval is at least this percentage of its price.
    pub confidence_ratio: f64,
}

#[derive(Debug, Error)]
pub enum PriceConfigError {
    #[error("could not read price config file {path}")]
    Read {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("price config does not match the expected schema")]
    Schema(#[from] serde_yaml::Error),
    #[error("price config contains no feeds")]
    Empty,
    #[error("alias must not be empty (feed {id})")]
    EmptyAlias { id: PriceId },
    #[error("duplicate alias {alias:?} in price config")]
    DuplicateAlias { alias: String },
    #[error("duplicate price id {id} in price config (alias {alias:?})")]
    DuplicateId { id: PriceId, alias: String },
    #[error("{field} for {alias:?} must be a finite, non-negative number, got {value}")]
    InvalidThreshold {
        alias: String,
        field: &'static str,
        value: f64,
    },
}

/// Reads and validates the price config file at `path`.
pub fn read_price_config_file(path: impl AsRef<Path>) -> Result<Vec<PriceConfig>, PriceConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| PriceConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_price_configs(&contents)
}

pub fn parse_price_configs(contents: &str) -> Result<Vec<PriceConfig>, PriceConfigError> {
    let configs: Vec<PriceConfig> = serde_yaml::from_str(contents)?;
    validate(&configs)?;
    Ok(configs)
}

fn validate(configs: &[PriceConfig]) -> Result<(), PriceConfigError> {
    if configs.is_empty() {
        return Err(PriceConfigError::Empty);
    }

    let mut aliases = HashSet::new();
    let mut ids = HashSet::new();
    for config in configs {
        if config.alias.trim().is_empty() {
            return Err(PriceConfigError::EmptyAlias { id: config.id });
        }
        if !aliases.insert(config.alias.as_str()) {
            return Err(PriceConfigError::DuplicateAlias {
                alias: config.alias.clone(),
            });
        }
        if !ids.insert(config.id) {
            return Err(PriceConfigError::DuplicateId {
                id:    config.id,
                alias: config.alias.clone(),
            });
        }

        // Zero is allowed and means "push on any change".
        for (field, value) in [
            ("time_difference", config.time_difference),
            ("price_deviation", config.price_deviation),
            ("confidence_ratio", config.confidence_ratio),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PriceConfigError::InvalidThreshold {
                    alias: config.alias.clone(),
                    field,
                    value,
                });
            }
        }
    }

    Ok(())
}
