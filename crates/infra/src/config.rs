//! Ordering configuration, loaded from the environment.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ordercore_core::WarehouseId;

pub const ENV_CURRENCY: &str = "ORDERCORE_CURRENCY";
pub const ENV_ORDER_PREFIX: &str = "ORDERCORE_ORDER_PREFIX";
pub const ENV_MAX_CONFLICT_RETRIES: &str = "ORDERCORE_MAX_CONFLICT_RETRIES";
pub const ENV_DEFAULT_WAREHOUSE: &str = "ORDERCORE_DEFAULT_WAREHOUSE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingConfig {
    /// Currency new orders are created in.
    pub currency: String,
    pub order_number_prefix: String,
    /// How often a workflow step is re-run after losing an optimistic version check.
    pub max_conflict_retries: u32,
    /// Preferred warehouse for reservations; falls back to the best-stocked one.
    pub default_warehouse: Option<WarehouseId>,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            currency: "THB".to_string(),
            order_number_prefix: "ORD".to_string(),
            max_conflict_retries: 3,
            default_warehouse: None,
        }
    }
}

impl OrderingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(currency) = get(ENV_CURRENCY) {
            config.currency = currency.trim().to_uppercase();
        }
        if let Some(prefix) = get(ENV_ORDER_PREFIX) {
            let prefix = prefix.trim();
            if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(invalid(ENV_ORDER_PREFIX, prefix, "must be ASCII alphanumeric"));
            }
            config.order_number_prefix = prefix.to_string();
        }
        if let Some(retries) = get(ENV_MAX_CONFLICT_RETRIES) {
            config.max_conflict_retries = u32::from_str(retries.trim())
                .map_err(|e| invalid(ENV_MAX_CONFLICT_RETRIES, &retries, e))?;
        }
        if let Some(warehouse) = get(ENV_DEFAULT_WAREHOUSE) {
            let id = WarehouseId::from_str(warehouse.trim())
                .map_err(|e| invalid(ENV_DEFAULT_WAREHOUSE, &warehouse, e))?;
            config.default_warehouse = Some(id);
        }

        Ok(config)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
