use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::utils::error::AppError;

/// Identity of a monitored (product, location) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub product_id: String,
    pub location_id: String,
}

impl TargetId {
    pub fn new(product_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            location_id: location_id.into(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.product_id, self.location_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct Target {
    pub product_id: String,
    pub location_id: String,
    pub display_name: String,
    pub enabled: bool,
}

impl Target {
    /// Creates an enabled target. The display name falls back to the product id.
    pub fn new(
        product_id: impl Into<String>,
        location_id: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        let product_id = product_id.into();
        let display_name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| product_id.clone());

        Self {
            product_id,
            location_id: location_id.into(),
            display_name,
            enabled: true,
        }
    }

    pub fn id(&self) -> TargetId {
        TargetId::new(&self.product_id, &self.location_id)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        for (field, value) in [("product", &self.product_id), ("location", &self.location_id)] {
            if value.is_empty() {
                return Err(AppError::Validation(format!("{} id must not be empty", field)));
            }
            if value.chars().any(|c| c.is_whitespace() || c == '@') {
                return Err(AppError::Validation(format!(
                    "{} id '{}' contains invalid characters",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

/// Which targets a lifecycle or subscription command applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    All,
    Target(TargetId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all targets"),
            Scope::Target(id) => write!(f, "{}", id),
        }
    }
}
