//! Shared cluster configuration
//!
//! The few settings every component agrees on: which cloud backs the
//! fleet, where it runs, and the currency used for cost figures.
//! Component-specific configuration lives with each component.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cloud provider backing the fleet: aws, gcp, or azure
    pub provider: String,

    /// Default region for pricing and capacity calls
    pub region: String,

    /// Currency code used in cost figures and alerts
    pub currency: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            provider: "aws".to_string(),
            region: "us-east-1".to_string(),
            currency: "USD".to_string(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        match self.provider.as_str() {
            "aws" | "gcp" | "azure" => {}
            other => {
                return Err(Error::config(format!("unknown cloud provider: {}", other)));
            }
        }
        if self.region.is_empty() {
            return Err(Error::config("region must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = ClusterConfig {
            provider: "ibm".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
