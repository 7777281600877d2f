//! Credentials and region.

use crate::errors::ConfigErrors;
use crate::observability::SecretFilter;
use serde::{Deserialize, Serialize};

/// Credentials and the region builds run in.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Region the instance is launched in and the AMI first registered in.
    pub region: String,
    /// Static access key.
    pub access_key: String,
    /// Static secret key.
    pub secret_key: String,
    /// Session token.
    pub token: String,
    /// Skip checking that regions exist.
    pub skip_region_validation: bool,
}

impl std::fmt::Debug for AccessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessConfig")
            .field("region", &self.region)
            .field("access_key", &mask(&self.access_key))
            .field("secret_key", &mask(&self.secret_key))
            .field("token", &mask(&self.token))
            .field("skip_region_validation", &self.skip_region_validation)
            .finish()
    }
}

fn mask(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        crate::observability::REDACTED
    }
}

impl AccessConfig {
    /// Creates an access config for `region`.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    /// Validates the block.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn prepare(&mut self) -> Result<(), ConfigErrors> {
        let mut errs = ConfigErrors::new();
        self.region = self.region.trim().to_string();
        if self.region.is_empty() {
            errs.push("region must be specified");
        }
        if self.access_key.is_empty() != self.secret_key.is_empty() {
            errs.push("access_key and secret_key must be specified together");
        }
        errs.into_result()
    }

    /// Returns a fresh per-run filter holding the credentials.
    #[must_use]
    pub fn secret_filter(&self) -> SecretFilter {
        let filter = SecretFilter::new();
        filter.register_all([&self.access_key, &self.secret_key, &self.token].map(String::as_str));
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_required() {
        let mut access = AccessConfig::default();
        let errs = access.prepare().unwrap_err();
        assert!(errs.contains("region must be specified"));
    }

    #[test]
    fn test_keys_come_in_pairs() {
        let mut access = AccessConfig::new("us-east-1");
        access.access_key = "AKIA".to_string();
        assert!(access.prepare().unwrap_err().contains("together"));
    }

    #[test]
    fn test_secret_filter_and_debug_hide_credentials() {
        let mut access = AccessConfig::new("us-east-1");
        access.access_key = "AKIAEXAMPLE".to_string();
        access.secret_key = "wJalrXUtnFEMI".to_string();

        let filter = access.secret_filter();
        assert_eq!(filter.len(), 2);
        assert_eq!(filter.redact("key=wJalrXUtnFEMI"), "key=<sensitive>");

        let debug = format!("{access:?}");
        assert!(!debug.contains("wJalrXUtnFEMI"));
        assert!(debug.contains("us-east-1"));
    }
}
