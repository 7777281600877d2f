//! Per-run secret masking.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text for a masked secret.
pub const REDACTED: &str = "<sensitive>";

/// Secrets registered for one run.
///
/// Cloning shares the registry, so the filter handed to a [`super::RedactingUi`]
/// sees secrets registered later in the run. Dropping the last clone forgets
/// them; nothing leaks into other runs.
#[derive(Debug, Clone, Default)]
pub struct SecretFilter {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value to mask. Empty and duplicate values are ignored.
    pub fn register(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.is_empty() {
            return;
        }
        let mut secrets = self.secrets.write();
        if !secrets.contains(&secret) {
            secrets.push(secret);
            // Longest first so a secret containing another is masked whole.
            secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        }
    }

    /// Registers several values.
    pub fn register_all<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for secret in secrets {
            self.register(secret);
        }
    }

    /// Returns the number of registered secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }

    /// Returns `message` with every registered secret replaced.
    #[must_use]
    pub fn redact(&self, message: &str) -> String {
        self.secrets
            .read()
            .iter()
            .fold(message.to_string(), |acc, secret| acc.replace(secret, REDACTED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_replaces_all_occurrences() {
        let filter = SecretFilter::new();
        filter.register("s3cr3t");
        assert_eq!(filter.redact("a s3cr3t and s3cr3t"), "a <sensitive> and <sensitive>");
    }

    #[test]
    fn test_empty_and_duplicate_ignored() {
        let filter = SecretFilter::new();
        filter.register_all(["", "tok", "tok"]);
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_longest_secret_first() {
        let filter = SecretFilter::new();
        filter.register("abc");
        filter.register("abcdef");
        assert_eq!(filter.redact("key=abcdef"), "key=<sensitive>");
    }

    #[test]
    fn test_filters_are_isolated() {
        let a = SecretFilter::new();
        let b = SecretFilter::new();
        a.register("only-in-a");
        assert_eq!(b.redact("only-in-a"), "only-in-a");

        let shared = a.clone();
        shared.register("later");
        assert_eq!(a.redact("later"), REDACTED);
    }
}
