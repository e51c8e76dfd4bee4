//! Build configuration

use crate::error::{IndexerError, Result};

/// Sentinel disabling a normally-limited knob
pub const UNLIMITED: usize = usize::MAX;

/// Default rows to attempt in a single transaction
pub const DEFAULT_LIMIT: usize = 100;

/// Default cap on records processed per second
pub const DEFAULT_RECORDS_PER_SECOND: usize = 10_000;

/// Default number of times to retry a single range build
pub const DEFAULT_MAX_RETRIES: usize = 100;

/// Default initial backoff delay in milliseconds
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 10;

/// Default backoff delay ceiling in milliseconds
pub const DEFAULT_MAX_DELAY_MS: u64 = 1_000;

/// Knobs for an online index build.
///
/// `limit` is only the starting point: the build shrinks it when the store
/// reports there is too much work in one transaction, and the shrunken
/// value sticks for the rest of the run.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Rows to attempt in a single transaction
    pub limit: usize,
    /// Cap on records processed per second; [`UNLIMITED`] disables
    pub records_per_second: usize,
    /// Retry budget for a single range build
    pub max_retries: usize,
    /// First backoff delay bound, in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff delay ceiling, in milliseconds
    pub max_delay_ms: u64,
    /// Record types to index; `None` infers them from the index
    pub record_types: Option<Vec<String>>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            records_per_second: DEFAULT_RECORDS_PER_SECOND,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            record_types: None,
        }
    }
}

impl BuildOptions {
    /// Builder method to set the per-transaction row limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Builder method to set the records-per-second cap
    pub fn with_records_per_second(mut self, records_per_second: usize) -> Self {
        self.records_per_second = records_per_second;
        self
    }

    /// Builder method to set the retry budget
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder method to set the backoff bounds
    pub fn with_delays_ms(mut self, initial: u64, max: u64) -> Self {
        self.initial_delay_ms = initial;
        self.max_delay_ms = max;
        self
    }

    /// Builder method to restrict the record types indexed
    pub fn with_record_types(
        mut self,
        record_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.record_types = Some(record_types.into_iter().map(Into::into).collect());
        self
    }

    /// Reject non-positive knobs
    pub fn validate(&self) -> Result<()> {
        check_positive(self.limit, "record limit")?;
        check_positive(self.max_retries, "maximum retries")?;
        check_positive(self.records_per_second, "records per second")?;
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(IndexerError::InvalidConfig(format!(
                "initial delay {}ms exceeds maximum delay {}ms",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

fn check_positive(value: usize, what: &str) -> Result<()> {
    if value == 0 {
        return Err(IndexerError::InvalidConfig(format!(
            "non-positive value given for {what}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = BuildOptions::default();
        assert_eq!(options.limit, 100);
        assert_eq!(options.records_per_second, 10_000);
        assert_eq!(options.max_retries, 100);
        assert!(options.record_types.is_none());
        options.validate().unwrap();
    }

    #[test]
    fn test_builders() {
        let options = BuildOptions::default()
            .with_limit(7)
            .with_records_per_second(UNLIMITED)
            .with_max_retries(3)
            .with_record_types(["order"]);
        assert_eq!(options.limit, 7);
        assert_eq!(options.records_per_second, UNLIMITED);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.record_types, Some(vec!["order".to_string()]));
        options.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_knobs() {
        assert!(BuildOptions::default().with_limit(0).validate().is_err());
        assert!(BuildOptions::default().with_max_retries(0).validate().is_err());
        assert!(BuildOptions::default()
            .with_records_per_second(0)
            .validate()
            .is_err());
        assert!(BuildOptions::default()
            .with_delays_ms(100, 10)
            .validate()
            .is_err());
    }
}
