//! Rate limit requests, responses and bucket keys.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::duration_millis;
use crate::error::{GatekeeperError, Result};

/// Shortest window a limit may use.
pub const MIN_DURATION: Duration = Duration::from_secs(1);

/// Longest window a limit may use (ten years).
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A single limit to check for a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitRequest {
    /// Limit dimension, e.g. `requests-per-minute`
    pub name: String,
    /// Tenant, key or entity the limit applies to
    pub identifier: String,
    /// Maximum cost admitted per window
    pub limit: i64,
    /// Window length
    pub duration: Duration,
    /// Cost of this request
    pub cost: i64,
    /// Decision time; `None` means the service clock's now
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl RatelimitRequest {
    /// Create a request with cost 1 evaluated at the current time.
    pub fn new(
        name: impl Into<String>,
        identifier: impl Into<String>,
        limit: i64,
        duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
            limit,
            duration,
            cost: 1,
            time: None,
        }
    }

    pub fn with_cost(mut self, cost: i64) -> Self {
        self.cost = cost;
        self
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Check the request shape. Nothing is touched when this fails.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatekeeperError::Validation("name is required".into()));
        }
        if self.identifier.is_empty() {
            return Err(GatekeeperError::Validation("identifier is required".into()));
        }
        if self.limit <= 0 {
            return Err(GatekeeperError::Validation(format!(
                "limit must be > 0 (got {})",
                self.limit
            )));
        }
        if self.cost < 0 {
            return Err(GatekeeperError::Validation(format!(
                "cost must be >= 0 (got {})",
                self.cost
            )));
        }
        if self.duration < MIN_DURATION {
            return Err(GatekeeperError::Validation(format!(
                "duration must be at least {:?} (got {:?})",
                MIN_DURATION, self.duration
            )));
        }
        if self.duration > MAX_DURATION {
            return Err(GatekeeperError::Validation(format!(
                "duration must be at most {:?} (got {:?})",
                MAX_DURATION, self.duration
            )));
        }
        Ok(())
    }

    pub fn bucket_key(&self) -> BucketKey {
        BucketKey::new(&self.name, &self.identifier, self.limit, self.duration)
    }
}

/// Outcome of checking one limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitResponse {
    /// Whether this limit admits the request
    pub success: bool,
    /// Cost still available in the window, never negative
    pub remaining: i64,
    /// End of the current window
    pub reset: DateTime<Utc>,
    /// The limit that was checked
    pub limit: i64,
    /// Effective count at decision time, including this request's cost
    pub current: i64,
}

/// A key that uniquely identifies a rate limit bucket.
///
/// The canonical string form orders lock acquisition in batch checks and
/// names the bucket's counters in the origin store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn new(name: &str, identifier: &str, limit: i64, duration: Duration) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            escape(name),
            escape(identifier),
            limit,
            duration_millis(duration)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Origin key of this bucket's window with the given sequence.
    pub fn window_key(&self, sequence: i64) -> String {
        format!("{}:{}", self.0, sequence)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keep `:` unambiguous as the field separator.
fn escape(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RatelimitRequest {
        RatelimitRequest::new("requests-per-minute", "key_123", 100, Duration::from_secs(60))
    }

    #[test]
    fn test_defaults() {
        let req = request();
        assert_eq!(req.cost, 1);
        assert!(req.time.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validation_rules() {
        let cases = vec![
            RatelimitRequest { name: String::new(), ..request() },
            RatelimitRequest { identifier: String::new(), ..request() },
            RatelimitRequest { limit: 0, ..request() },
            RatelimitRequest { limit: -4, ..request() },
            RatelimitRequest { cost: -1, ..request() },
            RatelimitRequest { duration: Duration::from_millis(999), ..request() },
            RatelimitRequest { duration: MAX_DURATION + Duration::from_secs(1), ..request() },
            RatelimitRequest { duration: Duration::from_secs(u64::MAX / 2), ..request() },
        ];

        for req in cases {
            let err = req.validate().unwrap_err();
            assert!(matches!(err, GatekeeperError::Validation(_)), "{:?}", req);
        }

        assert!(request().with_cost(0).validate().is_ok());
        assert!(request().with_cost(i64::MAX).validate().is_ok());
        assert!(RatelimitRequest { duration: MAX_DURATION, ..request() }.validate().is_ok());
    }

    #[test]
    fn test_bucket_key_to_string() {
        let key = request().bucket_key();
        assert_eq!(key.as_str(), "requests-per-minute:key_123:100:60000");
        assert_eq!(key.window_key(28_401_120), "requests-per-minute:key_123:100:60000:28401120");
        assert_eq!(key.to_string(), key.as_str());
    }

    #[test]
    fn test_bucket_key_distinguishes_every_field() {
        let base = request().bucket_key();
        assert_ne!(base, RatelimitRequest { limit: 101, ..request() }.bucket_key());
        assert_ne!(
            base,
            RatelimitRequest { duration: Duration::from_secs(61), ..request() }.bucket_key()
        );
        assert_eq!(base, request().with_cost(7).bucket_key());
    }

    #[test]
    fn test_bucket_key_escapes_separator() {
        let a = BucketKey::new("a:b", "c", 1, Duration::from_secs(1));
        let b = BucketKey::new("a", "b:c", 1, Duration::from_secs(1));
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "a%3Ab:c:1:1000");
    }
}
