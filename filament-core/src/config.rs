//! Configuration.
//!
//! Everything here deserializes from JSON with durations given in
//! milliseconds. `null` means "forever" for retention and "off" for
//! intervals.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Defaults applied by a [`QueryCache`](crate::query::QueryCache) when a
/// call does not override them.
///
/// ```rust
/// use filament_core::config::QueryCacheConfig;
/// use std::time::Duration;
///
/// let config: QueryCacheConfig =
///     serde_json::from_str(r#"{ "defaultStaleTime": 5000, "defaultCacheTime": null }"#).unwrap();
/// assert_eq!(config.default_stale_time, Duration::from_secs(5));
/// assert_eq!(config.default_cache_time, None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryCacheConfig {
    /// Freshness window. Zero means data is stale as soon as any time
    /// passes.
    #[serde(with = "millis")]
    pub default_stale_time: Duration,

    /// Retention window. `None` keeps entries until removed.
    #[serde(with = "optional_millis")]
    pub default_cache_time: Option<Duration>,

    /// Period of the background eviction sweep. `None` disables it.
    #[serde(with = "optional_millis")]
    pub sweep_interval: Option<Duration>,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            default_stale_time: Duration::ZERO,
            default_cache_time: None,
            sweep_interval: None,
        }
    }
}

impl QueryCacheConfig {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Option<Duration>) -> Self {
        self.default_cache_time = cache_time;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds or `null`.
pub(crate) mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
