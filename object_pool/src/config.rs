use crate::error::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MIN_SIZE: usize = 1;
pub const DEFAULT_MAX_SIZE: usize = 40;
pub const DEFAULT_AUTO_DEBUG_THRESHOLD: usize = 35;

/// Sizing, eviction and acquisition settings of one pool.
///
/// Durations are (de)serialized as milliseconds. `max_ttl` and
/// `in_use_idle_time` are disabled when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    /// Period of the maintenance sweep.
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// How long a free member may stay idle while the pool is above `min`.
    #[serde(rename = "expire_ms", with = "duration_ms")]
    pub expire: Duration,
    /// Absolute lifetime of a member, counted from creation.
    #[serde(rename = "max_ttl_ms", with = "opt_duration_ms")]
    pub max_ttl: Option<Duration>,
    /// Leased members untouched for this long are severed by the sweep.
    ///
    /// This is a leak backstop: a lessee blocked inside a slow backing-store
    /// call for longer than this loses its object and gets
    /// `PoolError::ObjectDestroyed` on the next call. Keep it generous.
    #[serde(rename = "in_use_idle_time_ms", with = "opt_duration_ms")]
    pub in_use_idle_time: Option<Duration>,
    #[serde(rename = "time_to_wait_ms", with = "duration_ms")]
    pub time_to_wait: Duration,
    #[serde(rename = "time_to_sleep_ms", with = "duration_ms")]
    pub time_to_sleep: Duration,
    /// When false, `stop()` joins the maintenance worker.
    pub daemon: bool,
    pub auto_debug_threshold: usize,
    pub debug: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_SIZE,
            max: DEFAULT_MAX_SIZE,
            interval: Duration::from_secs(60),
            expire: Duration::from_secs(5 * 60),
            max_ttl: Some(Duration::from_secs(60 * 60)),
            in_use_idle_time: Some(Duration::from_secs(30 * 60)),
            time_to_wait: Duration::from_secs(5),
            time_to_sleep: Duration::from_millis(500),
            daemon: true,
            auto_debug_threshold: DEFAULT_AUTO_DEBUG_THRESHOLD,
            debug: false,
        }
    }
}

impl PoolConfig {
    pub fn from_json_str(content: &str) -> PoolResult<Self> {
        let config: PoolConfig = serde_json::from_str(content)
            .map_err(|e| PoolError::InvalidParam(format!("parse pool config failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.max == 0 {
            return Err(PoolError::InvalidParam("max must be positive".to_string()));
        }
        if self.min > self.max {
            return Err(PoolError::InvalidParam(format!(
                "min {} is larger than max {}",
                self.min, self.max
            )));
        }
        if self.interval.is_zero() || self.time_to_sleep.is_zero() {
            return Err(PoolError::InvalidParam(
                "interval and time_to_sleep must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
