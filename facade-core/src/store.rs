//! Threshold and adaptive counter storage
//!
//! Thresholds live under `threshold:<machine_id>`, counters under
//! `anomaly_counter:<machine_id>`. Counter mutation only ever happens inside
//! a server-side script so several facade instances can share one store.

use crate::error::{Error, Result};
use crate::types::MachineId;
use crate::{COUNTER_MAX, COUNTER_MIN};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Key prefixes
pub mod keys {
    /// Per-machine threshold
    pub const THRESHOLD: &str = "threshold";
    /// Per-machine adaptive counter
    pub const ANOMALY_COUNTER: &str = "anomaly_counter";
}

/// Store key for the threshold of `machine_id`
pub fn threshold_key(machine_id: MachineId) -> String {
    format!("{}:{}", keys::THRESHOLD, machine_id)
}

/// Store key for the adaptive counter of `machine_id`
pub fn counter_key(machine_id: MachineId) -> String {
    format!("{}:{}", keys::ANOMALY_COUNTER, machine_id)
}

// KEYS[1] counter key, ARGV[1] ceiling
const INCREMENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current < tonumber(ARGV[1]) then
    return redis.call('INCR', KEYS[1])
end
return current
"#;

// KEYS[1] counter key, ARGV[1] floor
const DECREMENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > tonumber(ARGV[1]) then
    return redis.call('DECR', KEYS[1])
end
return current
"#;

/// Key-value store holding thresholds and adaptive counters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ThresholdStore: Send + Sync {
    /// Threshold of `machine_id`; [`Error::ThresholdNotFound`] when unset
    async fn get_threshold(&self, machine_id: MachineId) -> Result<f64>;

    /// Store a threshold and reset the machine's counter to zero
    async fn set_threshold(&self, machine_id: MachineId, threshold: f64) -> Result<()>;

    /// Clamped increment, returns the resulting counter
    async fn increment_counter(&self, machine_id: MachineId) -> Result<i64>;

    /// Clamped decrement, returns the resulting counter
    async fn decrement_counter(&self, machine_id: MachineId) -> Result<i64>;

    /// Current counter (zero when unset)
    async fn counter(&self, machine_id: MachineId) -> Result<i64>;
}

/// Log a counter that escaped its clamp. The value is passed through unchanged.
fn check_counter(machine_id: MachineId, value: i64) -> i64 {
    if !(COUNTER_MIN..=COUNTER_MAX).contains(&value) {
        let err = Error::CounterOutOfRange { machine_id, value };
        error!(machine_id, value, code = err.code(), "{}", err);
    }
    value
}

/// Redis-backed store
#[derive(Clone)]
pub struct RedisThresholdStore {
    redis: ConnectionManager,
    increment: Script,
    decrement: Script,
}

impl RedisThresholdStore {
    /// Wrap a managed connection
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            increment: Script::new(INCREMENT_SCRIPT),
            decrement: Script::new(DECREMENT_SCRIPT),
        }
    }

    /// Open a managed connection to `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Connected to Redis");
        Ok(Self::new(manager))
    }

    /// PING round trip
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ThresholdStore for RedisThresholdStore {
    async fn get_threshold(&self, machine_id: MachineId) -> Result<f64> {
        let value: Option<f64> = self.redis.clone().get(threshold_key(machine_id)).await?;
        value.ok_or(Error::ThresholdNotFound(machine_id))
    }

    async fn set_threshold(&self, machine_id: MachineId, threshold: f64) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .set(threshold_key(machine_id), threshold)
            .ignore()
            .set(counter_key(machine_id), 0)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        info!(machine_id, threshold, "Threshold set, counter reset");
        Ok(())
    }

    async fn increment_counter(&self, machine_id: MachineId) -> Result<i64> {
        let mut conn = self.redis.clone();
        let value: i64 = self
            .increment
            .key(counter_key(machine_id))
            .arg(COUNTER_MAX)
            .invoke_async(&mut conn)
            .await?;
        debug!(machine_id, value, "Counter incremented");
        Ok(check_counter(machine_id, value))
    }

    async fn decrement_counter(&self, machine_id: MachineId) -> Result<i64> {
        let mut conn = self.redis.clone();
        let value: i64 = self
            .decrement
            .key(counter_key(machine_id))
            .arg(COUNTER_MIN)
            .invoke_async(&mut conn)
            .await?;
        debug!(machine_id, value, "Counter decremented");
        Ok(check_counter(machine_id, value))
    }

    async fn counter(&self, machine_id: MachineId) -> Result<i64> {
        let value: Option<i64> = self.redis.clone().get(counter_key(machine_id)).await?;
        Ok(check_counter(machine_id, value.unwrap_or(0)))
    }
}

#[derive(Default)]
struct MemoryState {
    thresholds: HashMap<MachineId, f64>,
    counters: HashMap<MachineId, i64>,
}

/// Process-local store. Each operation runs under one lock, which gives the
/// same per-key atomicity the Redis scripts provide.
#[derive(Default)]
pub struct InMemoryThresholdStore {
    state: Mutex<MemoryState>,
}

impl InMemoryThresholdStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a counter directly, bypassing the clamp
    pub fn preset_counter(&self, machine_id: MachineId, value: i64) {
        self.lock().counters.insert(machine_id, value);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock still holds consistent maps: every write is a single insert.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ThresholdStore for InMemoryThresholdStore {
    async fn get_threshold(&self, machine_id: MachineId) -> Result<f64> {
        self.lock()
            .thresholds
            .get(&machine_id)
            .copied()
            .ok_or(Error::ThresholdNotFound(machine_id))
    }

    async fn set_threshold(&self, machine_id: MachineId, threshold: f64) -> Result<()> {
        let mut state = self.lock();
        state.thresholds.insert(machine_id, threshold);
        state.counters.insert(machine_id, 0);
        Ok(())
    }

    async fn increment_counter(&self, machine_id: MachineId) -> Result<i64> {
        let mut state = self.lock();
        let current = state.counters.entry(machine_id).or_insert(0);
        if *current < COUNTER_MAX {
            *current += 1;
        }
        Ok(check_counter(machine_id, *current))
    }

    async fn decrement_counter(&self, machine_id: MachineId) -> Result<i64> {
        let mut state = self.lock();
        let current = state.counters.entry(machine_id).or_insert(0);
        if *current > COUNTER_MIN {
            *current -= 1;
        }
        Ok(check_counter(machine_id, *current))
    }

    async fn counter(&self, machine_id: MachineId) -> Result<i64> {
        let value = self.lock().counters.get(&machine_id).copied().unwrap_or(0);
        Ok(check_counter(machine_id, value))
    }
}
