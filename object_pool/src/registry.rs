use crate::config::PoolConfig;
use crate::connection::{ConnectionKey, ConnectionPool, SqliteConnector};
use crate::error::PoolResult;
use crate::lock;
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Maps connection keys to their pools. At most one pool exists per key.
pub struct PoolRegistry {
    defaults: RwLock<PoolConfig>,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self {
            defaults: RwLock::new(PoolConfig::default()),
            pools: Mutex::new(HashMap::new()),
        }
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: PoolConfig) -> PoolResult<Self> {
        defaults.validate()?;
        Ok(Self {
            defaults: RwLock::new(defaults),
            pools: Mutex::new(HashMap::new()),
        })
    }

    pub fn defaults(&self) -> PoolConfig {
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies to pools created afterwards.
    pub fn set_defaults(&self, defaults: PoolConfig) -> PoolResult<()> {
        defaults.validate()?;
        *self.defaults.write().unwrap_or_else(PoisonError::into_inner) = defaults;
        Ok(())
    }

    /// Returns the pool for the key, creating and starting it on first use.
    /// A cached pool that was stopped is replaced by a fresh one.
    pub fn get_or_create(
        &self,
        url: &str,
        user: &str,
        password: &str,
    ) -> PoolResult<Arc<ConnectionPool>> {
        let key = ConnectionKey::new(url, user, password);
        let mut pools = lock(&self.pools);
        if let Some(pool) = pools.get(&key.registry_key()) {
            if !pool.is_stop_requested() {
                return Ok(pool.clone());
            }
            info!("PoolRegistry: pool {} was stopped, replacing it", pool.name());
        }

        let registry_key = key.registry_key();
        let pool = ConnectionPool::new(SqliteConnector::new(key), self.defaults())?;
        pool.start()?;
        info!("PoolRegistry: created pool {}", pool.name());
        pools.insert(registry_key, pool.clone());
        Ok(pool)
    }

    pub fn get(&self, url: &str, user: &str, password: &str) -> Option<Arc<ConnectionPool>> {
        let key = ConnectionKey::new(url, user, password);
        lock(&self.pools).get(&key.registry_key()).cloned()
    }

    pub fn pools(&self) -> Vec<Arc<ConnectionPool>> {
        lock(&self.pools).values().cloned().collect()
    }

    /// Stops and forgets every pool.
    pub fn shutdown_all(&self) {
        let pools: Vec<Arc<ConnectionPool>> = lock(&self.pools).drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.stop();
        }
    }
}
