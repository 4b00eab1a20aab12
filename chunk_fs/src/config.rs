use crate::error::{FsError, FsResult};
use object_pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_CHUNK_SIZE: usize = 100 * 1024;
pub const DEFAULT_FIELD_TTL_MS: u64 = 500;

/// Cache name of directory listings.
pub const FIELD_KIDS: &str = "kids";
pub const FIELD_FILE_TYPE: &str = "file_type";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkFsConfig {
    /// Database path or `file:` uri.
    pub url: String,
    pub user_id: String,
    pub password: String,
    pub chunk_size: usize,
    /// TTL of cached metadata fields without an entry in `field_ttl`.
    pub field_ttl_ms: u64,
    pub field_ttl: HashMap<String, u64>,
    /// Replaces the registry defaults of the pool on connect.
    pub pool: Option<PoolConfig>,
}

impl Default for ChunkFsConfig {
    fn default() -> Self {
        let mut field_ttl = HashMap::new();
        field_ttl.insert(FIELD_KIDS.to_string(), 1000);
        field_ttl.insert(FIELD_FILE_TYPE.to_string(), 100_000);
        Self {
            url: String::new(),
            user_id: "sa".to_string(),
            password: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            field_ttl_ms: DEFAULT_FIELD_TTL_MS,
            field_ttl,
            pool: None,
        }
    }
}

impl ChunkFsConfig {
    pub fn new(url: &str, user_id: &str, password: &str) -> Self {
        Self {
            url: url.to_string(),
            user_id: user_id.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    pub fn from_json_file(path: &Path) -> FsResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ChunkFsConfig = serde_json::from_str(&content)
            .map_err(|e| FsError::InvalidParam(format!("parse config failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.url.is_empty() {
            return Err(FsError::InvalidParam("url is empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(FsError::InvalidParam("chunk_size must be positive".to_string()));
        }
        if let Some(pool) = &self.pool {
            pool.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.json");
        std::fs::write(
            &path,
            r#"{"url": "/data/fs.db", "chunk_size": 4096, "field_ttl": {"kids": 50}, "pool": {"max": 4}}"#,
        )
        .unwrap();
        let config = ChunkFsConfig::from_json_file(&path).unwrap();
        assert_eq!(config.url, "/data/fs.db");
        assert_eq!(config.user_id, "sa");
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.field_ttl.get(FIELD_KIDS), Some(&50));
        assert_eq!(config.field_ttl.get(FIELD_FILE_TYPE), None);
        assert_eq!(config.pool.map(|p| p.max), Some(4));
    }

    #[test]
    fn test_invalid_config() {
        assert!(ChunkFsConfig::default().validate().is_err());
        let mut config = ChunkFsConfig::new("/tmp/x.db", "sa", "");
        assert!(config.validate().is_ok());
        config.chunk_size = 0;
        assert!(matches!(config.validate(), Err(FsError::InvalidParam(_))));
    }
}
