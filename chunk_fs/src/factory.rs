use crate::chunked_file::ChunkedFile;
use crate::config::ChunkFsConfig;
use crate::error::{FsError, FsResult};
use crate::lock;
use crate::schema;
use log::info;
use object_pool::{ConnectionPool, LeasedConnection, PoolRegistry};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Entry point of a chunk-backed file tree: owns the configuration and
/// the pooled connection that every `ChunkedFile` of the tree goes through.
pub struct ChunkFsFactory {
    registry: Arc<PoolRegistry>,
    config: RwLock<ChunkFsConfig>,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
    current_dir: Mutex<String>,
}

impl ChunkFsFactory {
    pub fn new(registry: Arc<PoolRegistry>, config: ChunkFsConfig) -> FsResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            registry,
            config: RwLock::new(config),
            pool: RwLock::new(None),
            current_dir: Mutex::new("/".to_string()),
        }))
    }

    pub fn config(&self) -> ChunkFsConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Obtains the shared pool for the configured key and makes sure the
    /// schema exists.
    pub fn connect(&self) -> FsResult<()> {
        let config = self.config();
        let pool = self
            .registry
            .get_or_create(&config.url, &config.user_id, &config.password)?;
        if let Some(pool_config) = config.pool.clone() {
            pool.set_config(pool_config)?;
        }

        let conn = pool.connection()?;
        conn.with_conn(|c| schema::create_schema(c, &config.user_id).map_err(FsError::from))?;
        drop(conn);

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool.clone());
        info!("ChunkFsFactory: connected to {}", pool.name());
        Ok(())
    }

    /// Closes every pooled connection. The pool itself stays registered.
    pub fn disconnect(&self) {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            let closed = pool.destroy_all();
            info!(
                "ChunkFsFactory: disconnected from {}, closed {} connection(s)",
                pool.name(),
                closed
            );
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn connection(&self) -> FsResult<LeasedConnection> {
        let pool = self
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| FsError::NotConnected(self.config().url))?;
        Ok(pool.connection()?)
    }

    pub fn user_id(&self) -> String {
        self.config().user_id
    }

    pub fn chunk_size(&self) -> usize {
        self.config().chunk_size
    }

    pub fn set_chunk_size(&self, chunk_size: usize) -> FsResult<()> {
        if chunk_size == 0 {
            return Err(FsError::InvalidParam("chunk_size must be positive".to_string()));
        }
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .chunk_size = chunk_size;
        Ok(())
    }

    pub fn field_ttl(&self, field: &str) -> Duration {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        let ms = config
            .field_ttl
            .get(field)
            .copied()
            .unwrap_or(config.field_ttl_ms);
        Duration::from_millis(ms)
    }

    pub fn set_field_ttl(&self, field: &str, ttl: Duration) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .field_ttl
            .insert(field.to_string(), ttl.as_millis() as u64);
    }

    pub fn set_default_field_ttl(&self, ttl: Duration) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .field_ttl_ms = ttl.as_millis() as u64;
    }

    pub fn root(self: &Arc<Self>) -> Arc<ChunkedFile> {
        ChunkedFile::root(self.clone())
    }

    pub fn list_roots(self: &Arc<Self>) -> Vec<Arc<ChunkedFile>> {
        vec![self.root()]
    }

    pub fn current_directory(self: &Arc<Self>) -> FsResult<Arc<ChunkedFile>> {
        let path = lock(&self.current_dir).clone();
        Ok(self.resolve(self.root(), &path))
    }

    pub fn set_current_directory(self: &Arc<Self>, path: &str) -> FsResult<()> {
        let dir = self.create_file(path)?;
        if !dir.is_directory()? {
            return Err(FsError::InvalidState(format!(
                "{} is not a directory",
                dir.absolute_path()
            )));
        }
        *lock(&self.current_dir) = dir.absolute_path();
        Ok(())
    }

    /// Resolves `path` against the root when absolute, otherwise against
    /// the current directory. The returned file need not exist.
    pub fn create_file(self: &Arc<Self>, path: &str) -> FsResult<Arc<ChunkedFile>> {
        let base = if path.starts_with('/') {
            self.root()
        } else {
            self.current_directory()?
        };
        Ok(self.resolve(base, path))
    }

    fn resolve(&self, base: Arc<ChunkedFile>, path: &str) -> Arc<ChunkedFile> {
        let mut file = base;
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if let Some(parent) = file.parent() {
                        file = parent;
                    }
                }
                name => file = ChunkedFile::child(&file, name),
            }
        }
        file
    }
}
