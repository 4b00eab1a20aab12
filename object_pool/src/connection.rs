use crate::error::{PoolError, PoolResult};
use crate::pool::{ObjectFactory, ObjectPool, PooledObject};
use log::warn;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Params, Row, Transaction};
use std::sync::Arc;

/// Identity of a connection target. Pools are shared per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl ConnectionKey {
    pub fn new(url: &str, user: &str, password: &str) -> Self {
        Self {
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// Plain concatenation; no normalization of the url.
    pub fn registry_key(&self) -> String {
        format!("{}{}{}", self.url, self.user, self.password)
    }

    pub fn display_name(&self) -> String {
        format!("{}:{}", self.url, self.user)
    }
}

/// Opens and closes SQLite connections for one key.
pub struct SqliteConnector {
    key: ConnectionKey,
}

impl SqliteConnector {
    pub fn new(key: ConnectionKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    fn init_connection(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
    }
}

impl ObjectFactory for SqliteConnector {
    type Object = Connection;

    fn name(&self) -> String {
        self.key.display_name()
    }

    fn create(&self) -> PoolResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.key.url, flags).map_err(|e| {
            warn!("SqliteConnector: open {} failed! {}", self.key.display_name(), e);
            PoolError::CreationFailed(e.to_string())
        })?;
        Self::init_connection(&conn).map_err(|e| {
            warn!("SqliteConnector: init {} failed! {}", self.key.display_name(), e);
            PoolError::CreationFailed(e.to_string())
        })?;
        Ok(conn)
    }

    fn destroy(&self, conn: Connection) -> PoolResult<()> {
        conn.close().map_err(|(_, e)| PoolError::DbError(e.to_string()))
    }
}

pub type ConnectionPool = ObjectPool<SqliteConnector>;

impl ObjectPool<SqliteConnector> {
    pub fn connection(self: &Arc<Self>) -> PoolResult<LeasedConnection> {
        LeasedConnection::new(self.acquire()?)
    }
}

/// Session settings observed at lease time and restored on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub autocommit: bool,
    pub query_only: bool,
    pub read_uncommitted: bool,
}

impl SessionState {
    pub fn capture(conn: &Connection) -> rusqlite::Result<Self> {
        Ok(Self {
            autocommit: conn.is_autocommit(),
            query_only: conn.query_row("PRAGMA query_only", [], |row| row.get(0))?,
            read_uncommitted: conn.query_row("PRAGMA read_uncommitted", [], |row| row.get(0))?,
        })
    }

    /// Every step runs even if an earlier one failed; the first error wins.
    pub fn restore(&self, conn: &Connection) -> rusqlite::Result<()> {
        let mut first_err = None;
        if self.autocommit && !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = conn.pragma_update(None, "query_only", self.query_only) {
            first_err.get_or_insert(e);
        }
        if let Err(e) = conn.pragma_update(None, "read_uncommitted", self.read_uncommitted) {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A leased connection. Every call touches the lease before delegating;
/// dropping it resets the session and returns the connection to its pool.
pub struct LeasedConnection {
    lease: PooledObject<SqliteConnector>,
    session: SessionState,
}

impl LeasedConnection {
    fn new(lease: PooledObject<SqliteConnector>) -> PoolResult<Self> {
        let session = lease.with(|conn| SessionState::capture(conn))??;
        Ok(Self { lease, session })
    }

    pub fn id(&self) -> u64 {
        self.lease.id()
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    pub fn with_conn<R, E>(&self, f: impl FnOnce(&mut Connection) -> Result<R, E>) -> Result<R, E>
    where
        E: From<PoolError>,
    {
        self.lease.with(f)?
    }

    /// Runs `f` inside a transaction committed when it returns `Ok`.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<PoolError> + From<rusqlite::Error>,
    {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> PoolResult<usize> {
        self.with_conn(|conn| conn.execute(sql, params).map_err(PoolError::from))
    }

    pub fn execute_batch(&self, sql: &str) -> PoolResult<()> {
        self.with_conn(|conn| conn.execute_batch(sql).map_err(PoolError::from))
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> PoolResult<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| conn.query_row(sql, params, f).map_err(PoolError::from))
    }

    pub fn query_row_optional<T, P, F>(&self, sql: &str, params: P, f: F) -> PoolResult<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| {
            conn.query_row(sql, params, f)
                .optional()
                .map_err(PoolError::from)
        })
    }

    pub fn close(self) {}
}

impl Drop for LeasedConnection {
    fn drop(&mut self) {
        let session = self.session;
        match self.lease.with(|conn| session.restore(conn)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    "LeasedConnection: reset session of #{} failed, ignored: {}",
                    self.lease.id(),
                    e
                );
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_pool(max: usize) -> (TempDir, Arc<ConnectionPool>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool.db");
        let key = ConnectionKey::new(path.to_str().unwrap(), "sa", "secret");
        let config = PoolConfig {
            max,
            time_to_wait: Duration::from_millis(200),
            time_to_sleep: Duration::from_millis(20),
            ..Default::default()
        };
        let pool = ConnectionPool::new(SqliteConnector::new(key), config).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_name_hides_password() {
        let key = ConnectionKey::new("/tmp/a.db", "sa", "secret");
        assert_eq!(key.registry_key(), "/tmp/a.dbsasecret");
        assert!(!SqliteConnector::new(key).name().contains("secret"));
    }

    #[test]
    fn test_leased_connection_executes() {
        let (_dir, pool) = create_test_pool(2);
        let conn = pool.connection().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
        conn.execute("INSERT INTO t (v) VALUES (?1)", [42]).unwrap();
        let v: i64 = conn
            .query_row("SELECT v FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, 42);
        let missing: Option<i64> = conn
            .query_row_optional("SELECT v FROM t WHERE v = 7", [], |row| row.get(0))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_transaction_commits_or_rolls_back() {
        let (_dir, pool) = create_test_pool(1);
        let conn = pool.connection().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();

        let res: PoolResult<()> = conn.transaction(|tx| {
            tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Err(PoolError::InvalidParam("abort".to_string()))
        });
        assert!(res.is_err());

        conn.transaction(|tx| {
            tx.execute("INSERT INTO t (v) VALUES (2)", [])?;
            Ok::<_, PoolError>(())
        })
        .unwrap();

        let total: i64 = conn
            .query_row("SELECT COALESCE(SUM(v), 0) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_session_reset_on_release() {
        let (_dir, pool) = create_test_pool(1);
        let first_id;
        {
            let conn = pool.connection().unwrap();
            first_id = conn.id();
            assert!(conn.session().autocommit);
            conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
            conn.execute_batch("BEGIN; INSERT INTO t (v) VALUES (1);")
                .unwrap();
            conn.execute_batch("PRAGMA read_uncommitted = 1").unwrap();
            assert!(!conn.with_conn(|c| Ok::<_, PoolError>(c.is_autocommit())).unwrap());
        }

        let conn = pool.connection().unwrap();
        assert_eq!(conn.id(), first_id);
        assert!(conn.with_conn(|c| Ok::<_, PoolError>(c.is_autocommit())).unwrap());
        assert!(!conn.session().read_uncommitted);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_query_only_restored() {
        let (_dir, pool) = create_test_pool(1);
        {
            let conn = pool.connection().unwrap();
            conn.execute_batch("PRAGMA query_only = 1").unwrap();
        }
        let conn = pool.connection().unwrap();
        assert!(!conn.session().query_only);
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
    }

    #[test]
    fn test_calls_touch_the_lease() {
        let (_dir, pool) = create_test_pool(1);
        let conn = pool.connection().unwrap();
        let before = conn.lease.managed().last_access();
        std::thread::sleep(Duration::from_millis(5));
        conn.execute_batch("SELECT 1").unwrap();
        assert!(conn.lease.managed().last_access() > before);
    }

    #[test]
    fn test_open_failure_is_creation_failed() {
        let _ = env_logger::builder().is_test(true).try_init();
        let key = ConnectionKey::new("/nonexistent-dir/sub/pool.db", "sa", "");
        let config = PoolConfig {
            time_to_wait: Duration::from_millis(50),
            time_to_sleep: Duration::from_millis(10),
            ..Default::default()
        };
        let pool = ConnectionPool::new(SqliteConnector::new(key), config).unwrap();
        match pool.connection() {
            Err(PoolError::NoObjectAvailable { reason, .. }) => {
                assert!(reason.contains("creation failed"));
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("open should fail"),
        }
        assert_eq!(pool.size(), 0);
    }
}
