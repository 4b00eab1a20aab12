use crate::config::FIELD_KIDS;
use crate::error::{FsError, FsResult};
use crate::factory::ChunkFsFactory;
use crate::field_cache::FieldCache;
use crate::random_access::{RandomAccessController, RandomAccessStream};
use crate::schema::{
    metadata_select_sql, FileField, FileType, Permission, FILE_COLUMNS, INSERT_FILE,
    LOCATE_CHUNK, REFRESH_SIZES, ROOT_FILE_ID,
};
use crate::streams::{ChunkInputStream, ChunkOutputStream, ChunkSeekableReader};
use crate::{lock, now_millis};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Position of one stored chunk inside its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    /// 1-based.
    pub chunk_number: u64,
    pub start: u64,
    pub length: u64,
}

impl ChunkLocation {
    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.start + self.length
    }
}

struct CachedListing {
    loaded_at: Instant,
    entries: Vec<(i64, String)>,
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn insert_chunk(conn: &Connection, file_id: i64, chunk_number: i64, data: &[u8]) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO file_data (fileid, chunk_number, length, data) VALUES (?1, ?2, ?3, ?4)",
        params![file_id, chunk_number, data.len() as i64, data],
    )
}

fn value_to_u64(value: &Value) -> u64 {
    match value {
        Value::Integer(v) => (*v).max(0) as u64,
        _ => 0,
    }
}

fn value_to_bool(value: &Value) -> bool {
    matches!(value, Value::Integer(v) if *v != 0)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        _ => String::new(),
    }
}

/// A file or directory stored in the `file` and `file_data` tables.
///
/// The identity is resolved lazily from (parent, name) and kept once found.
/// Metadata reads go through a per-field cache; every mutation through this
/// handle clears it.
pub struct ChunkedFile {
    factory: Arc<ChunkFsFactory>,
    parent: Option<Arc<ChunkedFile>>,
    name: String,
    file_id: Mutex<Option<i64>>,
    cache: Mutex<FieldCache>,
    listing: Mutex<Option<CachedListing>>,
}

impl ChunkedFile {
    pub(crate) fn root(factory: Arc<ChunkFsFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            parent: None,
            name: String::new(),
            file_id: Mutex::new(Some(ROOT_FILE_ID)),
            cache: Mutex::new(FieldCache::new()),
            listing: Mutex::new(None),
        })
    }

    pub fn child(parent: &Arc<ChunkedFile>, name: &str) -> Arc<Self> {
        Self::child_with_id(parent, name, None)
    }

    fn child_with_id(parent: &Arc<ChunkedFile>, name: &str, file_id: Option<i64>) -> Arc<Self> {
        Arc::new(Self {
            factory: parent.factory.clone(),
            parent: Some(parent.clone()),
            name: name.to_string(),
            file_id: Mutex::new(file_id),
            cache: Mutex::new(FieldCache::new()),
            listing: Mutex::new(None),
        })
    }

    pub fn factory(&self) -> &Arc<ChunkFsFactory> {
        &self.factory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<ChunkedFile>> {
        self.parent.clone()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn absolute_path(&self) -> String {
        match &self.parent {
            None => "/".to_string(),
            Some(parent) if parent.is_root() => format!("/{}", self.name),
            Some(parent) => format!("{}/{}", parent.absolute_path(), self.name),
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }

    /// True when `other` is a direct entry of this directory.
    pub fn is_child_of_mine(&self, other: &ChunkedFile) -> bool {
        match &other.parent {
            Some(parent) => parent.absolute_path() == self.absolute_path(),
            None => false,
        }
    }

    // ========== identity ==========

    pub fn file_id(&self) -> FsResult<Option<i64>> {
        if let Some(id) = *lock(&self.file_id) {
            return Ok(Some(id));
        }
        let parent = match &self.parent {
            Some(parent) => parent,
            None => return Ok(Some(ROOT_FILE_ID)),
        };
        let parent_id = match parent.file_id()? {
            Some(id) => id,
            None => return Ok(None),
        };

        let conn = self.factory.connection()?;
        let found: Option<i64> = conn.query_row_optional(
            "SELECT fileid FROM file WHERE parentid = ?1 AND name = ?2",
            params![parent_id, self.name],
            |row| row.get(0),
        )?;
        if let Some(id) = found {
            *lock(&self.file_id) = Some(id);
        }
        Ok(found)
    }

    pub fn exists(&self) -> FsResult<bool> {
        Ok(self.file_id()?.is_some())
    }

    fn require_id(&self) -> FsResult<i64> {
        self.file_id()?
            .ok_or_else(|| FsError::NotFound(self.absolute_path()))
    }

    fn forget_id(&self) {
        *lock(&self.file_id) = None;
        self.invalidate_metadata();
        *lock(&self.listing) = None;
    }

    pub fn invalidate_metadata(&self) {
        lock(&self.cache).clear();
    }

    pub fn invalidate_listing(&self) {
        *lock(&self.listing) = None;
    }

    pub(crate) fn invalidate_length(&self) {
        let mut cache = lock(&self.cache);
        cache.invalidate(FileField::Length);
        cache.invalidate(FileField::ChunkCount);
    }

    // ========== cached metadata ==========

    fn field_value(&self, field: FileField) -> FsResult<Value> {
        let ttl = self.factory.field_ttl(field.column());
        if let Some(value) = lock(&self.cache).get(field, ttl) {
            return Ok(value.clone());
        }
        if field.is_derived() {
            let (length, chunk_count) = self.load_sizes()?;
            return Ok(match field {
                FileField::ChunkCount => Value::Integer(chunk_count),
                _ => Value::Integer(length),
            });
        }
        let values = self.load_metadata()?;
        let value = FILE_COLUMNS
            .iter()
            .zip(values)
            .find(|(f, _)| **f == field)
            .map(|(_, v)| v)
            .unwrap_or(Value::Null);
        Ok(value)
    }

    fn load_metadata(&self) -> FsResult<Vec<Value>> {
        let id = self.require_id()?;
        let conn = self.factory.connection()?;
        let values = conn
            .query_row_optional(metadata_select_sql(), [id], |row| {
                (0..FILE_COLUMNS.len())
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })?
            .ok_or_else(|| FsError::NotFound(self.absolute_path()))?;

        let mut cache = lock(&self.cache);
        for (field, value) in FILE_COLUMNS.iter().zip(values.iter()) {
            cache.put(*field, value.clone());
        }
        Ok(values)
    }

    fn load_sizes(&self) -> FsResult<(i64, i64)> {
        let id = self.require_id()?;
        let conn = self.factory.connection()?;
        let (length, chunk_count): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(length), 0), COUNT(*) FROM file_data WHERE fileid = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut cache = lock(&self.cache);
        cache.put(FileField::Length, Value::Integer(length));
        cache.put(FileField::ChunkCount, Value::Integer(chunk_count));
        Ok((length, chunk_count))
    }

    pub fn file_type(&self) -> FsResult<Option<FileType>> {
        if !self.exists()? {
            return Ok(None);
        }
        let value = self.field_value(FileField::FileType)?;
        Ok(FileType::from_str(&value_to_string(&value)))
    }

    pub fn is_directory(&self) -> FsResult<bool> {
        Ok(self.file_type()? == Some(FileType::Directory))
    }

    pub fn is_file(&self) -> FsResult<bool> {
        Ok(self.file_type()? == Some(FileType::File))
    }

    /// Sum of the chunk lengths.
    pub fn length(&self) -> FsResult<u64> {
        if !self.exists()? {
            return Ok(0);
        }
        Ok(value_to_u64(&self.field_value(FileField::Length)?))
    }

    pub fn length_refreshed(&self) -> FsResult<u64> {
        self.invalidate_length();
        self.length()
    }

    pub fn chunk_count(&self) -> FsResult<u64> {
        if !self.exists()? {
            return Ok(0);
        }
        Ok(value_to_u64(&self.field_value(FileField::ChunkCount)?))
    }

    pub fn creation_time(&self) -> FsResult<u64> {
        Ok(value_to_u64(&self.field_value(FileField::CreateTime)?))
    }

    pub fn last_access_time(&self) -> FsResult<u64> {
        Ok(value_to_u64(&self.field_value(FileField::LastAccessTime)?))
    }

    pub fn last_modified(&self) -> FsResult<u64> {
        Ok(value_to_u64(&self.field_value(FileField::LastModifiedTime)?))
    }

    pub fn owner(&self) -> FsResult<String> {
        Ok(value_to_string(&self.field_value(FileField::Owner)?))
    }

    pub fn group(&self) -> FsResult<String> {
        Ok(value_to_string(&self.field_value(FileField::Group)?))
    }

    /// False for a file that does not exist.
    pub fn can(&self, permission: Permission) -> FsResult<bool> {
        if !self.exists()? {
            return Ok(false);
        }
        Ok(value_to_bool(
            &self.field_value(FileField::Permission(permission))?,
        ))
    }

    pub fn can_read(&self) -> FsResult<bool> {
        self.can(Permission::OwnerRead)
    }

    pub fn can_write(&self) -> FsResult<bool> {
        self.can(Permission::OwnerWrite)
    }

    pub fn can_execute(&self) -> FsResult<bool> {
        self.can(Permission::OwnerExecute)
    }

    // ========== metadata updates ==========

    fn update_fields(&self, fields: &[(FileField, Value)]) -> FsResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let id = self.require_id()?;
        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (field, _))| format!("{} = ?{}", field.column(), i + 1))
            .collect();
        let sql = format!(
            "UPDATE file SET {} WHERE fileid = ?{}",
            assignments.join(", "),
            fields.len() + 1
        );
        let mut values: Vec<Value> = fields.iter().map(|(_, v)| v.clone()).collect();
        values.push(Value::Integer(id));

        let conn = self.factory.connection()?;
        let changed = conn.execute(&sql, params_from_iter(values))?;
        drop(conn);
        self.invalidate_metadata();
        if changed == 0 {
            return Err(FsError::NotFound(self.absolute_path()));
        }
        Ok(())
    }

    pub fn set_create_time(&self, millis: u64) -> FsResult<()> {
        self.update_fields(&[(FileField::CreateTime, Value::Integer(millis as i64))])
    }

    pub fn set_last_access_time(&self, millis: u64) -> FsResult<()> {
        self.update_fields(&[(FileField::LastAccessTime, Value::Integer(millis as i64))])
    }

    pub fn set_last_modified_time(&self, millis: u64) -> FsResult<()> {
        self.update_fields(&[(FileField::LastModifiedTime, Value::Integer(millis as i64))])
    }

    pub fn update_access_and_mod_time(&self) -> FsResult<()> {
        let now = Value::Integer(now_millis() as i64);
        self.update_fields(&[
            (FileField::LastAccessTime, now.clone()),
            (FileField::LastModifiedTime, now),
        ])
    }

    pub fn set_owner(&self, owner: &str) -> FsResult<()> {
        self.update_fields(&[(FileField::Owner, Value::Text(owner.to_string()))])
    }

    pub fn set_group(&self, group: &str) -> FsResult<()> {
        self.update_fields(&[(FileField::Group, Value::Text(group.to_string()))])
    }

    pub fn set_permission(&self, permission: Permission, allowed: bool) -> FsResult<()> {
        self.set_permissions(&[permission], allowed)
    }

    pub fn set_permissions(&self, permissions: &[Permission], allowed: bool) -> FsResult<()> {
        let fields: Vec<(FileField, Value)> = permissions
            .iter()
            .map(|p| (FileField::Permission(*p), Value::Integer(allowed as i64)))
            .collect();
        self.update_fields(&fields)
    }

    /// `owner_only` touches the owner bit alone, otherwise all three classes.
    pub fn set_readable(&self, readable: bool, owner_only: bool) -> FsResult<()> {
        self.set_class_bits(Permission::READ, readable, owner_only)
    }

    pub fn set_writable(&self, writable: bool, owner_only: bool) -> FsResult<()> {
        self.set_class_bits(Permission::WRITE, writable, owner_only)
    }

    pub fn set_executable(&self, executable: bool, owner_only: bool) -> FsResult<()> {
        self.set_class_bits(Permission::EXECUTE, executable, owner_only)
    }

    fn set_class_bits(&self, bits: [Permission; 3], allowed: bool, owner_only: bool) -> FsResult<()> {
        if owner_only {
            self.set_permissions(&bits[..1], allowed)
        } else {
            self.set_permissions(&bits, allowed)
        }
    }

    /// Clears every write and execute bit.
    pub fn set_read_only(&self) -> FsResult<()> {
        let mut bits = Permission::WRITE.to_vec();
        bits.extend_from_slice(&Permission::EXECUTE);
        self.set_permissions(&bits, false)
    }

    // ========== tree operations ==========

    fn insert_entry(&self, kind: FileType) -> FsResult<i64> {
        let path = self.absolute_path();
        if self.exists()? {
            return Err(FsError::AlreadyExists(path));
        }
        let parent = self
            .parent
            .as_ref()
            .ok_or_else(|| FsError::AlreadyExists(path.clone()))?;
        let parent_id = parent
            .file_id()?
            .ok_or_else(|| FsError::NotFound(parent.absolute_path()))?;
        if !parent.is_directory()? {
            return Err(FsError::InvalidState(format!(
                "{} is not a directory",
                parent.absolute_path()
            )));
        }

        let owner = self.factory.user_id();
        let now = now_millis() as i64;
        let p = kind.default_permissions();
        let conn = self.factory.connection()?;
        let id = conn.with_conn(|c| {
            let inserted = c.execute(
                INSERT_FILE,
                params![
                    parent_id, self.name, kind, owner, now, p[0], p[1], p[2], p[3], p[4], p[5],
                    p[6], p[7], p[8]
                ],
            );
            match inserted {
                Ok(_) => Ok(c.last_insert_rowid()),
                Err(e) if is_constraint_violation(&e) => Err(FsError::AlreadyExists(path.clone())),
                Err(e) => Err(FsError::from(e)),
            }
        })?;
        drop(conn);

        *lock(&self.file_id) = Some(id);
        {
            let mut cache = lock(&self.cache);
            cache.clear();
            cache.put(FileField::FileType, Value::Text(kind.as_str().to_string()));
        }
        parent.invalidate_listing();
        debug!("ChunkedFile: created {} {} as #{}", kind.as_str(), path, id);
        Ok(id)
    }

    /// Fails with `AlreadyExists` when the entry is present.
    pub fn create_new_file(&self) -> FsResult<()> {
        self.insert_entry(FileType::File).map(|_| ())
    }

    /// False when the entry exists or the parent is missing.
    pub fn mkdir(&self) -> FsResult<bool> {
        match self.insert_entry(FileType::Directory) {
            Ok(_) => Ok(true),
            Err(FsError::AlreadyExists(_)) | Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn mkdirs(&self) -> FsResult<bool> {
        if self.exists()? {
            return Ok(false);
        }
        if let Some(parent) = &self.parent {
            if !parent.exists()? {
                parent.mkdirs()?;
            }
        }
        self.mkdir()
    }

    /// Removes the chunks and then the entry. Directories must be empty.
    pub fn delete(&self) -> FsResult<()> {
        let id = self.require_id()?;
        let path = self.absolute_path();
        if id == ROOT_FILE_ID {
            return Err(FsError::InvalidState("cannot delete root".to_string()));
        }

        let conn = self.factory.connection()?;
        conn.transaction(|tx| -> FsResult<()> {
            let children: i64 = tx.query_row(
                "SELECT COUNT(*) FROM file WHERE parentid = ?1",
                [id],
                |row| row.get(0),
            )?;
            if children > 0 {
                return Err(FsError::NotEmpty(path.clone()));
            }
            tx.execute("DELETE FROM file_data WHERE fileid = ?1", [id])?;
            tx.execute("DELETE FROM file WHERE fileid = ?1", [id])?;
            Ok(())
        })?;
        drop(conn);

        self.forget_id();
        if let Some(parent) = &self.parent {
            parent.invalidate_listing();
        }
        debug!("ChunkedFile: deleted {} (#{})", path, id);
        Ok(())
    }

    /// Moves this entry to `target`, keeping its identity. Missing parents
    /// of the target are created.
    pub fn rename_to(&self, target: &ChunkedFile) -> FsResult<()> {
        let id = self.require_id()?;
        let source_path = self.absolute_path();
        let target_path = target.absolute_path();
        if target.exists()? {
            return Err(FsError::AlreadyExists(target_path));
        }
        if target_path.starts_with(&format!("{}/", source_path)) {
            return Err(FsError::InvalidParam(format!(
                "cannot move {} into itself",
                source_path
            )));
        }
        let target_parent = target
            .parent
            .as_ref()
            .ok_or_else(|| FsError::AlreadyExists(target_path.clone()))?;
        if !target_parent.exists()? {
            target_parent.mkdirs()?;
        }
        let parent_id = target_parent
            .file_id()?
            .ok_or_else(|| FsError::NotFound(target_parent.absolute_path()))?;

        let conn = self.factory.connection()?;
        conn.with_conn(|c| {
            let updated = c.execute(
                "UPDATE file SET parentid = ?1, name = ?2 WHERE fileid = ?3",
                params![parent_id, target.name, id],
            );
            match updated {
                Ok(0) => Err(FsError::NotFound(source_path.clone())),
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => {
                    Err(FsError::AlreadyExists(target_path.clone()))
                }
                Err(e) => Err(FsError::from(e)),
            }
        })?;
        drop(conn);

        *lock(&target.file_id) = Some(id);
        target.invalidate_metadata();
        self.forget_id();
        target_parent.invalidate_listing();
        if let Some(parent) = &self.parent {
            parent.invalidate_listing();
        }
        debug!("ChunkedFile: renamed {} to {}", source_path, target_path);
        Ok(())
    }

    fn child_entries(&self) -> FsResult<Vec<(i64, String)>> {
        let id = self.require_id()?;
        if !self.is_directory()? {
            return Err(FsError::InvalidState(format!(
                "{} is not a directory",
                self.absolute_path()
            )));
        }
        let ttl = self.factory.field_ttl(FIELD_KIDS);
        if let Some(cached) = lock(&self.listing).as_ref() {
            if cached.loaded_at.elapsed() <= ttl {
                return Ok(cached.entries.clone());
            }
        }

        let conn = self.factory.connection()?;
        let entries = conn.with_conn(|c| -> FsResult<Vec<(i64, String)>> {
            let mut stmt = c.prepare("SELECT fileid, name FROM file WHERE parentid = ?1 ORDER BY name")?;
            let rows = stmt.query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let entries = rows.collect::<rusqlite::Result<Vec<(i64, String)>>>()?;
            Ok(entries)
        })?;
        *lock(&self.listing) = Some(CachedListing {
            loaded_at: Instant::now(),
            entries: entries.clone(),
        });
        Ok(entries)
    }

    pub fn list(&self) -> FsResult<Vec<String>> {
        Ok(self
            .child_entries()?
            .into_iter()
            .map(|(_, name)| name)
            .collect())
    }

    pub fn list_files(self: &Arc<Self>) -> FsResult<Vec<Arc<ChunkedFile>>> {
        Ok(self
            .child_entries()?
            .into_iter()
            .map(|(id, name)| Self::child_with_id(self, &name, Some(id)))
            .collect())
    }

    pub fn list_filtered(
        self: &Arc<Self>,
        filter: impl Fn(&ChunkedFile) -> bool,
    ) -> FsResult<Vec<Arc<ChunkedFile>>> {
        Ok(self
            .list_files()?
            .into_iter()
            .filter(|f| filter(f))
            .collect())
    }

    /// Only directories have children; the child need not exist.
    pub fn get_child(self: &Arc<Self>, name: &str) -> FsResult<Arc<ChunkedFile>> {
        if !self.is_directory()? {
            return Err(FsError::InvalidState(format!(
                "{} is not a directory",
                self.absolute_path()
            )));
        }
        Ok(Self::child(self, name))
    }

    // ========== chunk store ==========

    pub fn get_chunk(&self, chunk_number: u64) -> FsResult<Option<Vec<u8>>> {
        let id = self.require_id()?;
        let conn = self.factory.connection()?;
        let data = conn.query_row_optional(
            "SELECT data FROM file_data WHERE fileid = ?1 AND chunk_number = ?2",
            params![id, chunk_number as i64],
            |row| row.get(0),
        )?;
        Ok(data)
    }

    /// The chunk covering `pos`, or the last chunk when `pos` is at or past
    /// the end. `None` for a file without chunks.
    pub fn locate_chunk(&self, pos: u64) -> FsResult<Option<ChunkLocation>> {
        let id = self.require_id()?;
        let conn = self.factory.connection()?;
        let location = conn.query_row_optional(LOCATE_CHUNK, params![id, pos as i64], |row| {
            Ok(ChunkLocation {
                chunk_number: row.get::<_, i64>(0)? as u64,
                start: row.get::<_, i64>(1)? as u64,
                length: row.get::<_, i64>(2)? as u64,
            })
        })?;
        Ok(location)
    }

    /// Stores `data` as the next chunk and returns its number.
    ///
    /// A row left behind under that number by an aborted append is replaced
    /// once. The cached sizes and times are refreshed from the update.
    pub fn append_data(&self, data: &[u8]) -> FsResult<u64> {
        let id = self.require_id()?;
        if self.is_directory()? {
            return Err(FsError::InvalidState(format!(
                "cannot append to directory {}",
                self.absolute_path()
            )));
        }
        let now = now_millis() as i64;

        let conn = self.factory.connection()?;
        let (chunk_number, length, chunk_count) =
            conn.transaction(|tx| -> FsResult<(i64, i64, i64)> {
                let next: i64 = tx.query_row(
                    "SELECT chunk_count + 1 FROM file WHERE fileid = ?1",
                    [id],
                    |row| row.get(0),
                )?;
                if let Err(e) = insert_chunk(tx, id, next, data) {
                    if !is_constraint_violation(&e) {
                        return Err(e.into());
                    }
                    warn!(
                        "ChunkedFile: dangling chunk {} of file #{}, replacing it",
                        next, id
                    );
                    tx.execute(
                        "DELETE FROM file_data WHERE fileid = ?1 AND chunk_number = ?2",
                        params![id, next],
                    )?;
                    insert_chunk(tx, id, next, data)?;
                }
                let (length, chunk_count) =
                    tx.query_row(REFRESH_SIZES, params![id, now], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                Ok((next, length, chunk_count))
            })?;
        drop(conn);

        let mut cache = lock(&self.cache);
        cache.put(FileField::Length, Value::Integer(length));
        cache.put(FileField::ChunkCount, Value::Integer(chunk_count));
        cache.put(FileField::LastAccessTime, Value::Integer(now));
        cache.put(FileField::LastModifiedTime, Value::Integer(now));
        Ok(chunk_number as u64)
    }

    /// Replaces the content of an existing chunk in place.
    pub fn update_chunk(&self, chunk_number: u64, data: &[u8]) -> FsResult<()> {
        let id = self.require_id()?;
        let now = now_millis() as i64;
        let conn = self.factory.connection()?;
        conn.transaction(|tx| -> FsResult<()> {
            let changed = tx.execute(
                "UPDATE file_data SET data = ?1, length = ?2 WHERE fileid = ?3 AND chunk_number = ?4",
                params![data, data.len() as i64, id, chunk_number as i64],
            )?;
            if changed != 1 {
                return Err(FsError::InvalidState(format!(
                    "chunk {} of file #{} matched {} rows",
                    chunk_number, id, changed
                )));
            }
            tx.query_row(REFRESH_SIZES, params![id, now], |_| Ok(()))?;
            Ok(())
        })?;
        drop(conn);
        self.invalidate_metadata();
        Ok(())
    }

    /// Deletes chunk `chunk_number` and every chunk after it.
    pub fn delete_chunks_from(&self, chunk_number: u64) -> FsResult<usize> {
        let id = self.require_id()?;
        let now = now_millis() as i64;
        let conn = self.factory.connection()?;
        let removed = conn.transaction(|tx| -> FsResult<usize> {
            let removed = tx.execute(
                "DELETE FROM file_data WHERE fileid = ?1 AND chunk_number >= ?2",
                params![id, chunk_number as i64],
            )?;
            tx.query_row(REFRESH_SIZES, params![id, now], |_| Ok(()))?;
            Ok(removed)
        })?;
        drop(conn);
        self.invalidate_metadata();
        Ok(removed)
    }

    /// Drops every chunk. A no-op for an empty file.
    pub fn truncate(&self) -> FsResult<()> {
        if self.length_refreshed()? == 0 {
            return Ok(());
        }
        self.delete_chunks_from(1)?;
        Ok(())
    }

    // ========== streams ==========

    pub fn input_stream(self: &Arc<Self>, start: u64) -> FsResult<ChunkInputStream> {
        ChunkInputStream::open(self.clone(), start)
    }

    pub fn output_stream(self: &Arc<Self>, append: bool) -> FsResult<ChunkOutputStream> {
        ChunkOutputStream::open(self.clone(), append)
    }

    pub fn seekable_reader(self: &Arc<Self>) -> FsResult<ChunkSeekableReader> {
        ChunkSeekableReader::open(self.clone())
    }

    pub fn random_access_controller(self: &Arc<Self>) -> FsResult<RandomAccessController> {
        RandomAccessController::open(self.clone())
    }

    /// `mode` is `"r"` or `"rw"`.
    pub fn random_access(self: &Arc<Self>, mode: &str) -> FsResult<RandomAccessStream> {
        RandomAccessStream::open(self.clone(), mode)
    }
}

impl fmt::Debug for ChunkedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedFile")
            .field("path", &self.absolute_path())
            .field("file_id", &*lock(&self.file_id))
            .finish()
    }
}
