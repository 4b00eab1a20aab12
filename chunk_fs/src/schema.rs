use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection};
use std::sync::OnceLock;

pub const ROOT_FILE_ID: i64 = 1;
pub const ROOT_PARENT_ID: i64 = 0;

const CREATE_TABLES: &str = "CREATE TABLE IF NOT EXISTS file (
        fileid INTEGER PRIMARY KEY AUTOINCREMENT,
        parentid INTEGER NOT NULL,
        name TEXT NOT NULL,
        file_type TEXT NOT NULL,
        owner TEXT,
        group_name TEXT,
        create_time INTEGER NOT NULL,
        last_access_date INTEGER NOT NULL,
        last_modified_date INTEGER NOT NULL,
        length INTEGER NOT NULL DEFAULT 0,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        owner_readable INTEGER NOT NULL DEFAULT 1,
        owner_writeable INTEGER NOT NULL DEFAULT 1,
        owner_executable INTEGER NOT NULL DEFAULT 0,
        group_readable INTEGER NOT NULL DEFAULT 1,
        group_writeable INTEGER NOT NULL DEFAULT 0,
        group_executable INTEGER NOT NULL DEFAULT 0,
        other_readable INTEGER NOT NULL DEFAULT 1,
        other_writeable INTEGER NOT NULL DEFAULT 0,
        other_executable INTEGER NOT NULL DEFAULT 0,
        UNIQUE(parentid, name)
    );
    CREATE TABLE IF NOT EXISTS file_data (
        fileid INTEGER NOT NULL REFERENCES file(fileid) ON DELETE CASCADE,
        chunk_number INTEGER NOT NULL,
        length INTEGER NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY(fileid, chunk_number)
    );";

pub(crate) const INSERT_FILE: &str = "INSERT INTO file (
        parentid, name, file_type, owner, group_name,
        create_time, last_access_date, last_modified_date, length, chunk_count,
        owner_readable, owner_writeable, owner_executable,
        group_readable, group_writeable, group_executable,
        other_readable, other_writeable, other_executable)
    VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?5, ?5, 0, 0, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

/// Creates both tables and the root directory row if missing.
pub fn create_schema(conn: &Connection, owner: &str) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    let now = crate::now_millis() as i64;
    let perms = FileType::Directory.default_permissions();
    conn.execute(
        "INSERT OR IGNORE INTO file (
            fileid, parentid, name, file_type, owner, group_name,
            create_time, last_access_date, last_modified_date, length, chunk_count,
            owner_readable, owner_writeable, owner_executable,
            group_readable, group_writeable, group_executable,
            other_readable, other_writeable, other_executable)
        VALUES (?1, ?2, '', ?3, ?4, ?4, ?5, ?5, ?5, 0, 0, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            ROOT_FILE_ID,
            ROOT_PARENT_ID,
            FileType::Directory,
            owner,
            now,
            perms[0],
            perms[1],
            perms[2],
            perms[3],
            perms[4],
            perms[5],
            perms[6],
            perms[7],
            perms[8],
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    File,
    Directory,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Directory => "dir",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "file" => Some(FileType::File),
            "dir" => Some(FileType::Directory),
            _ => None,
        }
    }

    /// Indexed like `Permission::ALL`: files `rw-r--r--`, directories `rwxr-xr-x`.
    pub fn default_permissions(&self) -> [bool; 9] {
        match self {
            FileType::File => [true, true, false, true, false, false, true, false, false],
            FileType::Directory => [true, true, true, true, false, true, true, false, true],
        }
    }
}

impl ToSql for FileType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for FileType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        FileType::from_str(s).ok_or_else(|| FromSqlError::Other(format!("bad file_type {}", s).into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    OwnerRead,
    OwnerWrite,
    OwnerExecute,
    GroupRead,
    GroupWrite,
    GroupExecute,
    OtherRead,
    OtherWrite,
    OtherExecute,
}

impl Permission {
    pub const ALL: [Permission; 9] = [
        Permission::OwnerRead,
        Permission::OwnerWrite,
        Permission::OwnerExecute,
        Permission::GroupRead,
        Permission::GroupWrite,
        Permission::GroupExecute,
        Permission::OtherRead,
        Permission::OtherWrite,
        Permission::OtherExecute,
    ];

    pub const READ: [Permission; 3] = [
        Permission::OwnerRead,
        Permission::GroupRead,
        Permission::OtherRead,
    ];
    pub const WRITE: [Permission; 3] = [
        Permission::OwnerWrite,
        Permission::GroupWrite,
        Permission::OtherWrite,
    ];
    pub const EXECUTE: [Permission; 3] = [
        Permission::OwnerExecute,
        Permission::GroupExecute,
        Permission::OtherExecute,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            Permission::OwnerRead => "owner_readable",
            Permission::OwnerWrite => "owner_writeable",
            Permission::OwnerExecute => "owner_executable",
            Permission::GroupRead => "group_readable",
            Permission::GroupWrite => "group_writeable",
            Permission::GroupExecute => "group_executable",
            Permission::OtherRead => "other_readable",
            Permission::OtherWrite => "other_writeable",
            Permission::OtherExecute => "other_executable",
        }
    }
}

/// Cached metadata attributes of a `file` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileField {
    FileType,
    Owner,
    Group,
    CreateTime,
    LastAccessTime,
    LastModifiedTime,
    Length,
    ChunkCount,
    Permission(Permission),
}

/// Columns loaded together on a metadata cache miss, in select order.
/// Length and chunk count are derived from `file_data` instead.
pub(crate) const FILE_COLUMNS: [FileField; 15] = [
    FileField::FileType,
    FileField::Owner,
    FileField::Group,
    FileField::CreateTime,
    FileField::LastAccessTime,
    FileField::LastModifiedTime,
    FileField::Permission(Permission::OwnerRead),
    FileField::Permission(Permission::OwnerWrite),
    FileField::Permission(Permission::OwnerExecute),
    FileField::Permission(Permission::GroupRead),
    FileField::Permission(Permission::GroupWrite),
    FileField::Permission(Permission::GroupExecute),
    FileField::Permission(Permission::OtherRead),
    FileField::Permission(Permission::OtherWrite),
    FileField::Permission(Permission::OtherExecute),
];

impl FileField {
    pub fn column(&self) -> &'static str {
        match self {
            FileField::FileType => "file_type",
            FileField::Owner => "owner",
            FileField::Group => "group_name",
            FileField::CreateTime => "create_time",
            FileField::LastAccessTime => "last_access_date",
            FileField::LastModifiedTime => "last_modified_date",
            FileField::Length => "length",
            FileField::ChunkCount => "chunk_count",
            FileField::Permission(p) => p.column(),
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, FileField::Length | FileField::ChunkCount)
    }
}

pub(crate) fn metadata_select_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let columns: Vec<&str> = FILE_COLUMNS.iter().map(|f| f.column()).collect();
        format!("SELECT {} FROM file WHERE fileid = ?1", columns.join(", "))
    })
}

/// Recomputes the stored size columns of a file from its chunk rows.
pub(crate) const REFRESH_SIZES: &str = "UPDATE file SET
        length = (SELECT COALESCE(SUM(length), 0) FROM file_data WHERE fileid = ?1),
        chunk_count = (SELECT COUNT(*) FROM file_data WHERE fileid = ?1),
        last_access_date = ?2,
        last_modified_date = ?2
    WHERE fileid = ?1
    RETURNING length, chunk_count";

/// Chunk covering `?2`: the last one whose cumulative start is not past it.
pub(crate) const LOCATE_CHUNK: &str = "SELECT chunk_number, start_pos, length FROM (
        SELECT chunk_number, length,
               SUM(length) OVER (ORDER BY chunk_number) - length AS start_pos
        FROM file_data WHERE fileid = ?1)
    WHERE start_pos <= ?2
    ORDER BY chunk_number DESC LIMIT 1";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn, "alice").unwrap();
        create_schema(&conn, "bob").unwrap();
        let (name, owner, kind): (String, String, FileType) = conn
            .query_row(
                "SELECT name, owner, file_type FROM file WHERE fileid = ?1",
                [ROOT_FILE_ID],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(name, "");
        assert_eq!(owner, "alice");
        assert_eq!(kind, FileType::Directory);
    }

    #[test]
    fn test_metadata_select_matches_columns() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn, "sa").unwrap();
        let mut stmt = conn.prepare(metadata_select_sql()).unwrap();
        assert_eq!(stmt.column_count(), FILE_COLUMNS.len());
        let exists = stmt.exists([ROOT_FILE_ID]).unwrap();
        assert!(exists);
    }

    #[test]
    fn test_locate_chunk_query() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn, "sa").unwrap();
        for (n, len) in [(1i64, 100i64), (2, 40), (3, 100)] {
            conn.execute(
                "INSERT INTO file_data (fileid, chunk_number, length, data) VALUES (?1, ?2, ?3, zeroblob(?3))",
                params![ROOT_FILE_ID, n, len],
            )
            .unwrap();
        }
        let locate = |pos: i64| -> (i64, i64) {
            conn.query_row(LOCATE_CHUNK, params![ROOT_FILE_ID, pos], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap()
        };
        assert_eq!(locate(0), (1, 0));
        assert_eq!(locate(99), (1, 0));
        assert_eq!(locate(100), (2, 100));
        assert_eq!(locate(139), (2, 100));
        assert_eq!(locate(140), (3, 140));
        assert_eq!(locate(500), (3, 140));
    }
}
