use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{IndexerError, Result};
use crate::index::fragment::{DirtySet, FragmentData};
use crate::index::migrations::{run_migrations, verify_schema_compatibility};
use crate::index::{
    BindingId, BindingRecord, FileId, FileRecord, Linkage, NameId, NameRecord, NameRole,
};

/// SQLite backing store of one fragment. The in-memory [`FragmentData`] is
/// authoritative while the process runs; every commit is written through.
pub struct SqliteFragment {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteFragment {
    /// Opens (or creates) a fragment database. Anything that prevents the
    /// schema from being read is reported as [`IndexerError::CorruptFragment`].
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|e| as_corruption(e.into()))?;
        Self::configure_pragmas(&conn).map_err(as_corruption)?;
        run_migrations(&conn).map_err(as_corruption)?;
        verify_schema_compatibility(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_pragmas(&conn)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Configure SQLite PRAGMA settings.
    /// - WAL mode: readers of the file are not blocked by the write-through
    /// - NORMAL synchronous: durability at commit boundaries
    /// - MEMORY temp_store: speeds up temporary tables and sorts
    fn configure_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Reads every record and rebuilds the in-memory fragment.
    pub fn load(&self) -> Result<FragmentData> {
        let conn = self.conn();
        quick_check(&conn)?;
        let (files, bindings, names) = read_records(&conn).map_err(as_corruption)?;
        FragmentData::from_records(files, bindings, names)
    }

    /// Writes the records named in `dirty` in one transaction.
    pub fn flush(&self, data: &FragmentData, dirty: &DirtySet) -> Result<()> {
        if dirty.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if dirty.cleared {
            delete_all(&tx)?;
        }
        for id in &dirty.files {
            match data.file(*id) {
                Some(file) => upsert_file(&tx, file)?,
                None => {
                    tx.execute("DELETE FROM files WHERE id = ?1", [id.0])?;
                }
            }
        }
        for id in &dirty.bindings {
            match data.binding(*id) {
                Some(binding) => upsert_binding(&tx, binding)?,
                None => {
                    tx.execute("DELETE FROM bindings WHERE id = ?1", [id.0])?;
                }
            }
        }
        for id in &dirty.names {
            match data.name(*id) {
                Some(name) => upsert_name(&tx, name)?,
                None => {
                    tx.execute("DELETE FROM names WHERE id = ?1", [id.0])?;
                }
            }
        }
        tx.commit()?;
        tracing::debug!(
            "Flushed {} files, {} bindings, {} names",
            dirty.files.len(),
            dirty.bindings.len(),
            dirty.names.len()
        );
        Ok(())
    }

    /// Replaces the whole database content with `data`.
    pub fn replace_all(&self, data: &FragmentData) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        delete_all(&tx)?;
        for file in data.files() {
            upsert_file(&tx, file)?;
        }
        for binding in data.bindings() {
            upsert_binding(&tx, binding)?;
        }
        for name in data.names() {
            upsert_name(&tx, name)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn as_corruption(err: IndexerError) -> IndexerError {
    match err {
        IndexerError::CorruptFragment(_) => err,
        other => IndexerError::CorruptFragment(other.to_string()),
    }
}

fn quick_check(conn: &Connection) -> Result<()> {
    let result: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| IndexerError::CorruptFragment(e.to_string()))?;
    if result != "ok" {
        return Err(IndexerError::CorruptFragment(format!(
            "quick_check failed: {}",
            result
        )));
    }
    Ok(())
}

fn delete_all(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        r#"
        DELETE FROM names;
        DELETE FROM bindings;
        DELETE FROM files;
        "#,
    )?;
    Ok(())
}

fn upsert_file(tx: &Transaction<'_>, file: &FileRecord) -> Result<()> {
    tx.execute(
        r#"
        INSERT OR REPLACE INTO files
        (id, location, linkage, fingerprint, timestamp, significant_macros_json,
         includes_json, macros_json, state_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            file.id.0,
            file.location.to_string(),
            file.linkage.as_str(),
            file.fingerprint as i64,
            file.timestamp,
            serde_json::to_string(&file.significant_macros)?,
            serde_json::to_string(&file.includes)?,
            serde_json::to_string(&file.macros)?,
            serde_json::to_string(&file.state)?,
        ],
    )?;
    Ok(())
}

fn upsert_binding(tx: &Transaction<'_>, binding: &BindingRecord) -> Result<()> {
    tx.execute(
        r#"
        INSERT OR REPLACE INTO bindings
        (id, qualified_name_json, kind_json, linkage, template_json, implicit)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            binding.id.0,
            serde_json::to_string(&binding.qualified_name)?,
            serde_json::to_string(&binding.kind)?,
            binding.linkage.as_str(),
            serde_json::to_string(&binding.template)?,
            binding.implicit,
        ],
    )?;
    Ok(())
}

fn upsert_name(tx: &Transaction<'_>, name: &NameRecord) -> Result<()> {
    tx.execute(
        r#"
        INSERT OR REPLACE INTO names
        (id, file_id, binding_id, offset, length, role, enclosing_id,
         is_read, is_write, qualified, polymorphic)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            name.id.0,
            name.file.0,
            name.binding.0,
            name.offset,
            name.length,
            name.role.as_str(),
            name.enclosing.map(|e| e.0),
            name.is_read,
            name.is_write,
            name.qualified,
            name.could_be_polymorphic,
        ],
    )?;
    Ok(())
}

type Records = (Vec<FileRecord>, Vec<BindingRecord>, Vec<NameRecord>);

fn read_records(conn: &Connection) -> Result<Records> {
    let mut names: Vec<NameRecord> = Vec::new();
    {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, file_id, binding_id, offset, length, role, enclosing_id,
                   is_read, is_write, qualified, polymorphic
            FROM names ORDER BY file_id, offset, id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let role: String = row.get(5)?;
            let enclosing: Option<u32> = row.get(6)?;
            Ok((
                NameRecord {
                    id: NameId(row.get(0)?),
                    file: FileId(row.get(1)?),
                    binding: BindingId(row.get(2)?),
                    offset: row.get(3)?,
                    length: row.get(4)?,
                    role: NameRole::Reference,
                    enclosing: enclosing.map(NameId),
                    is_read: row.get(7)?,
                    is_write: row.get(8)?,
                    qualified: row.get(9)?,
                    could_be_polymorphic: row.get(10)?,
                },
                role,
            ))
        })?;
        for row in rows {
            let (mut name, role) = row?;
            name.role = parse_role(&role)?;
            names.push(name);
        }
    }

    let mut names_by_file: HashMap<FileId, Vec<NameId>> = HashMap::new();
    let mut names_by_binding: HashMap<BindingId, Vec<NameId>> = HashMap::new();
    for name in &names {
        names_by_file.entry(name.file).or_default().push(name.id);
        names_by_binding.entry(name.binding).or_default().push(name.id);
    }

    let mut files = Vec::new();
    {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, location, linkage, fingerprint, timestamp, significant_macros_json,
                   includes_json, macros_json, state_json
            FROM files ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        for row in rows {
            let (id, location, linkage, fingerprint, timestamp, macros_ctx, includes, macros, state) =
                row?;
            let id = FileId(id);
            files.push(FileRecord {
                id,
                location: location.parse()?,
                linkage: parse_linkage(&linkage)?,
                fingerprint: fingerprint as u64,
                timestamp,
                significant_macros: serde_json::from_str(&macros_ctx)?,
                includes: serde_json::from_str(&includes)?,
                macros: serde_json::from_str(&macros)?,
                names: names_by_file.remove(&id).unwrap_or_default(),
                state: serde_json::from_str(&state)?,
            });
        }
    }

    let mut bindings = Vec::new();
    {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, qualified_name_json, kind_json, linkage, template_json, implicit
            FROM bindings ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;
        for row in rows {
            let (id, qualified_name, kind, linkage, template, implicit) = row?;
            let id = BindingId(id);
            bindings.push(BindingRecord {
                id,
                qualified_name: serde_json::from_str(&qualified_name)?,
                kind: serde_json::from_str(&kind)?,
                linkage: parse_linkage(&linkage)?,
                template: serde_json::from_str(&template)?,
                implicit,
                names: names_by_binding.remove(&id).unwrap_or_default(),
            });
        }
    }

    if let Some(file) = names_by_file.keys().next() {
        return Err(IndexerError::CorruptFragment(format!(
            "names reference missing file {}",
            file
        )));
    }
    Ok((files, bindings, names))
}

fn parse_linkage(s: &str) -> Result<Linkage> {
    Linkage::from_str(s).ok_or_else(|| IndexerError::CorruptFragment(format!("linkage {:?}", s)))
}

fn parse_role(s: &str) -> Result<NameRole> {
    match s {
        "declaration" => Ok(NameRole::Declaration),
        "definition" => Ok(NameRole::Definition),
        "reference" => Ok(NameRole::Reference),
        other => Err(IndexerError::CorruptFragment(format!("name role {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::fragment::tests::{occurrence, sym, update};
    use crate::index::fragment::StagedOp;
    use crate::index::{BindingKind, IncludeRecord, SignificantMacros};
    use crate::location::LocationKey;
    use tempfile::TempDir;

    fn sample() -> FragmentData {
        let mut data = FragmentData::new();
        let mut u = update(
            LocationKey::workspace("p", "a.cpp"),
            vec![
                occurrence(sym("f", BindingKind::Function { is_virtual: false }), 0, NameRole::Definition),
                occurrence(sym("g", BindingKind::Function { is_virtual: true }), 9, NameRole::Reference),
            ],
        );
        u.significant_macros = SignificantMacros::new().defined("X", "1");
        u.includes.push(IncludeRecord {
            includer: FileId(0),
            target: Some(LocationKey::external("/usr/include/stdio.h")),
            target_macros: SignificantMacros::new(),
            directive: "#include <stdio.h>".into(),
            offset: 0,
            name_offset: 10,
            name_length: 7,
            system: true,
            active: true,
        });
        data.apply(vec![StagedOp::ReplaceFile(Box::new(u))]).unwrap();
        data
    }

    #[test]
    fn test_flush_and_load() {
        let dir = TempDir::new().unwrap();
        let db = SqliteFragment::open(dir.path().join("p.db")).unwrap();
        let mut data = sample();
        let dirty = data.take_dirty();
        db.flush(&data, &dirty).unwrap();

        let loaded = db.load().unwrap();
        assert_eq!(loaded.stats(), data.stats());
        let file = &loaded.get_all_files()[0];
        assert_eq!(file.includes.len(), 1);
        assert!(file.includes[0].system);
        assert_eq!(file.significant_macros.get("X"), Some(&Some("1".to_string())));
        assert_eq!(file.names.len(), 2);
    }

    #[test]
    fn test_flush_deletes_removed_records() {
        let db = SqliteFragment::in_memory().unwrap();
        let mut data = sample();
        let dirty = data.take_dirty();
        db.flush(&data, &dirty).unwrap();

        data.apply(vec![StagedOp::RemoveLocation(LocationKey::workspace("p", "a.cpp"))])
            .unwrap();
        let dirty = data.take_dirty();
        db.flush(&data, &dirty).unwrap();

        let loaded = db.load().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.stats().names, 0);
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.db");
        std::fs::write(&path, vec![b'x'; 8192]).unwrap();
        let err = SqliteFragment::open(&path).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_unopenable_path_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let err = SqliteFragment::open(dir.path().join("no/such/dir/p.db"))
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::CorruptFragment(_)));
    }

    #[test]
    fn test_dangling_row_is_corrupt() {
        let db = SqliteFragment::in_memory().unwrap();
        let mut data = sample();
        let dirty = data.take_dirty();
        db.flush(&data, &dirty).unwrap();
        db.conn().execute("DELETE FROM bindings", []).unwrap();

        let err = db.load().err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_meta_round_trip() {
        let db = SqliteFragment::in_memory().unwrap();
        assert!(db.get_meta("project").unwrap().is_none());
        db.set_meta("project", "app").unwrap();
        assert_eq!(db.get_meta("project").unwrap().as_deref(), Some("app"));
    }
}
